//! Prometheus-to-OTLP conversion and the periodic push loop.

pub mod convert;
pub mod push;

pub use convert::{convert_metrics, MetricBatch, OtlpMetric, OtlpMetricData};
pub use push::{run_push_loop, ExportHealth, ExportState, PushError};
