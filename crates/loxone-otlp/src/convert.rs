//! Translate gathered Prometheus metric families into the OTLP data model.

use prometheus::proto::{MetricFamily, MetricType};

/// One exported data point's label set, already flattened to `(name,
/// value)` string pairs ready to become OTLP attributes.
pub type Attributes = Vec<(String, String)>;

/// A single OTLP data point, shared shape across gauge/sum points.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    /// Attributes attached to this point.
    pub attributes: Attributes,
    /// The numeric value.
    pub value: f64,
}

/// One bucketed histogram data point.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramDataPoint {
    /// Attributes attached to this point.
    pub attributes: Attributes,
    /// Number of observations.
    pub count: u64,
    /// Sum of all observed values.
    pub sum: f64,
    /// Upper bounds, ascending, with an implicit `+Inf` overflow bucket
    /// appended last.
    pub bounds: Vec<f64>,
    /// Cumulative counts per bucket, one longer than `bounds`.
    pub bucket_counts: Vec<u64>,
}

/// One metric's worth of converted data, tagged by OTLP metric kind.
#[derive(Debug, Clone, PartialEq)]
pub enum OtlpMetricData {
    /// Prometheus Gauge -> OTLP Gauge.
    Gauge(Vec<DataPoint>),
    /// Prometheus Counter -> OTLP Sum (monotonic, cumulative).
    Sum(Vec<DataPoint>),
    /// Prometheus Histogram -> OTLP Histogram (cumulative).
    Histogram(Vec<HistogramDataPoint>),
}

/// A single named, converted metric ready for transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct OtlpMetric {
    /// Metric name, unchanged from the Prometheus family name.
    pub name: String,
    /// Metric help text, unchanged from the Prometheus family.
    pub description: String,
    /// Converted data points.
    pub data: OtlpMetricData,
}

/// A batch of converted metrics ready for one export attempt.
#[derive(Debug, Clone, Default)]
pub struct MetricBatch {
    /// The converted metrics.
    pub metrics: Vec<OtlpMetric>,
}

fn attributes_from_labels(family_labels: &[prometheus::proto::LabelPair]) -> Attributes {
    family_labels
        .iter()
        .map(|pair| (pair.get_name().to_string(), pair.get_value().to_string()))
        .collect()
}

/// Convert one gathered Prometheus family into its OTLP equivalent.
/// Returns `None` for family types with no meaningful OTLP mapping here
/// (there are none today, but this keeps the conversion total).
#[must_use]
pub fn convert_family(family: &MetricFamily) -> Option<OtlpMetric> {
    let data = match family.get_field_type() {
        MetricType::GAUGE => OtlpMetricData::Gauge(
            family
                .get_metric()
                .iter()
                .map(|m| DataPoint {
                    attributes: attributes_from_labels(m.get_label()),
                    value: m.get_gauge().get_value(),
                })
                .collect(),
        ),
        MetricType::COUNTER => OtlpMetricData::Sum(
            family
                .get_metric()
                .iter()
                .map(|m| DataPoint {
                    attributes: attributes_from_labels(m.get_label()),
                    value: m.get_counter().get_value(),
                })
                .collect(),
        ),
        MetricType::HISTOGRAM => OtlpMetricData::Histogram(
            family
                .get_metric()
                .iter()
                .map(|m| {
                    let h = m.get_histogram();
                    let mut bounds: Vec<f64> =
                        h.get_bucket().iter().map(|b| b.get_upper_bound()).collect();
                    bounds.sort_by(|a, b| a.partial_cmp(b).unwrap());
                    let mut bucket_counts: Vec<u64> = h
                        .get_bucket()
                        .iter()
                        .map(|b| b.get_cumulative_count())
                        .collect();
                    bucket_counts.push(h.get_sample_count());
                    HistogramDataPoint {
                        attributes: attributes_from_labels(m.get_label()),
                        count: h.get_sample_count(),
                        sum: h.get_sample_sum(),
                        bounds,
                        bucket_counts,
                    }
                })
                .collect(),
        ),
        // Prometheus Info metrics surface through this crate as gauges
        // fixed at 1.0 (see loxone-metrics::projector), so no separate
        // INFO/UNTYPED handling is needed.
        _ => OtlpMetricData::Gauge(
            family
                .get_metric()
                .iter()
                .map(|m| DataPoint {
                    attributes: attributes_from_labels(m.get_label()),
                    value: m.get_gauge().get_value(),
                })
                .collect(),
        ),
    };

    Some(OtlpMetric {
        name: family.get_name().to_string(),
        description: family.get_help().to_string(),
        data,
    })
}

/// Convert every gathered family into a [`MetricBatch`].
#[must_use]
pub fn convert_metrics(families: &[MetricFamily]) -> MetricBatch {
    MetricBatch {
        metrics: families.iter().filter_map(convert_family).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loxone_common::config::ExporterConfig;
    use loxone_metrics::projector::{gather, BuildInfo, NamedSnapshot};
    use loxone_common::model::MirrorSnapshot;

    #[test]
    fn converts_gauge_family_to_gauge_points() {
        let snapshot = MirrorSnapshot::default();
        let config = ExporterConfig::default();
        let named = [NamedSnapshot {
            name: "house",
            snapshot: &snapshot,
        }];
        let families = gather(&named, &config, &BuildInfo::default()).unwrap();
        let batch = convert_metrics(&families);
        let up = batch
            .metrics
            .iter()
            .find(|m| m.name == "loxone_exporter_up")
            .unwrap();
        match &up.data {
            OtlpMetricData::Gauge(points) => {
                assert_eq!(points.len(), 1);
                assert_eq!(points[0].value, 1.0);
            }
            other => panic!("expected gauge data, got {other:?}"),
        }
    }

    #[test]
    fn histogram_bucket_counts_append_overflow_bucket() {
        let registry = prometheus::Registry::new();
        let histogram = prometheus::Histogram::with_opts(
            prometheus::HistogramOpts::new("test_histogram", "help").buckets(vec![1.0, 2.0]),
        )
        .unwrap();
        registry.register(Box::new(histogram.clone())).unwrap();
        histogram.observe(0.5);
        histogram.observe(1.5);
        histogram.observe(5.0);
        let families = registry.gather();
        let batch = convert_metrics(&families);
        let metric = &batch.metrics[0];
        match &metric.data {
            OtlpMetricData::Histogram(points) => {
                let point = &points[0];
                assert_eq!(point.bucket_counts.len(), point.bounds.len() + 1);
                assert_eq!(point.count, 3);
            }
            other => panic!("expected histogram data, got {other:?}"),
        }
    }
}
