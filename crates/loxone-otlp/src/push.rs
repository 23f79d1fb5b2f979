//! The periodic OTLP push loop: snapshot, convert, transmit, classify,
//! retry with exponential backoff.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use loxone_common::config::OtlpConfig;
use loxone_metrics::http::NamedMirror;
use loxone_metrics::projector::{gather, BuildInfo, NamedSnapshot};
use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::convert::{convert_metrics, DataPoint, HistogramDataPoint, OtlpMetricData};

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(300);
const MAX_FAILURES: u32 = 10;

/// Errors transmitting a metric batch.
#[derive(Debug, Error)]
pub enum PushError {
    /// The HTTP request itself failed (connect, TLS, timeout).
    #[error("otlp transport error: {0}")]
    Transport(String),
    /// The collector responded with a non-2xx status.
    #[error("otlp collector rejected export: status {0}")]
    Rejected(u16),
}

/// The push loop's externally observable state, mirrored into
/// `otlp_export_status` as both an int gauge and (via `as_str`) a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum ExportState {
    /// Push loop is configured off.
    Disabled = 0,
    /// Waiting for the next scheduled export.
    Idle = 1,
    /// An export attempt is in flight.
    Exporting = 2,
    /// The previous attempt failed and a retry is backed off.
    Retrying = 3,
    /// `MAX_FAILURES` consecutive attempts have failed; latched until a
    /// success resets the counter.
    Failed = 4,
}

impl ExportState {
    /// Lowercase string form used for logging and the JSON health body.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ExportState::Disabled => "disabled",
            ExportState::Idle => "idle",
            ExportState::Exporting => "exporting",
            ExportState::Retrying => "retrying",
            ExportState::Failed => "failed",
        }
    }

    /// Recover the variant from [`ExportHealth::state`]'s raw gauge value.
    #[must_use]
    pub fn from_gauge_value(value: i64) -> Self {
        match value {
            1 => ExportState::Idle,
            2 => ExportState::Exporting,
            3 => ExportState::Retrying,
            4 => ExportState::Failed,
            _ => ExportState::Disabled,
        }
    }
}

/// Shared, atomics-backed health status for the push loop, read by the
/// metrics projector to emit `otlp_*` self-health gauges.
#[derive(Debug)]
pub struct ExportHealth {
    state: AtomicI64,
    last_success_unix: AtomicI64,
    consecutive_failures: AtomicU64,
    last_duration_millis: AtomicU64,
    exported_metrics_total: AtomicU64,
}

impl Default for ExportHealth {
    fn default() -> Self {
        Self {
            state: AtomicI64::new(ExportState::Disabled as i64),
            last_success_unix: AtomicI64::new(0),
            consecutive_failures: AtomicU64::new(0),
            last_duration_millis: AtomicU64::new(0),
            exported_metrics_total: AtomicU64::new(0),
        }
    }
}

impl ExportHealth {
    fn set_state(&self, state: ExportState) {
        self.state.store(state as i64, Ordering::Relaxed);
    }

    /// Current state as reported to the scrape endpoint.
    #[must_use]
    pub fn state(&self) -> i64 {
        self.state.load(Ordering::Relaxed)
    }

    /// Unix timestamp of the last successful export, or 0 if never.
    #[must_use]
    pub fn last_success_timestamp(&self) -> i64 {
        self.last_success_unix.load(Ordering::Relaxed)
    }

    /// Current consecutive-failure count.
    #[must_use]
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Duration in seconds of the most recent export attempt.
    #[must_use]
    pub fn last_duration_seconds(&self) -> f64 {
        self.last_duration_millis.load(Ordering::Relaxed) as f64 / 1000.0
    }

    /// Total number of metric points successfully exported over the
    /// process lifetime.
    #[must_use]
    pub fn exported_metrics_total(&self) -> u64 {
        self.exported_metrics_total.load(Ordering::Relaxed)
    }

    /// Render the push loop's own health as Prometheus text-exposition
    /// lines, appended to the scrape body alongside the projected mirror
    /// metrics (see `loxone_metrics::http::MetricsServer::with_extra_metrics`).
    #[must_use]
    pub fn render_prometheus_lines(&self) -> String {
        format!(
            "# TYPE otlp_export_status gauge\n\
             otlp_export_status {status}\n\
             # TYPE otlp_last_success_timestamp_seconds gauge\n\
             otlp_last_success_timestamp_seconds {last_success}\n\
             # TYPE otlp_consecutive_failures gauge\n\
             otlp_consecutive_failures {failures}\n\
             # TYPE otlp_export_duration_seconds gauge\n\
             otlp_export_duration_seconds {duration}\n\
             # TYPE otlp_exported_metrics_total counter\n\
             otlp_exported_metrics_total {total}\n",
            status = self.state(),
            last_success = self.last_success_timestamp(),
            failures = self.consecutive_failures(),
            duration = self.last_duration_seconds(),
            total = self.exported_metrics_total(),
        )
    }
}

/// Backoff before the inline retry of the `n`th consecutive failure
/// (1-indexed): `2^(n-1)` seconds, capped at `MAX_DELAY`. The first
/// failure's retry waits `BASE_DELAY` (1s).
fn calculate_backoff(consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1);
    let scaled = BASE_DELAY.saturating_mul(2u32.saturating_pow(exponent));
    scaled.min(MAX_DELAY)
}

#[derive(Serialize)]
struct OtlpAttribute {
    key: String,
    value: OtlpAttributeValue,
}

#[derive(Serialize)]
struct OtlpAttributeValue {
    #[serde(rename = "stringValue")]
    string_value: String,
}

fn attrs_to_json(attrs: &[(String, String)]) -> Vec<OtlpAttribute> {
    attrs
        .iter()
        .map(|(k, v)| OtlpAttribute {
            key: k.clone(),
            value: OtlpAttributeValue {
                string_value: v.clone(),
            },
        })
        .collect()
}

#[derive(Serialize)]
struct JsonDataPoint {
    attributes: Vec<OtlpAttribute>,
    #[serde(rename = "asDouble")]
    as_double: f64,
    #[serde(rename = "timeUnixNano")]
    time_unix_nano: String,
}

#[derive(Serialize)]
struct JsonHistogramDataPoint {
    attributes: Vec<OtlpAttribute>,
    count: String,
    sum: f64,
    #[serde(rename = "explicitBounds")]
    explicit_bounds: Vec<f64>,
    #[serde(rename = "bucketCounts")]
    bucket_counts: Vec<String>,
    #[serde(rename = "timeUnixNano")]
    time_unix_nano: String,
}

#[derive(Serialize)]
struct JsonMetric {
    name: String,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    gauge: Option<JsonNumberData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sum: Option<JsonSumData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    histogram: Option<JsonHistogramData>,
}

#[derive(Serialize)]
struct JsonNumberData {
    #[serde(rename = "dataPoints")]
    data_points: Vec<JsonDataPoint>,
}

#[derive(Serialize)]
struct JsonSumData {
    #[serde(rename = "dataPoints")]
    data_points: Vec<JsonDataPoint>,
    #[serde(rename = "isMonotonic")]
    is_monotonic: bool,
    #[serde(rename = "aggregationTemporality")]
    aggregation_temporality: i32,
}

#[derive(Serialize)]
struct JsonHistogramData {
    #[serde(rename = "dataPoints")]
    data_points: Vec<JsonHistogramDataPoint>,
    #[serde(rename = "aggregationTemporality")]
    aggregation_temporality: i32,
}

#[derive(Serialize)]
struct JsonScopeMetrics {
    scope: JsonScope,
    metrics: Vec<JsonMetric>,
}

#[derive(Serialize)]
struct JsonScope {
    name: String,
}

#[derive(Serialize)]
struct JsonResource {
    attributes: Vec<OtlpAttribute>,
}

#[derive(Serialize)]
struct JsonResourceMetrics {
    resource: JsonResource,
    #[serde(rename = "scopeMetrics")]
    scope_metrics: Vec<JsonScopeMetrics>,
}

#[derive(Serialize)]
struct JsonExportRequest {
    #[serde(rename = "resourceMetrics")]
    resource_metrics: Vec<JsonResourceMetrics>,
}

const AGGREGATION_TEMPORALITY_CUMULATIVE: i32 = 2;

fn build_export_request(
    batch: &crate::convert::MetricBatch,
    resource_attrs: &[KeyValue],
    time_unix_nano: u64,
) -> JsonExportRequest {
    let resource = JsonResource {
        attributes: resource_attrs
            .iter()
            .map(|kv| OtlpAttribute {
                key: kv.key.to_string(),
                value: OtlpAttributeValue {
                    string_value: kv.value.to_string(),
                },
            })
            .collect(),
    };

    let metrics = batch
        .metrics
        .iter()
        .map(|metric| {
            let (gauge, sum, histogram) = match &metric.data {
                OtlpMetricData::Gauge(points) => (
                    Some(JsonNumberData {
                        data_points: to_json_points(points, time_unix_nano),
                    }),
                    None,
                    None,
                ),
                OtlpMetricData::Sum(points) => (
                    None,
                    Some(JsonSumData {
                        data_points: to_json_points(points, time_unix_nano),
                        is_monotonic: true,
                        aggregation_temporality: AGGREGATION_TEMPORALITY_CUMULATIVE,
                    }),
                    None,
                ),
                OtlpMetricData::Histogram(points) => (
                    None,
                    None,
                    Some(JsonHistogramData {
                        data_points: to_json_histogram_points(points, time_unix_nano),
                        aggregation_temporality: AGGREGATION_TEMPORALITY_CUMULATIVE,
                    }),
                ),
            };
            JsonMetric {
                name: metric.name.clone(),
                description: metric.description.clone(),
                gauge,
                sum,
                histogram,
            }
        })
        .collect();

    JsonExportRequest {
        resource_metrics: vec![JsonResourceMetrics {
            resource,
            scope_metrics: vec![JsonScopeMetrics {
                scope: JsonScope {
                    name: "loxone-exporter".to_string(),
                },
                metrics,
            }],
        }],
    }
}

fn to_json_points(points: &[DataPoint], time_unix_nano: u64) -> Vec<JsonDataPoint> {
    points
        .iter()
        .map(|p| JsonDataPoint {
            attributes: attrs_to_json(&p.attributes),
            as_double: p.value,
            time_unix_nano: time_unix_nano.to_string(),
        })
        .collect()
}

fn to_json_histogram_points(
    points: &[HistogramDataPoint],
    time_unix_nano: u64,
) -> Vec<JsonHistogramDataPoint> {
    points
        .iter()
        .map(|p| JsonHistogramDataPoint {
            attributes: attrs_to_json(&p.attributes),
            count: p.count.to_string(),
            sum: p.sum,
            explicit_bounds: p.bounds.clone(),
            bucket_counts: p.bucket_counts.iter().map(u64::to_string).collect(),
            time_unix_nano: time_unix_nano.to_string(),
        })
        .collect()
}

fn build_resource(config: &OtlpConfig) -> Resource {
    let mut attrs = vec![KeyValue::new(
        opentelemetry_semantic_conventions::resource::SERVICE_NAME,
        "loxone-exporter",
    )];
    for raw in &config.resource_attributes {
        if let Some((k, v)) = raw.split_once('=') {
            attrs.push(KeyValue::new(k.to_string(), v.to_string()));
        }
    }
    Resource::builder().with_attributes(attrs).build()
}

fn resource_key_values(resource: &Resource) -> Vec<KeyValue> {
    resource
        .iter()
        .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
        .collect()
}

/// Attach every configured `Header-Name: value` pair verbatim, e.g. a
/// collector's bearer token or API key. Malformed entries (no `:`) are
/// skipped rather than rejected, since config validation happens earlier.
fn apply_auth_headers(
    mut builder: reqwest::RequestBuilder,
    auth_headers: &[String],
) -> reqwest::RequestBuilder {
    for raw in auth_headers {
        if let Some((name, value)) = raw.split_once(':') {
            builder = builder.header(name.trim(), value.trim());
        }
    }
    builder
}

async fn transmit(
    client: &reqwest::Client,
    endpoint: &str,
    timeout: Duration,
    auth_headers: &[String],
    request: &JsonExportRequest,
) -> Result<(), PushError> {
    let url = format!("{}/v1/metrics", endpoint.trim_end_matches('/'));
    let builder = apply_auth_headers(client.post(&url), auth_headers);
    let response = builder
        .timeout(timeout)
        .json(request)
        .send()
        .await
        .map_err(|e| PushError::Transport(e.to_string()))?;

    if response.status().is_success() {
        Ok(())
    } else {
        Err(PushError::Rejected(response.status().as_u16()))
    }
}

/// One snapshot-gather-convert-transmit attempt. Returns the number of
/// data points sent on success, or a description of the failure.
async fn run_export_cycle(
    mirrors: &[NamedMirror],
    config: &loxone_common::config::ExporterConfig,
    build_info: &BuildInfo,
    client: &reqwest::Client,
    resource_attrs: &[KeyValue],
) -> Result<usize, String> {
    let mut snapshots = Vec::with_capacity(mirrors.len());
    for named in mirrors {
        let snapshot = named.mirror.read(Clone::clone).await;
        snapshots.push((named.name.clone(), snapshot));
    }
    let named_refs: Vec<NamedSnapshot<'_>> = snapshots
        .iter()
        .map(|(name, snapshot)| NamedSnapshot {
            name: name.as_str(),
            snapshot,
        })
        .collect();

    let families = gather(&named_refs, config, build_info).map_err(|e| e.to_string())?;
    let batch = convert_metrics(&families);
    let point_count: usize = batch
        .metrics
        .iter()
        .map(|m| match &m.data {
            OtlpMetricData::Gauge(p) | OtlpMetricData::Sum(p) => p.len(),
            OtlpMetricData::Histogram(p) => p.len(),
        })
        .sum();
    let time_unix_nano = unix_nano_now();
    let request = build_export_request(&batch, resource_attrs, time_unix_nano);
    timeout_transmit(client, &config.otlp, &request)
        .await
        .map(|()| point_count)
        .map_err(|e| e.to_string())
}

/// Run the OTLP push loop forever, honoring `config.enabled`. Returns only
/// when `shutdown` is triggered.
pub async fn run_push_loop(
    mirrors: Vec<NamedMirror>,
    config: loxone_common::config::ExporterConfig,
    health: Arc<ExportHealth>,
    shutdown: tokio_util::sync::CancellationToken,
) {
    if !config.otlp.enabled {
        health.set_state(ExportState::Disabled);
        return;
    }

    health.set_state(ExportState::Idle);
    let resource = build_resource(&config.otlp);
    let resource_attrs = resource_key_values(&resource);
    let client = reqwest::Client::new();
    let build_info = BuildInfo::default();

    let mut consecutive_failures: u32 = 0;

    loop {
        tokio::select! {
            () = tokio::time::sleep(config.otlp.interval) => {}
            () = shutdown.cancelled() => return,
        }

        // A prior run latched FAILED; a fresh scheduled tick starts a new
        // streak rather than keeping the old one's count climbing.
        if health.state() == ExportState::Failed as i64 {
            consecutive_failures = 0;
            health.consecutive_failures.store(0, Ordering::Relaxed);
            health.set_state(ExportState::Idle);
        }

        health.set_state(ExportState::Exporting);
        let started = Instant::now();
        let mut result =
            run_export_cycle(&mirrors, &config, &build_info, &client, &resource_attrs).await;

        // Retry once inline, after a single backoff sleep, before handing
        // control back to the scheduler.
        if let Err(reason) = &result {
            health.set_state(ExportState::Retrying);
            let backoff = calculate_backoff(consecutive_failures + 1);
            warn!(error = %reason, backoff = ?backoff, "otlp export failed, retrying inline");
            tokio::select! {
                () = tokio::time::sleep(backoff) => {}
                () = shutdown.cancelled() => return,
            }
            health.set_state(ExportState::Exporting);
            result =
                run_export_cycle(&mirrors, &config, &build_info, &client, &resource_attrs).await;
        }

        health
            .last_duration_millis
            .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);

        match result {
            Ok(point_count) => {
                consecutive_failures = 0;
                health.consecutive_failures.store(0, Ordering::Relaxed);
                health.exported_metrics_total.fetch_add(point_count as u64, Ordering::Relaxed);
                health
                    .last_success_unix
                    .store(now_unix_secs(), Ordering::Relaxed);
                health.set_state(ExportState::Idle);
                info!(points = point_count, "otlp export succeeded");
            }
            Err(reason) => {
                consecutive_failures += 1;
                health
                    .consecutive_failures
                    .store(u64::from(consecutive_failures), Ordering::Relaxed);
                if consecutive_failures >= MAX_FAILURES {
                    health.set_state(ExportState::Failed);
                } else {
                    health.set_state(ExportState::Retrying);
                }
                warn!(error = %reason, consecutive_failures, "otlp export failed after inline retry");
            }
        }
    }
}

async fn timeout_transmit(
    client: &reqwest::Client,
    config: &OtlpConfig,
    request: &JsonExportRequest,
) -> Result<(), PushError> {
    transmit(client, &config.endpoint, config.timeout, &config.auth_headers, request).await
}

fn unix_nano_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

fn now_unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(calculate_backoff(1), Duration::from_secs(1));
        assert_eq!(calculate_backoff(2), Duration::from_secs(2));
        assert_eq!(calculate_backoff(3), Duration::from_secs(4));
        assert_eq!(calculate_backoff(20), MAX_DELAY);
    }

    #[test]
    fn export_health_starts_disabled() {
        let health = ExportHealth::default();
        assert_eq!(health.state(), ExportState::Disabled as i64);
        assert_eq!(health.consecutive_failures(), 0);
    }

    #[test]
    fn render_prometheus_lines_includes_all_five_gauges() {
        let health = ExportHealth::default();
        let rendered = health.render_prometheus_lines();
        assert!(rendered.contains("otlp_export_status 0"));
        assert!(rendered.contains("otlp_last_success_timestamp_seconds 0"));
        assert!(rendered.contains("otlp_consecutive_failures 0"));
        assert!(rendered.contains("otlp_export_duration_seconds 0"));
        assert!(rendered.contains("otlp_exported_metrics_total 0"));
    }

    #[test]
    fn export_state_as_str_matches_variant() {
        assert_eq!(ExportState::Retrying.as_str(), "retrying");
        assert_eq!(ExportState::Failed.as_str(), "failed");
    }

    #[tokio::test]
    async fn disabled_config_exits_immediately() {
        let health = Arc::new(ExportHealth::default());
        let shutdown = tokio_util::sync::CancellationToken::new();
        let config = loxone_common::config::ExporterConfig::default();
        run_push_loop(Vec::new(), config, Arc::clone(&health), shutdown).await;
        assert_eq!(health.state(), ExportState::Disabled as i64);
    }
}
