//! The scrape (`/metrics`) and liveness (`/healthz`) HTTP endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use loxone_common::config::ExporterConfig;
use loxone_session::Mirror;
use serde::Serialize;
use tracing::warn;

use crate::projector::{render, BuildInfo, NamedSnapshot};
use crate::registry::ScrapeErrorCounter;

/// A named mirror handle the HTTP server holds a read-only reference to.
#[derive(Clone)]
pub struct NamedMirror {
    /// Value of the `miniserver` label for metrics from this mirror.
    pub name: String,
    /// The mirror itself.
    pub mirror: Mirror,
}

/// A closure rendering additional already-formatted Prometheus
/// text-exposition lines, appended to every scrape response. Used by the
/// OTLP push loop to surface its own health without this crate depending
/// on `loxone-otlp` (which itself depends on this crate).
pub type ExtraMetricsFn = Arc<dyn Fn() -> String + Send + Sync>;

/// Snapshot of the OTLP push loop's health, reported inside `/healthz`.
/// Kept as a plain data struct (rather than a dependency on
/// `loxone-otlp::ExportHealth`) for the same reason as [`ExtraMetricsFn`]:
/// `loxone-otlp` already depends on this crate.
#[derive(Clone, Copy)]
pub struct OtlpHealthSnapshot {
    /// Lowercase state name (`"idle"`, `"retrying"`, `"failed"`, ...).
    pub state: &'static str,
    /// True when `state` is `"failed"`.
    pub failed: bool,
    /// Unix timestamp of the last successful export, or 0 if never.
    pub last_success: i64,
    /// Current consecutive-failure streak.
    pub consecutive_failures: u64,
}

/// A closure returning the OTLP push loop's current health, wired through
/// the same way as [`ExtraMetricsFn`].
pub type OtlpHealthFn = Arc<dyn Fn() -> OtlpHealthSnapshot + Send + Sync>;

/// Shared state for the scrape/health router.
pub struct MetricsServerState {
    /// One entry per configured Miniserver.
    pub mirrors: Vec<NamedMirror>,
    /// The validated exporter configuration (read for filters/flags).
    pub config: ExporterConfig,
    /// Static build metadata.
    pub build_info: BuildInfo,
    /// Process-lifetime scrape failure counter.
    pub scrape_errors: ScrapeErrorCounter,
    /// Optional renderer for out-of-crate metrics appended to every scrape.
    pub extra_metrics: Option<ExtraMetricsFn>,
    /// Optional OTLP health reader, folded into `/healthz`.
    pub otlp_health: Option<OtlpHealthFn>,
}

/// Server wrapping the shared state behind an `Arc`, in the style of the
/// teacher's `WebUiServer`.
#[derive(Clone)]
pub struct MetricsServer {
    state: Arc<MetricsServerState>,
}

impl MetricsServer {
    /// Construct a new server from the already-running session mirrors.
    #[must_use]
    pub fn new(
        mirrors: Vec<NamedMirror>,
        config: ExporterConfig,
        build_info: BuildInfo,
    ) -> Self {
        Self {
            state: Arc::new(MetricsServerState {
                mirrors,
                config,
                build_info,
                scrape_errors: ScrapeErrorCounter::new(),
                extra_metrics: None,
                otlp_health: None,
            }),
        }
    }

    /// Attach a renderer for metrics owned by another crate (the OTLP push
    /// loop's self-health gauges) appended to every scrape response, and a
    /// reader of its health folded into `/healthz`. Must be called before
    /// the server starts serving, since the underlying state is shared
    /// behind an `Arc` once constructed.
    #[must_use]
    pub fn with_extra_metrics(
        mirrors: Vec<NamedMirror>,
        config: ExporterConfig,
        build_info: BuildInfo,
        extra_metrics: ExtraMetricsFn,
        otlp_health: OtlpHealthFn,
    ) -> Self {
        Self {
            state: Arc::new(MetricsServerState {
                mirrors,
                config,
                build_info,
                scrape_errors: ScrapeErrorCounter::new(),
                extra_metrics: Some(extra_metrics),
                otlp_health: Some(otlp_health),
            }),
        }
    }

    /// Build the axum router. Split out from [`MetricsServer::serve`] so
    /// tests can exercise routes without binding a socket.
    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(Arc::clone(&self.state))
    }

    /// Bind `listen_address:listen_port` and serve until `shutdown` fires,
    /// honoring the configured graceful-shutdown deadline for in-flight
    /// requests.
    pub async fn serve(
        &self,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> std::io::Result<()> {
        let addr = format!(
            "{}:{}",
            self.state.config.listen_address, self.state.config.listen_port
        );
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(%addr, "scrape endpoint listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
            })
            .await
    }
}

async fn metrics_handler(State(state): State<Arc<MetricsServerState>>) -> Response {
    let mut snapshots = Vec::with_capacity(state.mirrors.len());
    for named in &state.mirrors {
        let snapshot = named.mirror.read(Clone::clone).await;
        snapshots.push((named.name.clone(), snapshot));
    }
    let named_refs: Vec<NamedSnapshot<'_>> = snapshots
        .iter()
        .map(|(name, snapshot)| NamedSnapshot {
            name,
            snapshot,
        })
        .collect();

    match render(&named_refs, &state.config, &state.build_info) {
        Ok(mut body) => {
            body.push_str(&state.scrape_errors.render_line());
            if let Some(extra) = &state.extra_metrics {
                body.push_str(&extra());
            }
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
                .into_response()
        }
        Err(err) => {
            state.scrape_errors.increment();
            warn!(error = %err, "scrape rendering failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    miniservers: Vec<MiniserverHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    otlp: Option<OtlpHealthBody>,
}

#[derive(Serialize)]
struct MiniserverHealth {
    name: String,
    connected: bool,
    last_update: Option<f64>,
    controls_discovered: usize,
    controls_exported: usize,
}

#[derive(Serialize)]
struct OtlpHealthBody {
    state: &'static str,
    last_success: i64,
    consecutive_failures: u64,
}

/// `healthy` iff every configured Miniserver is connected (HTTP 200);
/// `degraded` iff some but not all are connected, or all are connected but
/// the OTLP push loop is latched `FAILED` (HTTP 200); `unhealthy` iff none
/// are connected (HTTP 503). An empty miniserver list is vacuously
/// all-connected and reports `healthy`.
async fn healthz_handler(State(state): State<Arc<MetricsServerState>>) -> Response {
    let mut miniservers = Vec::with_capacity(state.mirrors.len());
    for named in &state.mirrors {
        let (connected, last_update, discovered, exported) = named
            .mirror
            .read(|snapshot| {
                let discovered = snapshot.controls.len()
                    + snapshot
                        .controls
                        .values()
                        .map(|c| c.sub_controls.len())
                        .sum::<usize>();
                let exported = snapshot
                    .controls
                    .values()
                    .filter(|control| {
                        let room_name = snapshot
                            .rooms
                            .get(&control.room_id)
                            .map(|r| r.name.as_str())
                            .unwrap_or_default();
                        !crate::projector::should_exclude(control, room_name, &state.config)
                    })
                    .count();
                let last_update = snapshot.last_update.and_then(|ts| {
                    ts.duration_since(std::time::UNIX_EPOCH)
                        .ok()
                        .map(|d| d.as_secs_f64())
                });
                (snapshot.connected, last_update, discovered, exported)
            })
            .await;
        miniservers.push(MiniserverHealth {
            name: named.name.clone(),
            connected,
            last_update,
            controls_discovered: discovered,
            controls_exported: exported,
        });
    }

    let any_connected = miniservers.iter().any(|m| m.connected);
    let all_connected = miniservers.iter().all(|m| m.connected);

    let otlp_health = state.otlp_health.as_ref().map(|f| f());
    let otlp_failed = otlp_health.as_ref().is_some_and(|h| h.failed);
    let otlp = otlp_health.map(|h| OtlpHealthBody {
        state: h.state,
        last_success: h.last_success,
        consecutive_failures: h.consecutive_failures,
    });

    let (status, code) = if !miniservers.is_empty() && !any_connected {
        ("unhealthy", StatusCode::SERVICE_UNAVAILABLE)
    } else if all_connected && !otlp_failed {
        ("healthy", StatusCode::OK)
    } else {
        ("degraded", StatusCode::OK)
    };

    let body = HealthBody {
        status,
        miniservers,
        otlp,
    };
    (code, axum::Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn metrics_route_serves_prometheus_text() {
        let server = MetricsServer::new(Vec::new(), ExporterConfig::default(), BuildInfo::default());
        let response = server
            .router()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn healthz_route_reports_ok_with_no_miniservers() {
        let server = MetricsServer::new(Vec::new(), ExporterConfig::default(), BuildInfo::default());
        let response = server
            .router()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_reports_unhealthy_and_503_when_none_connected() {
        let mirror = Mirror::new();
        let named = vec![NamedMirror {
            name: "house".to_string(),
            mirror,
        }];
        let server = MetricsServer::new(named, ExporterConfig::default(), BuildInfo::default());
        let response = server
            .router()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await;
        assert_eq!(body["status"], "unhealthy");
    }

    #[tokio::test]
    async fn healthz_reports_degraded_with_200_when_otlp_failed() {
        let mirror = Mirror::new();
        mirror.set_connected(true).await;
        let named = vec![NamedMirror {
            name: "house".to_string(),
            mirror,
        }];
        let otlp_health: OtlpHealthFn = Arc::new(|| OtlpHealthSnapshot {
            state: "failed",
            failed: true,
            last_success: 0,
            consecutive_failures: 10,
        });
        let server = MetricsServer::with_extra_metrics(
            named,
            ExporterConfig::default(),
            BuildInfo::default(),
            Arc::new(|| String::new()),
            otlp_health,
        );
        let response = server
            .router()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["otlp"]["state"], "failed");
    }
}
