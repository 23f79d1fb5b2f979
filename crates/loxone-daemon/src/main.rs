//! Loxone exporter daemon entry point.
//!
//! Wires together, per configured Miniserver, a session runner and a
//! shared mirror; one HTTP listener serving `/metrics` and `/healthz`
//! across all mirrors; and, if enabled, one OTLP push loop. All tasks
//! share a single cooperative cancellation token tied to SIGTERM/SIGINT.

mod logging;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use loxone_common::config::{ConfigError, ExporterConfig};
use loxone_metrics::http::{NamedMirror, OtlpHealthSnapshot};
use loxone_metrics::projector::BuildInfo;
use loxone_metrics::MetricsServer;
use loxone_otlp::push::{run_push_loop, ExportHealth, ExportState};
use loxone_session::{run_session, Mirror};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Loxone Miniserver to Prometheus/OTLP exporter.
#[derive(Parser, Debug)]
#[command(
    name = "loxone-exporter",
    about = "Exports Loxone Miniserver state as Prometheus metrics and OTLP",
    version,
    long_about = None
)]
struct Args {
    /// Path to the exporter configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error).
    #[arg(long, short = 'l')]
    log_level: Option<String>,

    /// Print the effective configuration as TOML and exit, without
    /// starting any network task.
    #[arg(long)]
    print_config: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(1);
        }
    };

    if args.print_config {
        match config.to_toml() {
            Ok(toml) => {
                println!("{toml}");
                return ExitCode::SUCCESS;
            }
            Err(err) => {
                eprintln!("failed to render configuration: {err}");
                return ExitCode::from(2);
            }
        }
    }

    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    logging::init_logging(
        log_level,
        &config.log_format,
        logging::secrets_from_config(&config),
    );

    info!(version = env!("CARGO_PKG_VERSION"), "starting loxone-exporter");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start async runtime: {err}");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "fatal error");
            ExitCode::from(2)
        }
    }
}

/// Load configuration from a file if given, otherwise from `LOXONE_*`
/// environment variables alone.
fn load_config(args: &Args) -> Result<ExporterConfig, ConfigError> {
    match &args.config {
        Some(path) => ExporterConfig::from_file(path),
        None => ExporterConfig::from_env(),
    }
}

async fn run(config: ExporterConfig) -> Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_watcher(shutdown.clone()).context("failed to install signal handlers")?;

    let build_info = BuildInfo::default();
    let mut mirrors = Vec::with_capacity(config.miniservers.len());
    let mut tasks = tokio::task::JoinSet::new();

    for ms_config in &config.miniservers {
        let mirror = Mirror::new();
        mirrors.push(NamedMirror {
            name: ms_config.name.clone(),
            mirror: mirror.clone(),
        });
        let ms_config = ms_config.clone();
        let token = shutdown.clone();
        tasks.spawn(async move {
            run_session(ms_config, mirror, token).await;
        });
    }

    let metrics_server = if config.otlp.enabled {
        let otlp_health = Arc::new(ExportHealth::default());
        let renderer_health = Arc::clone(&otlp_health);
        let status_health = Arc::clone(&otlp_health);
        let server = MetricsServer::with_extra_metrics(
            mirrors.clone(),
            config.clone(),
            build_info.clone(),
            Arc::new(move || renderer_health.render_prometheus_lines()),
            Arc::new(move || {
                let state = ExportState::from_gauge_value(status_health.state());
                OtlpHealthSnapshot {
                    state: state.as_str(),
                    failed: state == ExportState::Failed,
                    last_success: status_health.last_success_timestamp(),
                    consecutive_failures: status_health.consecutive_failures(),
                }
            }),
        );

        let otlp_mirrors = mirrors.clone();
        let otlp_config = config.clone();
        let otlp_shutdown = shutdown.clone();
        tasks.spawn(async move {
            run_push_loop(otlp_mirrors, otlp_config, otlp_health, otlp_shutdown).await;
        });

        server
    } else {
        MetricsServer::new(mirrors.clone(), config.clone(), build_info.clone())
    };

    let metrics_shutdown = shutdown.clone();
    tasks.spawn(async move {
        if let Err(err) = metrics_server.serve(metrics_shutdown).await {
            error!(error = %err, "metrics HTTP listener exited with an error");
        }
    });

    let shutdown_timeout = config.shutdown_timeout;
    tokio::select! {
        () = async { while tasks.join_next().await.is_some() {} } => {
            info!("shutdown complete");
        }
        () = async {
            shutdown.cancelled().await;
            tokio::time::sleep(shutdown_timeout).await;
        } => {
            warn!(timeout = ?shutdown_timeout, "graceful shutdown timed out, forcing exit");
        }
    }

    Ok(())
}

/// Install SIGTERM/SIGINT/SIGHUP handlers. SIGTERM and SIGINT both trigger
/// cooperative shutdown; SIGHUP is logged but, like the teacher's
/// `take_reload_request`, does not yet trigger a config reload.
fn spawn_signal_watcher(shutdown: CancellationToken) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sighup = signal(SignalKind::hangup())?;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("received SIGTERM, shutting down");
                        shutdown.cancel();
                        break;
                    }
                    _ = sigint.recv() => {
                        info!("received SIGINT, shutting down");
                        shutdown.cancel();
                        break;
                    }
                    _ = sighup.recv() => {
                        warn!("received SIGHUP (config reload not yet implemented)");
                    }
                }
            }
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received interrupt, shutting down");
            shutdown.cancel();
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_parse_with_config_path() {
        let args = Args::parse_from(["loxone-exporter", "-c", "exporter.toml"]);
        assert_eq!(args.config, Some(PathBuf::from("exporter.toml")));
        assert!(!args.print_config);
    }

    #[test]
    fn args_parse_log_level_override() {
        let args = Args::parse_from(["loxone-exporter", "--log-level", "debug"]);
        assert_eq!(args.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn args_default_to_no_config_file() {
        let args = Args::parse_from(["loxone-exporter"]);
        assert!(args.config.is_none());
        assert!(args.log_level.is_none());
    }
}
