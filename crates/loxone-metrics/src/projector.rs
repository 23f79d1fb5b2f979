//! Pure translation from mirror snapshots to Prometheus text exposition.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use loxone_common::config::ExporterConfig;
use loxone_common::model::{Control, MirrorSnapshot};
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;

const CONTROL_LABELS: &[&str] = &[
    "miniserver",
    "name",
    "room",
    "category",
    "type",
    "subcontrol",
];

/// Errors while projecting a snapshot into metric text.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// A `prometheus` registration or encoding call failed.
    #[error("metric projection failed: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Build information surfaced as `loxone_exporter_build_info`.
#[derive(Debug, Clone)]
pub struct BuildInfo {
    /// Crate version string.
    pub version: String,
    /// Git commit hash, if known at build time.
    pub commit: String,
    /// Build date string.
    pub build_date: String,
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            commit: option_env!("LOXONE_EXPORTER_GIT_SHA")
                .unwrap_or("unknown")
                .to_string(),
            build_date: option_env!("LOXONE_EXPORTER_BUILD_DATE")
                .unwrap_or("unknown")
                .to_string(),
        }
    }
}

/// One Miniserver's mirror alongside the label value used to identify it.
pub struct NamedSnapshot<'a> {
    /// Value of the `miniserver` label for every metric from this snapshot.
    pub name: &'a str,
    /// The snapshot itself.
    pub snapshot: &'a MirrorSnapshot,
}

pub(crate) fn should_exclude(control: &Control, room_name: &str, config: &ExporterConfig) -> bool {
    if config.exclude_rooms.iter().any(|r| r == room_name) {
        return true;
    }
    if config
        .exclude_types
        .iter()
        .any(|t| t == &control.control_type)
    {
        return true;
    }
    config
        .exclude_names
        .iter()
        .any(|pattern| glob_match(pattern, &control.name))
}

/// Minimal shell-style glob matcher supporting `*` and `?`, sufficient for
/// the `exclude_names` filter (no full glob crate is pulled in for this).
fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(pattern: &[u8], text: &[u8]) -> bool {
        match (pattern.first(), text.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&pattern[1..], text) || (!text.is_empty() && inner(pattern, &text[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&pattern[1..], &text[1..]),
            (Some(p), Some(t)) if p == t => inner(&pattern[1..], &text[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

fn collect_control_metrics(
    control: &Control,
    miniserver: &str,
    room_name: &str,
    category_name: &str,
    subcontrol_name: &str,
    config: &ExporterConfig,
    value_metric: &GaugeVec,
    info_metric: Option<&GaugeVec>,
) {
    if should_exclude(control, room_name, config) {
        return;
    }

    if control.text_only {
        if let Some(info_metric) = info_metric {
            for state in control.states.values() {
                let text = state.text_value.clone().unwrap_or_default();
                let _ = info_metric
                    .get_metric_with_label_values(&[
                        miniserver,
                        &control.name,
                        room_name,
                        category_name,
                        &control.control_type,
                        subcontrol_name,
                        &text,
                    ])
                    .map(|m| m.set(1.0));
            }
        }
    } else {
        for state in control.states.values() {
            if let Some(value) = state.numeric_value {
                let _ = value_metric
                    .get_metric_with_label_values(&[
                        miniserver,
                        &control.name,
                        room_name,
                        category_name,
                        &control.control_type,
                        subcontrol_name,
                    ])
                    .map(|m| m.set(value));
            }
        }
    }

    for sub in &control.sub_controls {
        collect_control_metrics(
            sub,
            miniserver,
            room_name,
            category_name,
            &sub.name,
            config,
            value_metric,
            info_metric,
        );
    }
}

/// Render the Prometheus text exposition format for the current set of
/// mirror snapshots, honoring the configured exclusion filters. Pure
/// function of its inputs; never touches the network.
pub fn render(
    snapshots: &[NamedSnapshot<'_>],
    config: &ExporterConfig,
    build_info: &BuildInfo,
) -> Result<String, ProjectionError> {
    let metric_families = gather(snapshots, config, build_info)?;
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Build the same metric set as [`render`] but return the raw
/// `prometheus` proto families instead of encoded text, so the OTLP push
/// loop can convert them without a text round-trip.
pub fn gather(
    snapshots: &[NamedSnapshot<'_>],
    config: &ExporterConfig,
    build_info: &BuildInfo,
) -> Result<Vec<prometheus::proto::MetricFamily>, ProjectionError> {
    let scrape_start = Instant::now();
    let registry = Registry::new();

    let value_metric = GaugeVec::new(
        Opts::new("loxone_control_value", "Current numeric value of a control state"),
        CONTROL_LABELS,
    )?;
    registry.register(Box::new(value_metric.clone()))?;

    let info_metric = if config.include_text_values {
        let mut labels = CONTROL_LABELS.to_vec();
        labels.push("value");
        let metric = GaugeVec::new(
            Opts::new("loxone_control_info", "Present with value 1 for text-only controls"),
            &labels,
        )?;
        registry.register(Box::new(metric.clone()))?;
        Some(metric)
    } else {
        None
    };

    let connected = GaugeVec::new(
        Opts::new("loxone_exporter_connected", "1 if the session to this miniserver is up"),
        &["miniserver"],
    )?;
    registry.register(Box::new(connected.clone()))?;

    let last_update = GaugeVec::new(
        Opts::new(
            "loxone_exporter_last_update_timestamp_seconds",
            "Unix timestamp of the last applied value update",
        ),
        &["miniserver"],
    )?;
    registry.register(Box::new(last_update.clone()))?;

    let controls_discovered = GaugeVec::new(
        Opts::new(
            "loxone_exporter_controls_discovered",
            "Number of controls parsed from the structure file",
        ),
        &["miniserver"],
    )?;
    registry.register(Box::new(controls_discovered.clone()))?;

    let controls_exported = GaugeVec::new(
        Opts::new(
            "loxone_exporter_controls_exported",
            "Number of controls with at least one value emitted this scrape",
        ),
        &["miniserver"],
    )?;
    registry.register(Box::new(controls_exported.clone()))?;

    for named in snapshots {
        let snapshot = named.snapshot;
        connected
            .with_label_values(&[named.name])
            .set(f64::from(u8::from(snapshot.connected)));
        if let Some(ts) = snapshot.last_update {
            if let Ok(secs) = ts.duration_since(UNIX_EPOCH) {
                last_update
                    .with_label_values(&[named.name])
                    .set(secs.as_secs_f64());
            }
        }
        let discovered = snapshot.controls.len()
            + snapshot
                .controls
                .values()
                .map(|c| c.sub_controls.len())
                .sum::<usize>();
        controls_discovered
            .with_label_values(&[named.name])
            .set(discovered as f64);

        let mut exported = 0i64;
        for control in snapshot.controls.values() {
            let room_name = snapshot
                .rooms
                .get(&control.room_id)
                .map(|r| r.name.as_str())
                .unwrap_or_default();
            let category_name = snapshot
                .categories
                .get(&control.cat_id)
                .map(|c| c.name.as_str())
                .unwrap_or_default();
            if !should_exclude(control, room_name, config) {
                exported += 1;
            }
            collect_control_metrics(
                control,
                named.name,
                room_name,
                category_name,
                "",
                config,
                &value_metric,
                info_metric.as_ref(),
            );
        }
        controls_exported
            .with_label_values(&[named.name])
            .set(exported as f64);
    }

    let up = GaugeVec::new(Opts::new("loxone_exporter_up", "1 if the process is running"), &[] as &[&str])?;
    registry.register(Box::new(up.clone()))?;
    up.with_label_values(&[]).set(1.0);

    let build = GaugeVec::new(
        Opts::new("loxone_exporter_build_info", "Always 1, labeled with build metadata"),
        &["version", "commit", "build_date"],
    )?;
    registry.register(Box::new(build.clone()))?;
    build
        .with_label_values(&[&build_info.version, &build_info.commit, &build_info.build_date])
        .set(1.0);

    let scrape_duration = GaugeVec::new(
        Opts::new(
            "loxone_exporter_scrape_duration_seconds",
            "Time taken to render this scrape",
        ),
        &[] as &[&str],
    )?;
    registry.register(Box::new(scrape_duration.clone()))?;
    scrape_duration
        .with_label_values(&[])
        .set(scrape_start.elapsed().as_secs_f64());

    Ok(registry.gather())
}

/// Current Unix timestamp in seconds, used by the OTLP conversion layer
/// when a snapshot carries no `last_update`.
#[must_use]
pub fn now_unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use loxone_common::model::{Category, Room, StateEntry};
    use std::collections::HashMap;

    fn sample_snapshot() -> MirrorSnapshot {
        let mut states = HashMap::new();
        states.insert(
            "active".to_string(),
            StateEntry {
                id: "s1".to_string(),
                name: "active".to_string(),
                numeric_value: Some(1.0),
                text_value: None,
                digital: true,
            },
        );
        let control = Control {
            id: "c1".to_string(),
            name: "Kitchen Light".to_string(),
            room_id: "r1".to_string(),
            cat_id: "cat1".to_string(),
            control_type: "Switch".to_string(),
            text_only: false,
            states,
            sub_controls: vec![],
        };
        let mut controls = HashMap::new();
        controls.insert("c1".to_string(), control);
        let mut rooms = HashMap::new();
        rooms.insert(
            "r1".to_string(),
            Room {
                id: "r1".to_string(),
                name: "Kitchen".to_string(),
            },
        );
        let mut categories = HashMap::new();
        categories.insert(
            "cat1".to_string(),
            Category {
                id: "cat1".to_string(),
                name: "Lighting".to_string(),
            },
        );
        MirrorSnapshot {
            controls,
            rooms,
            categories,
            state_index: HashMap::new(),
            connected: true,
            last_update: Some(SystemTime::now()),
            serial: None,
            firmware: None,
            generation2: false,
        }
    }

    #[test]
    fn glob_matches_star_and_question_mark() {
        assert!(glob_match("Kitchen*", "Kitchen Light"));
        assert!(glob_match("K?tchen*", "Kitchen Light"));
        assert!(!glob_match("Bedroom*", "Kitchen Light"));
    }

    #[test]
    fn renders_control_value_metric() {
        let snapshot = sample_snapshot();
        let config = ExporterConfig::default();
        let named = [NamedSnapshot {
            name: "house",
            snapshot: &snapshot,
        }];
        let text = render(&named, &config, &BuildInfo::default()).unwrap();
        assert!(text.contains("loxone_control_value"));
        assert!(text.contains("Kitchen Light"));
        assert!(text.contains("loxone_exporter_up 1"));
    }

    #[test]
    fn excludes_rooms_per_config() {
        let snapshot = sample_snapshot();
        let mut config = ExporterConfig::default();
        config.exclude_rooms.push("Kitchen".to_string());
        let named = [NamedSnapshot {
            name: "house",
            snapshot: &snapshot,
        }];
        let text = render(&named, &config, &BuildInfo::default()).unwrap();
        assert!(!text.contains("Kitchen Light"));
        assert!(text.contains("loxone_exporter_controls_exported{miniserver=\"house\"} 0"));
    }

    #[test]
    fn metric_names_match_the_expected_namespace() {
        let snapshot = sample_snapshot();
        let config = ExporterConfig::default();
        let named = [NamedSnapshot {
            name: "house",
            snapshot: &snapshot,
        }];
        let text = render(&named, &config, &BuildInfo::default()).unwrap();
        for line in text.lines().filter(|l| !l.starts_with('#')) {
            let name = line.split(['{', ' ']).next().unwrap_or_default();
            assert!(
                name.starts_with("loxone_control") || name.starts_with("loxone_exporter"),
                "unexpected metric name: {name}"
            );
        }
    }
}
