//! End-to-end scenario: parse a structure document, apply two rounds of
//! value/text updates to the mirror, then project the resulting snapshot
//! into Prometheus metrics, exercising the same path the session runner
//! and the scrape handler use in production.

use loxone_common::config::ExporterConfig;
use loxone_metrics::projector::{gather, render, BuildInfo, NamedSnapshot};
use loxone_session::mirror::Mirror;
use loxone_session::structure::{apply_structure, parse_structure};

fn sample_structure() -> serde_json::Value {
    serde_json::json!({
        "msInfo": {"serialNr": "SN1", "swVersion": "14.0", "miniserverType": 1},
        "rooms": {"r1": {"name": "Living Room"}},
        "cats": {"c1": {"name": "Lighting"}},
        "controls": {
            "ctrl1": {
                "name": "Ceiling Light",
                "type": "Switch",
                "room": "r1",
                "cat": "c1",
                "states": {"active": "state-active-1"}
            },
            "ctrl2": {
                "name": "Thermostat Display",
                "type": "InfoOnlyText",
                "room": "r1",
                "cat": "c1",
                "states": {"text": "state-text-1"}
            }
        }
    })
}

#[tokio::test]
async fn structure_then_value_and_text_updates_project_into_metrics() {
    let mirror = Mirror::new();
    let parsed = parse_structure(&sample_structure()).unwrap();
    mirror.write(|snapshot| apply_structure(snapshot, parsed)).await;
    mirror.set_connected(true).await;

    let unknown = mirror
        .apply_value_batch(&[("state-active-1".to_string(), 1.0)])
        .await;
    assert_eq!(unknown, 0);

    let unknown_text = mirror
        .apply_text_batch(&[("state-text-1".to_string(), "22.5C".to_string())])
        .await;
    assert_eq!(unknown_text, 0);

    let mut config = ExporterConfig::default();
    config.include_text_values = true;

    let snapshot = mirror.read(Clone::clone).await;
    let named = [NamedSnapshot {
        name: "house",
        snapshot: &snapshot,
    }];

    let families = gather(&named, &config, &BuildInfo::default()).unwrap();
    let value_family = families
        .iter()
        .find(|f| f.get_name() == "loxone_control_value")
        .expect("loxone_control_value family present");
    assert!(value_family
        .get_metric()
        .iter()
        .any(|m| m.get_gauge().get_value() == 1.0));

    let rendered = render(&named, &config, &BuildInfo::default()).unwrap();
    assert!(rendered.contains("Ceiling Light"));
    assert!(rendered.contains("loxone_exporter_connected{miniserver=\"house\"} 1"));

    // A second round of updates for the same ids is idempotent, matching
    // the Miniserver re-sending the full state batch after a reconnect.
    let unknown_again = mirror
        .apply_value_batch(&[("state-active-1".to_string(), 1.0)])
        .await;
    assert_eq!(unknown_again, 0);
}

#[tokio::test]
async fn unknown_state_ids_from_a_stale_structure_are_not_fatal() {
    let mirror = Mirror::new();
    let parsed = parse_structure(&sample_structure()).unwrap();
    mirror.write(|snapshot| apply_structure(snapshot, parsed)).await;

    let unknown = mirror
        .apply_value_batch(&[("not-a-real-state".to_string(), 5.0)])
        .await;
    assert_eq!(unknown, 1);

    let config = ExporterConfig::default();
    let snapshot = mirror.read(Clone::clone).await;
    let named = [NamedSnapshot {
        name: "house",
        snapshot: &snapshot,
    }];
    // Projection still succeeds even though the batch referenced an
    // id the mirror didn't recognize.
    assert!(render(&named, &config, &BuildInfo::default()).is_ok());
}
