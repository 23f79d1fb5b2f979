//! Parse a Miniserver's `LoxAPP3.json` structure file into the data model.

use std::collections::HashMap;

use loxone_common::model::{Category, Control, MirrorSnapshot, Room, StateEntry, StateRef};
use serde_json::Value;
use thiserror::Error;

/// Errors while parsing a structure document.
#[derive(Debug, Error)]
pub enum StructureError {
    /// The top-level document was not a JSON object.
    #[error("structure document is not an object")]
    NotAnObject,
}

/// The parsed, flattened result of a structure document.
pub struct ParsedStructure {
    /// Top-level controls, keyed by id.
    pub controls: HashMap<String, Control>,
    /// Rooms keyed by id.
    pub rooms: HashMap<String, Room>,
    /// Categories keyed by id.
    pub categories: HashMap<String, Category>,
    /// Reverse index from every known state id to its owning control.
    pub state_index: HashMap<String, StateRef>,
    /// Controller-reported serial number.
    pub serial: Option<String>,
    /// Controller-reported firmware version.
    pub firmware: Option<String>,
    /// True when `msInfo.miniserverType == 2`.
    pub generation2: bool,
}

/// Parse a full `LoxAPP3.json` document.
pub fn parse_structure(data: &Value) -> Result<ParsedStructure, StructureError> {
    let root = data.as_object().ok_or(StructureError::NotAnObject)?;

    let rooms = root
        .get("rooms")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .map(|(id, v)| {
                    let name = v
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    (
                        id.clone(),
                        Room {
                            id: id.clone(),
                            name,
                        },
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    let categories = root
        .get("cats")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .map(|(id, v)| {
                    let name = v
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    (
                        id.clone(),
                        Category {
                            id: id.clone(),
                            name,
                        },
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    let mut state_index = HashMap::new();
    let mut controls = HashMap::new();

    if let Some(raw_controls) = root.get("controls").and_then(Value::as_object) {
        for (id, raw) in raw_controls {
            let control = parse_control(id, raw, "", "", &mut state_index);
            controls.insert(id.clone(), control);
        }
    }

    let ms_info = root.get("msInfo");
    let serial = ms_info
        .and_then(|v| v.get("serialNr"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let firmware = ms_info
        .and_then(|v| v.get("swVersion"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let generation2 = ms_info
        .and_then(|v| v.get("miniserverType"))
        .and_then(Value::as_i64)
        == Some(2);

    Ok(ParsedStructure {
        controls,
        rooms,
        categories,
        state_index,
        serial,
        firmware,
        generation2,
    })
}

/// Recursively parse one control (and its sub-controls), inheriting
/// `room_id`/`cat_id` from the parent when this is a sub-control, and
/// recording every state id into `state_index` against the id of the
/// control it's actually declared on (top-level or sub-control).
fn parse_control(
    id: &str,
    raw: &Value,
    inherited_room: &str,
    inherited_cat: &str,
    state_index: &mut HashMap<String, StateRef>,
) -> Control {
    let name = raw
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let control_type = raw
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let room_id = raw
        .get("room")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| inherited_room.to_string());
    let cat_id = raw
        .get("cat")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| inherited_cat.to_string());

    let mut states = HashMap::new();
    let mut state_names = Vec::new();
    if let Some(raw_states) = raw.get("states").and_then(Value::as_object) {
        for (state_name, state_id_value) in raw_states {
            let Some(state_id) = state_id_value.as_str() else {
                continue;
            };
            state_names.push(state_name.clone());
            let digital = Control::derive_digital(&control_type, state_name);
            states.insert(
                state_name.clone(),
                StateEntry {
                    id: state_id.to_string(),
                    name: state_name.clone(),
                    numeric_value: None,
                    text_value: None,
                    digital,
                },
            );
            state_index.insert(
                state_id.to_string(),
                StateRef {
                    control_id: id.to_string(),
                    state_name: state_name.clone(),
                },
            );
        }
    }

    let text_only = Control::derive_text_only(&control_type, &state_names);

    let sub_controls = raw
        .get("subControls")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .map(|(sub_id, sub_raw)| {
                    parse_control(sub_id, sub_raw, &room_id, &cat_id, state_index)
                })
                .collect()
        })
        .unwrap_or_default();

    Control {
        id: id.to_string(),
        name,
        room_id,
        cat_id,
        control_type,
        text_only,
        states,
        sub_controls,
    }
}

/// Apply a freshly parsed structure wholesale onto a mirror snapshot,
/// replacing the structural maps while leaving connection bookkeeping
/// untouched.
pub fn apply_structure(snapshot: &mut MirrorSnapshot, parsed: ParsedStructure) {
    snapshot.replace_structure(
        parsed.controls,
        parsed.rooms,
        parsed.categories,
        parsed.state_index,
        parsed.generation2,
    );
    snapshot.serial = parsed.serial;
    snapshot.firmware = parsed.firmware;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_document() -> Value {
        serde_json::json!({
            "msInfo": {"serialNr": "ABC123", "swVersion": "13.1", "miniserverType": 2},
            "rooms": {"r1": {"name": "Kitchen"}},
            "cats": {"c1": {"name": "Lighting"}},
            "controls": {
                "ctrl1": {
                    "name": "Kitchen Light",
                    "type": "Switch",
                    "room": "r1",
                    "cat": "c1",
                    "states": {"active": "state-ctrl1-active"},
                    "subControls": {
                        "sub1": {
                            "name": "Kitchen Light Sub",
                            "type": "InfoOnlyDigital",
                            "states": {"active": "state-sub1-active"}
                        }
                    }
                },
                "ctrl2": {
                    "name": "Notes",
                    "type": "TextInput",
                    "states": {"text": "state-ctrl2-text"}
                }
            }
        })
    }

    #[test]
    fn parses_rooms_and_categories() {
        let parsed = parse_structure(&sample_document()).unwrap();
        assert_eq!(parsed.rooms["r1"].name, "Kitchen");
        assert_eq!(parsed.categories["c1"].name, "Lighting");
    }

    #[test]
    fn sub_controls_inherit_room_and_category() {
        let parsed = parse_structure(&sample_document()).unwrap();
        let ctrl1 = &parsed.controls["ctrl1"];
        assert_eq!(ctrl1.sub_controls.len(), 1);
        assert_eq!(ctrl1.sub_controls[0].room_id, "r1");
        assert_eq!(ctrl1.sub_controls[0].cat_id, "c1");
    }

    #[test]
    fn reverse_index_covers_sub_control_states() {
        let parsed = parse_structure(&sample_document()).unwrap();
        let state_ref = &parsed.state_index["state-sub1-active"];
        assert_eq!(state_ref.control_id, "sub1");
        assert_eq!(state_ref.state_name, "active");
    }

    #[test]
    fn reverse_index_uses_top_level_id_for_top_level_states() {
        let parsed = parse_structure(&sample_document()).unwrap();
        let state_ref = &parsed.state_index["state-ctrl1-active"];
        assert_eq!(state_ref.control_id, "ctrl1");
    }

    #[test]
    fn digital_flag_derived_from_type_and_state_name() {
        let parsed = parse_structure(&sample_document()).unwrap();
        let ctrl1 = &parsed.controls["ctrl1"];
        assert!(ctrl1.states["active"].digital);
    }

    #[test]
    fn text_only_control_is_flagged() {
        let parsed = parse_structure(&sample_document()).unwrap();
        assert!(parsed.controls["ctrl2"].text_only);
        assert!(!parsed.controls["ctrl1"].text_only);
    }

    #[test]
    fn detects_generation2() {
        let parsed = parse_structure(&sample_document()).unwrap();
        assert!(parsed.generation2);
    }

    #[test]
    fn every_state_id_appears_exactly_once_in_the_index() {
        let parsed = parse_structure(&sample_document()).unwrap();
        assert_eq!(parsed.state_index.len(), 3);
    }
}
