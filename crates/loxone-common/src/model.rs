//! In-memory mirror of a single Miniserver's structure and live values.

use std::collections::HashMap;
use std::time::SystemTime;

/// Control types whose `active`/`value` state is a digital (boolean-ish)
/// quantity rather than an analog one.
pub const DIGITAL_CONTROL_TYPES: &[&str] = &[
    "Switch",
    "TimedSwitch",
    "Pushbutton",
    "InfoOnlyDigital",
    "PresenceDetector",
    "SmokeAlarm",
];

const DIGITAL_STATE_NAMES: &[&str] = &["active", "value"];

/// Control types whose states are always textual, regardless of the state
/// names present.
pub const TEXT_ONLY_CONTROL_TYPES: &[&str] = &["TextInput", "Webpage", "TextState"];

/// State names that, when exhaustive for a control, mark it text-only even
/// if its type is not in [`TEXT_ONLY_CONTROL_TYPES`].
pub const TEXT_STATE_NAMES: &[&str] = &["textAndIcon", "text", "textColor", "textInput"];

/// A single named state belonging to a [`Control`].
#[derive(Debug, Clone, Default)]
pub struct StateEntry {
    /// Stable identifier for this state, canonical lowercase hyphenated form.
    pub id: String,
    /// State name, scoped to the owning control (e.g. `"value"`, `"active"`).
    pub name: String,
    /// Most recently received numeric value, if any.
    pub numeric_value: Option<f64>,
    /// Most recently received text value, if any.
    pub text_value: Option<String>,
    /// True when this state represents a digital (boolean-ish) quantity.
    pub digital: bool,
}

/// A single addressable entity on a Miniserver.
#[derive(Debug, Clone, Default)]
pub struct Control {
    /// Stable identifier, canonical lowercase hyphenated form.
    pub id: String,
    /// Human-assigned name, arbitrary Unicode.
    pub name: String,
    /// Owning room identifier, empty string if unassigned.
    pub room_id: String,
    /// Owning category identifier, empty string if unassigned.
    pub cat_id: String,
    /// Control type tag, e.g. `"Switch"`, `"InfoOnlyAnalog"`.
    pub control_type: String,
    /// True when every state on this control (and its sub-controls) is
    /// textual rather than numeric.
    pub text_only: bool,
    /// States keyed by state name.
    pub states: HashMap<String, StateEntry>,
    /// Nested sub-controls, inheriting this control's room and category.
    pub sub_controls: Vec<Control>,
}

impl Control {
    /// Derive [`Control::text_only`] from the control's type and state set.
    #[must_use]
    pub fn derive_text_only(control_type: &str, state_names: &[String]) -> bool {
        if TEXT_ONLY_CONTROL_TYPES.contains(&control_type) {
            return true;
        }
        !state_names.is_empty()
            && state_names
                .iter()
                .all(|name| TEXT_STATE_NAMES.contains(&name.as_str()))
    }

    /// Derive [`StateEntry::digital`] from the owning control's type and the
    /// state name.
    #[must_use]
    pub fn derive_digital(control_type: &str, state_name: &str) -> bool {
        DIGITAL_CONTROL_TYPES.contains(&control_type) && DIGITAL_STATE_NAMES.contains(&state_name)
    }
}

/// A Miniserver room grouping.
#[derive(Debug, Clone, Default)]
pub struct Room {
    /// Stable identifier.
    pub id: String,
    /// Human-assigned name.
    pub name: String,
}

/// A Miniserver category grouping.
#[derive(Debug, Clone, Default)]
pub struct Category {
    /// Stable identifier.
    pub id: String,
    /// Human-assigned name.
    pub name: String,
}

/// A reverse-index entry pointing a wire state identifier back to its
/// owning control and state name, avoiding a tree walk on every incoming
/// value frame.
#[derive(Debug, Clone)]
pub struct StateRef {
    /// Identifier of the control that owns this state directly: the
    /// top-level control's own id if the state lives there, or the
    /// sub-control's own id if it doesn't. [`MirrorSnapshot::find_control`]
    /// and its `_mut` counterpart fall back to scanning sub-controls for
    /// this id, the same two-step lookup the Miniserver client performs.
    pub control_id: String,
    /// Scoped state name on the owning control or sub-control.
    pub state_name: String,
}

/// The full live mirror for a single Miniserver.
#[derive(Debug, Clone, Default)]
pub struct MirrorSnapshot {
    /// Top-level controls keyed by id. Sub-controls live nested inside.
    pub controls: HashMap<String, Control>,
    /// Rooms keyed by id.
    pub rooms: HashMap<String, Room>,
    /// Categories keyed by id.
    pub categories: HashMap<String, Category>,
    /// Maps every known state id (including those on sub-controls) to the
    /// owning top-level control id and scoped state name.
    pub state_index: HashMap<String, StateRef>,
    /// True while the session runner is inside its receive loop.
    pub connected: bool,
    /// Wall-clock time of the most recent successfully applied value
    /// update, if any.
    pub last_update: Option<SystemTime>,
    /// Controller-reported serial number, if known.
    pub serial: Option<String>,
    /// Controller-reported firmware version string, if known.
    pub firmware: Option<String>,
    /// True when the structure reports `miniserverType == 2` (Gen2).
    pub generation2: bool,
}

impl MirrorSnapshot {
    /// Replace the structural maps wholesale, as happens on every
    /// successful (re)connection. Connection/runtime bookkeeping fields are
    /// left untouched.
    pub fn replace_structure(
        &mut self,
        controls: HashMap<String, Control>,
        rooms: HashMap<String, Room>,
        categories: HashMap<String, Category>,
        state_index: HashMap<String, StateRef>,
        generation2: bool,
    ) {
        self.controls = controls;
        self.rooms = rooms;
        self.categories = categories;
        self.state_index = state_index;
        self.generation2 = generation2;
    }

    /// Look up a control by id, searching one level of sub-controls.
    #[must_use]
    pub fn find_control(&self, control_id: &str) -> Option<&Control> {
        if let Some(c) = self.controls.get(control_id) {
            return Some(c);
        }
        self.controls
            .values()
            .flat_map(|c| c.sub_controls.iter())
            .find(|c| c.id == control_id)
    }

    /// Mutable counterpart of [`MirrorSnapshot::find_control`].
    pub fn find_control_mut(&mut self, control_id: &str) -> Option<&mut Control> {
        if self.controls.contains_key(control_id) {
            return self.controls.get_mut(control_id);
        }
        self.controls
            .values_mut()
            .flat_map(|c| c.sub_controls.iter_mut())
            .find(|c| c.id == control_id)
    }
}
