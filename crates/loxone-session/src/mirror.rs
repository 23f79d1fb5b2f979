//! Shared, single-writer-per-snapshot in-memory mirror for one Miniserver.

use std::sync::Arc;
use std::time::SystemTime;

use loxone_common::model::MirrorSnapshot;
use tokio::sync::RwLock;

/// A cheaply clonable handle to a Miniserver's mirror. The session runner
/// holds the only writer; the metric projector and OTLP push loop take
/// read locks.
#[derive(Clone, Default)]
pub struct Mirror {
    inner: Arc<RwLock<MirrorSnapshot>>,
}

impl Mirror {
    /// Create a fresh, empty, disconnected mirror.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a read lock and run `f` against the current snapshot.
    pub async fn read<R>(&self, f: impl FnOnce(&MirrorSnapshot) -> R) -> R {
        let guard = self.inner.read().await;
        f(&guard)
    }

    /// Take a write lock and run `f` against the current snapshot. Only
    /// the session runner should call this.
    pub async fn write<R>(&self, f: impl FnOnce(&mut MirrorSnapshot) -> R) -> R {
        let mut guard = self.inner.write().await;
        f(&mut guard)
    }

    /// Mark the mirror connected or disconnected. Clearing `connected`
    /// never rewinds `last_update`.
    pub async fn set_connected(&self, connected: bool) {
        self.write(|snapshot| snapshot.connected = connected).await;
    }

    /// Apply a decoded VALUE_STATES batch: for every `(state_id, value)`
    /// pair whose id is present in the reverse index, write the new
    /// numeric value into the owning control's state entry. Unknown ids
    /// are counted and returned so the caller can log them at debug level.
    /// Idempotent: applying the same batch twice leaves the mirror in the
    /// same observable state.
    pub async fn apply_value_batch(&self, updates: &[(String, f64)]) -> usize {
        self.write(|snapshot| {
            let mut unknown = 0usize;
            let mut applied = false;
            for (state_id, value) in updates {
                let Some(state_ref) = snapshot.state_index.get(state_id).cloned() else {
                    unknown += 1;
                    continue;
                };
                if let Some(control) = snapshot.find_control_mut(&state_ref.control_id) {
                    if let Some(state) = control.states.get_mut(&state_ref.state_name) {
                        state.numeric_value = Some(*value);
                        applied = true;
                    }
                }
            }
            if applied {
                snapshot.last_update = Some(SystemTime::now());
            }
            unknown
        })
        .await
    }

    /// Apply a decoded TEXT_STATES batch, analogous to
    /// [`Mirror::apply_value_batch`] but for text values.
    pub async fn apply_text_batch(&self, updates: &[(String, String)]) -> usize {
        self.write(|snapshot| {
            let mut unknown = 0usize;
            let mut applied = false;
            for (state_id, text) in updates {
                let Some(state_ref) = snapshot.state_index.get(state_id).cloned() else {
                    unknown += 1;
                    continue;
                };
                if let Some(control) = snapshot.find_control_mut(&state_ref.control_id) {
                    if let Some(state) = control.states.get_mut(&state_ref.state_name) {
                        state.text_value = Some(text.clone());
                        applied = true;
                    }
                }
            }
            if applied {
                snapshot.last_update = Some(SystemTime::now());
            }
            unknown
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::{apply_structure, parse_structure};

    fn sample_mirror() -> Mirror {
        let doc = serde_json::json!({
            "controls": {
                "ctrl1": {
                    "name": "Light",
                    "type": "Switch",
                    "states": {"active": "state-1"}
                }
            }
        });
        let parsed = parse_structure(&doc).unwrap();
        let mirror = Mirror::new();
        let snapshot_clone = mirror.clone();
        tokio_test_block_on(async move {
            snapshot_clone
                .write(|snapshot| apply_structure(snapshot, parsed))
                .await;
        });
        mirror
    }

    fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(f)
    }

    #[test]
    fn unknown_state_ids_are_counted_not_fatal() {
        let mirror = sample_mirror();
        let unknown = tokio_test_block_on(mirror.apply_value_batch(&[("nope".to_string(), 1.0)]));
        assert_eq!(unknown, 1);
    }

    #[test]
    fn applying_a_value_batch_updates_the_state_and_timestamp() {
        let mirror = sample_mirror();
        tokio_test_block_on(mirror.apply_value_batch(&[("state-1".to_string(), 1.0)]));
        let value = tokio_test_block_on(mirror.read(|snapshot| {
            snapshot.controls["ctrl1"].states["active"].numeric_value
        }));
        assert_eq!(value, Some(1.0));
        let updated = tokio_test_block_on(mirror.read(|snapshot| snapshot.last_update.is_some()));
        assert!(updated);
    }

    #[test]
    fn applying_the_same_batch_twice_is_idempotent() {
        let mirror = sample_mirror();
        tokio_test_block_on(mirror.apply_value_batch(&[("state-1".to_string(), 3.0)]));
        tokio_test_block_on(mirror.apply_value_batch(&[("state-1".to_string(), 3.0)]));
        let value = tokio_test_block_on(mirror.read(|snapshot| {
            snapshot.controls["ctrl1"].states["active"].numeric_value
        }));
        assert_eq!(value, Some(3.0));
    }

    #[test]
    fn disconnecting_does_not_clear_last_update() {
        let mirror = sample_mirror();
        tokio_test_block_on(mirror.apply_value_batch(&[("state-1".to_string(), 1.0)]));
        tokio_test_block_on(mirror.set_connected(false));
        let updated = tokio_test_block_on(mirror.read(|snapshot| snapshot.last_update.is_some()));
        assert!(updated);
        let connected = tokio_test_block_on(mirror.read(|snapshot| snapshot.connected));
        assert!(!connected);
    }
}
