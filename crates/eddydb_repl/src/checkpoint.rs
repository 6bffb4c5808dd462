//! Replication checkpoints.
//!
//! A checkpoint records how far replication has progressed in each
//! direction: `local` is the highest local sequence pushed, `remote` an
//! opaque string naming the upstream position. The pair is serialized as
//! JSON, persisted locally and as a document on the peer, and autosaved
//! while dirty.

use crate::actor::Timer;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Callback that persists the checkpoint JSON. Call
/// [`Checkpoint::saved`] once the save has succeeded.
pub type Saver = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug, Default)]
struct Inner {
    local: u64,
    remote: String,
    /// Changed since the last save started.
    dirty: bool,
    /// A save is in flight.
    save_pending: bool,
}

/// The persisted replication position, with autosave.
#[derive(Default)]
pub struct Checkpoint {
    inner: Mutex<Inner>,
    autosave: Mutex<Option<Autosave>>,
}

struct Autosave {
    delay: Duration,
    saver: Saver,
    timer: Arc<Timer>,
}

impl Checkpoint {
    /// Creates an empty checkpoint.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replaces the sequences with those parsed from `json`.
    ///
    /// Unknown keys are ignored; missing keys reset to zero/empty. The
    /// `remote` value may be a JSON number or string.
    pub fn decode_from(&self, json: &str) -> bool {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(json) else {
            return false;
        };
        let mut inner = self.inner.lock();
        inner.local = value.get("local").and_then(|v| v.as_u64()).unwrap_or(0);
        inner.remote = match value.get("remote") {
            Some(serde_json::Value::Number(n)) => n.to_string(),
            Some(serde_json::Value::String(s)) => s.clone(),
            _ => String::new(),
        };
        true
    }

    /// Returns the (local, remote) sequence pair.
    #[must_use]
    pub fn sequences(&self) -> (u64, String) {
        let inner = self.inner.lock();
        (inner.local, inner.remote.clone())
    }

    /// Serializes the checkpoint as JSON. Zero/empty sequences are
    /// omitted, so a fresh checkpoint encodes as `{}`.
    #[must_use]
    pub fn to_json(&self) -> String {
        let inner = self.inner.lock();
        let mut map = serde_json::Map::new();
        if inner.local != 0 {
            map.insert("local".to_owned(), inner.local.into());
        }
        if !inner.remote.is_empty() {
            // Numeric remote positions encode as numbers.
            let value = match inner.remote.parse::<u64>() {
                Ok(n) => serde_json::Value::from(n),
                Err(_) => serde_json::Value::from(inner.remote.clone()),
            };
            map.insert("remote".to_owned(), value);
        }
        serde_json::Value::Object(map).to_string()
    }

    /// Compares this checkpoint with the copy the peer holds. On any
    /// mismatch both sequences reset to zero, forcing replication to
    /// start over.
    pub fn validate_with(&self, remote_copy: &Checkpoint) {
        let (their_local, their_remote) = remote_copy.sequences();
        let mut inner = self.inner.lock();
        if inner.local != their_local || inner.remote != their_remote {
            debug!(
                local = inner.local,
                remote = %inner.remote,
                their_local,
                their_remote = %their_remote,
                "checkpoint mismatch; resetting"
            );
            inner.local = 0;
            inner.remote.clear();
        }
    }

    /// Updates the local (push) sequence, keeping the maximum.
    pub fn set_local(self: &Arc<Self>, sequence: u64) {
        {
            let mut inner = self.inner.lock();
            if sequence <= inner.local {
                return;
            }
            inner.local = sequence;
        }
        self.changed();
    }

    /// Updates the remote (pull) sequence.
    pub fn set_remote(self: &Arc<Self>, sequence: String) {
        {
            let mut inner = self.inner.lock();
            if inner.remote == sequence {
                return;
            }
            inner.remote = sequence;
        }
        self.changed();
    }

    /// True while there are unsaved changes or a save is in flight.
    #[must_use]
    pub fn is_unsaved(&self) -> bool {
        let inner = self.inner.lock();
        inner.dirty || inner.save_pending
    }

    /// Enables autosave: while the checkpoint is dirty, `saver` is called
    /// with the JSON form at most once per `delay`.
    pub fn enable_autosave(self: &Arc<Self>, delay: Duration, saver: Saver) {
        let this = Arc::downgrade(self);
        let timer = Arc::new(Timer::new(move || {
            if let Some(checkpoint) = this.upgrade() {
                checkpoint.save();
            }
        }));
        *self.autosave.lock() = Some(Autosave {
            delay,
            saver,
            timer,
        });
    }

    /// Stops autosave. A save already in flight may still call back.
    pub fn stop_autosave(&self) {
        if let Some(autosave) = self.autosave.lock().take() {
            autosave.timer.cancel();
        }
    }

    /// Saves immediately if dirty and no save is in flight.
    pub fn save(self: &Arc<Self>) {
        let saver = {
            let autosave = self.autosave.lock();
            let Some(autosave) = autosave.as_ref() else {
                return;
            };
            let mut inner = self.inner.lock();
            if !inner.dirty || inner.save_pending {
                return;
            }
            inner.dirty = false;
            inner.save_pending = true;
            Arc::clone(&autosave.saver)
        };
        let json = self.to_json();
        debug!(%json, "saving checkpoint");
        saver(json);
    }

    /// Reports that the in-flight save succeeded. If the checkpoint
    /// changed again meanwhile, another save is scheduled.
    pub fn saved(self: &Arc<Self>) {
        let dirty_again = {
            let mut inner = self.inner.lock();
            inner.save_pending = false;
            inner.dirty
        };
        if dirty_again {
            self.schedule_save();
        }
    }

    fn changed(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            inner.dirty = true;
            if inner.save_pending {
                return; // `saved` will reschedule
            }
        }
        self.schedule_save();
    }

    fn schedule_save(&self) {
        let autosave = self.autosave.lock();
        if let Some(autosave) = autosave.as_ref() {
            if !autosave.timer.is_armed() {
                autosave.timer.fire_after(autosave.delay);
            }
        }
    }
}
