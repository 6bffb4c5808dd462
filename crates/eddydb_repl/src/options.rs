//! Replicator configuration.

use std::sync::Arc;
use std::time::Duration;

/// How a replication direction operates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ReplicatorMode {
    /// This direction is off.
    #[default]
    Disabled,
    /// Respond to the peer, but never initiate change enumeration.
    Passive,
    /// Replicate until caught up, then stop.
    OneShot,
    /// Keep replicating as new changes commit.
    Continuous,
}

impl ReplicatorMode {
    /// True for `OneShot` or `Continuous`.
    #[must_use]
    pub fn is_active(self) -> bool {
        self > ReplicatorMode::Passive
    }
}

/// Validates a document about to be pulled; return false to reject it.
pub type PullValidator = Arc<dyn Fn(&str, &serde_json::Value) -> bool + Send + Sync>;

/// Options controlling a [`Replicator`](crate::Replicator).
#[derive(Clone, Default)]
pub struct ReplicatorOptions {
    /// Push direction mode.
    pub push: ReplicatorMode,
    /// Pull direction mode.
    pub pull: ReplicatorMode,
    /// Identity under which checkpoints are stored, locally and on the
    /// peer.
    pub client_id: String,
    /// Reject incoming revisions that would create a conflict, and
    /// propose-push against the peer's current revision.
    pub no_conflicts: bool,
    /// Do not propagate deletion tombstones.
    pub skip_deleted: bool,
    /// Restrict replication to these document IDs.
    pub doc_ids: Option<Vec<String>>,
    /// Cookies to present when connecting.
    pub cookies: Option<String>,
    /// Maximum interval between checkpoint autosaves.
    pub checkpoint_interval: Option<Duration>,
    /// Callback vetting each pulled revision.
    pub pull_validator: Option<PullValidator>,
    /// Keep the connection open when idle even without a continuous
    /// direction (listener-style usage).
    pub open_server: bool,
}

impl ReplicatorOptions {
    /// Default autosave interval.
    pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5);

    /// Options for an active push.
    #[must_use]
    pub fn pushing(mode: ReplicatorMode) -> Self {
        Self {
            push: mode,
            client_id: "client".to_owned(),
            ..Self::default()
        }
    }

    /// Options for an active pull.
    #[must_use]
    pub fn pulling(mode: ReplicatorMode) -> Self {
        Self {
            pull: mode,
            client_id: "client".to_owned(),
            ..Self::default()
        }
    }

    /// Options for a passive peer (responds in both directions).
    #[must_use]
    pub fn passive() -> Self {
        Self {
            push: ReplicatorMode::Passive,
            pull: ReplicatorMode::Passive,
            client_id: "server".to_owned(),
            ..Self::default()
        }
    }

    /// Sets the document ID filter.
    #[must_use]
    pub fn with_doc_ids(mut self, doc_ids: Vec<String>) -> Self {
        self.doc_ids = Some(doc_ids);
        self
    }

    /// Sets `no_conflicts` mode.
    #[must_use]
    pub fn with_no_conflicts(mut self, no_conflicts: bool) -> Self {
        self.no_conflicts = no_conflicts;
        self
    }

    /// Sets the checkpoint autosave interval.
    #[must_use]
    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = Some(interval);
        self
    }

    /// Sets the pull validator.
    #[must_use]
    pub fn with_pull_validator(mut self, validator: PullValidator) -> Self {
        self.pull_validator = Some(validator);
        self
    }

    /// True if either direction initiates replication.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.push.is_active() || self.pull.is_active()
    }

    /// True if either direction is continuous.
    #[must_use]
    pub fn is_continuous(&self) -> bool {
        self.push == ReplicatorMode::Continuous || self.pull == ReplicatorMode::Continuous
    }

    /// True if the replicator should stay open when idle: explicit
    /// `open_server`, or any passive direction.
    #[must_use]
    pub fn is_open_server(&self) -> bool {
        self.open_server
            || self.push == ReplicatorMode::Passive
            || self.pull == ReplicatorMode::Passive
    }

    /// The effective autosave interval.
    #[must_use]
    pub fn effective_checkpoint_interval(&self) -> Duration {
        self.checkpoint_interval
            .unwrap_or(Self::DEFAULT_CHECKPOINT_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_activity() {
        assert!(!ReplicatorMode::Disabled.is_active());
        assert!(!ReplicatorMode::Passive.is_active());
        assert!(ReplicatorMode::OneShot.is_active());
        assert!(ReplicatorMode::Continuous.is_active());
    }

    #[test]
    fn passive_counts_as_open_server() {
        assert!(ReplicatorOptions::passive().is_open_server());
        assert!(!ReplicatorOptions::pushing(ReplicatorMode::OneShot).is_open_server());
    }

    #[test]
    fn continuous_detection() {
        assert!(ReplicatorOptions::pushing(ReplicatorMode::Continuous).is_continuous());
        assert!(!ReplicatorOptions::pushing(ReplicatorMode::OneShot).is_continuous());
    }
}
