//! Shared plumbing for workers: status tracking and parent notification.

use crate::actor::Mailbox;
use crate::error::ReplError;
use crate::status::{ActivityLevel, Progress, Status};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Receives a child worker's status updates. Created by the parent with
/// [`Mailbox::asynchronize`] so the body runs on the parent's thread.
pub type StatusSink = Arc<dyn Fn((&'static str, Status)) + Send + Sync>;

/// The state every worker carries: a mailbox, a status, and a parent to
/// notify when the status changes.
pub struct WorkerShell {
    name: &'static str,
    mailbox: Mailbox,
    status: Mutex<Status>,
    parent: Mutex<Option<StatusSink>>,
}

impl WorkerShell {
    /// Creates a shell with its own mailbox thread.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            mailbox: Mailbox::spawn(name),
            status: Mutex::new(Status::default()),
            parent: Mutex::new(None),
        }
    }

    /// The worker's name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The worker's mailbox.
    #[must_use]
    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Sets the parent status sink.
    pub fn set_parent(&self, sink: StatusSink) {
        *self.parent.lock() = Some(sink);
    }

    /// Current status snapshot.
    #[must_use]
    pub fn status(&self) -> Status {
        self.status.lock().clone()
    }

    /// Current activity level.
    #[must_use]
    pub fn level(&self) -> ActivityLevel {
        self.status.lock().level
    }

    /// Sets the activity level and notifies the parent on change.
    pub fn set_level(&self, level: ActivityLevel) {
        let changed = {
            let mut status = self.status.lock();
            let changed = status.level != level;
            status.level = level;
            changed
        };
        if changed {
            debug!(worker = self.name, ?level, "activity level changed");
            self.notify_parent();
        }
    }

    /// Adds to the progress counters and notifies the parent.
    pub fn add_progress(&self, delta: Progress) {
        self.status.lock().progress += delta;
        self.notify_parent();
    }

    /// Overwrites the progress counters and notifies the parent.
    pub fn set_progress(&self, progress: Progress) {
        self.status.lock().progress = progress;
        self.notify_parent();
    }

    /// Records the first error and notifies the parent. Later errors are
    /// logged but do not replace the first.
    pub fn got_error(&self, error: ReplError) {
        let recorded = {
            let mut status = self.status.lock();
            if status.error.is_none() {
                status.error = Some(error.clone());
                true
            } else {
                false
            }
        };
        if recorded {
            debug!(worker = self.name, %error, "worker error");
            self.notify_parent();
        } else {
            debug!(worker = self.name, %error, "suppressed secondary error");
        }
    }

    fn notify_parent(&self) {
        let sink = self.parent.lock().clone();
        if let Some(sink) = sink {
            sink((self.name, self.status()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn status_changes_notify_parent() {
        let shell = WorkerShell::new("child");
        let (tx, rx) = mpsc::channel();
        shell.set_parent(Arc::new(move |(name, status): (&'static str, Status)| {
            tx.send((name, status.level)).unwrap();
        }));

        shell.set_level(ActivityLevel::Busy);
        let (name, level) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(name, "child");
        assert_eq!(level, ActivityLevel::Busy);

        // Unchanged level does not re-notify.
        shell.set_level(ActivityLevel::Busy);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn only_first_error_is_kept() {
        let shell = WorkerShell::new("child");
        shell.got_error(ReplError::http(500, "first"));
        shell.got_error(ReplError::http(502, "second"));
        assert_eq!(shell.status().error.unwrap().code, 500);
    }
}
