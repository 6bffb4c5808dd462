//! The database worker: a single-threaded gateway to the storage layer.
//!
//! All storage I/O performed by the replication engine goes through this
//! actor, keeping blocking work off the replicator's and pushers' own
//! mailboxes. Callbacks are invoked on the DB worker's thread; callers
//! asynchronize them onto their own mailboxes.

use crate::error::ReplResult;
use crate::status::ActivityLevel;
use crate::store::{BlobStore, ChangeEntry, InsertResult, RevisionToSend, Store};
use crate::worker::WorkerShell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tracing::debug;

/// Result of a checkpoint read: the stored JSON (if any) and whether the
/// database is empty.
#[derive(Debug, Clone)]
pub struct CheckpointRead {
    /// The checkpoint JSON, if one was stored.
    pub data: Option<String>,
    /// True if the database holds no sequences at all.
    pub db_empty: bool,
}

/// The storage gateway actor.
pub struct DbWorker {
    shell: WorkerShell,
    store: Arc<dyn Store>,
    /// Jobs enqueued but not yet finished; drives the busy level.
    pending: AtomicUsize,
    closed: AtomicBool,
}

impl DbWorker {
    /// Creates a DB worker over a store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self {
            shell: WorkerShell::new("db"),
            store,
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// The worker shell (status, parent wiring).
    #[must_use]
    pub fn shell(&self) -> &WorkerShell {
        &self.shell
    }

    /// Runs a storage job on the worker thread, tracking busyness.
    fn run<T: Send + 'static>(
        self: &Arc<Self>,
        job: impl FnOnce(&dyn Store) -> T + Send + 'static,
        done: impl FnOnce(T) + Send + 'static,
    ) {
        if self.closed.load(Ordering::SeqCst) {
            debug!("db worker closed; dropping job");
            return;
        }
        self.begin_job();
        let this = Arc::clone(self);
        self.shell.mailbox().enqueue(move || {
            let result = job(this.store.as_ref());
            done(result);
            this.end_job();
        });
    }

    fn begin_job(&self) {
        if self.pending.fetch_add(1, Ordering::SeqCst) == 0 {
            self.shell.set_level(ActivityLevel::Busy);
        }
    }

    fn end_job(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            let level = if self.closed.load(Ordering::SeqCst) {
                ActivityLevel::Stopped
            } else {
                ActivityLevel::Idle
            };
            self.shell.set_level(level);
        }
    }

    /// Runs an arbitrary read against the store on the worker thread.
    ///
    /// For batched checks that would otherwise take one round-trip per
    /// item (e.g. deciding which offered revisions are new).
    pub fn with_store<T: Send + 'static>(
        self: &Arc<Self>,
        job: impl FnOnce(&dyn Store) -> T + Send + 'static,
        done: impl FnOnce(T) + Send + 'static,
    ) {
        self.run(job, done);
    }

    /// Reads the checkpoint stored under `checkpoint_id`.
    pub fn get_checkpoint(
        self: &Arc<Self>,
        checkpoint_id: &str,
        done: impl FnOnce(ReplResult<CheckpointRead>) + Send + 'static,
    ) {
        let id = checkpoint_id.to_owned();
        self.run(
            move |store| {
                let data = store.get_checkpoint(&id)?;
                Ok(CheckpointRead {
                    data,
                    db_empty: store.last_sequence() == 0,
                })
            },
            done,
        );
    }

    /// Writes the checkpoint stored under `checkpoint_id`.
    pub fn set_checkpoint(
        self: &Arc<Self>,
        checkpoint_id: &str,
        json: &str,
        done: impl FnOnce(ReplResult<()>) + Send + 'static,
    ) {
        let id = checkpoint_id.to_owned();
        let json = json.to_owned();
        self.run(move |store| store.set_checkpoint(&id, &json), done);
    }

    /// Stores a cookie received from the peer's HTTP response.
    pub fn set_cookie(self: &Arc<Self>, cookie: &str) {
        let cookie = cookie.to_owned();
        self.run(
            move |store| {
                if let Err(err) = store.set_cookie(&cookie) {
                    debug!(%err, "failed to store cookie");
                }
            },
            |()| {},
        );
    }

    /// Enumerates changes after `since`, applying the document filter.
    pub fn get_changes(
        self: &Arc<Self>,
        since: u64,
        limit: usize,
        skip_deleted: bool,
        doc_ids: Option<Vec<String>>,
        done: impl FnOnce(ReplResult<Vec<ChangeEntry>>) + Send + 'static,
    ) {
        self.run(
            move |store| {
                let mut changes = store.changes_since(since, limit, skip_deleted)?;
                if let Some(doc_ids) = &doc_ids {
                    changes.retain(|entry| doc_ids.contains(&entry.doc_id));
                }
                Ok(changes)
            },
            done,
        );
    }

    /// Reads a revision (body + history) for sending to the peer.
    pub fn read_revision(
        self: &Arc<Self>,
        doc_id: &str,
        rev_id: &str,
        done: impl FnOnce(ReplResult<RevisionToSend>) + Send + 'static,
    ) {
        let doc_id = doc_id.to_owned();
        let rev_id = rev_id.to_owned();
        self.run(move |store| store.rev_to_send(&doc_id, &rev_id), done);
    }

    /// True if the given revision is already stored.
    pub fn has_revision(
        self: &Arc<Self>,
        doc_id: &str,
        rev_id: &str,
        done: impl FnOnce(ReplResult<bool>) + Send + 'static,
    ) {
        let doc_id = doc_id.to_owned();
        let rev_id = rev_id.to_owned();
        self.run(move |store| store.has_revision(&doc_id, &rev_id), done);
    }

    /// The document's current revision ID.
    pub fn current_rev_id(
        self: &Arc<Self>,
        doc_id: &str,
        done: impl FnOnce(ReplResult<Option<String>>) + Send + 'static,
    ) {
        let doc_id = doc_id.to_owned();
        self.run(move |store| store.current_rev_id(&doc_id), done);
    }

    /// Inserts a pulled revision into storage.
    pub fn insert_revision(
        self: &Arc<Self>,
        doc_id: String,
        history: Vec<String>,
        body: Vec<u8>,
        deleted: bool,
        allow_conflict: bool,
        done: impl FnOnce(ReplResult<InsertResult>) + Send + 'static,
    ) {
        self.run(
            move |store| store.insert_revision(&doc_id, &history, &body, deleted, allow_conflict),
            done,
        );
    }

    /// The blob store (itself thread-safe).
    #[must_use]
    pub fn blobs(&self) -> BlobStore {
        self.store.blobs()
    }

    /// Subscribes to the store's committed-change feed.
    #[must_use]
    pub fn subscribe_changes(&self) -> Receiver<ChangeEntry> {
        self.store.subscribe_changes()
    }

    /// Called when the connection closes: no further jobs are accepted.
    pub fn connection_closed(self: &Arc<Self>) {
        self.closed.store(true, Ordering::SeqCst);
        if self.pending.load(Ordering::SeqCst) == 0 {
            self.shell.set_level(ActivityLevel::Stopped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::mpsc;
    use std::time::Duration;

    fn wait<T>(rx: &mpsc::Receiver<T>) -> T {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn checkpoint_roundtrip_reports_empty_db() {
        let store = MemoryStore::new();
        let db = DbWorker::new(store.clone());

        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        db.get_checkpoint("cp-1", move |result| {
            tx2.send(result.unwrap()).unwrap();
        });
        let read = wait(&rx);
        assert!(read.data.is_none());
        assert!(read.db_empty);

        let (stx, srx) = mpsc::channel();
        db.set_checkpoint("cp-1", r#"{"local":3}"#, move |result| {
            stx.send(result.is_ok()).unwrap();
        });
        assert!(wait(&srx));

        store.create_rev("doc", "1-aa", b"{}", false).unwrap();
        db.get_checkpoint("cp-1", move |result| {
            tx.send(result.unwrap()).unwrap();
        });
        let read = wait(&rx);
        assert_eq!(read.data.as_deref(), Some(r#"{"local":3}"#));
        assert!(!read.db_empty);
    }

    #[test]
    fn get_changes_applies_doc_id_filter() {
        let store = MemoryStore::new();
        for id in ["a", "b", "c"] {
            store
                .create_rev(id, "1-aa", b"{}", false)
                .unwrap();
        }
        let db = DbWorker::new(store);

        let (tx, rx) = mpsc::channel();
        db.get_changes(
            0,
            100,
            false,
            Some(vec!["a".to_owned(), "c".to_owned()]),
            move |result| {
                tx.send(result.unwrap()).unwrap();
            },
        );
        let changes = wait(&rx);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.doc_id == "a" || c.doc_id == "c"));
    }

    #[test]
    fn closed_worker_drops_jobs_and_stops() {
        let store = MemoryStore::new();
        let db = DbWorker::new(store);
        db.connection_closed();
        assert_eq!(db.shell().level(), ActivityLevel::Stopped);

        let (tx, rx) = mpsc::channel::<bool>();
        db.get_changes(0, 10, false, None, move |_| {
            tx.send(true).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
