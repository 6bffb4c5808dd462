//! The push side of replication.
//!
//! The Pusher enumerates local change sequences through the DB worker,
//! offers them to the peer (`proposeChanges` when active, `changes` when
//! serving a pull), sends the bodies the peer asks for as `rev`
//! messages, and advances the local half of the checkpoint after each
//! completed batch. Peer rejections surface as per-document errors; the
//! push continues past them.

use crate::db_worker::DbWorker;
use crate::error::{DocError, ReplError};
use crate::message::{Connection, MessageBuilder, MessageProgress, MessageProgressState};
use crate::options::ReplicatorOptions;
use crate::status::{ActivityLevel, Progress};
use crate::store::{ChangeEntry, RevisionToSend};
use crate::wire;
use crate::worker::WorkerShell;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How many changes are offered per batch.
const CHANGES_BATCH_SIZE: usize = 200;

/// Pusher state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushState {
    Idle,
    EnumeratingChanges,
    SendingProposals,
    AwaitingAck,
    Error,
}

/// Receives the highest pushed sequence after each completed batch.
pub type LocalCheckpointSink = Arc<dyn Fn(u64) + Send + Sync>;
/// Receives per-document push errors.
pub type DocErrorSink = Arc<dyn Fn(DocError) + Send + Sync>;

struct PusherInner {
    state: PushState,
    /// Sequence up to which changes have been enumerated.
    enumerated: u64,
    /// Revisions of the current batch still awaiting an ack.
    batch_pending: usize,
    /// Highest sequence in the current batch.
    batch_max_seq: u64,
    caught_up: bool,
    stopped: bool,
    feed_running: bool,
}

/// The push worker.
pub struct Pusher {
    shell: WorkerShell,
    connection: Arc<dyn Connection>,
    db: Arc<DbWorker>,
    /// Active pushers propose; passive ones (serving `subChanges`) send
    /// plain change lists.
    proposes: bool,
    /// Keep pushing as new changes commit.
    follows_feed: bool,
    skip_deleted: bool,
    doc_ids: Option<Vec<String>>,
    checkpoint_sink: Option<LocalCheckpointSink>,
    doc_errors: DocErrorSink,
    inner: Mutex<PusherInner>,
}

impl Pusher {
    /// Creates an active pusher driven by the local checkpoint.
    #[must_use]
    pub fn active(
        connection: Arc<dyn Connection>,
        db: Arc<DbWorker>,
        options: &ReplicatorOptions,
        checkpoint_sink: LocalCheckpointSink,
        doc_errors: DocErrorSink,
    ) -> Arc<Self> {
        let follows_feed = options.is_continuous();
        Arc::new(Self {
            shell: WorkerShell::new("push"),
            connection,
            db,
            proposes: true,
            follows_feed,
            skip_deleted: options.skip_deleted,
            doc_ids: options.doc_ids.clone(),
            checkpoint_sink: Some(checkpoint_sink),
            doc_errors,
            inner: Mutex::new(PusherInner {
                state: PushState::Idle,
                enumerated: 0,
                batch_pending: 0,
                batch_max_seq: 0,
                caught_up: false,
                stopped: false,
                feed_running: false,
            }),
        })
    }

    /// Creates a passive pusher serving a peer's `subChanges` request.
    /// The peer's filters override the local options.
    #[must_use]
    pub fn passive(
        connection: Arc<dyn Connection>,
        db: Arc<DbWorker>,
        options: &ReplicatorOptions,
        skip_deleted: bool,
        doc_ids: Option<Vec<String>>,
        doc_errors: DocErrorSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            shell: WorkerShell::new("push"),
            connection,
            db,
            proposes: false,
            follows_feed: true,
            skip_deleted,
            doc_ids,
            checkpoint_sink: None,
            doc_errors,
            inner: Mutex::new(PusherInner {
                state: PushState::Idle,
                enumerated: 0,
                batch_pending: 0,
                batch_max_seq: 0,
                caught_up: false,
                stopped: false,
                feed_running: false,
            }),
        })
    }

    /// The worker shell (status, parent wiring).
    #[must_use]
    pub fn shell(&self) -> &WorkerShell {
        &self.shell
    }

    /// Starts pushing changes recorded after `since`.
    pub fn start(self: &Arc<Self>, since: u64) {
        let this = Arc::clone(self);
        self.shell.mailbox().enqueue(move || {
            info!(since, proposes = this.proposes, "pusher starting");
            this.shell.set_level(ActivityLevel::Busy);
            if this.follows_feed {
                this.start_feed();
            }
            this.enumerate(since);
        });
    }

    /// Marks the worker stopped; pending callbacks become no-ops.
    pub fn connection_closed(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.shell.mailbox().enqueue(move || {
            this.inner.lock().stopped = true;
            this.shell.set_level(ActivityLevel::Stopped);
        });
    }

    fn start_feed(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.feed_running {
                return;
            }
            inner.feed_running = true;
        }
        let rx = self.db.subscribe_changes();
        let this = Arc::clone(self);
        std::thread::Builder::new()
            .name("eddydb-push-feed".to_owned())
            .spawn(move || {
                while let Ok(entry) = rx.recv() {
                    if this.inner.lock().stopped {
                        break;
                    }
                    let notify = Arc::clone(&this);
                    this.shell
                        .mailbox()
                        .enqueue(move || notify.on_feed_change(entry.sequence));
                }
            })
            .expect("failed to spawn feed thread");
    }

    fn on_feed_change(self: &Arc<Self>, sequence: u64) {
        let since = {
            let inner = self.inner.lock();
            if inner.stopped || !inner.caught_up || sequence <= inner.enumerated {
                return;
            }
            inner.enumerated
        };
        debug!(sequence, "change feed woke pusher");
        self.shell.set_level(ActivityLevel::Busy);
        self.enumerate(since);
    }

    fn enumerate(self: &Arc<Self>, since: u64) {
        {
            let mut inner = self.inner.lock();
            if inner.stopped {
                return;
            }
            inner.state = PushState::EnumeratingChanges;
            inner.caught_up = false;
        }
        let this = Arc::clone(self);
        let done = self
            .shell
            .mailbox()
            .asynchronize_once(move |result| this.on_changes(since, result));
        self.db
            .get_changes(since, CHANGES_BATCH_SIZE, self.skip_deleted, self.doc_ids.clone(), done);
    }

    fn on_changes(self: &Arc<Self>, since: u64, result: Result<Vec<ChangeEntry>, ReplError>) {
        if self.inner.lock().stopped {
            return;
        }
        let changes = match result {
            Ok(changes) => changes,
            Err(err) => return self.fatal(err),
        };
        if changes.is_empty() {
            return self.caught_up(since);
        }

        debug!(count = changes.len(), since, "offering changes");
        {
            let mut inner = self.inner.lock();
            inner.state = PushState::SendingProposals;
            inner.batch_max_seq = changes.iter().map(|c| c.sequence).max().unwrap_or(since);
            inner.enumerated = inner.batch_max_seq;
        }
        self.shell.add_progress(Progress {
            completed: 0,
            total: changes.len() as u64,
        });

        let profile = if self.proposes {
            wire::PROFILE_PROPOSE_CHANGES
        } else {
            wire::PROFILE_CHANGES
        };
        let message = MessageBuilder::request(profile).json_body(&wire::encode_changes(&changes));
        let this = Arc::clone(self);
        let callback = self.shell.mailbox().asynchronize(move |p: MessageProgress| {
            this.on_changes_response(&changes, &p);
        });
        self.connection.send_request(message, Some(callback));
    }

    /// Reports "caught up" to the peer with an empty change list, so an
    /// active puller knows it can go idle.
    fn caught_up(self: &Arc<Self>, since: u64) {
        {
            let mut inner = self.inner.lock();
            inner.state = PushState::Idle;
            inner.caught_up = true;
            inner.enumerated = inner.enumerated.max(since);
        }
        debug!(since, "pusher caught up");
        let profile = if self.proposes {
            wire::PROFILE_PROPOSE_CHANGES
        } else {
            wire::PROFILE_CHANGES
        };
        let message =
            MessageBuilder::request(profile).json_body(&wire::encode_changes(&[]));
        self.connection.send_request(message, None);
        self.shell.set_level(ActivityLevel::Idle);
    }

    fn on_changes_response(self: &Arc<Self>, changes: &[ChangeEntry], p: &MessageProgress) {
        if self.inner.lock().stopped {
            return;
        }
        let Some(reply) = &p.reply else { return };
        if p.state != MessageProgressState::Complete {
            return;
        }
        if let Some(err) = reply.error() {
            return self.fatal(err);
        }
        let codes = match reply.json_body().and_then(|b| wire::decode_change_response(&b)) {
            Ok(codes) => codes,
            Err(err) => return self.fatal(err),
        };

        let mut to_send = Vec::new();
        for (i, change) in changes.iter().enumerate() {
            match codes.get(i).copied().unwrap_or(wire::CHANGE_HAVE) {
                wire::CHANGE_WANTED => to_send.push(change.clone()),
                wire::CHANGE_REJECTED => {
                    (self.doc_errors)(DocError {
                        doc_id: change.doc_id.clone(),
                        pushing: true,
                        error: ReplError::http(409, "revision is not based on the server revision"),
                        transient: false,
                    });
                    self.shell.add_progress(Progress {
                        completed: 1,
                        total: 0,
                    });
                }
                _ => {
                    // Peer already has it (or filtered it out).
                    self.shell.add_progress(Progress {
                        completed: 1,
                        total: 0,
                    });
                }
            }
        }

        if to_send.is_empty() {
            return self.batch_done();
        }
        {
            let mut inner = self.inner.lock();
            inner.state = PushState::AwaitingAck;
            inner.batch_pending = to_send.len();
        }
        for change in to_send {
            self.send_revision(change);
        }
    }

    fn send_revision(self: &Arc<Self>, change: ChangeEntry) {
        let this = Arc::clone(self);
        let doc_id = change.doc_id.clone();
        let done = self.shell.mailbox().asynchronize_once(
            move |result: Result<RevisionToSend, ReplError>| match result {
                Ok(rev) => this.on_revision_read(rev),
                Err(err) => {
                    (this.doc_errors)(DocError {
                        doc_id,
                        pushing: true,
                        error: err,
                        transient: false,
                    });
                    this.revision_acked();
                }
            },
        );
        self.db.read_revision(&change.doc_id, &change.rev_id, done);
    }

    fn on_revision_read(self: &Arc<Self>, rev: RevisionToSend) {
        if self.inner.lock().stopped {
            return;
        }
        let mut message = MessageBuilder::request(wire::PROFILE_REV)
            .property("id", &rev.doc_id)
            .property("rev", &rev.rev_id)
            .property("sequence", rev.sequence)
            .property("history", wire::encode_history(&rev.history));
        if rev.deleted {
            message = message.property("deleted", 1);
        }
        let message = message.body(rev.body);

        let this = Arc::clone(self);
        let doc_id = rev.doc_id.clone();
        let callback = self.shell.mailbox().asynchronize(move |p: MessageProgress| {
            let Some(reply) = &p.reply else { return };
            if p.state != MessageProgressState::Complete {
                return;
            }
            if let Some(err) = reply.error() {
                warn!(doc_id = %doc_id, %err, "peer rejected revision");
                (this.doc_errors)(DocError {
                    doc_id: doc_id.clone(),
                    pushing: true,
                    error: err,
                    transient: false,
                });
            }
            this.revision_acked();
        });
        self.connection.send_request(message, Some(callback));
    }

    fn revision_acked(self: &Arc<Self>) {
        self.shell.add_progress(Progress {
            completed: 1,
            total: 0,
        });
        let batch_done = {
            let mut inner = self.inner.lock();
            if inner.stopped {
                return;
            }
            inner.batch_pending = inner.batch_pending.saturating_sub(1);
            inner.batch_pending == 0
        };
        if batch_done {
            self.batch_done();
        }
    }

    /// A batch finished: advance the local checkpoint and enumerate the
    /// next one.
    fn batch_done(self: &Arc<Self>) {
        let max_seq = {
            let inner = self.inner.lock();
            if inner.stopped {
                return;
            }
            inner.batch_max_seq
        };
        if let Some(sink) = &self.checkpoint_sink {
            sink(max_seq);
        }
        self.enumerate(max_seq);
    }

    fn fatal(self: &Arc<Self>, err: ReplError) {
        {
            let mut inner = self.inner.lock();
            if inner.state == PushState::Error {
                return;
            }
            inner.state = PushState::Error;
        }
        warn!(%err, "pusher failed");
        self.shell.got_error(err);
        self.shell.set_level(ActivityLevel::Stopped);
    }
}
