//! The pull side of replication.
//!
//! The Puller receives change proposals, answers which revisions it
//! wants, and inserts arriving `rev` bodies into storage through the DB
//! worker. Revisions that reference attachments spawn
//! [`IncomingBlob`](crate::IncomingBlob) workers, and the remote half of
//! the checkpoint does not advance past a change until its revision and
//! all of its blobs are installed. Conflicts, validation rejections, and
//! other per-document failures are reported and skipped; the pull
//! continues.

use crate::blob::IncomingBlob;
use crate::db_worker::DbWorker;
use crate::error::{engine_code, DocError, ReplError};
use crate::message::{Connection, MessageBuilder, MessageIn, ReplyHandle};
use crate::options::ReplicatorOptions;
use crate::status::{ActivityLevel, Progress};
use crate::store::{find_blob_refs, BlobRequest, InsertResult, Store};
use crate::wire;
use crate::worker::WorkerShell;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Puller state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PullState {
    Idle,
    AwaitingProposals,
    RequestingRevs,
    InsertingRevs,
    Error,
}

/// Receives the remote sequence once everything up to it is installed.
pub type RemoteCheckpointSink = Arc<dyn Fn(String) + Send + Sync>;
/// Receives per-document pull errors.
pub type DocErrorSink = Arc<dyn Fn(DocError) + Send + Sync>;

/// A change batch entry whose revision (and blobs) we are waiting for.
struct PendingSeq {
    sequence: u64,
    done: bool,
}

/// A revision waiting for its attachments before insertion.
struct WaitingRev {
    doc_id: String,
    history: Vec<String>,
    body: Vec<u8>,
    deleted: bool,
    sequence: u64,
    remaining_blobs: usize,
    blob_error: Option<ReplError>,
    reply: Option<ReplyHandle>,
}

struct PullerInner {
    state: PullState,
    skip_deleted: bool,
    stopped: bool,
    /// The peer reported it has no further changes (an empty change
    /// list). Cleared whenever a non-empty list arrives.
    caught_up: bool,
    pending: VecDeque<PendingSeq>,
    waiting: Vec<WaitingRev>,
}

/// The pull worker.
pub struct Puller {
    shell: WorkerShell,
    connection: Arc<dyn Connection>,
    db: Arc<DbWorker>,
    options: ReplicatorOptions,
    checkpoint_sink: Option<RemoteCheckpointSink>,
    doc_errors: DocErrorSink,
    inner: Mutex<PullerInner>,
}

impl Puller {
    /// Creates a puller.
    ///
    /// `checkpoint_sink` is provided on the active side only; a passive
    /// puller (serving a peer's push) has no checkpoint of its own to
    /// advance.
    #[must_use]
    pub fn new(
        connection: Arc<dyn Connection>,
        db: Arc<DbWorker>,
        options: &ReplicatorOptions,
        checkpoint_sink: Option<RemoteCheckpointSink>,
        doc_errors: DocErrorSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            shell: WorkerShell::new("pull"),
            connection,
            db,
            options: options.clone(),
            checkpoint_sink,
            doc_errors,
            inner: Mutex::new(PullerInner {
                state: PullState::Idle,
                skip_deleted: options.skip_deleted,
                stopped: false,
                caught_up: false,
                pending: VecDeque::new(),
                waiting: Vec::new(),
            }),
        })
    }

    /// The worker shell (status, parent wiring).
    #[must_use]
    pub fn shell(&self) -> &WorkerShell {
        &self.shell
    }

    /// Suppress tombstones: set when pulling into an empty database with
    /// no local checkpoint.
    pub fn set_skip_deleted(&self) {
        self.inner.lock().skip_deleted = true;
    }

    /// Starts an active pull from the given remote sequence.
    pub fn start(self: &Arc<Self>, since: String) {
        let this = Arc::clone(self);
        self.shell.mailbox().enqueue(move || {
            info!(%since, "puller starting");
            this.shell.set_level(ActivityLevel::Busy);
            this.inner.lock().state = PullState::AwaitingProposals;

            let request = wire::SubChanges {
                since: since.parse().unwrap_or(0),
                skip_deleted: this.inner.lock().skip_deleted,
                continuous: this.options.is_continuous(),
                doc_ids: this.options.doc_ids.clone(),
            };
            let body = serde_json::to_value(&request).unwrap_or_default();
            let message =
                MessageBuilder::request(wire::PROFILE_SUB_CHANGES).json_body(&body);
            // The interesting data flows back as `changes`/`rev` requests.
            this.connection.send_request(message, None);
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

    /// Handles an incoming `changes` or `proposeChanges` request.
    /// `proposed` is true for the latter, which carries parent revisions
    /// for the no-conflicts check.
    pub fn handle_changes(self: &Arc<Self>, message: Arc<MessageIn>, reply: ReplyHandle, proposed: bool) {
        let this = Arc::clone(self);
        self.shell.mailbox().enqueue(move || {
            if this.inner.lock().stopped {
                return;
            }
            let entries = match message.json_body().and_then(|b| wire::decode_changes(&b)) {
                Ok(entries) => entries,
                Err(err) => {
                    this.inner.lock().state = PullState::Error;
                    this.shell.got_error(err.clone());
                    reply.respond_error("HTTP", err.code, err.message);
                    return;
                }
            };
            if entries.is_empty() {
                debug!("peer is caught up");
                {
                    let mut inner = this.inner.lock();
                    inner.caught_up = true;
                    inner.state = PullState::Idle;
                }
                this.maybe_go_idle();
                reply.respond(MessageBuilder::reply().json_body(&json!([])));
                return;
            }

            this.shell.set_level(ActivityLevel::Busy);
            {
                let mut inner = this.inner.lock();
                inner.caught_up = false;
                inner.state = PullState::RequestingRevs;
            }

            let (skip_deleted, no_conflicts) = {
                let inner = this.inner.lock();
                (inner.skip_deleted, this.options.no_conflicts)
            };
            let doc_ids = this.options.doc_ids.clone();

            // One storage pass decides the response code for every entry.
            let check_entries = entries.clone();
            this.db.with_store(
                move |store| {
                    check_entries
                        .iter()
                        .map(|entry| {
                            if let Some(doc_ids) = &doc_ids {
                                if !doc_ids.contains(&entry.doc_id) {
                                    return wire::CHANGE_FILTERED;
                                }
                            }
                            if skip_deleted && entry.deleted {
                                return wire::CHANGE_FILTERED;
                            }
                            match store.has_revision(&entry.doc_id, &entry.rev_id) {
                                Ok(true) => wire::CHANGE_HAVE,
                                Err(_) => wire::CHANGE_FILTERED,
                                Ok(false) => {
                                    if proposed && no_conflicts {
                                        let current = store
                                            .current_rev_id(&entry.doc_id)
                                            .ok()
                                            .flatten();
                                        if current.is_some() && current != entry.parent_rev_id {
                                            return wire::CHANGE_REJECTED;
                                        }
                                    }
                                    wire::CHANGE_WANTED
                                }
                            }
                        })
                        .collect::<Vec<i64>>()
                },
                {
                    let this = Arc::clone(&this);
                    move |codes: Vec<i64>| {
                        this.shell.mailbox().enqueue({
                            let this = Arc::clone(&this);
                            move || this.on_changes_checked(&entries, reply, codes)
                        });
                    }
                },
            );
        });
    }

    fn on_changes_checked(
        self: &Arc<Self>,
        entries: &[crate::store::ChangeEntry],
        reply: ReplyHandle,
        codes: Vec<i64>,
    ) {
        if self.inner.lock().stopped {
            return;
        }
        let mut wanted = 0u64;
        {
            let mut inner = self.inner.lock();
            for (entry, &code) in entries.iter().zip(&codes) {
                inner.pending.push_back(PendingSeq {
                    sequence: entry.sequence,
                    done: code != wire::CHANGE_WANTED,
                });
                if code == wire::CHANGE_WANTED {
                    wanted += 1;
                }
            }
        }
        debug!(offered = entries.len(), wanted, "answered change proposal");
        if wanted > 0 {
            self.shell.add_progress(Progress {
                completed: 0,
                total: wanted,
            });
        }
        self.advance_checkpoint();
        reply.respond(MessageBuilder::reply().json_body(&wire::encode_change_response(&codes)));
    }

    /// Handles an incoming `rev` request carrying one revision body.
    pub fn handle_rev(self: &Arc<Self>, message: Arc<MessageIn>, reply: ReplyHandle) {
        let this = Arc::clone(self);
        self.shell.mailbox().enqueue(move || {
            if this.inner.lock().stopped {
                return;
            }
            this.inner.lock().state = PullState::InsertingRevs;

            let doc_id = message.property("id").unwrap_or_default().to_owned();
            let rev_id = message.property("rev").unwrap_or_default().to_owned();
            let sequence: u64 = message
                .property("sequence")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let deleted = message.property("deleted").is_some();
            let history = wire::decode_history(message.property("history").unwrap_or(""));
            let body = message.body();
            if doc_id.is_empty() || rev_id.is_empty() {
                reply.respond_error("HTTP", 400, "rev message missing id or rev");
                return;
            }
            debug!(doc_id, rev_id, sequence, "received revision");

            // Pull validator gets a look before anything is stored.
            if let Some(validator) = &this.options.pull_validator {
                let parsed = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
                if !validator(&doc_id, &parsed) {
                    this.doc_failed(
                        &doc_id,
                        sequence,
                        ReplError::http(403, "rejected by validation function"),
                        Some(reply),
                    );
                    return;
                }
            }

            let mut history_full = vec![rev_id];
            history_full.extend(history);

            // Blobs referenced by the body must be installed before the
            // revision lands and the checkpoint moves.
            let blob_refs: Vec<BlobRequest> = serde_json::from_slice(&body)
                .map(|v: serde_json::Value| find_blob_refs(&v))
                .unwrap_or_default();
            let blobs = this.db.blobs();
            let missing: Vec<BlobRequest> = blob_refs
                .into_iter()
                .filter(|r| !blobs.has(&r.key))
                .collect();

            let waiting = WaitingRev {
                doc_id,
                history: history_full,
                body,
                deleted,
                sequence,
                remaining_blobs: missing.len(),
                blob_error: None,
                reply: Some(reply),
            };
            if missing.is_empty() {
                this.insert_rev(waiting);
                return;
            }

            info!(
                doc_id = %waiting.doc_id,
                blobs = missing.len(),
                "fetching attachments before insert"
            );
            this.inner.lock().waiting.push(waiting);
            for request in missing {
                let worker = IncomingBlob::new(Arc::clone(&this.connection), blobs.clone());
                let progress_shell = Arc::clone(&this);
                let progress = Arc::new(move |delta: Progress| {
                    progress_shell.shell.add_progress(delta);
                });
                let this2 = Arc::clone(&this);
                let seq = sequence;
                let done = this.shell.mailbox().asynchronize_once(
                    move |err: Option<ReplError>| this2.on_blob_done(seq, err),
                );
                worker.start(request, progress, Box::new(done));
            }
        });
    }

    fn on_blob_done(self: &Arc<Self>, sequence: u64, error: Option<ReplError>) {
        let ready = {
            let mut inner = self.inner.lock();
            if inner.stopped {
                return;
            }
            let Some(pos) = inner.waiting.iter().position(|w| w.sequence == sequence) else {
                return;
            };
            let rev = &mut inner.waiting[pos];
            rev.remaining_blobs = rev.remaining_blobs.saturating_sub(1);
            if error.is_some() && rev.blob_error.is_none() {
                rev.blob_error = error;
            }
            if rev.remaining_blobs == 0 {
                Some(inner.waiting.remove(pos))
            } else {
                None
            }
        };
        if let Some(mut rev) = ready {
            match rev.blob_error.take() {
                Some(err) => {
                    let reply = rev.reply.take();
                    self.doc_failed(&rev.doc_id, rev.sequence, err, reply);
                }
                None => self.insert_rev(rev),
            }
        }
    }

    fn insert_rev(self: &Arc<Self>, mut rev: WaitingRev) {
        let allow_conflict = !self.options.no_conflicts;
        let this = Arc::clone(self);
        let doc_id = rev.doc_id.clone();
        let sequence = rev.sequence;
        let reply = rev.reply.take();
        let done = self.shell.mailbox().asynchronize_once(
            move |result: Result<InsertResult, ReplError>| {
                this.on_inserted(&doc_id, sequence, reply, result);
            },
        );
        self.db.insert_revision(
            rev.doc_id,
            rev.history,
            rev.body,
            rev.deleted,
            allow_conflict,
            done,
        );
    }

    fn on_inserted(
        self: &Arc<Self>,
        doc_id: &str,
        sequence: u64,
        reply: Option<ReplyHandle>,
        result: Result<InsertResult, ReplError>,
    ) {
        if self.inner.lock().stopped {
            return;
        }
        match result {
            Ok(inserted) => {
                if inserted.conflict {
                    // The revision was stored as a conflicting leaf; the
                    // application resolves it later.
                    (self.doc_errors)(DocError {
                        doc_id: doc_id.to_owned(),
                        pushing: false,
                        error: ReplError::engine(engine_code::CONFLICT, "conflict"),
                        transient: false,
                    });
                }
                if let Some(reply) = reply {
                    reply.respond_ok();
                }
                self.rev_done(sequence);
            }
            Err(err) if err.is_conflict() => {
                self.doc_failed(
                    doc_id,
                    sequence,
                    ReplError::http(409, "revision would create a conflict"),
                    reply,
                );
            }
            Err(err) => {
                self.doc_failed(doc_id, sequence, err, reply);
            }
        }
    }

    /// Records a per-document failure, answers the peer, and still
    /// advances past the sequence so the pull can make progress.
    fn doc_failed(
        self: &Arc<Self>,
        doc_id: &str,
        sequence: u64,
        error: ReplError,
        reply: Option<ReplyHandle>,
    ) {
        warn!(doc_id, %error, "document failed to pull");
        if let Some(reply) = reply {
            let domain = match error.domain {
                crate::error::ErrorDomain::Http => "HTTP",
                _ => "EddyDB",
            };
            reply.respond_error(domain, error.code, error.message.clone());
        }
        (self.doc_errors)(DocError {
            doc_id: doc_id.to_owned(),
            pushing: false,
            error,
            transient: false,
        });
        self.rev_done(sequence);
    }

    fn rev_done(self: &Arc<Self>, sequence: u64) {
        self.shell.add_progress(Progress {
            completed: 1,
            total: 0,
        });
        {
            let mut inner = self.inner.lock();
            if let Some(slot) = inner.pending.iter_mut().find(|p| p.sequence == sequence) {
                slot.done = true;
            }
        }
        self.advance_checkpoint();
        self.maybe_go_idle();
    }

    /// Pops finished entries off the front of the pending queue and
    /// reports the new frontier to the checkpoint.
    fn advance_checkpoint(self: &Arc<Self>) {
        let frontier = {
            let mut inner = self.inner.lock();
            let mut frontier = None;
            while inner.pending.front().is_some_and(|p| p.done) {
                frontier = inner.pending.pop_front().map(|p| p.sequence);
            }
            frontier
        };
        if let (Some(sequence), Some(sink)) = (frontier, &self.checkpoint_sink) {
            sink(sequence.to_string());
        }
    }

    /// Goes idle only once the peer reported catch-up and every accepted
    /// revision (with its blobs) has landed.
    fn maybe_go_idle(self: &Arc<Self>) {
        let idle = {
            let mut inner = self.inner.lock();
            let idle = inner.caught_up
                && inner.pending.is_empty()
                && inner.waiting.is_empty()
                && inner.state != PullState::Error;
            if idle {
                inner.state = PullState::Idle;
            }
            idle
        };
        if idle {
            self.shell.set_level(ActivityLevel::Idle);
        }
    }
}
