//! The replicator: lifecycle, status aggregation, and delegate
//! notification.
//!
//! Owns the framed connection, the [`DbWorker`], and the push/pull
//! workers. Child workers report status changes into the replicator's
//! mailbox; the replicator folds them into one activity level, promotes
//! the first fatal child error, and notifies its delegate. Notifications
//! are rate-limited so consecutive calls at the same level coalesce.

use crate::checkpoint::Checkpoint;
use crate::db_worker::{CheckpointRead, DbWorker};
use crate::error::{engine_code, DocError, ReplError, ReplResult};
use crate::message::{
    CloseReason, CloseStatus, Connection, ConnectionDelegate, ConnectionState, MessageBuilder,
    MessageIn, MessageProgress, MessageProgressState, Properties, ReplyHandle,
};
use crate::options::ReplicatorOptions;
use crate::puller::Puller;
use crate::pusher::Pusher;
use crate::status::{ActivityLevel, Status};
use crate::store::Store;
use crate::wire;
use crate::worker::{StatusSink, WorkerShell};
use crate::OutgoingBlob;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Minimum interval between delegate calls at an unchanged activity
/// level.
const MIN_DELEGATE_CALL_INTERVAL: Duration = Duration::from_millis(200);

/// Receives replicator events. Calls arrive on the replicator's thread.
pub trait ReplicatorDelegate: Send + Sync {
    /// The replicator's status changed.
    fn status_changed(&self, status: Status);

    /// A document failed to transfer; replication continues.
    fn document_error(&self, _error: DocError) {}

    /// The connection closed.
    fn connection_closed(&self, _status: CloseStatus) {}

    /// The HTTP upgrade response arrived.
    fn http_response(&self, _status: u16, _headers: &Properties) {}
}

#[derive(Default)]
struct ChildStatus {
    push: Status,
    pull: Status,
    db: Status,
}

struct NotifyState {
    last_level: Option<ActivityLevel>,
    last_at: Instant,
    pending: bool,
}

/// The replication orchestrator.
pub struct Replicator {
    weak: Weak<Replicator>,
    shell: WorkerShell,
    connection: Arc<dyn Connection>,
    db: Arc<DbWorker>,
    options: ReplicatorOptions,
    checkpoint: Arc<Checkpoint>,
    checkpoint_rev_id: Mutex<String>,
    delegate: Mutex<Option<Arc<dyn ReplicatorDelegate>>>,
    pusher: Mutex<Option<Arc<Pusher>>>,
    puller: Mutex<Option<Arc<Puller>>>,
    child_status: Mutex<ChildStatus>,
    connection_state: Mutex<ConnectionState>,
    close_status: Mutex<Option<CloseStatus>>,
    notify: Mutex<NotifyState>,
    /// Revision counters for checkpoint documents served to peers.
    served_checkpoint_revs: Mutex<HashMap<String, u64>>,
}

impl Replicator {
    /// Creates a replicator over a store and a connection.
    ///
    /// The caller must install the replicator as the connection's
    /// delegate before calling [`start`](Self::start).
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        connection: Arc<dyn Connection>,
        options: ReplicatorOptions,
    ) -> Arc<Self> {
        let db = DbWorker::new(store);
        let replicator = Arc::new_cyclic(|weak: &Weak<Replicator>| {
            let mut child = ChildStatus::default();
            // Enabled directions start out busy so the replicator does
            // not look idle before its workers spin up.
            if options.push != crate::ReplicatorMode::Disabled {
                child.push.level = ActivityLevel::Busy;
            }
            if options.pull != crate::ReplicatorMode::Disabled {
                child.pull.level = ActivityLevel::Busy;
            }
            Self {
                weak: weak.clone(),
                shell: WorkerShell::new("repl"),
                connection,
                db,
                options,
                checkpoint: Checkpoint::new(),
                checkpoint_rev_id: Mutex::new(String::new()),
                delegate: Mutex::new(None),
                pusher: Mutex::new(None),
                puller: Mutex::new(None),
                child_status: Mutex::new(child),
                connection_state: Mutex::new(ConnectionState::Closed),
                close_status: Mutex::new(None),
                notify: Mutex::new(NotifyState {
                    last_level: None,
                    last_at: Instant::now(),
                    pending: false,
                }),
                served_checkpoint_revs: Mutex::new(HashMap::new()),
            }
        });
        replicator.db.shell().set_parent(replicator.child_sink());
        replicator
    }

    /// Sets the delegate receiving status and document events.
    pub fn set_delegate(&self, delegate: Arc<dyn ReplicatorDelegate>) {
        *self.delegate.lock() = Some(delegate);
    }

    /// Current aggregate status.
    #[must_use]
    pub fn status(&self) -> Status {
        self.shell.status()
    }

    /// The close status observed when the connection ended.
    #[must_use]
    pub fn close_status(&self) -> Option<CloseStatus> {
        self.close_status.lock().clone()
    }

    /// Starts connecting.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.shell.mailbox().enqueue(move || {
            info!(active = this.options.is_active(), "replicator starting");
            *this.connection_state.lock() = ConnectionState::Connecting;
            if this.options.is_active() {
                let weak = this.weak.clone();
                let saver = this.shell.mailbox().asynchronize(move |json: String| {
                    if let Some(r) = weak.upgrade() {
                        r.save_remote_checkpoint(&json);
                    }
                });
                this.checkpoint.enable_autosave(
                    this.options.effective_checkpoint_interval(),
                    Arc::new(move |json| saver(json)),
                );
            }
            this.connection.start();
            this.update_status();
        });
    }

    /// Initiates a clean shutdown.
    pub fn stop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.shell.mailbox().enqueue(move || this.do_stop());
    }

    fn do_stop(self: &Arc<Self>) {
        let mut state = self.connection_state.lock();
        if matches!(
            *state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            *state = ConnectionState::Closing;
            drop(state);
            self.connection.close();
        }
    }

    // ---- checkpoints ----

    /// Fetches the local and remote checkpoints, validates them against
    /// each other, and starts replicating.
    fn get_checkpoints(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let done = self.shell.mailbox().asynchronize_once(
            move |result: ReplResult<CheckpointRead>| this.on_local_checkpoint(result),
        );
        self.db.get_checkpoint(&self.options.client_id, done);
    }

    fn on_local_checkpoint(self: &Arc<Self>, result: ReplResult<CheckpointRead>) {
        if self.shell.level() == ActivityLevel::Stopped {
            return;
        }
        let read = match result {
            Ok(read) => read,
            Err(err) => {
                warn!(%err, "fatal error reading local checkpoint");
                self.shell.got_error(err);
                self.do_stop();
                return;
            }
        };
        let have_local = read.data.is_some();
        if let Some(json) = &read.data {
            self.checkpoint.decode_from(json);
            let (local, remote) = self.checkpoint.sequences();
            info!(local, %remote, "loaded local checkpoint; fetching remote");
        } else {
            info!("no local checkpoint");
            // Pulling into an empty database with no checkpoint: deleted
            // revisions need not be materialized.
            if read.db_empty && self.options.pull.is_active() {
                if let Some(puller) = self.puller() {
                    puller.set_skip_deleted();
                }
            }
        }

        let message = MessageBuilder::request(wire::PROFILE_GET_CHECKPOINT)
            .property("client", &self.options.client_id);
        let this = Arc::clone(self);
        let callback = self.shell.mailbox().asynchronize(move |p: MessageProgress| {
            this.on_remote_checkpoint(have_local, &p);
        });
        self.connection.send_request(message, Some(callback));

        if !have_local {
            self.start_replicating();
        }
    }

    fn on_remote_checkpoint(self: &Arc<Self>, have_local: bool, p: &MessageProgress) {
        if self.shell.level() == ActivityLevel::Stopped {
            return;
        }
        let Some(reply) = &p.reply else { return };
        if p.state != MessageProgressState::Complete {
            return;
        }

        let remote_copy = Checkpoint::new();
        if let Some(err) = reply.error() {
            // 404 just means there is no remote checkpoint yet.
            if !err.is_http_not_found() {
                warn!(%err, "fatal error fetching remote checkpoint");
                self.shell.got_error(err);
                self.do_stop();
                return;
            }
            info!("no remote checkpoint");
            self.checkpoint_rev_id.lock().clear();
        } else {
            let body = String::from_utf8_lossy(&reply.body()).into_owned();
            remote_copy.decode_from(&body);
            *self.checkpoint_rev_id.lock() = reply.property("rev").unwrap_or("").to_owned();
            debug!(%body, "received remote checkpoint");
        }

        if have_local {
            self.checkpoint.validate_with(&remote_copy);
            self.start_replicating();
        }
    }

    fn start_replicating(self: &Arc<Self>) {
        let (local, remote) = self.checkpoint.sequences();
        info!(local, %remote, "starting replication");
        if self.options.push.is_active() {
            let weak = self.weak.clone();
            let checkpoint = Arc::clone(&self.checkpoint);
            let pusher = Pusher::active(
                Arc::clone(&self.connection),
                Arc::clone(&self.db),
                &self.options,
                Arc::new(move |sequence| {
                    checkpoint.set_local(sequence);
                    if let Some(r) = weak.upgrade() {
                        let this = r.clone();
                        r.shell.mailbox().enqueue(move || this.update_status());
                    }
                }),
                self.doc_error_sink(),
            );
            pusher.shell().set_parent(self.child_sink());
            pusher.start(local);
            *self.pusher.lock() = Some(pusher);
        }
        if self.options.pull.is_active() {
            if let Some(puller) = self.puller() {
                puller.start(remote);
            }
        }
    }

    /// Sends the checkpoint to the peer, then persists it locally.
    fn save_remote_checkpoint(self: &Arc<Self>, json: &str) {
        if *self.connection_state.lock() != ConnectionState::Connected {
            return;
        }
        let rev = self.checkpoint_rev_id.lock().clone();
        debug!(%json, %rev, "saving remote checkpoint");
        let message = MessageBuilder::request(wire::PROFILE_SET_CHECKPOINT)
            .property("client", &self.options.client_id)
            .property("rev", rev)
            .body(json.as_bytes().to_vec());
        let this = Arc::clone(self);
        let json = json.to_owned();
        let callback = self.shell.mailbox().asynchronize(move |p: MessageProgress| {
            let Some(reply) = &p.reply else { return };
            if p.state != MessageProgressState::Complete {
                return;
            }
            if let Some(err) = reply.error() {
                warn!(%err, "failed to save remote checkpoint");
                this.shell.got_error(err);
                return;
            }
            *this.checkpoint_rev_id.lock() =
                reply.property("rev").unwrap_or("").to_owned();
            let this2 = Arc::clone(&this);
            let done = this.shell.mailbox().asynchronize_once(
                move |result: ReplResult<()>| {
                    if result.is_ok() {
                        this2.checkpoint.saved();
                    }
                    this2.update_status();
                },
            );
            this.db
                .set_checkpoint(&this.options.client_id, &json, done);
        });
        self.connection.send_request(message, Some(callback));
    }

    // ---- children ----

    fn child_sink(self: &Arc<Self>) -> StatusSink {
        let weak = self.weak.clone();
        self.shell
            .mailbox()
            .asynchronize(move |(name, status): (&'static str, Status)| {
                if let Some(r) = weak.upgrade() {
                    r.on_child_status(name, status);
                }
            })
    }

    fn doc_error_sink(self: &Arc<Self>) -> Arc<dyn Fn(DocError) + Send + Sync> {
        let weak = self.weak.clone();
        self.shell.mailbox().asynchronize(move |error: DocError| {
            if let Some(r) = weak.upgrade() {
                debug!(doc_id = %error.doc_id, pushing = error.pushing, "document error");
                let delegate = r.delegate.lock().clone();
                if let Some(delegate) = delegate {
                    delegate.document_error(error);
                }
            }
        })
    }

    fn on_child_status(self: &Arc<Self>, name: &'static str, status: Status) {
        if self.shell.level() == ActivityLevel::Stopped {
            return;
        }
        let level = status.level;
        {
            let mut child = self.child_status.lock();
            match name {
                "push" => child.push = status,
                "pull" => child.pull = status,
                "db" => child.db = status,
                _ => return,
            }
            let progress = child.push.progress + child.pull.progress;
            self.shell.set_progress(progress);

            // Promote the first fatal child error.
            let promoted = child
                .pull
                .error
                .clone()
                .or_else(|| child.push.error.clone());
            if let Some(err) = promoted {
                self.shell.got_error(err);
            }
        }
        // A direction that caught up (or stopped) is a good moment to
        // persist the checkpoint.
        if matches!(name, "push" | "pull")
            && matches!(level, ActivityLevel::Idle | ActivityLevel::Stopped)
        {
            self.checkpoint.save();
        }
        self.update_status();
    }

    // ---- status ----

    fn compute_activity_level(&self) -> ActivityLevel {
        let state = *self.connection_state.lock();
        let child = self.child_status.lock();
        match state {
            ConnectionState::Connecting => ActivityLevel::Connecting,
            ConnectionState::Connected => {
                let base = if self.checkpoint.is_unsaved() {
                    ActivityLevel::Busy
                } else {
                    ActivityLevel::Idle
                };
                base.max(child.push.level).max(child.pull.level)
            }
            ConnectionState::Closing => ActivityLevel::Busy,
            ConnectionState::Closed | ConnectionState::Disconnected => {
                if child.db.level == ActivityLevel::Busy {
                    ActivityLevel::Busy
                } else {
                    ActivityLevel::Stopped
                }
            }
        }
    }

    fn update_status(self: &Arc<Self>) {
        let mut level = self.compute_activity_level();
        if level == ActivityLevel::Idle
            && *self.connection_state.lock() == ConnectionState::Connected
            && !self.options.is_continuous()
            && !self.options.is_open_server()
        {
            // A non-continuous active replication that went idle is done.
            info!("replication complete; closing connection");
            self.do_stop();
            level = ActivityLevel::Busy;
        }
        self.shell.set_level(level);
        self.changed_status();
    }

    /// Notifies the delegate, but not too often: consecutive calls at
    /// the same activity level are coalesced with a minimum interval.
    fn changed_status(self: &Arc<Self>) {
        let status = self.status();
        let (report_now, wait) = {
            let notify = self.notify.lock();
            let level_changed = notify.last_level != Some(status.level);
            let elapsed = notify.last_at.elapsed();
            if level_changed || elapsed >= MIN_DELEGATE_CALL_INTERVAL {
                (true, Duration::ZERO)
            } else if notify.pending {
                return;
            } else {
                (false, MIN_DELEGATE_CALL_INTERVAL - elapsed)
            }
        };
        if report_now {
            self.report_status();
        } else {
            self.notify.lock().pending = true;
            let weak = self.weak.clone();
            self.shell.mailbox().enqueue_after(wait, move || {
                if let Some(r) = weak.upgrade() {
                    r.report_status();
                }
            });
        }
    }

    fn report_status(self: &Arc<Self>) {
        let status = self.status();
        {
            let mut notify = self.notify.lock();
            notify.pending = false;
            notify.last_level = Some(status.level);
            notify.last_at = Instant::now();
        }
        let delegate = self.delegate.lock().clone();
        if let Some(delegate) = delegate {
            delegate.status_changed(status.clone());
        }
        if status.level == ActivityLevel::Stopped {
            // Never call the delegate again after reporting Stopped.
            *self.delegate.lock() = None;
            *self.pusher.lock() = None;
            *self.puller.lock() = None;
        }
    }

    // ---- incoming requests ----

    /// Returns the puller, creating it on first use if pulling is
    /// enabled at all.
    fn puller(self: &Arc<Self>) -> Option<Arc<Puller>> {
        if self.options.pull == crate::ReplicatorMode::Disabled {
            return None;
        }
        let mut slot = self.puller.lock();
        if slot.is_none() {
            let checkpoint_sink = if self.options.pull.is_active() {
                let weak = self.weak.clone();
                let checkpoint = Arc::clone(&self.checkpoint);
                Some(Arc::new(move |sequence: String| {
                    checkpoint.set_remote(sequence);
                    if let Some(r) = weak.upgrade() {
                        let this = r.clone();
                        r.shell.mailbox().enqueue(move || this.update_status());
                    }
                }) as Arc<dyn Fn(String) + Send + Sync>)
            } else {
                None
            };
            let puller = Puller::new(
                Arc::clone(&self.connection),
                Arc::clone(&self.db),
                &self.options,
                checkpoint_sink,
                self.doc_error_sink(),
            );
            puller.shell().set_parent(self.child_sink());
            *slot = Some(puller);
        }
        slot.clone()
    }

    fn route_request(self: &Arc<Self>, message: Arc<MessageIn>, reply: ReplyHandle) {
        let profile = message.profile().unwrap_or("").to_owned();
        match profile.as_str() {
            wire::PROFILE_GET_CHECKPOINT => self.serve_get_checkpoint(&message, reply),
            wire::PROFILE_SET_CHECKPOINT => self.serve_set_checkpoint(&message, reply),
            wire::PROFILE_SUB_CHANGES => self.serve_sub_changes(&message, reply),
            wire::PROFILE_CHANGES => {
                if let Some(puller) = self.puller() {
                    puller.handle_changes(message, reply, false);
                }
            }
            wire::PROFILE_PROPOSE_CHANGES => {
                if let Some(puller) = self.puller() {
                    puller.handle_changes(message, reply, true);
                }
            }
            wire::PROFILE_REV => {
                if let Some(puller) = self.puller() {
                    puller.handle_rev(message, reply);
                }
            }
            wire::PROFILE_GET_ATTACHMENT => {
                if self.options.push != crate::ReplicatorMode::Disabled {
                    let digest = message.property("digest").unwrap_or("").to_owned();
                    OutgoingBlob::new(self.db.blobs()).start(digest, reply);
                }
            }
            other => {
                warn!(profile = other, number = message.number, "unhandled request");
                // Dropping the reply handle answers with HTTP 404.
            }
        }
    }

    fn serve_get_checkpoint(self: &Arc<Self>, message: &Arc<MessageIn>, reply: ReplyHandle) {
        let Some(client) = message.property("client").map(str::to_owned) else {
            reply.respond_error("HTTP", 400, "missing 'client' property");
            return;
        };
        let rev = self
            .served_checkpoint_revs
            .lock()
            .get(&client)
            .copied()
            .unwrap_or(0);
        let done = move |result: ReplResult<CheckpointRead>| match result {
            Ok(CheckpointRead {
                data: Some(json), ..
            }) => {
                reply.respond(
                    MessageBuilder::reply()
                        .property("rev", format!("0-{rev}"))
                        .body(json.into_bytes()),
                );
            }
            Ok(_) => reply.respond_error("HTTP", 404, "no checkpoint"),
            Err(err) => reply.respond_error("HTTP", 500, err.to_string()),
        };
        self.db.get_checkpoint(&client, done);
    }

    fn serve_set_checkpoint(self: &Arc<Self>, message: &Arc<MessageIn>, reply: ReplyHandle) {
        let Some(client) = message.property("client").map(str::to_owned) else {
            reply.respond_error("HTTP", 400, "missing 'client' property");
            return;
        };
        let json = String::from_utf8_lossy(&message.body()).into_owned();
        let rev = {
            let mut revs = self.served_checkpoint_revs.lock();
            let rev = revs.entry(client.clone()).or_insert(0);
            *rev += 1;
            *rev
        };
        let done = move |result: ReplResult<()>| match result {
            Ok(()) => reply.respond(MessageBuilder::reply().property("rev", format!("0-{rev}"))),
            Err(err) => reply.respond_error("HTTP", 500, err.to_string()),
        };
        self.db.set_checkpoint(&client, &json, done);
    }

    fn serve_sub_changes(self: &Arc<Self>, message: &Arc<MessageIn>, reply: ReplyHandle) {
        if self.options.push == crate::ReplicatorMode::Disabled {
            reply.respond_error("HTTP", 403, "push is disabled");
            return;
        }
        let request: wire::SubChanges = message
            .json_body()
            .ok()
            .and_then(|body| serde_json::from_value(body).ok())
            .unwrap_or_default();
        let skip_deleted = request.skip_deleted || self.options.skip_deleted;
        info!(since = request.since, skip_deleted, "peer subscribed to changes");

        let pusher = Pusher::passive(
            Arc::clone(&self.connection),
            Arc::clone(&self.db),
            &self.options,
            skip_deleted,
            request.doc_ids.or_else(|| self.options.doc_ids.clone()),
            self.doc_error_sink(),
        );
        pusher.shell().set_parent(self.child_sink());
        pusher.start(request.since);
        *self.pusher.lock() = Some(pusher);
        reply.respond_ok();
    }

    // ---- connection close ----

    fn handle_close(self: &Arc<Self>, status: CloseStatus, state: ConnectionState) {
        info!(reason = ?status.reason, code = status.code, "connection closed");
        *self.connection_state.lock() = state;
        self.checkpoint.stop_autosave();

        if let Some(pusher) = self.pusher.lock().clone() {
            pusher.connection_closed();
        }
        if let Some(puller) = self.puller.lock().clone() {
            puller.connection_closed();
        }
        self.db.connection_closed();

        if !status.is_normal() {
            self.shell.got_error(translate_close(&status));
        }
        *self.close_status.lock() = Some(status.clone());

        let delegate = self.delegate.lock().clone();
        if let Some(delegate) = delegate {
            delegate.connection_closed(status);
        }
        self.update_status();
    }
}

/// Maps an abnormal close to the matching error domain. A close code
/// the transport could not classify becomes a generic remote error.
fn translate_close(status: &CloseStatus) -> ReplError {
    if status.code == 0 {
        return ReplError::engine(engine_code::REMOTE_ERROR, status.message.clone());
    }
    match status.reason {
        CloseReason::WebSocket => ReplError::web_socket(status.code, status.message.clone()),
        CloseReason::Posix => ReplError::posix(status.code, status.message.clone()),
        CloseReason::Network => ReplError::network(status.code, status.message.clone()),
    }
}

impl ConnectionDelegate for Replicator {
    fn on_http_response(&self, status: u16, headers: &Properties) {
        let Some(this) = self.weak.upgrade() else { return };
        let headers = headers.clone();
        self.shell.mailbox().enqueue(move || {
            // Each Set-Cookie header is stored alongside the database
            // for future connections.
            for (name, value) in &headers {
                if name.eq_ignore_ascii_case("set-cookie") {
                    this.db.set_cookie(value);
                }
            }
            let delegate = this.delegate.lock().clone();
            if let Some(delegate) = delegate {
                delegate.http_response(status, &headers);
            }
        });
    }

    fn on_connect(&self) {
        let Some(this) = self.weak.upgrade() else { return };
        self.shell.mailbox().enqueue(move || {
            info!("connected");
            *this.connection_state.lock() = ConnectionState::Connected;
            if this.options.is_active() {
                this.get_checkpoints();
            }
            this.update_status();
        });
    }

    fn on_request(&self, message: Arc<MessageIn>, reply: ReplyHandle) {
        let Some(this) = self.weak.upgrade() else { return };
        self.shell
            .mailbox()
            .enqueue(move || this.route_request(message, reply));
    }

    fn on_close(&self, status: CloseStatus, state: ConnectionState) {
        let Some(this) = self.weak.upgrade() else { return };
        self.shell
            .mailbox()
            .enqueue(move || this.handle_close(status, state));
    }
}
