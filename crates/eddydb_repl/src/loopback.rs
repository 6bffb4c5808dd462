//! An in-process framing transport: two connected endpoints exchanging
//! numbered request/reply pairs.
//!
//! Each endpoint has a dispatcher mailbox standing in for the transport
//! thread: every delegate callback and every progress callback is
//! delivered there, never on the caller's thread. Reply bodies are
//! delivered in chunks, so consumers observe the `ReceivingReply`
//! progress state just as they would over a real socket.

use crate::actor::Mailbox;
use crate::message::{
    CloseStatus, Connection, ConnectionDelegate, ConnectionState, MessageBuilder, MessageIn,
    MessageProgress, MessageProgressState, ProgressCallback, Properties, Reply, ReplyHandle,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Reply bodies are delivered in chunks of this many bytes.
const REPLY_CHUNK_SIZE: usize = 4096;

/// One endpoint of an in-process connection pair.
pub struct LoopbackConnection {
    name: &'static str,
    weak: Weak<LoopbackConnection>,
    mailbox: Mailbox,
    delegate: RwLock<Option<Arc<dyn ConnectionDelegate>>>,
    peer: Mutex<Weak<LoopbackConnection>>,
    state: Mutex<ConnectionState>,
    next_number: AtomicU64,
    /// Progress callbacks of requests awaiting replies.
    pending: Mutex<HashMap<u64, ProgressCallback>>,
    /// Headers presented as the HTTP upgrade response.
    response_headers: Mutex<Properties>,
}

/// Creates a connected pair of endpoints.
#[must_use]
pub fn loopback_pair() -> (Arc<LoopbackConnection>, Arc<LoopbackConnection>) {
    let a = LoopbackConnection::endpoint("loopback-a");
    let b = LoopbackConnection::endpoint("loopback-b");
    *a.peer.lock() = Arc::downgrade(&b);
    *b.peer.lock() = Arc::downgrade(&a);
    (a, b)
}

impl LoopbackConnection {
    fn endpoint(name: &'static str) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| Self {
            name,
            weak: weak.clone(),
            mailbox: Mailbox::spawn(name),
            delegate: RwLock::new(None),
            peer: Mutex::new(Weak::new()),
            state: Mutex::new(ConnectionState::Closed),
            next_number: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            response_headers: Mutex::new(Vec::new()),
        })
    }

    /// Installs the delegate receiving this endpoint's events.
    pub fn set_delegate(&self, delegate: Arc<dyn ConnectionDelegate>) {
        *self.delegate.write() = Some(delegate);
    }

    /// Sets headers delivered with the simulated HTTP upgrade response.
    pub fn set_response_headers(&self, headers: Properties) {
        *self.response_headers.lock() = headers;
    }

    /// Simulates an abnormal close observed by both endpoints.
    pub fn disconnect(&self, status: CloseStatus) {
        let peer = self.peer.lock().upgrade();
        self.finish_close(status.clone(), ConnectionState::Disconnected);
        if let Some(peer) = peer {
            peer.finish_close(status, ConnectionState::Disconnected);
        }
    }

    fn delegate(&self) -> Option<Arc<dyn ConnectionDelegate>> {
        self.delegate.read().clone()
    }

    /// Routes the reply for request `number` back to its progress
    /// callback, in chunks.
    fn deliver_reply(&self, number: u64, reply: Reply) {
        let Some(callback) = self.pending.lock().remove(&number) else {
            trace!(endpoint = self.name, number, "reply for unawaited request dropped");
            return;
        };
        if *self.state.lock() != ConnectionState::Connected {
            debug!(endpoint = self.name, number, "reply after close discarded");
            return;
        }
        match reply {
            Reply::Ok(builder) => {
                let message = Arc::new(MessageIn::new(number, builder.properties, Vec::new()));
                let body = builder.body;
                let mut chunks: Vec<Vec<u8>> = body
                    .chunks(REPLY_CHUNK_SIZE)
                    .map(<[u8]>::to_vec)
                    .collect();
                if chunks.is_empty() {
                    chunks.push(Vec::new());
                }
                let chunk_count = chunks.len();
                for (i, chunk) in chunks.into_iter().enumerate() {
                    let message = Arc::clone(&message);
                    let callback = Arc::clone(&callback);
                    let last = i + 1 == chunk_count;
                    self.mailbox.enqueue(move || {
                        message.append_body(&chunk);
                        callback(MessageProgress {
                            state: if last {
                                MessageProgressState::Complete
                            } else {
                                MessageProgressState::ReceivingReply
                            },
                            reply: Some(message),
                        });
                    });
                }
            }
            Reply::Err {
                domain,
                code,
                message,
            } => {
                let reply_msg = Arc::new(MessageIn::new(
                    number,
                    vec![
                        ("Error-Domain".to_owned(), domain),
                        ("Error-Code".to_owned(), code.to_string()),
                    ],
                    message.into_bytes(),
                ));
                self.mailbox.enqueue({
                    let callback = Arc::clone(&callback);
                    move || {
                        callback(MessageProgress {
                            state: MessageProgressState::Complete,
                            reply: Some(reply_msg),
                        });
                    }
                });
            }
        }
    }

    fn finish_close(&self, status: CloseStatus, state: ConnectionState) {
        {
            let mut current = self.state.lock();
            if matches!(
                *current,
                ConnectionState::Closed | ConnectionState::Disconnected
            ) {
                return;
            }
            *current = state;
        }
        // In-flight replies arriving after this point are discarded.
        self.pending.lock().clear();
        let delegate = self.delegate();
        // Drop our delegate reference; the close notification below owns
        // the last one this endpoint will use.
        *self.delegate.write() = None;
        self.mailbox.enqueue(move || {
            if let Some(delegate) = delegate {
                delegate.on_close(status, state);
            }
        });
    }
}

impl Connection for LoopbackConnection {
    fn start(&self) {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Connecting;
        }
        let delegate = self.delegate();
        let headers = self.response_headers.lock().clone();
        let this = self.weak.upgrade();
        self.mailbox.enqueue(move || {
            if let Some(this) = this {
                *this.state.lock() = ConnectionState::Connected;
            }
            if let Some(delegate) = delegate {
                delegate.on_http_response(200, &headers);
                delegate.on_connect();
            }
        });
    }

    fn send_request(&self, message: MessageBuilder, progress: Option<ProgressCallback>) {
        let number = self.next_number.fetch_add(1, Ordering::SeqCst);
        trace!(endpoint = self.name, number, profile = %message.profile, "sending request");

        let expects_reply = !message.no_reply;
        if let Some(callback) = &progress {
            // Sending and AwaitingReply arrive before any reply bytes.
            for state in [
                MessageProgressState::Sending,
                MessageProgressState::AwaitingReply,
            ] {
                let callback = Arc::clone(callback);
                self.mailbox.enqueue(move || {
                    callback(MessageProgress {
                        state,
                        reply: None,
                    });
                });
            }
            if expects_reply {
                self.pending.lock().insert(number, Arc::clone(callback));
            }
        }

        let Some(peer) = self.peer.lock().upgrade() else {
            // Peer is gone; fail the request.
            self.deliver_reply(
                number,
                Reply::Err {
                    domain: "Network".to_owned(),
                    code: 1,
                    message: "connection is closed".to_owned(),
                },
            );
            return;
        };

        let mut properties = message.properties;
        if !message.profile.is_empty() {
            properties.insert(0, ("Profile".to_owned(), message.profile));
        }
        let incoming = Arc::new(MessageIn::new(number, properties, message.body));

        let requester = self.weak.clone();
        let reply = ReplyHandle::new(move |reply| {
            if let Some(conn) = requester.upgrade() {
                conn.deliver_reply(number, reply);
            }
        });
        peer.mailbox.enqueue({
            let peer = Arc::clone(&peer);
            move || {
                if let Some(delegate) = peer.delegate() {
                    delegate.on_request(incoming, reply);
                }
            }
        });
    }

    fn close(&self) {
        {
            let mut state = self.state.lock();
            if matches!(
                *state,
                ConnectionState::Closed | ConnectionState::Disconnected
            ) {
                return;
            }
            *state = ConnectionState::Closing;
        }
        let peer = self.peer.lock().upgrade();
        self.finish_close(CloseStatus::normal(), ConnectionState::Closed);
        if let Some(peer) = peer {
            peer.finish_close(CloseStatus::normal(), ConnectionState::Closed);
        }
    }
}
