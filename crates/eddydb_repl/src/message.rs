//! The message-framing transport interface.
//!
//! The replicator talks to its peer through profiled, numbered
//! request/reply pairs with progress reporting. This module defines the
//! collaborator interface; [`crate::loopback`] provides the in-process
//! implementation used by tests.

use crate::error::{ErrorDomain, ReplError};
use parking_lot::Mutex;
use std::sync::Arc;

/// Message and HTTP-style header properties.
pub type Properties = Vec<(String, String)>;

/// Progress states of an outbound request, in delivery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageProgressState {
    /// The request body is being transmitted.
    Sending,
    /// The request was sent; no reply bytes yet.
    AwaitingReply,
    /// Reply bytes are arriving.
    ReceivingReply,
    /// The reply is complete.
    Complete,
}

/// A progress callback invocation for an outbound request.
#[derive(Clone)]
pub struct MessageProgress {
    /// Current state; states arrive in monotonic order.
    pub state: MessageProgressState,
    /// The reply, once any of it has arrived.
    pub reply: Option<Arc<MessageIn>>,
}

/// Callback invoked as a request progresses. May be called on the
/// transport's thread; wrap with [`crate::actor::Mailbox::asynchronize`].
pub type ProgressCallback = Arc<dyn Fn(MessageProgress) + Send + Sync>;

/// An outbound message under construction.
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    /// The profile naming the operation (empty for replies).
    pub profile: String,
    /// Header properties.
    pub properties: Properties,
    /// Message body bytes.
    pub body: Vec<u8>,
    /// True if no reply is expected.
    pub no_reply: bool,
}

impl MessageBuilder {
    /// Starts a request with the given profile.
    #[must_use]
    pub fn request(profile: &str) -> Self {
        Self {
            profile: profile.to_owned(),
            ..Self::default()
        }
    }

    /// Starts a reply message.
    #[must_use]
    pub fn reply() -> Self {
        Self::default()
    }

    /// Adds a header property.
    #[must_use]
    pub fn property(mut self, name: &str, value: impl ToString) -> Self {
        self.properties.push((name.to_owned(), value.to_string()));
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Sets a JSON value as the body.
    #[must_use]
    pub fn json_body(self, value: &serde_json::Value) -> Self {
        self.body(value.to_string().into_bytes())
    }

    /// Marks the message as not expecting a reply.
    #[must_use]
    pub fn no_reply(mut self) -> Self {
        self.no_reply = true;
        self
    }
}

/// A received message: an incoming request or the reply to an outbound
/// request. The body may arrive in chunks.
#[derive(Debug)]
pub struct MessageIn {
    /// The request number this message belongs to.
    pub number: u64,
    /// Header properties.
    pub properties: Properties,
    body: Mutex<BodyBuffer>,
}

#[derive(Debug, Default)]
struct BodyBuffer {
    bytes: Vec<u8>,
    /// Start of the portion not yet drained by `take_body_chunk`.
    undrained: usize,
}

impl MessageIn {
    /// Creates a message with the given header and (possibly partial)
    /// body. Transports append further chunks with
    /// [`append_body`](Self::append_body).
    #[must_use]
    pub fn new(number: u64, properties: Properties, body: Vec<u8>) -> Self {
        Self {
            number,
            properties,
            body: Mutex::new(BodyBuffer {
                bytes: body,
                undrained: 0,
            }),
        }
    }

    /// Looks up a header property.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// The message's profile, if it is a request.
    #[must_use]
    pub fn profile(&self) -> Option<&str> {
        self.property("Profile")
    }

    /// Appends a body chunk (transport side).
    pub fn append_body(&self, chunk: &[u8]) {
        self.body.lock().bytes.extend_from_slice(chunk);
    }

    /// Returns a copy of the full body received so far.
    #[must_use]
    pub fn body(&self) -> Vec<u8> {
        self.body.lock().bytes.clone()
    }

    /// Parses the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns an HTTP 400 error if the body is not valid JSON.
    pub fn json_body(&self) -> Result<serde_json::Value, ReplError> {
        serde_json::from_slice(&self.body())
            .map_err(|e| ReplError::http(400, format!("bad message body: {e}")))
    }

    /// Drains and returns the body bytes that arrived since the last
    /// drain. Blob consumers call this on every progress callback.
    #[must_use]
    pub fn take_body_chunk(&self) -> Vec<u8> {
        let mut body = self.body.lock();
        let chunk = body.bytes[body.undrained..].to_vec();
        body.undrained = body.bytes.len();
        chunk
    }

    /// True if this message is an error reply.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.property("Error-Code").is_some()
    }

    /// Decodes the error carried by an error reply.
    #[must_use]
    pub fn error(&self) -> Option<ReplError> {
        let code: i32 = self.property("Error-Code")?.parse().ok()?;
        let domain = match self.property("Error-Domain").unwrap_or("") {
            "HTTP" => ErrorDomain::Http,
            "WebSocket" => ErrorDomain::WebSocket,
            "POSIX" => ErrorDomain::Posix,
            "Network" => ErrorDomain::Network,
            _ => ErrorDomain::Engine,
        };
        Some(ReplError {
            domain,
            code,
            message: String::from_utf8_lossy(&self.body()).into_owned(),
        })
    }
}

/// The response sent through a [`ReplyHandle`].
pub enum Reply {
    /// A normal reply.
    Ok(MessageBuilder),
    /// An error reply.
    Err {
        /// Error domain name as carried on the wire.
        domain: String,
        /// Error code.
        code: i32,
        /// Error message (becomes the reply body).
        message: String,
    },
}

type ReplyFn = Box<dyn FnOnce(Reply) + Send>;

/// One-shot handle for answering an incoming request.
///
/// Dropping the handle unanswered sends an HTTP 404 error reply, so an
/// unhandled profile never leaves the peer waiting.
pub struct ReplyHandle {
    reply: Option<ReplyFn>,
}

impl ReplyHandle {
    /// Creates a handle that delivers the response via `send`.
    #[must_use]
    pub fn new(send: impl FnOnce(Reply) + Send + 'static) -> Self {
        Self {
            reply: Some(Box::new(send)),
        }
    }

    /// Sends a normal reply.
    pub fn respond(mut self, message: MessageBuilder) {
        if let Some(send) = self.reply.take() {
            send(Reply::Ok(message));
        }
    }

    /// Sends an empty success reply.
    pub fn respond_ok(self) {
        self.respond(MessageBuilder::reply());
    }

    /// Sends an error reply.
    pub fn respond_error(mut self, domain: &str, code: i32, message: impl Into<String>) {
        if let Some(send) = self.reply.take() {
            send(Reply::Err {
                domain: domain.to_owned(),
                code,
                message: message.into(),
            });
        }
    }
}

impl Drop for ReplyHandle {
    fn drop(&mut self) {
        if let Some(send) = self.reply.take() {
            send(Reply::Err {
                domain: "HTTP".to_owned(),
                code: 404,
                message: "no handler for message".to_owned(),
            });
        }
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not yet started, or cleanly closed.
    Closed,
    /// Opening.
    Connecting,
    /// Open.
    Connected,
    /// Close initiated locally.
    Closing,
    /// Closed abnormally.
    Disconnected,
}

/// Why a connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A WebSocket close frame; `code` is the WebSocket status.
    WebSocket,
    /// An OS-level error; `code` is an errno.
    Posix,
    /// A network-level failure; `code` is transport-specific.
    Network,
}

/// WebSocket status code for a normal close.
pub const CLOSE_CODE_NORMAL: i32 = 1000;
/// WebSocket status code for "going away".
pub const CLOSE_CODE_GOING_AWAY: i32 = 1001;

/// Details of a connection close.
#[derive(Debug, Clone)]
pub struct CloseStatus {
    /// The reason category.
    pub reason: CloseReason,
    /// Reason-specific code.
    pub code: i32,
    /// Human-readable message.
    pub message: String,
}

impl CloseStatus {
    /// A clean WebSocket close.
    #[must_use]
    pub fn normal() -> Self {
        Self {
            reason: CloseReason::WebSocket,
            code: CLOSE_CODE_NORMAL,
            message: String::new(),
        }
    }

    /// True for a clean WebSocket close.
    #[must_use]
    pub fn is_normal(&self) -> bool {
        self.reason == CloseReason::WebSocket && self.code == CLOSE_CODE_NORMAL
    }
}

/// Receives connection events. May be called on the transport's thread.
pub trait ConnectionDelegate: Send + Sync {
    /// The HTTP upgrade response arrived.
    fn on_http_response(&self, status: u16, headers: &Properties);

    /// The connection is open.
    fn on_connect(&self);

    /// An incoming request arrived. Answer via `reply`.
    fn on_request(&self, message: Arc<MessageIn>, reply: ReplyHandle);

    /// The connection closed.
    fn on_close(&self, status: CloseStatus, state: ConnectionState);
}

/// A framed connection to the peer.
pub trait Connection: Send + Sync {
    /// Starts connecting. Events arrive at the delegate.
    fn start(&self);

    /// Sends a request. Progress (including the reply) is delivered to
    /// `progress`, in monotonic state order.
    fn send_request(&self, message: MessageBuilder, progress: Option<ProgressCallback>);

    /// Initiates a clean close.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_properties_and_body() {
        let msg = MessageBuilder::request("getAttachment")
            .property("digest", "sha256-abc")
            .body(b"x".to_vec());
        assert_eq!(msg.profile, "getAttachment");
        assert_eq!(msg.properties[0].1, "sha256-abc");
        assert!(!msg.no_reply);
    }

    #[test]
    fn message_in_drains_chunks_incrementally() {
        let msg = MessageIn::new(1, vec![], b"abc".to_vec());
        assert_eq!(msg.take_body_chunk(), b"abc");
        msg.append_body(b"def");
        assert_eq!(msg.take_body_chunk(), b"def");
        assert_eq!(msg.take_body_chunk(), b"");
        assert_eq!(msg.body(), b"abcdef");
    }

    #[test]
    fn error_reply_decoding() {
        let msg = MessageIn::new(
            2,
            vec![
                ("Error-Domain".into(), "HTTP".into()),
                ("Error-Code".into(), "404".into()),
            ],
            b"missing".to_vec(),
        );
        assert!(msg.is_error());
        let err = msg.error().unwrap();
        assert!(err.is_http_not_found());
        assert_eq!(err.message, "missing");
    }

    #[test]
    fn dropped_reply_handle_sends_not_found() {
        let (tx, rx) = std::sync::mpsc::channel();
        {
            let _handle = ReplyHandle::new(move |reply| {
                tx.send(matches!(reply, Reply::Err { code: 404, .. })).unwrap();
            });
        }
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn progress_states_are_ordered() {
        use MessageProgressState::*;
        assert!(Sending < AwaitingReply);
        assert!(AwaitingReply < ReceivingReply);
        assert!(ReceivingReply < Complete);
    }
}
