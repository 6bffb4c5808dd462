//! Blob transfer workers.
//!
//! [`IncomingBlob`] downloads one attachment: it opens a write stream
//! into the blob store (encrypted at rest when the store is configured
//! that way), sends `getAttachment`, appends each reply chunk, and on
//! completion installs the blob under its content digest.
//! [`OutgoingBlob`] is the symmetric responder, streaming a stored blob
//! as the reply body.

use crate::error::{engine_code, ReplError};
use crate::message::{
    Connection, MessageBuilder, MessageProgress, MessageProgressState, ReplyHandle,
};
use crate::status::{ActivityLevel, Progress};
use crate::store::{BlobKey, BlobRequest, BlobStore, BlobWriter};
use crate::worker::WorkerShell;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Reports blob progress deltas into the owning worker's progress.
pub type BlobProgressSink = Arc<dyn Fn(Progress) + Send + Sync>;

/// One-shot completion callback; `None` means the blob was installed.
pub type BlobDone = Box<dyn FnOnce(Option<ReplError>) + Send>;

struct Download {
    request: BlobRequest,
    writer: Option<BlobWriter>,
    received: u64,
    progress: BlobProgressSink,
    done: Option<BlobDone>,
}

/// Downloads a single attachment from the peer.
pub struct IncomingBlob {
    shell: WorkerShell,
    connection: Arc<dyn Connection>,
    blobs: BlobStore,
    download: Mutex<Option<Download>>,
}

impl IncomingBlob {
    /// Creates a blob download worker.
    #[must_use]
    pub fn new(connection: Arc<dyn Connection>, blobs: BlobStore) -> Arc<Self> {
        Arc::new(Self {
            shell: WorkerShell::new("blob-in"),
            connection,
            blobs,
            download: Mutex::new(None),
        })
    }

    /// Current activity level.
    #[must_use]
    pub fn level(&self) -> ActivityLevel {
        self.shell.level()
    }

    /// Starts downloading `request`. Progress deltas go to `progress`;
    /// `done` fires exactly once when the blob is installed or failed.
    pub fn start(self: &Arc<Self>, request: BlobRequest, progress: BlobProgressSink, done: BlobDone) {
        let this = Arc::clone(self);
        self.shell.mailbox().enqueue(move || this.on_start(request, progress, done));
    }

    fn on_start(self: &Arc<Self>, request: BlobRequest, progress: BlobProgressSink, done: BlobDone) {
        debug!(digest = %request.key.digest_string(), size = request.size, "requesting blob");
        self.shell.set_level(ActivityLevel::Busy);
        progress(Progress {
            completed: 0,
            total: request.size,
        });

        let writer = match self.blobs.open_writer() {
            Ok(writer) => writer,
            Err(err) => {
                progress(Progress {
                    completed: request.size,
                    total: 0,
                });
                self.shell.set_level(ActivityLevel::Stopped);
                done(Some(err));
                return;
            }
        };

        let digest = request.key.digest_string();
        *self.download.lock() = Some(Download {
            request,
            writer: Some(writer),
            received: 0,
            progress,
            done: Some(done),
        });

        let message = MessageBuilder::request("getAttachment").property("digest", digest);
        let this = Arc::clone(self);
        let callback = self
            .shell
            .mailbox()
            .asynchronize(move |p: MessageProgress| this.on_progress(&p));
        self.connection.send_request(message, Some(callback));
    }

    fn on_progress(self: &Arc<Self>, p: &MessageProgress) {
        let mut guard = self.download.lock();
        let Some(download) = guard.as_mut() else {
            return; // already finished
        };
        if download.writer.is_none() {
            return;
        }
        let Some(reply) = &p.reply else { return };

        if let Some(err) = reply.error() {
            drop(guard);
            self.finish(Some(err));
            return;
        }

        let chunk = reply.take_body_chunk();
        if !chunk.is_empty() {
            if let Some(writer) = download.writer.as_mut() {
                if let Err(err) = writer.append(&chunk) {
                    drop(guard);
                    self.finish(Some(err));
                    return;
                }
            }
            download.received += chunk.len() as u64;
            (download.progress)(Progress {
                completed: chunk.len() as u64,
                total: 0,
            });
        }

        if p.state == MessageProgressState::Complete {
            drop(guard);
            self.install();
        }
    }

    fn install(self: &Arc<Self>) {
        let (writer, key) = {
            let mut guard = self.download.lock();
            let Some(download) = guard.as_mut() else { return };
            let Some(writer) = download.writer.take() else {
                return;
            };
            (writer, download.request.key)
        };
        match writer.install(&key) {
            Ok(()) => {
                debug!(digest = %key.digest_string(), "blob installed");
                self.finish(None);
            }
            Err(err) => self.finish(Some(err)),
        }
    }

    /// Completes the download. On failure the writer is discarded and
    /// progress is bumped to 100%, so aggregate progress still reaches
    /// unity.
    fn finish(self: &Arc<Self>, error: Option<ReplError>) {
        let Some(mut download) = self.download.lock().take() else {
            return;
        };
        if let Some(writer) = download.writer.take() {
            writer.cancel();
        }
        if error.is_some() {
            let remaining = download.request.size.saturating_sub(download.received);
            if remaining > 0 {
                (download.progress)(Progress {
                    completed: remaining,
                    total: 0,
                });
            }
        }
        self.shell.set_level(ActivityLevel::Stopped);
        if let Some(err) = &error {
            debug!(%err, "blob download failed");
            self.shell.got_error(err.clone());
        }
        if let Some(done) = download.done.take() {
            done(error);
        }
    }
}

/// Serves a stored attachment as a reply body.
pub struct OutgoingBlob {
    shell: WorkerShell,
    blobs: BlobStore,
}

impl OutgoingBlob {
    /// Creates a blob upload worker.
    #[must_use]
    pub fn new(blobs: BlobStore) -> Arc<Self> {
        Arc::new(Self {
            shell: WorkerShell::new("blob-out"),
            blobs,
        })
    }

    /// Reads the blob named by `digest` and streams it as the reply.
    pub fn start(self: &Arc<Self>, digest: String, reply: ReplyHandle) {
        let this = Arc::clone(self);
        self.shell.mailbox().enqueue(move || {
            let Some(key) = BlobKey::parse(&digest) else {
                reply.respond_error("HTTP", 400, format!("bad digest '{digest}'"));
                return;
            };
            match this.blobs.contents(&key) {
                Ok(contents) => {
                    debug!(%digest, bytes = contents.len(), "serving blob");
                    reply.respond(MessageBuilder::reply().body(contents));
                }
                Err(err) if err.code == engine_code::NOT_FOUND => {
                    reply.respond_error("HTTP", 404, format!("no blob {digest}"));
                }
                Err(err) => {
                    reply.respond_error("HTTP", 500, err.to_string());
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageIn, ProgressCallback, Reply};
    use parking_lot::Mutex as PlMutex;
    use std::sync::mpsc;
    use std::time::Duration;

    /// A connection stub that hands each request's progress callback to
    /// the test for manual delivery.
    struct StubConnection {
        callbacks: PlMutex<Vec<(String, ProgressCallback)>>,
    }

    impl StubConnection {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                callbacks: PlMutex::new(Vec::new()),
            })
        }

        fn take_callback(&self) -> (String, ProgressCallback) {
            for _ in 0..100 {
                if let Some(entry) = self.callbacks.lock().pop() {
                    return entry;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            panic!("no request was sent");
        }
    }

    impl Connection for StubConnection {
        fn start(&self) {}

        fn send_request(&self, message: MessageBuilder, progress: Option<ProgressCallback>) {
            let digest = message
                .properties
                .iter()
                .find(|(k, _)| k == "digest")
                .map(|(_, v)| v.clone())
                .unwrap_or_default();
            self.callbacks.lock().push((digest, progress.unwrap()));
        }

        fn close(&self) {}
    }

    #[test]
    fn incoming_blob_installs_chunked_download() {
        let blobs = BlobStore::new(None);
        let connection = StubConnection::new();
        let content = vec![0x42u8; 10_000];
        let request = BlobRequest {
            key: BlobKey::compute(&content),
            size: content.len() as u64,
        };

        let worker = IncomingBlob::new(connection.clone(), blobs.clone());
        let progress_total = Arc::new(PlMutex::new(Progress::default()));
        let pt = Arc::clone(&progress_total);
        let (done_tx, done_rx) = mpsc::channel();
        worker.start(
            request.clone(),
            Arc::new(move |delta| {
                let mut p = pt.lock();
                *p = *p + delta;
            }),
            Box::new(move |err| done_tx.send(err).unwrap()),
        );

        let (digest, callback) = connection.take_callback();
        assert_eq!(digest, request.key.digest_string());

        // Deliver the reply in two chunks, then complete.
        let reply = Arc::new(MessageIn::new(1, vec![], content[..4000].to_vec()));
        callback(MessageProgress {
            state: MessageProgressState::ReceivingReply,
            reply: Some(Arc::clone(&reply)),
        });
        reply.append_body(&content[4000..]);
        callback(MessageProgress {
            state: MessageProgressState::Complete,
            reply: Some(reply),
        });

        assert!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap().is_none());
        assert!(blobs.has(&request.key));
        assert_eq!(blobs.contents(&request.key).unwrap(), content);
        let p = *progress_total.lock();
        assert_eq!(p.completed, request.size);
        assert_eq!(p.total, request.size);
    }

    #[test]
    fn incoming_blob_error_bumps_progress_to_total() {
        let blobs = BlobStore::new(None);
        let connection = StubConnection::new();
        let request = BlobRequest {
            key: BlobKey::compute(b"missing"),
            size: 7,
        };

        let worker = IncomingBlob::new(connection.clone(), blobs.clone());
        let progress_total = Arc::new(PlMutex::new(Progress::default()));
        let pt = Arc::clone(&progress_total);
        let (done_tx, done_rx) = mpsc::channel();
        worker.start(
            request.clone(),
            Arc::new(move |delta| {
                let mut p = pt.lock();
                *p = *p + delta;
            }),
            Box::new(move |err| done_tx.send(err).unwrap()),
        );

        let (_, callback) = connection.take_callback();
        let reply = Arc::new(MessageIn::new(
            1,
            vec![
                ("Error-Domain".into(), "HTTP".into()),
                ("Error-Code".into(), "404".into()),
            ],
            b"no such blob".to_vec(),
        ));
        callback(MessageProgress {
            state: MessageProgressState::Complete,
            reply: Some(reply),
        });

        let err = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(err.unwrap().is_http_not_found());
        assert!(!blobs.has(&request.key));
        // Progress still reached unity.
        let p = *progress_total.lock();
        assert_eq!(p.completed, 7);
        assert_eq!(p.total, 7);
    }

    #[test]
    fn outgoing_blob_serves_and_404s() {
        let blobs = BlobStore::new(None);
        let stored = blobs.put(b"the blob body").unwrap();
        let worker = OutgoingBlob::new(blobs);

        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        worker.start(
            stored.key.digest_string(),
            ReplyHandle::new(move |reply| {
                let ok = match reply {
                    Reply::Ok(msg) => msg.body == b"the blob body",
                    Reply::Err { .. } => false,
                };
                tx2.send(ok).unwrap();
            }),
        );
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());

        let missing = BlobKey::compute(b"other");
        worker.start(
            missing.digest_string(),
            ReplyHandle::new(move |reply| {
                tx.send(matches!(reply, Reply::Err { code: 404, .. })).unwrap();
            }),
        );
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }
}
