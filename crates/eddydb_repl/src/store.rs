//! The storage collaborator.
//!
//! The replication engine talks to the key-value storage layer through
//! the [`Store`] trait; [`MemoryStore`] is a complete in-memory
//! implementation that keeps each document as an encoded revision tree,
//! so every read and write exercises the tree codec. [`BlobStore`] holds
//! content-addressed attachments, optionally encrypted at rest through
//! the random-access encrypted stream.

use crate::error::{engine_code, ReplError, ReplResult};
use eddydb_revtree::{RevBody, RevId, RevTree, TreeError};
use eddydb_storage::{
    EncryptedReadStream, EncryptedWriteStream, EncryptionAlgorithm, EncryptionKey,
    MemoryReadStream, MemoryWriteStream, SharedBytes,
};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use tracing::{debug, trace};

/// One entry of a change enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    /// Local sequence of the document's current revision.
    pub sequence: u64,
    /// Document ID.
    pub doc_id: String,
    /// Current revision ID.
    pub rev_id: String,
    /// Parent of the current revision, if any.
    pub parent_rev_id: Option<String>,
    /// True if the current revision is a tombstone.
    pub deleted: bool,
    /// Size of the revision body in bytes.
    pub body_size: u64,
}

/// A content-address digest identifying a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobKey([u8; 32]);

impl BlobKey {
    /// Computes the key of `content` (SHA-256 over the cleartext).
    #[must_use]
    pub fn compute(content: &[u8]) -> Self {
        let digest = Sha256::digest(content);
        Self(digest.into())
    }

    /// Formats the key as a digest string (`sha256-<hex>`).
    #[must_use]
    pub fn digest_string(&self) -> String {
        let mut out = String::with_capacity(7 + 64);
        out.push_str("sha256-");
        for byte in self.0 {
            use std::fmt::Write as _;
            let _ = write!(out, "{byte:02x}");
        }
        out
    }

    /// Parses a digest string produced by
    /// [`digest_string`](Self::digest_string).
    #[must_use]
    pub fn parse(digest: &str) -> Option<Self> {
        let hex = digest.strip_prefix("sha256-")?;
        if hex.len() != 64 {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }
}

/// A blob a revision references: content digest and byte length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRequest {
    /// Content-address digest.
    pub key: BlobKey,
    /// Cleartext length in bytes.
    pub size: u64,
}

/// Scans a document body for attachment references.
///
/// Attachments live under the `_attachments` key, each with a `digest`
/// and `length` field.
#[must_use]
pub fn find_blob_refs(body: &serde_json::Value) -> Vec<BlobRequest> {
    let Some(attachments) = body.get("_attachments").and_then(|a| a.as_object()) else {
        return Vec::new();
    };
    let mut refs = Vec::new();
    for meta in attachments.values() {
        let Some(key) = meta
            .get("digest")
            .and_then(|d| d.as_str())
            .and_then(BlobKey::parse)
        else {
            continue;
        };
        let size = meta.get("length").and_then(|l| l.as_u64()).unwrap_or(0);
        refs.push(BlobRequest { key, size });
    }
    refs
}

/// A revision read back for sending to the peer.
#[derive(Debug, Clone)]
pub struct RevisionToSend {
    /// Document ID.
    pub doc_id: String,
    /// Revision ID.
    pub rev_id: String,
    /// Ancestor revision IDs, nearest first.
    pub history: Vec<String>,
    /// True for a tombstone.
    pub deleted: bool,
    /// Local sequence of the revision.
    pub sequence: u64,
    /// The body JSON bytes (empty for bodiless tombstones).
    pub body: Vec<u8>,
}

/// Result of inserting a pulled revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertResult {
    /// False if the revision was already present.
    pub added: bool,
    /// True if the insert created a conflicting branch.
    pub conflict: bool,
    /// The local sequence assigned to the revision.
    pub sequence: u64,
}

/// The key-value storage layer, as the replication engine sees it.
///
/// Implementations must be thread-safe; the [`DbWorker`](crate::DbWorker)
/// serializes all replication access on one thread regardless.
pub trait Store: Send + Sync {
    /// Reads the local checkpoint stored under `checkpoint_id`.
    fn get_checkpoint(&self, checkpoint_id: &str) -> ReplResult<Option<String>>;

    /// Writes the local checkpoint.
    fn set_checkpoint(&self, checkpoint_id: &str, json: &str) -> ReplResult<()>;

    /// Stores an HTTP cookie alongside the database.
    fn set_cookie(&self, cookie: &str) -> ReplResult<()>;

    /// Number of live (non-deleted) documents.
    fn document_count(&self) -> u64;

    /// Highest sequence assigned so far (zero for an empty database).
    fn last_sequence(&self) -> u64;

    /// Enumerates documents whose current revision has a sequence greater
    /// than `since`, in sequence order, up to `limit`.
    fn changes_since(
        &self,
        since: u64,
        limit: usize,
        skip_deleted: bool,
    ) -> ReplResult<Vec<ChangeEntry>>;

    /// True if the document already has the given revision.
    fn has_revision(&self, doc_id: &str, rev_id: &str) -> ReplResult<bool>;

    /// The document's current revision ID, if the document exists.
    fn current_rev_id(&self, doc_id: &str) -> ReplResult<Option<String>>;

    /// Reads a revision with its history for sending to the peer.
    fn rev_to_send(&self, doc_id: &str, rev_id: &str) -> ReplResult<RevisionToSend>;

    /// Inserts a revision with its history (`history[0]` is the revision
    /// itself). With `allow_conflict` false, a would-be conflicting
    /// branch is rejected.
    fn insert_revision(
        &self,
        doc_id: &str,
        history: &[String],
        body: &[u8],
        deleted: bool,
        allow_conflict: bool,
    ) -> ReplResult<InsertResult>;

    /// The attachment store.
    fn blobs(&self) -> BlobStore;

    /// Subscribes to committed changes (for continuous replication).
    fn subscribe_changes(&self) -> Receiver<ChangeEntry>;
}

#[derive(Debug)]
struct DocRecord {
    /// Encoded revision tree.
    tree_blob: Vec<u8>,
    /// Sequence under which the record was last saved.
    sequence: u64,
}

#[derive(Debug, Default)]
struct StoreInner {
    docs: BTreeMap<String, DocRecord>,
    checkpoints: HashMap<String, String>,
    cookies: Vec<String>,
    last_sequence: u64,
}

/// An in-memory [`Store`] keeping documents as encoded revision trees.
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
    blobs: BlobStore,
    subscribers: Mutex<Vec<Sender<ChangeEntry>>>,
}

impl MemoryStore {
    /// Creates an empty store with an unencrypted blob store.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_encryption(None)
    }

    /// Creates an empty store; blobs are encrypted at rest when a key is
    /// given.
    #[must_use]
    pub fn with_encryption(key: Option<EncryptionKey>) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(StoreInner::default()),
            blobs: BlobStore::new(key),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Creates a revision as a child of the document's current revision
    /// (test and application convenience).
    pub fn create_rev(
        &self,
        doc_id: &str,
        rev_id: &str,
        body: &[u8],
        deleted: bool,
    ) -> ReplResult<u64> {
        let mut history = vec![rev_id.to_owned()];
        if let Some(current) = self.current_rev_id(doc_id)? {
            history.push(current);
        }
        let result = self.insert_revision(doc_id, &history, body, deleted, false)?;
        Ok(result.sequence)
    }

    /// Decoded revision tree of a document (None if absent).
    pub fn document_tree(&self, doc_id: &str) -> ReplResult<Option<RevTree>> {
        let inner = self.inner.read();
        let Some(record) = inner.docs.get(doc_id) else {
            return Ok(None);
        };
        let tree = RevTree::decode(&record.tree_blob, record.sequence)?;
        Ok(Some(tree))
    }

    /// The body of a specific revision, if retained.
    pub fn revision_body(&self, doc_id: &str, rev_id: &str) -> ReplResult<Option<Vec<u8>>> {
        let Some(tree) = self.document_tree(doc_id)? else {
            return Ok(None);
        };
        let rev_id = RevId::parse(rev_id)?;
        Ok(tree
            .find(&rev_id)
            .and_then(|i| tree.get(i).body.inline().map(<[u8]>::to_vec)))
    }

    /// True if the document has more than one live leaf.
    pub fn is_conflicted(&self, doc_id: &str) -> ReplResult<bool> {
        Ok(self
            .document_tree(doc_id)?
            .is_some_and(|tree| tree.is_conflicted()))
    }

    /// Cookies stored so far.
    #[must_use]
    pub fn cookies(&self) -> Vec<String> {
        self.inner.read().cookies.clone()
    }

    /// Removes a stored checkpoint (e.g. after a database reset).
    pub fn delete_checkpoint(&self, checkpoint_id: &str) {
        self.inner.write().checkpoints.remove(checkpoint_id);
    }

    fn publish(&self, entry: &ChangeEntry) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(entry.clone()).is_ok());
    }

    fn entry_for(tree: &RevTree, doc_id: &str, sequence: u64) -> Option<ChangeEntry> {
        let current = tree.current()?;
        let rev = tree.get(current);
        Some(ChangeEntry {
            sequence,
            doc_id: doc_id.to_owned(),
            rev_id: rev.rev_id.as_str().to_owned(),
            parent_rev_id: tree
                .parent_of(current)
                .map(|p| tree.get(p).rev_id.as_str().to_owned()),
            deleted: rev.is_deleted(),
            body_size: rev.body.inline().map_or(0, |b| b.len() as u64),
        })
    }
}

impl Store for MemoryStore {
    fn get_checkpoint(&self, checkpoint_id: &str) -> ReplResult<Option<String>> {
        Ok(self.inner.read().checkpoints.get(checkpoint_id).cloned())
    }

    fn set_checkpoint(&self, checkpoint_id: &str, json: &str) -> ReplResult<()> {
        self.inner
            .write()
            .checkpoints
            .insert(checkpoint_id.to_owned(), json.to_owned());
        Ok(())
    }

    fn set_cookie(&self, cookie: &str) -> ReplResult<()> {
        self.inner.write().cookies.push(cookie.to_owned());
        Ok(())
    }

    fn document_count(&self) -> u64 {
        let inner = self.inner.read();
        inner
            .docs
            .iter()
            .filter(|(_, record)| {
                RevTree::decode(&record.tree_blob, record.sequence)
                    .ok()
                    .and_then(|tree| tree.current().map(|i| !tree.get(i).is_deleted()))
                    .unwrap_or(false)
            })
            .count() as u64
    }

    fn last_sequence(&self) -> u64 {
        self.inner.read().last_sequence
    }

    fn changes_since(
        &self,
        since: u64,
        limit: usize,
        skip_deleted: bool,
    ) -> ReplResult<Vec<ChangeEntry>> {
        let inner = self.inner.read();
        let mut entries = Vec::new();
        for (doc_id, record) in &inner.docs {
            if record.sequence <= since {
                continue;
            }
            let tree = RevTree::decode(&record.tree_blob, record.sequence)?;
            let Some(entry) = Self::entry_for(&tree, doc_id, record.sequence) else {
                continue;
            };
            if skip_deleted && entry.deleted {
                continue;
            }
            entries.push(entry);
        }
        entries.sort_by_key(|e| e.sequence);
        entries.truncate(limit);
        Ok(entries)
    }

    fn has_revision(&self, doc_id: &str, rev_id: &str) -> ReplResult<bool> {
        let Some(tree) = self.document_tree(doc_id)? else {
            return Ok(false);
        };
        let rev_id = RevId::parse(rev_id)?;
        Ok(tree.find(&rev_id).is_some())
    }

    fn current_rev_id(&self, doc_id: &str) -> ReplResult<Option<String>> {
        let Some(tree) = self.document_tree(doc_id)? else {
            return Ok(None);
        };
        Ok(tree
            .current()
            .map(|i| tree.get(i).rev_id.as_str().to_owned()))
    }

    fn rev_to_send(&self, doc_id: &str, rev_id: &str) -> ReplResult<RevisionToSend> {
        let tree = self.document_tree(doc_id)?.ok_or_else(|| {
            ReplError::engine(engine_code::NOT_FOUND, format!("no such document '{doc_id}'"))
        })?;
        let parsed = RevId::parse(rev_id)?;
        let index = tree.find(&parsed).ok_or_else(|| {
            ReplError::engine(
                engine_code::NOT_FOUND,
                format!("no revision '{rev_id}' in '{doc_id}'"),
            )
        })?;
        let rev = tree.get(index);
        let history = tree
            .history_of(index)
            .into_iter()
            .skip(1)
            .map(|id| id.as_str().to_owned())
            .collect();
        Ok(RevisionToSend {
            doc_id: doc_id.to_owned(),
            rev_id: rev_id.to_owned(),
            history,
            deleted: rev.is_deleted(),
            sequence: rev.sequence,
            body: rev.body.inline().map(<[u8]>::to_vec).unwrap_or_default(),
        })
    }

    fn insert_revision(
        &self,
        doc_id: &str,
        history: &[String],
        body: &[u8],
        deleted: bool,
        allow_conflict: bool,
    ) -> ReplResult<InsertResult> {
        let parsed: Vec<RevId> = history
            .iter()
            .map(|id| RevId::parse(id.as_str()))
            .collect::<Result<_, TreeError>>()?;

        let mut inner = self.inner.write();
        let mut tree = match inner.docs.get(doc_id) {
            Some(record) => RevTree::decode(&record.tree_blob, record.sequence)?,
            None => RevTree::new(),
        };

        let body_value = RevBody::Inline(body.to_vec());
        let has_attachments = serde_json::from_slice::<serde_json::Value>(body)
            .map(|v| !find_blob_refs(&v).is_empty())
            .unwrap_or(false);
        let outcome =
            match tree.insert_history(&parsed, body_value, deleted, has_attachments, allow_conflict)
            {
                Ok(outcome) => outcome,
                Err(TreeError::AlreadyExists(_)) => {
                    trace!(doc_id, rev_id = %history[0], "revision already present");
                    let sequence = inner.docs.get(doc_id).map_or(0, |r| r.sequence);
                    return Ok(InsertResult {
                        added: false,
                        conflict: false,
                        sequence,
                    });
                }
                Err(err) => return Err(err.into()),
            };

        inner.last_sequence += 1;
        let sequence = inner.last_sequence;
        tree.set_sequence(outcome.index, sequence);
        let tree_blob = tree.encode();
        inner.docs.insert(
            doc_id.to_owned(),
            DocRecord {
                tree_blob,
                sequence,
            },
        );
        debug!(doc_id, rev_id = %history[0], sequence, conflict = outcome.conflict, "inserted revision");

        let entry = ChangeEntry {
            sequence,
            doc_id: doc_id.to_owned(),
            rev_id: history[0].clone(),
            parent_rev_id: history.get(1).cloned(),
            deleted,
            body_size: body.len() as u64,
        };
        drop(inner);
        self.publish(&entry);

        Ok(InsertResult {
            added: true,
            conflict: outcome.conflict,
            sequence,
        })
    }

    fn blobs(&self) -> BlobStore {
        self.blobs.clone()
    }

    fn subscribe_changes(&self) -> Receiver<ChangeEntry> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }
}

struct BlobStoreInner {
    /// Stored payloads: ciphertext when an encryption key is configured.
    blobs: RwLock<HashMap<BlobKey, Vec<u8>>>,
    key: Option<EncryptionKey>,
}

/// A content-addressed attachment store.
///
/// Payloads are written through the encrypted write stream when an
/// encryption key is configured; keys are always digests of the
/// cleartext.
#[derive(Clone)]
pub struct BlobStore(Arc<BlobStoreInner>);

impl BlobStore {
    /// Creates a blob store, encrypted at rest when a key is given.
    #[must_use]
    pub fn new(key: Option<EncryptionKey>) -> Self {
        Self(Arc::new(BlobStoreInner {
            blobs: RwLock::new(HashMap::new()),
            key,
        }))
    }

    /// True if a blob with this key is installed.
    #[must_use]
    pub fn has(&self, key: &BlobKey) -> bool {
        self.0.blobs.read().contains_key(key)
    }

    /// Number of installed blobs.
    #[must_use]
    pub fn count(&self) -> usize {
        self.0.blobs.read().len()
    }

    /// Opens a write stream for a new blob.
    ///
    /// # Errors
    ///
    /// Fails if the encrypted stream cannot be initialized.
    pub fn open_writer(&self) -> ReplResult<BlobWriter> {
        let target = SharedBytes::new();
        let sink = Box::new(MemoryWriteStream::new(target.clone()));
        let stream = match &self.0.key {
            Some(key) => BlobSink::Encrypted(EncryptedWriteStream::new(
                sink,
                EncryptionAlgorithm::Aes128,
                key,
            )?),
            None => BlobSink::Plain(sink),
        };
        Ok(BlobWriter {
            store: self.clone(),
            target,
            sink: Some(stream),
            hasher: Sha256::new(),
            size: 0,
        })
    }

    /// Stores `content` and returns its key (write + install shorthand).
    ///
    /// # Errors
    ///
    /// Fails if the underlying stream fails.
    pub fn put(&self, content: &[u8]) -> ReplResult<BlobRequest> {
        let mut writer = self.open_writer()?;
        writer.append(content)?;
        let expected = BlobKey::compute(content);
        let size = content.len() as u64;
        writer.install(&expected)?;
        Ok(BlobRequest {
            key: expected,
            size,
        })
    }

    /// Reads back a blob's cleartext.
    ///
    /// # Errors
    ///
    /// Fails if the blob is missing or its payload fails to decrypt.
    pub fn contents(&self, key: &BlobKey) -> ReplResult<Vec<u8>> {
        let payload = self
            .0
            .blobs
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| {
                ReplError::engine(
                    engine_code::NOT_FOUND,
                    format!("no blob {}", key.digest_string()),
                )
            })?;
        match &self.0.key {
            None => Ok(payload),
            Some(enc_key) => {
                let source = Box::new(MemoryReadStream::new(SharedBytes::from_vec(payload)));
                let mut reader =
                    EncryptedReadStream::new(source, EncryptionAlgorithm::Aes128, enc_key)?;
                let length = reader.length()? as usize;
                let mut cleartext = vec![0u8; length];
                reader.seek(0)?;
                let n = reader.read(&mut cleartext)?;
                cleartext.truncate(n);
                Ok(cleartext)
            }
        }
    }

    fn install_payload(&self, key: BlobKey, payload: Vec<u8>) {
        self.0.blobs.write().insert(key, payload);
    }
}

enum BlobSink {
    Plain(Box<MemoryWriteStream>),
    Encrypted(EncryptedWriteStream),
}

/// An in-progress blob write.
///
/// The digest is computed over the cleartext as it is appended; the
/// payload goes through the configured stream. [`install`] verifies the
/// digest before publishing the blob.
///
/// [`install`]: BlobWriter::install
pub struct BlobWriter {
    store: BlobStore,
    target: SharedBytes,
    sink: Option<BlobSink>,
    hasher: Sha256,
    size: u64,
}

impl BlobWriter {
    /// Appends cleartext to the blob.
    ///
    /// # Errors
    ///
    /// Fails if the underlying stream fails.
    pub fn append(&mut self, chunk: &[u8]) -> ReplResult<()> {
        self.hasher.update(chunk);
        self.size += chunk.len() as u64;
        match self.sink.as_mut() {
            Some(BlobSink::Plain(stream)) => {
                use eddydb_storage::WriteStream as _;
                stream.write(chunk)?;
            }
            Some(BlobSink::Encrypted(stream)) => stream.write(chunk)?,
            None => {
                return Err(ReplError::engine(
                    engine_code::CORRUPT_DATA,
                    "blob writer already closed",
                ))
            }
        }
        Ok(())
    }

    /// Bytes appended so far.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Finishes the write and installs the blob under `expected`.
    ///
    /// # Errors
    ///
    /// Fails if the computed digest does not match `expected`.
    pub fn install(mut self, expected: &BlobKey) -> ReplResult<()> {
        self.close_sink()?;
        let actual = BlobKey(self.hasher.clone().finalize().into());
        if &actual != expected {
            return Err(ReplError::engine(
                engine_code::CORRUPT_DATA,
                format!(
                    "blob digest mismatch: expected {}, got {}",
                    expected.digest_string(),
                    actual.digest_string()
                ),
            ));
        }
        self.store.install_payload(actual, self.target.snapshot());
        Ok(())
    }

    /// Abandons the write.
    pub fn cancel(mut self) {
        let _ = self.close_sink();
    }

    fn close_sink(&mut self) -> ReplResult<()> {
        match self.sink.take() {
            Some(BlobSink::Plain(mut stream)) => {
                use eddydb_storage::WriteStream as _;
                stream.close()?;
            }
            Some(BlobSink::Encrypted(mut stream)) => stream.close()?,
            None => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_enumerate_changes() {
        let store = MemoryStore::new();
        store.create_rev("a", "1-aa", b"{\"n\":1}", false).unwrap();
        store.create_rev("b", "1-bb", b"{\"n\":2}", false).unwrap();
        store.create_rev("a", "2-aa", b"{\"n\":3}", false).unwrap();

        assert_eq!(store.document_count(), 2);
        assert_eq!(store.last_sequence(), 3);

        let changes = store.changes_since(0, 100, false).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].doc_id, "b");
        assert_eq!(changes[0].sequence, 2);
        assert_eq!(changes[1].doc_id, "a");
        assert_eq!(changes[1].rev_id, "2-aa");
        assert_eq!(changes[1].parent_rev_id.as_deref(), Some("1-aa"));

        let incremental = store.changes_since(2, 100, false).unwrap();
        assert_eq!(incremental.len(), 1);
        assert_eq!(incremental[0].doc_id, "a");
    }

    #[test]
    fn skip_deleted_suppresses_tombstones() {
        let store = MemoryStore::new();
        store.create_rev("a", "1-aa", b"{}", false).unwrap();
        store.create_rev("a", "2-aa", b"", true).unwrap();
        store.create_rev("b", "1-bb", b"{}", false).unwrap();

        assert_eq!(store.document_count(), 1);
        assert_eq!(store.changes_since(0, 100, false).unwrap().len(), 2);
        let live = store.changes_since(0, 100, true).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].doc_id, "b");
    }

    #[test]
    fn rev_to_send_includes_history() {
        let store = MemoryStore::new();
        store.create_rev("a", "1-aa", b"{\"v\":1}", false).unwrap();
        store.create_rev("a", "2-aa", b"{\"v\":2}", false).unwrap();

        let rev = store.rev_to_send("a", "2-aa").unwrap();
        assert_eq!(rev.history, vec!["1-aa".to_owned()]);
        assert_eq!(rev.body, b"{\"v\":2}");
        assert!(!rev.deleted);

        assert!(store.rev_to_send("a", "9-zz").is_err());
        assert!(store.rev_to_send("nope", "1-aa").is_err());
    }

    #[test]
    fn insert_remote_revision_with_history() {
        let store = MemoryStore::new();
        store.create_rev("a", "1-aa", b"{}", false).unwrap();

        let result = store
            .insert_revision(
                "a",
                &["3-cc".to_owned(), "2-bb".to_owned(), "1-aa".to_owned()],
                b"{\"v\":3}",
                false,
                false,
            )
            .unwrap();
        assert!(result.added);
        assert!(!result.conflict);
        assert_eq!(store.current_rev_id("a").unwrap().as_deref(), Some("3-cc"));

        // Inserting the same revision again is a no-op.
        let again = store
            .insert_revision(
                "a",
                &["3-cc".to_owned(), "2-bb".to_owned()],
                b"{\"v\":3}",
                false,
                false,
            )
            .unwrap();
        assert!(!again.added);
    }

    #[test]
    fn conflicting_insert_respects_allow_flag() {
        let store = MemoryStore::new();
        store.create_rev("doc", "1-aa", b"{}", false).unwrap();
        store.create_rev("doc", "2-aa", b"{}", false).unwrap();

        let rejected = store.insert_revision(
            "doc",
            &["2-bb".to_owned(), "1-aa".to_owned()],
            b"{}",
            false,
            false,
        );
        assert!(rejected.is_err());
        assert!(!store.is_conflicted("doc").unwrap());

        let accepted = store
            .insert_revision(
                "doc",
                &["2-bb".to_owned(), "1-aa".to_owned()],
                b"{}",
                false,
                true,
            )
            .unwrap();
        assert!(accepted.conflict);
        assert!(store.is_conflicted("doc").unwrap());
    }

    #[test]
    fn change_feed_delivers_commits() {
        let store = MemoryStore::new();
        let rx = store.subscribe_changes();
        store.create_rev("a", "1-aa", b"{}", false).unwrap();
        let entry = rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(entry.doc_id, "a");
        assert_eq!(entry.sequence, 1);
    }

    #[test]
    fn blob_key_digest_string_roundtrip() {
        let key = BlobKey::compute(b"attachment body");
        let digest = key.digest_string();
        assert!(digest.starts_with("sha256-"));
        assert_eq!(BlobKey::parse(&digest), Some(key));
        assert_eq!(BlobKey::parse("sha256-zz"), None);
        assert_eq!(BlobKey::parse("md5-abcd"), None);
    }

    #[test]
    fn blob_store_roundtrip_plain() {
        let blobs = BlobStore::new(None);
        let request = blobs.put(b"hello blob").unwrap();
        assert!(blobs.has(&request.key));
        assert_eq!(blobs.contents(&request.key).unwrap(), b"hello blob");
    }

    #[test]
    fn blob_store_roundtrip_encrypted() {
        let key = EncryptionKey::from_bytes(&[9u8; 16]).unwrap();
        let blobs = BlobStore::new(Some(key));
        let content = vec![0x5Au8; 10_000];
        let request = blobs.put(&content).unwrap();
        assert_eq!(blobs.contents(&request.key).unwrap(), content);

        // The stored payload is ciphertext, not the content.
        let stored = blobs.0.blobs.read().get(&request.key).cloned().unwrap();
        assert_ne!(stored, content);
    }

    #[test]
    fn blob_writer_rejects_digest_mismatch() {
        let blobs = BlobStore::new(None);
        let mut writer = blobs.open_writer().unwrap();
        writer.append(b"actual content").unwrap();
        let wrong = BlobKey::compute(b"expected content");
        assert!(writer.install(&wrong).is_err());
        assert_eq!(blobs.count(), 0);
    }

    #[test]
    fn find_blob_refs_scans_attachments() {
        let key = BlobKey::compute(b"data");
        let body = serde_json::json!({
            "title": "doc",
            "_attachments": {
                "photo": {"digest": key.digest_string(), "length": 4, "stub": true},
                "broken": {"length": 9}
            }
        });
        let refs = find_blob_refs(&body);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].key, key);
        assert_eq!(refs[0].size, 4);

        assert!(find_blob_refs(&serde_json::json!({"no": "atts"})).is_empty());
    }
}
