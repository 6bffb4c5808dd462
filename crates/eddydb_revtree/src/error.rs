//! Error types for revision trees.

use thiserror::Error;

/// Result type for revision tree operations.
pub type TreeResult<T> = Result<T, TreeError>;

/// Errors that can occur while building or decoding revision trees.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    /// The encoded tree ended before the zero sentinel.
    #[error("encoded revision tree is truncated")]
    Truncated,

    /// A record declared a size that is too small to hold its header.
    #[error("invalid record size {size} at offset {offset}")]
    InvalidRecordSize {
        /// The declared record size.
        size: u32,
        /// Byte offset of the record within the tree blob.
        offset: usize,
    },

    /// A record's parent index does not refer to an earlier revision.
    #[error("parent index {parent} out of range for revision {index}")]
    BadParentIndex {
        /// The offending parent index.
        parent: u16,
        /// Index of the revision that declared it.
        index: usize,
    },

    /// A varint field was malformed or overflowed 64 bits.
    #[error("malformed varint in revision record")]
    BadVarint,

    /// A revision ID failed validation.
    #[error("invalid revision ID: {0}")]
    BadRevId(String),

    /// The tree has no root, or more than one.
    #[error("revision tree must have exactly one root, found {0}")]
    BadRootCount(usize),

    /// An insert would create a conflicting branch and conflicts are
    /// disallowed by the caller.
    #[error("insertion of '{rev_id}' would conflict with an existing leaf")]
    Conflict {
        /// The revision that was rejected.
        rev_id: String,
    },

    /// An insert named a parent revision that does not exist in the tree.
    #[error("revision history does not connect to the tree")]
    Disconnected,

    /// The revision already exists in the tree.
    #[error("revision '{0}' already exists")]
    AlreadyExists(String),
}
