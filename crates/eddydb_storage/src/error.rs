//! Error types for storage streams.

use std::io;
use thiserror::Error;

/// Result type for stream operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors that can occur in stream operations.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The ciphertext is truncated, tampered with, or was written with a
    /// different key.
    #[error("corrupt data: {0}")]
    CorruptData(String),

    /// The requested encryption algorithm is not supported.
    #[error("unsupported encryption algorithm")]
    UnsupportedEncryption,

    /// The encryption key has the wrong size.
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize {
        /// Required key size.
        expected: usize,
        /// Provided key size.
        actual: usize,
    },

    /// The stream was already closed.
    #[error("stream is closed")]
    Closed,
}

impl StreamError {
    /// Creates a `CorruptData` error with a message.
    pub fn corrupt(message: impl Into<String>) -> Self {
        StreamError::CorruptData(message.into())
    }
}
