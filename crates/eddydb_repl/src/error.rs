//! Replication errors: (domain, code, message) triples.
//!
//! Fatal errors travel through worker status and stop the replicator;
//! per-document errors go through a separate delegate channel and do not.

use thiserror::Error;

/// Result type for replication operations.
pub type ReplResult<T> = Result<T, ReplError>;

/// The domain an error code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDomain {
    /// Engine-internal errors (see [`engine_code`]).
    Engine,
    /// WebSocket close codes.
    WebSocket,
    /// POSIX errno values.
    Posix,
    /// Network-level failures (DNS, TLS, timeout).
    Network,
    /// HTTP status codes.
    Http,
}

/// Engine-domain error codes.
pub mod engine_code {
    /// A query AST failed to translate.
    pub const INVALID_QUERY: i32 = 1;
    /// The operation is not supported.
    pub const UNSUPPORTED: i32 = 2;
    /// The operation is not implemented yet.
    pub const UNIMPLEMENTED: i32 = 3;
    /// The requested encryption algorithm is unavailable.
    pub const UNSUPPORTED_ENCRYPTION: i32 = 4;
    /// Stored data failed to decode or decrypt.
    pub const CORRUPT_DATA: i32 = 5;
    /// The remote peer reported an error outside the known domains.
    pub const REMOTE_ERROR: i32 = 6;
    /// A revision conflicts with an existing leaf.
    pub const CONFLICT: i32 = 7;
    /// A referenced document or blob does not exist.
    pub const NOT_FOUND: i32 = 8;
}

/// A replication error: domain, code, and human-readable message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{domain:?} error {code}: {message}")]
pub struct ReplError {
    /// Error domain.
    pub domain: ErrorDomain,
    /// Domain-specific code.
    pub code: i32,
    /// Human-readable description.
    pub message: String,
}

impl ReplError {
    /// Creates an engine-domain error.
    pub fn engine(code: i32, message: impl Into<String>) -> Self {
        Self {
            domain: ErrorDomain::Engine,
            code,
            message: message.into(),
        }
    }

    /// Creates a WebSocket-domain error.
    pub fn web_socket(code: i32, message: impl Into<String>) -> Self {
        Self {
            domain: ErrorDomain::WebSocket,
            code,
            message: message.into(),
        }
    }

    /// Creates a POSIX-domain error.
    pub fn posix(code: i32, message: impl Into<String>) -> Self {
        Self {
            domain: ErrorDomain::Posix,
            code,
            message: message.into(),
        }
    }

    /// Creates a network-domain error.
    pub fn network(code: i32, message: impl Into<String>) -> Self {
        Self {
            domain: ErrorDomain::Network,
            code,
            message: message.into(),
        }
    }

    /// Creates an HTTP-domain error.
    pub fn http(status: i32, message: impl Into<String>) -> Self {
        Self {
            domain: ErrorDomain::Http,
            code: status,
            message: message.into(),
        }
    }

    /// True for the HTTP 404 "no such checkpoint / not handled" reply.
    #[must_use]
    pub fn is_http_not_found(&self) -> bool {
        self.domain == ErrorDomain::Http && self.code == 404
    }

    /// True if this is a revision conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ReplError {
                domain: ErrorDomain::Engine,
                code: engine_code::CONFLICT,
                ..
            }
        ) || matches!(
            self,
            ReplError {
                domain: ErrorDomain::Http,
                code: 409,
                ..
            }
        )
    }
}

impl From<eddydb_revtree::TreeError> for ReplError {
    fn from(err: eddydb_revtree::TreeError) -> Self {
        use eddydb_revtree::TreeError;
        match err {
            TreeError::Conflict { .. } => ReplError::engine(engine_code::CONFLICT, err.to_string()),
            _ => ReplError::engine(engine_code::CORRUPT_DATA, err.to_string()),
        }
    }
}

impl From<eddydb_storage::StreamError> for ReplError {
    fn from(err: eddydb_storage::StreamError) -> Self {
        use eddydb_storage::StreamError;
        match err {
            StreamError::UnsupportedEncryption => {
                ReplError::engine(engine_code::UNSUPPORTED_ENCRYPTION, err.to_string())
            }
            _ => ReplError::engine(engine_code::CORRUPT_DATA, err.to_string()),
        }
    }
}

/// A per-document replication error.
///
/// Reported via the delegate's document-error callback; the replication
/// continues past it.
#[derive(Debug, Clone)]
pub struct DocError {
    /// The affected document.
    pub doc_id: String,
    /// True if the error happened while pushing, false while pulling.
    pub pushing: bool,
    /// The error itself.
    pub error: ReplError,
    /// True if retrying later may succeed.
    pub transient: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_detection_covers_both_forms() {
        assert!(ReplError::engine(engine_code::CONFLICT, "sibling leaf").is_conflict());
        assert!(ReplError::http(409, "not current").is_conflict());
        assert!(!ReplError::http(404, "missing").is_conflict());
    }

    #[test]
    fn tree_conflict_maps_to_conflict_code() {
        let err: ReplError = eddydb_revtree::TreeError::Conflict {
            rev_id: "2-aa".into(),
        }
        .into();
        assert!(err.is_conflict());
    }
}
