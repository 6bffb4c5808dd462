//! Error types for query translation.

use thiserror::Error;

/// Result type for query translation.
pub type QueryResult<T> = Result<T, QueryError>;

/// Errors raised while translating a query.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    /// The query AST is malformed or uses an unsupported construct.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

impl QueryError {
    /// Creates an `InvalidQuery` error with a message.
    pub fn invalid(message: impl Into<String>) -> Self {
        QueryError::InvalidQuery(message.into())
    }
}
