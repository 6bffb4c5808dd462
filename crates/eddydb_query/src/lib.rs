//! # EddyDB Query Translator
//!
//! Compiles a JSON-encoded query AST into SQL over the virtual document
//! schema, plus the set of named parameters the query references.
//!
//! The query is either a `SELECT` operand dictionary, a
//! `["SELECT", {...}]` array, or a bare expression treated as an implicit
//! `WHERE` clause. Expressions are `[operator, arg...]` arrays or
//! primitive literals.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod translator;
mod value;

pub use error::{QueryError, QueryResult};
pub use translator::{property_getter, translate, translate_expression, Translation};
pub use value::Value;
