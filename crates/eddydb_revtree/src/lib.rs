//! # EddyDB Revision Trees
//!
//! Revision tree model and binary codec.
//!
//! A document's history is a tree of revisions. Each revision is identified
//! by a generation-prefixed token (`"2-c0ffee"`), points at its parent by
//! index into the owning tree, and may carry an inline body or a reference
//! to a body stored in an earlier record.
//!
//! This crate provides:
//! - [`Revision`], [`RevId`], [`RevFlags`]: the in-memory model
//! - [`RevTree`]: an arena-backed tree with conflict and leaf queries
//! - [`raw`]: the compact on-disk encoding (big-endian records terminated
//!   by a four-byte zero sentinel)

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
pub mod raw;
mod rev;
mod tree;

pub use error::{TreeError, TreeResult};
pub use rev::{RevBody, RevFlags, RevId, Revision};
pub use tree::{InsertOutcome, RevTree};
