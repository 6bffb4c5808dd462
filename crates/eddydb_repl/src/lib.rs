//! # EddyDB Replication Engine
//!
//! Actor-based replication over a message-framing transport: push/pull of
//! document revisions, checkpoints, blob transfer, conflict handling, and
//! filtering.
//!
//! The [`Replicator`] owns the framed connection and spawns a
//! [`Pusher`], [`Puller`], and [`DbWorker`]. Every worker has a
//! single-consumer mailbox; all mutable
//! state inside a worker is touched only from jobs running on its own
//! thread. The transport delivers callbacks on its own thread; handlers
//! marshal to the target worker's mailbox before touching state.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod actor;
mod blob;
mod checkpoint;
mod db_worker;
mod error;
pub mod loopback;
pub mod message;
mod options;
mod pusher;
mod puller;
mod replicator;
mod status;
pub mod store;
pub mod wire;
mod worker;

pub use blob::{IncomingBlob, OutgoingBlob};
pub use checkpoint::Checkpoint;
pub use db_worker::DbWorker;
pub use error::{engine_code, DocError, ErrorDomain, ReplError, ReplResult};
pub use options::{ReplicatorMode, ReplicatorOptions};
pub use pusher::Pusher;
pub use puller::Puller;
pub use replicator::{Replicator, ReplicatorDelegate};
pub use status::{ActivityLevel, Progress, Status};
