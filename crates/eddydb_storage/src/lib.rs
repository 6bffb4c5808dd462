//! # EddyDB Storage Streams
//!
//! Stream abstractions and the random-access encrypted stream.
//!
//! This crate provides:
//! - [`WriteStream`] / [`SeekableReadStream`] traits with in-memory and
//!   file-backed implementations
//! - [`EncryptedWriteStream`] / [`EncryptedReadStream`]: an AES-128-CBC
//!   wrapper that gives seek/read/write over a ciphertext file in
//!   4 KiB blocks

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod encrypted;
mod error;
mod stream;

pub use encrypted::{
    EncryptedReadStream, EncryptedWriteStream, EncryptionAlgorithm, EncryptionKey,
    FILE_BLOCK_SIZE, FILE_SIZE_OVERHEAD, KEY_SIZE,
};
pub use error::{StreamError, StreamResult};
pub use stream::{
    FileReadStream, FileWriteStream, MemoryReadStream, MemoryWriteStream, SeekableReadStream,
    SharedBytes, WriteStream,
};
