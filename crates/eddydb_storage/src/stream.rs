//! Write and seekable-read stream abstractions.
//!
//! Two pairs of implementations are provided: shared in-memory buffers
//! (used by tests and the in-memory blob store) and plain files.

use crate::error::{StreamError, StreamResult};
use parking_lot::RwLock;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

/// An append-only byte sink.
pub trait WriteStream: Send {
    /// Appends bytes to the stream.
    fn write(&mut self, data: &[u8]) -> StreamResult<()>;

    /// Flushes and closes the stream. Further writes fail.
    fn close(&mut self) -> StreamResult<()>;
}

/// A random-access byte source.
pub trait SeekableReadStream: Send {
    /// Reads up to `buf.len()` bytes at the current position, returning
    /// the number of bytes read (0 at end of stream).
    fn read(&mut self, buf: &mut [u8]) -> StreamResult<usize>;

    /// Moves the read position to `pos` (bytes from the start).
    fn seek(&mut self, pos: u64) -> StreamResult<()>;

    /// Total length of the stream in bytes.
    fn length(&self) -> StreamResult<u64>;
}

/// A byte buffer shared between a writer and later readers.
#[derive(Debug, Clone, Default)]
pub struct SharedBytes(Arc<RwLock<Vec<u8>>>);

impl SharedBytes {
    /// Creates an empty shared buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a shared buffer holding `data`.
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self(Arc::new(RwLock::new(data)))
    }

    /// Returns a copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.0.read().clone()
    }

    /// Current length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    /// True if the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}

/// A write stream appending into a [`SharedBytes`] buffer.
#[derive(Debug)]
pub struct MemoryWriteStream {
    target: SharedBytes,
    closed: bool,
}

impl MemoryWriteStream {
    /// Creates a writer appending into `target`.
    #[must_use]
    pub fn new(target: SharedBytes) -> Self {
        Self {
            target,
            closed: false,
        }
    }
}

impl WriteStream for MemoryWriteStream {
    fn write(&mut self, data: &[u8]) -> StreamResult<()> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        self.target.0.write().extend_from_slice(data);
        Ok(())
    }

    fn close(&mut self) -> StreamResult<()> {
        self.closed = true;
        Ok(())
    }
}

/// A read stream over a [`SharedBytes`] buffer.
#[derive(Debug)]
pub struct MemoryReadStream {
    source: SharedBytes,
    pos: u64,
}

impl MemoryReadStream {
    /// Creates a reader over `source`, positioned at the start.
    #[must_use]
    pub fn new(source: SharedBytes) -> Self {
        Self { source, pos: 0 }
    }
}

impl SeekableReadStream for MemoryReadStream {
    fn read(&mut self, buf: &mut [u8]) -> StreamResult<usize> {
        let data = self.source.0.read();
        let start = (self.pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn seek(&mut self, pos: u64) -> StreamResult<()> {
        self.pos = pos;
        Ok(())
    }

    fn length(&self) -> StreamResult<u64> {
        Ok(self.source.len() as u64)
    }
}

/// A write stream appending to a file.
#[derive(Debug)]
pub struct FileWriteStream {
    writer: Option<BufWriter<File>>,
}

impl FileWriteStream {
    /// Creates (truncating) the file at `path` for writing.
    pub fn create(path: impl AsRef<Path>) -> StreamResult<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: Some(BufWriter::new(file)),
        })
    }
}

impl WriteStream for FileWriteStream {
    fn write(&mut self, data: &[u8]) -> StreamResult<()> {
        let writer = self.writer.as_mut().ok_or(StreamError::Closed)?;
        writer.write_all(data)?;
        Ok(())
    }

    fn close(&mut self) -> StreamResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }
}

/// A random-access read stream over a file.
#[derive(Debug)]
pub struct FileReadStream {
    file: File,
    len: u64,
}

impl FileReadStream {
    /// Opens the file at `path` for reading.
    pub fn open(path: impl AsRef<Path>) -> StreamResult<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

impl SeekableReadStream for FileReadStream {
    fn read(&mut self, buf: &mut [u8]) -> StreamResult<usize> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn seek(&mut self, pos: u64) -> StreamResult<()> {
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    fn length(&self) -> StreamResult<u64> {
        Ok(self.len)
    }
}
