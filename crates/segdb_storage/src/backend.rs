//! Storage backend trait definition.

use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use std::io::{self, Write};

/// A low-level byte region backing one segment.
///
/// Backends are **opaque byte stores**. segdb owns the interpretation of
/// every byte: segment headers, record framing and addresses all live above
/// this trait.
///
/// # Invariants
///
/// - `append` returns the offset where data was written, which always equals
///   the size before the call
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `write_at` only overwrites bytes that already exist; it never extends
/// - Backends must be `Send + Sync` so sealed segments can be read from many
///   threads
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For tests and in-memory stores
/// - [`super::FileBackend`] - For persistent storage
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The read would extend beyond the current size
    /// - An I/O error occurs
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Overwrites already-written bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::WritePastEnd`] if the range is not fully
    /// inside the current size, or an I/O error.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Appends data to the end of the storage.
    ///
    /// Returns the offset where the data was written.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Streams `len` bytes starting at `offset` into `sink`.
    ///
    /// The range is copied through a bounded buffer rather than read into
    /// one allocation, so large records can move between segments (or out
    /// to a socket) without materialising them.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is out of bounds, or if reading the
    /// backend or writing the sink fails.
    fn transfer_to(&self, offset: u64, len: usize, sink: &mut dyn Write) -> StorageResult<u64>;

    /// Appends `len` bytes of `source`, starting at `offset`, to the end of
    /// this backend.
    ///
    /// Returns the offset where the bytes landed. Between two file backends
    /// the copy is handed to the kernel (`copy_file_range` on Linux) and
    /// never passes through a user-space buffer; otherwise it streams
    /// through a [`BackendAppender`].
    ///
    /// # Errors
    ///
    /// Returns an error if the source range is out of bounds or the copy
    /// fails. A failed copy may leave a partial tail for the caller to
    /// truncate.
    fn append_from(
        &mut self,
        source: &dyn StorageBackend,
        offset: u64,
        len: usize,
    ) -> StorageResult<u64>;

    /// Returns this backend as a [`FileBackend`], if it is one.
    fn as_file_backend(&self) -> Option<&FileBackend> {
        None
    }

    /// Flushes all pending writes to the OS.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size of the storage in bytes.
    ///
    /// This is the offset where the next `append` will write.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Syncs all data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Truncates the storage to the given size.
    ///
    /// segdb uses this to roll an append cursor back after a failed append,
    /// so a retry never double-counts bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The truncation fails
    /// - `new_size` is greater than current size
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}

/// Adapts a backend into an [`io::Write`] sink that appends.
///
/// Used to stream a byte range from one backend onto the end of another
/// when no kernel-side copy is available.
pub struct BackendAppender<'a> {
    backend: &'a mut dyn StorageBackend,
}

impl<'a> BackendAppender<'a> {
    /// Wraps a backend.
    pub fn new(backend: &'a mut dyn StorageBackend) -> Self {
        Self { backend }
    }
}

/// Streams a range of `source` onto the end of `target`.
pub(crate) fn append_streamed(
    target: &mut dyn StorageBackend,
    source: &dyn StorageBackend,
    offset: u64,
    len: usize,
) -> StorageResult<u64> {
    let position = target.size()?;
    let mut sink = BackendAppender::new(target);
    source.transfer_to(offset, len, &mut sink)?;
    Ok(position)
}

impl Write for BackendAppender<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.backend.append(buf).map_err(into_io_error)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.backend.flush().map_err(into_io_error)
    }
}

fn into_io_error(err: StorageError) -> io::Error {
    match err {
        StorageError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}
