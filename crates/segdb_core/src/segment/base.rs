//! A single append-only segment.

use crate::error::{CoreError, CoreResult};
use crate::segment::header::{SegmentHeader, SegmentMode, DATA_START_POSITION, MODE_OFFSET};
use crate::segment::record::{checked_length, RECORD_HEADER_SIZE};
use crate::types::SegmentId;
use parking_lot::RwLock;
use segdb_storage::StorageBackend;
use std::io::Write;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// One append-only region of records.
///
/// The append cursor is the backend's size, so a failed append can be
/// undone by truncating back to the cursor it started from. `load_size` is
/// the number of payload bytes of records that are still referenced by the
/// address array; it only drifts from reality through the bookkeeping done
/// by the record store.
///
/// # Thread Safety
///
/// Any number of threads may read while one thread appends. Bytes below the
/// cursor are never rewritten (the header aside), so a reader that learned
/// an address can always read the record behind it.
pub struct Segment {
    id: SegmentId,
    capacity: u64,
    backend: RwLock<Box<dyn StorageBackend>>,
    mode: AtomicU8,
    load_size: AtomicU64,
}

impl Segment {
    /// Initializes a fresh, appendable segment on an empty backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be written.
    pub fn create(
        id: SegmentId,
        capacity: u64,
        mut backend: Box<dyn StorageBackend>,
    ) -> CoreResult<Self> {
        backend.truncate(0)?;
        let header = SegmentHeader {
            id,
            mode: SegmentMode::Appendable,
            capacity,
        };
        backend.append(&header.encode())?;

        Ok(Self {
            id,
            capacity,
            backend: RwLock::new(backend),
            mode: AtomicU8::new(SegmentMode::Appendable.as_byte()),
            load_size: AtomicU64::new(0),
        })
    }

    /// Opens an existing segment, validating its header.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the header is damaged or belongs to a
    /// different segment id.
    pub fn load(
        id: SegmentId,
        capacity: u64,
        backend: Box<dyn StorageBackend>,
    ) -> CoreResult<Self> {
        let size = backend.size()?;
        if size < DATA_START_POSITION {
            return Err(CoreError::segment_corruption(format!(
                "segment {id} is {size} bytes, shorter than its header"
            )));
        }

        let header = SegmentHeader::decode(&backend.read_at(0, DATA_START_POSITION as usize)?)?;
        if header.id != id {
            return Err(CoreError::segment_corruption(format!(
                "segment file for id {id} carries id {}",
                header.id
            )));
        }
        if header.capacity != capacity {
            return Err(CoreError::segment_corruption(format!(
                "segment {id} was created with capacity {}, expected {capacity}",
                header.capacity
            )));
        }

        Ok(Self {
            id,
            capacity,
            backend: RwLock::new(backend),
            mode: AtomicU8::new(header.mode.as_byte()),
            load_size: AtomicU64::new(0),
        })
    }

    /// Returns the segment id.
    #[must_use]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Returns the byte capacity, header included.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the current mode.
    #[must_use]
    pub fn mode(&self) -> SegmentMode {
        if self.mode.load(Ordering::Acquire) == SegmentMode::ReadOnly.as_byte() {
            SegmentMode::ReadOnly
        } else {
            SegmentMode::Appendable
        }
    }

    /// Whether the segment has been sealed.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.mode() == SegmentMode::ReadOnly
    }

    /// Seals the segment; later appends fail.
    ///
    /// Prefer [`super::SegmentManager::seal`], which serializes with other
    /// pool changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be rewritten or flushed.
    pub fn seal_read_only(&self) -> CoreResult<()> {
        let mut backend = self.backend.write();
        backend.write_at(MODE_OFFSET, &[SegmentMode::ReadOnly.as_byte()])?;
        backend.flush()?;
        self.mode
            .store(SegmentMode::ReadOnly.as_byte(), Ordering::Release);
        Ok(())
    }

    /// Position the next append will land at.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size is unavailable.
    pub fn append_position(&self) -> CoreResult<u64> {
        Ok(self.backend.read().size()?)
    }

    /// Moves the append cursor back to `position`, dropping everything
    /// after it.
    ///
    /// # Errors
    ///
    /// Returns an error when `position` is inside the header or past the
    /// current cursor.
    pub fn set_append_position(&self, position: u64) -> CoreResult<()> {
        if position < DATA_START_POSITION {
            return Err(CoreError::segment_corruption(format!(
                "append position {position} is inside the segment header"
            )));
        }
        self.backend.write().truncate(position)?;
        Ok(())
    }

    /// Bytes still available for appends.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size is unavailable.
    pub fn remaining(&self) -> CoreResult<u64> {
        Ok(self.capacity.saturating_sub(self.append_position()?))
    }

    fn check_append(&self, backend: &dyn StorageBackend, len: u64) -> CoreResult<u64> {
        if self.is_read_only() {
            return Err(CoreError::SegmentReadOnly {
                segment_id: self.id,
            });
        }
        let position = backend.size()?;
        if position + len > self.capacity {
            return Err(CoreError::SegmentOverflow {
                segment_id: self.id,
            });
        }
        Ok(position)
    }

    /// Appends a 4-byte little-endian integer, returning its position.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SegmentReadOnly`], [`CoreError::SegmentOverflow`]
    /// or an I/O error.
    pub fn append_int(&self, value: i32) -> CoreResult<u64> {
        self.append(&value.to_le_bytes())
    }

    /// Appends raw bytes, returning their position.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SegmentReadOnly`], [`CoreError::SegmentOverflow`]
    /// or an I/O error.
    pub fn append(&self, data: &[u8]) -> CoreResult<u64> {
        let mut backend = self.backend.write();
        let position = self.check_append(&**backend, data.len() as u64)?;
        backend.append(data)?;
        Ok(position)
    }

    /// Reads a 4-byte little-endian integer.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not there.
    pub fn read_int(&self, offset: u64) -> CoreResult<i32> {
        let bytes = self.backend.read().read_at(offset, 4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads `len` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is not fully written.
    pub fn read(&self, offset: u64, len: usize) -> CoreResult<Vec<u8>> {
        Ok(self.backend.read().read_at(offset, len)?)
    }

    /// Payload length of the record whose prefix is at `offset`.
    ///
    /// `embedded` is the size carried by the address, if any; it saves the
    /// prefix read.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the prefix is invalid.
    pub fn record_length(&self, offset: u64, embedded: Option<usize>) -> CoreResult<usize> {
        if let Some(len) = embedded {
            return Ok(len);
        }
        let raw = self.read_int(offset)?;
        checked_length(raw, offset, self.append_position()?)
    }

    /// Reads the payload of the record whose prefix is at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is truncated or corrupted.
    pub fn read_record(&self, offset: u64, embedded: Option<usize>) -> CoreResult<Vec<u8>> {
        let len = self.record_length(offset, embedded)?;
        self.read(offset + RECORD_HEADER_SIZE, len)
    }

    /// Copies `len` bytes at `offset` onto the end of `target`.
    ///
    /// Returns the position in `target` where the bytes landed. On failure
    /// the target's cursor is restored.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SegmentOverflow`] if `target` lacks room, or an
    /// I/O error.
    pub fn transfer_to(&self, offset: u64, len: usize, target: &Segment) -> CoreResult<u64> {
        let source = self.backend.read();
        let mut destination = target.backend.write();
        let position = target.check_append(&**destination, len as u64)?;

        if let Err(err) = destination.append_from(&**source, offset, len) {
            destination.truncate(position)?;
            return Err(err.into());
        }
        Ok(position)
    }

    /// Streams `len` bytes at `offset` into `sink`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is missing or the sink fails.
    pub fn transfer_to_writer(
        &self,
        offset: u64,
        len: usize,
        sink: &mut dyn Write,
    ) -> CoreResult<u64> {
        Ok(self.backend.read().transfer_to(offset, len, sink)?)
    }

    /// Payload bytes of live records attributed to this segment.
    #[must_use]
    pub fn load_size(&self) -> u64 {
        self.load_size.load(Ordering::Acquire)
    }

    /// Attributes `bytes` more live bytes to this segment.
    pub fn incr_load_size(&self, bytes: u64) {
        self.load_size.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Removes `bytes` of live bytes, saturating at zero.
    pub fn decr_load_size(&self, bytes: u64) {
        let _ = self
            .load_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    /// Fraction of the capacity held by live records.
    #[must_use]
    pub fn load_factor(&self) -> f64 {
        self.load_size() as f64 / self.capacity as f64
    }

    /// Flushes appended bytes to stable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn force(&self) -> CoreResult<()> {
        let mut backend = self.backend.write();
        backend.flush()?;
        backend.sync()?;
        Ok(())
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("mode", &self.mode())
            .field("load_size", &self.load_size())
            .finish_non_exhaustive()
    }
}
