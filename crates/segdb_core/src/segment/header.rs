//! Segment header layout.

use crate::error::{CoreError, CoreResult};
use crate::types::SegmentId;

/// Bytes reserved at the start of every segment; the first record starts here.
pub const DATA_START_POSITION: u64 = 64;

/// Magic bytes opening every segment.
pub const SEGMENT_MAGIC: [u8; 4] = *b"SGSG";

/// Current segment format version.
pub const SEGMENT_VERSION: u16 = 1;

/// Byte offset of the mode flag inside the header.
pub(crate) const MODE_OFFSET: u64 = 6;

/// Whether a segment still accepts appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentMode {
    /// Accepting appends: the live segment or a compaction target.
    Appendable,
    /// Sealed; only read, and possibly compacted away.
    ReadOnly,
}

impl SegmentMode {
    /// Returns the on-disk flag.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Appendable => 0,
            Self::ReadOnly => 1,
        }
    }

    /// Parses the on-disk flag.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for unknown flags.
    pub fn from_byte(b: u8) -> CoreResult<Self> {
        match b {
            0 => Ok(Self::Appendable),
            1 => Ok(Self::ReadOnly),
            other => Err(CoreError::segment_corruption(format!(
                "unknown segment mode flag {other:#04x}"
            ))),
        }
    }
}

/// The fixed header at the start of a segment.
///
/// ```text
/// | magic (4) | version (2) | mode (1) | reserved (1) | id (4) | capacity (8) | zero padding |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Segment id the file was allocated as.
    pub id: SegmentId,
    /// Mode at the time the header was last written.
    pub mode: SegmentMode,
    /// Capacity the segment was created with.
    pub capacity: u64,
}

impl SegmentHeader {
    /// Encodes the header into exactly [`DATA_START_POSITION`] bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DATA_START_POSITION as usize);
        buf.extend_from_slice(&SEGMENT_MAGIC);
        buf.extend_from_slice(&SEGMENT_VERSION.to_le_bytes());
        buf.push(self.mode.as_byte());
        buf.push(0);
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.capacity.to_le_bytes());
        buf.resize(DATA_START_POSITION as usize, 0);
        buf
    }

    /// Decodes a header.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for short input, bad magic or a newer
    /// version.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < 20 {
            return Err(CoreError::segment_corruption("segment header too short"));
        }
        if data[0..4] != SEGMENT_MAGIC {
            return Err(CoreError::segment_corruption("invalid segment magic"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version > SEGMENT_VERSION {
            return Err(CoreError::segment_corruption(format!(
                "unsupported segment version: {version}"
            )));
        }
        let mode = SegmentMode::from_byte(data[MODE_OFFSET as usize])?;
        let id = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        let capacity = u64::from_le_bytes([
            data[12], data[13], data[14], data[15], data[16], data[17], data[18], data[19],
        ]);

        Ok(Self { id, mode, capacity })
    }
}
