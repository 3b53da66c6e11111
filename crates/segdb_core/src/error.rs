//! Error types for segdb core.

use crate::types::SegmentId;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in segdb core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] segdb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Segment is corrupted or invalid.
    #[error("segment corruption: {message}")]
    SegmentCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Append attempted on a sealed segment.
    #[error("segment {segment_id} is read-only")]
    SegmentReadOnly {
        /// The sealed segment.
        segment_id: SegmentId,
    },

    /// Append would run past the segment's capacity.
    ///
    /// The record store answers this by rolling over to a new segment, so
    /// callers of the store never see it.
    #[error("segment {segment_id} overflow")]
    SegmentOverflow {
        /// The full segment.
        segment_id: SegmentId,
    },

    /// No segment id is left in the pool's addressable range.
    #[error("segment pool exhausted: at most {max_segments} segments are addressable")]
    SegmentPoolExhausted {
        /// Maximum number of segments the address format can name.
        max_segments: u32,
    },

    /// Index is outside a fixed-length store.
    #[error("index {index} out of bounds for length {length}")]
    IndexOutOfBounds {
        /// The requested index.
        index: usize,
        /// The store length.
        length: usize,
    },

    /// Record can never fit into a single segment.
    #[error("record of {len} bytes exceeds the maximum of {max} bytes")]
    RecordTooLarge {
        /// Payload length.
        len: usize,
        /// Largest payload a segment can hold.
        max: usize,
    },

    /// Configuration rejected at store creation.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// Invalid on-disk format or version.
    #[error("invalid store format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// A compactor run gave up; the store stays consistent.
    #[error("compaction aborted: {reason}")]
    CompactionAborted {
        /// Why the run stopped.
        reason: String,
    },

    /// Another process holds the store directory.
    #[error("store locked: another process has exclusive access")]
    StoreLocked,

    /// Store is closed.
    #[error("store is closed")]
    StoreClosed,
}

impl CoreError {
    /// Creates a segment corruption error.
    pub fn segment_corruption(message: impl Into<String>) -> Self {
        Self::SegmentCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates a compaction aborted error.
    pub fn compaction_aborted(reason: impl Into<String>) -> Self {
        Self::CompactionAborted {
            reason: reason.into(),
        }
    }
}
