//! Segments and the segment pool.
//!
//! A segment is a fixed-capacity, append-only byte region that starts with a
//! [`DATA_START_POSITION`]-byte header and then holds length-prefixed
//! records. Exactly one segment is live (appendable) at a time for the
//! writer; a compaction run may hold further appendable targets. Everything
//! else is read-only.

mod base;
mod header;
mod manager;
mod record;

pub use base::Segment;
pub use header::{SegmentHeader, SegmentMode, DATA_START_POSITION, SEGMENT_MAGIC, SEGMENT_VERSION};
pub use manager::{SegmentManager, SEGMENT_META_MAGIC, SEGMENT_META_VERSION};
pub use record::{checked_length, record_size, RECORD_HEADER_SIZE};
