//! Core type definitions for segdb.

/// Identifier of a segment in the pool.
///
/// Ids are dense and reused after a segment is freed.
pub type SegmentId = u32;

/// A packed record location; see [`crate::AddressFormat`].
pub type Address = u64;

/// The "no record" address. Never produced by encoding, because every record
/// offset is at or past [`crate::segment::DATA_START_POSITION`].
pub const NO_ADDRESS: Address = 0;

/// System change number: a monotonically non-decreasing update stamp.
pub type Scn = u64;

/// CRC32 (IEEE) over `data`, used by every metadata file segdb writes.
pub(crate) fn compute_crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}
