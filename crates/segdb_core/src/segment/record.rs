//! Record framing.
//!
//! A record is `[i32 LE length][length bytes]`. A length of zero is a
//! present-but-empty record; absence is expressed only by the
//! [`crate::NO_ADDRESS`] sentinel, never inside a segment.

use crate::error::{CoreError, CoreResult};

/// Size of the length prefix.
pub const RECORD_HEADER_SIZE: u64 = 4;

/// On-disk size of a record with a `payload_len`-byte payload.
#[must_use]
pub const fn record_size(payload_len: usize) -> u64 {
    RECORD_HEADER_SIZE + payload_len as u64
}

/// Validates a length prefix read at `offset` against the segment's append
/// cursor.
///
/// # Errors
///
/// Returns a corruption error for negative lengths or records that would run
/// past `end`.
pub fn checked_length(raw: i32, offset: u64, end: u64) -> CoreResult<usize> {
    let len = usize::try_from(raw).map_err(|_| {
        CoreError::segment_corruption(format!("negative record length {raw} at offset {offset}"))
    })?;
    if offset + record_size(len) > end {
        return Err(CoreError::segment_corruption(format!(
            "record of {len} bytes at offset {offset} runs past segment end {end}"
        )));
    }
    Ok(len)
}
