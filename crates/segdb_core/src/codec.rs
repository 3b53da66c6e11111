//! Bit-packed record addresses.
//!
//! An [`Address`] packs three fields into one `u64`, high bits first:
//!
//! ```text
//! | data size (size_bits) | segment id (segment_bits) | offset (offset_bits) |
//! ```
//!
//! The offset points at the record's 4-byte length prefix. The data size is
//! optional: it is embedded only for non-empty payloads small enough to fit,
//! which lets readers skip reading the prefix. A zero size field means "read
//! the prefix".
//!
//! The split is chosen once when a store is created and recorded in its
//! manifest; it can never change for the life of the store.

use crate::error::{CoreError, CoreResult};
use crate::types::{Address, SegmentId};

/// Smallest allowed offset width.
pub const MIN_OFFSET_BITS: u8 = 16;
/// Largest allowed offset width.
pub const MAX_OFFSET_BITS: u8 = 48;
/// Largest allowed segment id width.
pub const MAX_SEGMENT_BITS: u8 = 16;

/// Bit layout of an [`Address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressFormat {
    offset_bits: u8,
    segment_bits: u8,
    size_bits: u8,
}

/// The fields of a decoded address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedAddress {
    /// Byte offset of the length prefix within the segment.
    pub offset: u64,
    /// Segment holding the record.
    pub segment_id: SegmentId,
    /// Payload length, when it was embedded.
    pub data_size: Option<usize>,
}

impl Default for AddressFormat {
    fn default() -> Self {
        Self::from_parts(32, 16, 16)
    }
}

impl AddressFormat {
    /// Creates a validated address format.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] when:
    /// - `offset_bits` is outside `16..=48`
    /// - `segment_bits` is outside `1..=16`
    /// - the three widths add up to more than 64 bits
    pub fn new(offset_bits: u8, segment_bits: u8, size_bits: u8) -> CoreResult<Self> {
        if !(MIN_OFFSET_BITS..=MAX_OFFSET_BITS).contains(&offset_bits) {
            return Err(CoreError::invalid_config(format!(
                "offset bits must be in {MIN_OFFSET_BITS}..={MAX_OFFSET_BITS}, got {offset_bits}"
            )));
        }
        if segment_bits == 0 || segment_bits > MAX_SEGMENT_BITS {
            return Err(CoreError::invalid_config(format!(
                "segment bits must be in 1..={MAX_SEGMENT_BITS}, got {segment_bits}"
            )));
        }
        let total = u32::from(offset_bits) + u32::from(segment_bits) + u32::from(size_bits);
        if total > 64 {
            return Err(CoreError::invalid_config(format!(
                "address needs {total} bits, only 64 are available"
            )));
        }
        Ok(Self::from_parts(offset_bits, segment_bits, size_bits))
    }

    const fn from_parts(offset_bits: u8, segment_bits: u8, size_bits: u8) -> Self {
        Self {
            offset_bits,
            segment_bits,
            size_bits,
        }
    }

    /// Width of the offset field.
    #[must_use]
    pub const fn offset_bits(&self) -> u8 {
        self.offset_bits
    }

    /// Width of the segment id field.
    #[must_use]
    pub const fn segment_bits(&self) -> u8 {
        self.segment_bits
    }

    /// Width of the embedded data size field.
    #[must_use]
    pub const fn size_bits(&self) -> u8 {
        self.size_bits
    }

    /// Largest encodable offset.
    #[must_use]
    pub const fn max_offset(&self) -> u64 {
        mask(self.offset_bits)
    }

    /// Number of distinct segment ids.
    #[must_use]
    pub const fn max_segments(&self) -> u32 {
        1u32 << self.segment_bits
    }

    /// Largest payload length that is embedded in the address.
    #[must_use]
    pub const fn max_embedded_size(&self) -> usize {
        mask(self.size_bits) as usize
    }

    const fn segment_shift(&self) -> u32 {
        self.offset_bits as u32
    }

    const fn size_shift(&self) -> u32 {
        self.offset_bits as u32 + self.segment_bits as u32
    }

    /// Packs a record location.
    ///
    /// # Panics
    ///
    /// Panics if `offset` or `segment_id` does not fit its field. Callers
    /// check segment capacity and pool size up front, so this only fires on
    /// a programming error.
    #[must_use]
    pub fn encode(&self, offset: u64, segment_id: SegmentId, data_size: usize) -> Address {
        assert!(
            offset <= self.max_offset(),
            "offset {offset} exceeds {} offset bits",
            self.offset_bits
        );
        assert!(
            u64::from(segment_id) <= mask(self.segment_bits),
            "segment id {segment_id} exceeds {} segment bits",
            self.segment_bits
        );

        let mut address = offset | (u64::from(segment_id) << self.segment_shift());
        if self.size_bits > 0 && data_size > 0 && data_size <= self.max_embedded_size() {
            address |= (data_size as u64) << self.size_shift();
        }
        address
    }

    /// Unpacks all fields of an address.
    #[must_use]
    pub fn decode(&self, address: Address) -> DecodedAddress {
        DecodedAddress {
            offset: self.offset(address),
            segment_id: self.segment(address),
            data_size: self.data_size(address),
        }
    }

    /// Extracts the offset field.
    #[must_use]
    pub fn offset(&self, address: Address) -> u64 {
        address & mask(self.offset_bits)
    }

    /// Extracts the segment id field.
    #[must_use]
    pub fn segment(&self, address: Address) -> SegmentId {
        ((address >> self.segment_shift()) & mask(self.segment_bits)) as SegmentId
    }

    /// Extracts the embedded data size, if one was stored.
    #[must_use]
    pub fn data_size(&self, address: Address) -> Option<usize> {
        if self.size_bits == 0 {
            return None;
        }
        let size = (address >> self.size_shift()) & mask(self.size_bits);
        (size > 0).then_some(size as usize)
    }
}

const fn mask(bits: u8) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_layout() {
        let format = AddressFormat::default();
        assert_eq!(format.offset_bits(), 32);
        assert_eq!(format.segment_bits(), 16);
        assert_eq!(format.size_bits(), 16);
        assert_eq!(format.max_segments(), 65536);
        assert_eq!(format.max_embedded_size(), 65535);
    }

    #[test]
    fn embedded_size_is_optional() {
        let format = AddressFormat::default();

        let small = format.encode(64, 3, 100);
        assert_eq!(format.data_size(small), Some(100));

        let empty = format.encode(64, 3, 0);
        assert_eq!(format.data_size(empty), None);

        let large = format.encode(64, 3, 70_000);
        assert_eq!(format.data_size(large), None);
        assert_eq!(format.offset(large), 64);
        assert_eq!(format.segment(large), 3);
    }

    #[test]
    fn no_size_field() {
        let format = AddressFormat::new(48, 16, 0).unwrap();
        let address = format.encode(1 << 40, 65535, 12);

        assert_eq!(
            format.decode(address),
            DecodedAddress {
                offset: 1 << 40,
                segment_id: 65535,
                data_size: None,
            }
        );
    }

    #[test]
    fn invalid_widths_rejected() {
        assert!(AddressFormat::new(8, 16, 16).is_err());
        assert!(AddressFormat::new(49, 8, 0).is_err());
        assert!(AddressFormat::new(32, 0, 16).is_err());
        assert!(AddressFormat::new(32, 17, 0).is_err());
        assert!(AddressFormat::new(40, 16, 16).is_err());
        assert!(AddressFormat::new(40, 16, 8).is_ok());
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn offset_overflow_fails_fast() {
        let format = AddressFormat::new(16, 8, 8).unwrap();
        let _ = format.encode(1 << 16, 0, 1);
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn segment_overflow_fails_fast() {
        let format = AddressFormat::new(16, 8, 8).unwrap();
        let _ = format.encode(64, 256, 1);
    }

    proptest! {
        #[test]
        fn encode_decode_roundtrip(
            offset_bits in MIN_OFFSET_BITS..=MAX_OFFSET_BITS,
            segment_bits in 1u8..=MAX_SEGMENT_BITS,
            raw_offset: u64,
            raw_segment: u32,
            raw_size: usize,
        ) {
            let size_bits = (64 - offset_bits - segment_bits).min(24);
            let format = AddressFormat::new(offset_bits, segment_bits, size_bits).unwrap();

            let offset = raw_offset & format.max_offset();
            let segment = raw_segment % format.max_segments();
            let size = if size_bits == 0 { 0 } else { raw_size % (format.max_embedded_size() + 1) };

            let decoded = format.decode(format.encode(offset, segment, size));
            prop_assert_eq!(decoded.offset, offset);
            prop_assert_eq!(decoded.segment_id, segment);
            prop_assert_eq!(decoded.data_size, (size > 0).then_some(size));
        }
    }
}
