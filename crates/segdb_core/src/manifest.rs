//! Store manifest: the geometry a store was created with.

use crate::codec::AddressFormat;
use crate::config::StoreConfig;
use crate::error::{CoreError, CoreResult};

/// Magic bytes for manifest file.
pub const MANIFEST_MAGIC: [u8; 4] = *b"SGDB";

/// Current manifest version.
pub const MANIFEST_VERSION: u16 = 1;

const MANIFEST_SIZE: usize = 4 + 2 + 8 + 1 + 8 + 3;

/// Geometry fixed at store creation.
///
/// Addresses already written depend on the segment capacity and the address
/// bit layout, so neither may change for the life of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreManifest {
    /// Slot count the store was created with.
    pub initial_length: u64,
    /// Whether the store grows on writes past the end.
    pub dynamic: bool,
    /// Byte capacity of each segment.
    pub segment_capacity: u64,
    /// Address bit layout.
    pub address_format: AddressFormat,
}

impl StoreManifest {
    /// Captures the geometry of `config`.
    #[must_use]
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            initial_length: config.initial_length as u64,
            dynamic: config.dynamic,
            segment_capacity: config.segment_capacity,
            address_format: config.address_format,
        }
    }

    /// Overrides the geometry fields of `config` with the recorded ones.
    #[must_use]
    pub fn apply_to(&self, config: StoreConfig) -> StoreConfig {
        config
            .initial_length(usize::try_from(self.initial_length).unwrap_or(usize::MAX))
            .dynamic(self.dynamic)
            .segment_capacity(self.segment_capacity)
            .address_format(self.address_format)
    }

    /// Checks that `config` describes the same geometry.
    ///
    /// The initial length is not compared: the address array records the
    /// current length itself.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidFormat`] naming the first mismatch.
    pub fn check_compatible(&self, config: &StoreConfig) -> CoreResult<()> {
        if self.segment_capacity != config.segment_capacity {
            return Err(CoreError::invalid_format(format!(
                "store was created with segment capacity {}, config asks for {}",
                self.segment_capacity, config.segment_capacity
            )));
        }
        if self.address_format != config.address_format {
            return Err(CoreError::invalid_format(format!(
                "store was created with address format {:?}, config asks for {:?}",
                self.address_format, config.address_format
            )));
        }
        if self.dynamic != config.dynamic {
            return Err(CoreError::invalid_format(format!(
                "store was created with dynamic = {}, config asks for {}",
                self.dynamic, config.dynamic
            )));
        }
        Ok(())
    }

    /// Encodes the manifest to bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MANIFEST_SIZE);

        buf.extend_from_slice(&MANIFEST_MAGIC);
        buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.initial_length.to_le_bytes());
        buf.push(u8::from(self.dynamic));
        buf.extend_from_slice(&self.segment_capacity.to_le_bytes());
        buf.push(self.address_format.offset_bits());
        buf.push(self.address_format.segment_bits());
        buf.push(self.address_format.size_bits());

        buf
    }

    /// Decodes a manifest from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidFormat`] for bad magic, a newer version,
    /// short input or an invalid address layout.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < 4 || data[0..4] != MANIFEST_MAGIC {
            return Err(CoreError::invalid_format("invalid manifest magic"));
        }
        if data.len() < MANIFEST_SIZE {
            return Err(CoreError::invalid_format("manifest too short"));
        }

        let version = u16::from_le_bytes([data[4], data[5]]);
        if version > MANIFEST_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported manifest version: {version}"
            )));
        }

        let read_u64 = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[at..at + 8]);
            u64::from_le_bytes(bytes)
        };

        let initial_length = read_u64(6);
        let dynamic = match data[14] {
            0 => false,
            1 => true,
            other => {
                return Err(CoreError::invalid_format(format!(
                    "invalid dynamic flag {other:#04x} in manifest"
                )))
            }
        };
        let segment_capacity = read_u64(15);
        let address_format = AddressFormat::new(data[23], data[24], data[25])
            .map_err(|err| CoreError::invalid_format(format!("manifest address format: {err}")))?;

        Ok(Self {
            initial_length,
            dynamic,
            segment_capacity,
            address_format,
        })
    }
}
