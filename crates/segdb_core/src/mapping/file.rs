//! File-backed address array.
//!
//! The whole table is written as one image:
//!
//! ```text
//! | magic "SGAA" (4) | version (2) | length (8) | lwm (8) | hwm (8) | entries (8 * length) | crc32 (4) |
//! ```
//!
//! Images replace each other by rename, so a crash leaves either the old or
//! the new image. Updates made after the last persist are lost on a crash;
//! the low water mark says which SCN the image on disk reflects.

use crate::dir::{read_file_if_exists, replace_file};
use crate::error::{CoreError, CoreResult};
use crate::mapping::table::AddressTable;
use crate::mapping::{AddressArray, PersistListener, VersionedMapping};
use crate::types::{compute_crc32, Address, Scn};
use std::path::{Path, PathBuf};

/// Magic bytes of an address array image.
pub const ADDRESS_ARRAY_MAGIC: [u8; 4] = *b"SGAA";

/// Current address array image version.
pub const ADDRESS_ARRAY_VERSION: u16 = 1;

const HEADER_SIZE: usize = 4 + 2 + 8 + 8 + 8;

/// An address array persisted to a single file.
pub struct FileAddressArray {
    path: PathBuf,
    table: AddressTable,
}

impl FileAddressArray {
    /// Opens the array at `path`, creating it with `initial_length` absent
    /// entries if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the image is corrupt or cannot be written.
    pub fn open(
        path: &Path,
        initial_length: usize,
        dynamic: bool,
        growth_unit: usize,
    ) -> CoreResult<Self> {
        match read_file_if_exists(path)? {
            Some(data) => {
                let image = decode_image(&data)?;
                tracing::debug!(
                    path = %path.display(),
                    length = image.entries.len(),
                    lwm = image.low_water_mark,
                    "loaded address array"
                );
                Ok(Self {
                    path: path.to_path_buf(),
                    table: AddressTable::from_entries(
                        image.entries,
                        dynamic,
                        growth_unit,
                        image.low_water_mark,
                        image.high_water_mark,
                    ),
                })
            }
            None => {
                let array = Self {
                    path: path.to_path_buf(),
                    table: AddressTable::new(initial_length, dynamic, growth_unit),
                };
                array.write_image(0, true)?;
                Ok(array)
            }
        }
    }

    /// Location of the image file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_image(&self, hwm: Scn, sync: bool) -> CoreResult<()> {
        let entries = self.table.snapshot();
        replace_file(&self.path, &encode_image(&entries, hwm, hwm), sync)
    }

    fn persist_image(&self, sync: bool) -> CoreResult<()> {
        self.table.persist_with(|hwm| self.write_image(hwm, sync))
    }
}

impl AddressArray for FileAddressArray {
    fn length(&self) -> usize {
        self.table.length()
    }

    fn get(&self, index: usize) -> Address {
        self.table.get(index)
    }

    fn expand_capacity(&self, index: usize) -> CoreResult<()> {
        self.table.expand_capacity(index)
    }
}

impl VersionedMapping for FileAddressArray {
    fn set(&self, index: usize, address: Address, scn: Scn) -> CoreResult<()> {
        self.table.set(index, address, scn)
    }

    fn high_water_mark(&self) -> Scn {
        self.table.high_water_mark()
    }

    fn low_water_mark(&self) -> Scn {
        self.table.low_water_mark()
    }

    fn save_hwmark(&self, scn: Scn) -> CoreResult<()> {
        self.table.raise_high_water_mark(scn);
        Ok(())
    }

    fn sync(&self) -> CoreResult<()> {
        self.persist_image(true)
    }

    fn persist(&self) -> CoreResult<()> {
        self.persist_image(false)
    }

    fn clear(&self) -> CoreResult<()> {
        self.table.clear();
        self.persist_image(true)
    }

    fn set_persist_listener(&self, listener: Box<dyn PersistListener>) {
        self.table.set_listener(listener);
    }
}

impl std::fmt::Debug for FileAddressArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAddressArray")
            .field("path", &self.path)
            .field("length", &self.length())
            .field("hwm", &self.high_water_mark())
            .field("lwm", &self.low_water_mark())
            .finish()
    }
}

struct Image {
    entries: Vec<Address>,
    low_water_mark: Scn,
    high_water_mark: Scn,
}

fn encode_image(entries: &[Address], lwm: Scn, hwm: Scn) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + entries.len() * 8 + 4);
    buf.extend_from_slice(&ADDRESS_ARRAY_MAGIC);
    buf.extend_from_slice(&ADDRESS_ARRAY_VERSION.to_le_bytes());
    buf.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    buf.extend_from_slice(&lwm.to_le_bytes());
    buf.extend_from_slice(&hwm.to_le_bytes());
    for address in entries {
        buf.extend_from_slice(&address.to_le_bytes());
    }
    let crc = compute_crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn decode_image(data: &[u8]) -> CoreResult<Image> {
    if data.len() < HEADER_SIZE + 4 || data[0..4] != ADDRESS_ARRAY_MAGIC {
        return Err(CoreError::invalid_format("invalid address array magic"));
    }
    let version = u16::from_le_bytes([data[4], data[5]]);
    if version > ADDRESS_ARRAY_VERSION {
        return Err(CoreError::invalid_format(format!(
            "unsupported address array version: {version}"
        )));
    }

    let length = usize::try_from(read_u64(data, 6))
        .map_err(|_| CoreError::invalid_format("address array length overflows usize"))?;
    let body_len = length
        .checked_mul(8)
        .and_then(|bytes| bytes.checked_add(HEADER_SIZE))
        .ok_or_else(|| CoreError::invalid_format("address array length overflows usize"))?;
    if data.len() != body_len + 4 {
        return Err(CoreError::invalid_format(format!(
            "address array image holds {} bytes, expected {}",
            data.len(),
            body_len + 4
        )));
    }

    let stored = u32::from_le_bytes([
        data[body_len],
        data[body_len + 1],
        data[body_len + 2],
        data[body_len + 3],
    ]);
    let actual = compute_crc32(&data[..body_len]);
    if stored != actual {
        return Err(CoreError::ChecksumMismatch {
            expected: stored,
            actual,
        });
    }

    Ok(Image {
        entries: data[HEADER_SIZE..body_len]
            .chunks_exact(8)
            .map(|chunk| read_u64(chunk, 0))
            .collect(),
        low_water_mark: read_u64(data, 14),
        high_water_mark: read_u64(data, 22),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NO_ADDRESS;
    use tempfile::tempdir;

    #[test]
    fn creates_file_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("addr.dat");

        let array = FileAddressArray::open(&path, 16, false, 16).unwrap();
        assert!(path.exists());
        assert_eq!(array.length(), 16);
        assert_eq!(array.get(0), NO_ADDRESS);
    }

    #[test]
    fn persisted_entries_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("addr.dat");
        {
            let array = FileAddressArray::open(&path, 4, true, 4).unwrap();
            array.expand_capacity(6).unwrap();
            array.set(1, 1111, 3).unwrap();
            array.set(6, 6666, 9).unwrap();
            array.persist().unwrap();

            // Not persisted.
            array.set(2, 2222, 10).unwrap();
        }

        let array = FileAddressArray::open(&path, 4, true, 4).unwrap();
        assert_eq!(array.length(), 8);
        assert_eq!(array.get(1), 1111);
        assert_eq!(array.get(6), 6666);
        assert_eq!(array.get(2), NO_ADDRESS);
        assert_eq!(array.low_water_mark(), 9);
        assert_eq!(array.high_water_mark(), 9);
    }

    #[test]
    fn clear_is_durable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("addr.dat");
        {
            let array = FileAddressArray::open(&path, 4, false, 4).unwrap();
            array.set(0, 77, 1).unwrap();
            array.sync().unwrap();
            array.clear().unwrap();
        }
        let array = FileAddressArray::open(&path, 4, false, 4).unwrap();
        assert_eq!(array.get(0), NO_ADDRESS);
    }

    #[test]
    fn corrupted_image_detected() {
        let mut image = encode_image(&[1, 2, 3], 5, 5);
        let decoded = decode_image(&image).unwrap();
        assert_eq!(decoded.entries, vec![1, 2, 3]);
        assert_eq!(decoded.low_water_mark, 5);

        let last_entry = HEADER_SIZE + 16;
        image[last_entry] ^= 0x01;
        assert!(matches!(
            decode_image(&image),
            Err(CoreError::ChecksumMismatch { .. })
        ));

        image.truncate(20);
        assert!(decode_image(&image).is_err());
    }
}
