//! In-memory address array.

use crate::error::CoreResult;
use crate::mapping::table::AddressTable;
use crate::mapping::{AddressArray, PersistListener, VersionedMapping};
use crate::types::{Address, Scn};

/// An address array that lives only in memory.
///
/// Persisting runs the listener hooks and advances the low water mark, so a
/// store built on it behaves exactly like a file-backed one minus
/// durability.
pub struct MemoryAddressArray {
    table: AddressTable,
}

impl MemoryAddressArray {
    /// Creates an array of `length` absent entries.
    #[must_use]
    pub fn new(length: usize, dynamic: bool, growth_unit: usize) -> Self {
        Self {
            table: AddressTable::new(length, dynamic, growth_unit),
        }
    }
}

impl AddressArray for MemoryAddressArray {
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

impl VersionedMapping for MemoryAddressArray {
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
        self.persist()
    }

    fn persist(&self) -> CoreResult<()> {
        self.table.persist_with(|_| Ok(()))
    }

    fn clear(&self) -> CoreResult<()> {
        self.table.clear();
        Ok(())
    }

    fn set_persist_listener(&self, listener: Box<dyn PersistListener>) {
        self.table.set_listener(listener);
    }
}

impl std::fmt::Debug for MemoryAddressArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryAddressArray")
            .field("length", &self.length())
            .field("hwm", &self.high_water_mark())
            .field("lwm", &self.low_water_mark())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NO_ADDRESS;

    #[test]
    fn set_get_and_clear() {
        let array = MemoryAddressArray::new(8, false, 8);
        array.set(3, 0xABCD, 1).unwrap();
        assert_eq!(array.get(3), 0xABCD);
        assert!(array.has_index(7));
        assert!(!array.has_index(8));

        array.clear().unwrap();
        assert_eq!(array.get(3), NO_ADDRESS);
    }

    #[test]
    fn save_hwmark_never_lowers() {
        let array = MemoryAddressArray::new(1, false, 1);
        array.save_hwmark(10).unwrap();
        array.save_hwmark(4).unwrap();
        assert_eq!(array.high_water_mark(), 10);

        array.sync().unwrap();
        assert_eq!(array.low_water_mark(), 10);
    }
}
