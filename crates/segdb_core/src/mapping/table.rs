//! Shared in-memory address table.

use crate::error::{CoreError, CoreResult};
use crate::mapping::PersistListener;
use crate::types::{Address, Scn, NO_ADDRESS};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// The atomics behind both address array implementations.
///
/// Growth is the only operation that takes the table's write lock; every
/// address read or write is a single atomic on an existing slot.
pub(crate) struct AddressTable {
    entries: RwLock<Vec<AtomicU64>>,
    dynamic: bool,
    growth_unit: usize,
    high_water_mark: AtomicU64,
    low_water_mark: AtomicU64,
    listener: RwLock<Option<Box<dyn PersistListener>>>,
}

impl AddressTable {
    pub(crate) fn new(length: usize, dynamic: bool, growth_unit: usize) -> Self {
        Self::from_entries(vec![NO_ADDRESS; length], dynamic, growth_unit, 0, 0)
    }

    pub(crate) fn from_entries(
        entries: Vec<Address>,
        dynamic: bool,
        growth_unit: usize,
        low_water_mark: Scn,
        high_water_mark: Scn,
    ) -> Self {
        Self {
            entries: RwLock::new(entries.into_iter().map(AtomicU64::new).collect()),
            dynamic,
            growth_unit: growth_unit.max(1),
            high_water_mark: AtomicU64::new(high_water_mark.max(low_water_mark)),
            low_water_mark: AtomicU64::new(low_water_mark),
            listener: RwLock::new(None),
        }
    }

    pub(crate) fn length(&self) -> usize {
        self.entries.read().len()
    }

    pub(crate) fn get(&self, index: usize) -> Address {
        self.entries
            .read()
            .get(index)
            .map_or(NO_ADDRESS, |slot| slot.load(Ordering::Acquire))
    }

    pub(crate) fn expand_capacity(&self, index: usize) -> CoreResult<()> {
        if index < self.length() {
            return Ok(());
        }
        if !self.dynamic {
            return Err(CoreError::IndexOutOfBounds {
                index,
                length: self.length(),
            });
        }

        let new_length = (index / self.growth_unit + 1)
            .checked_mul(self.growth_unit)
            .ok_or(CoreError::IndexOutOfBounds {
                index,
                length: self.length(),
            })?;
        let mut entries = self.entries.write();
        let old_length = entries.len();
        if new_length > old_length {
            entries.resize_with(new_length, || AtomicU64::new(NO_ADDRESS));
            tracing::debug!(old_length, new_length, "expanded address array");
        }
        Ok(())
    }

    pub(crate) fn set(&self, index: usize, address: Address, scn: Scn) -> CoreResult<()> {
        {
            let entries = self.entries.read();
            let slot = entries.get(index).ok_or(CoreError::IndexOutOfBounds {
                index,
                length: entries.len(),
            })?;
            slot.store(address, Ordering::Release);
        }
        self.high_water_mark.fetch_max(scn, Ordering::AcqRel);
        Ok(())
    }

    pub(crate) fn clear(&self) {
        for slot in self.entries.read().iter() {
            slot.store(NO_ADDRESS, Ordering::Release);
        }
    }

    /// Copies every address; used to write a persistent image.
    pub(crate) fn snapshot(&self) -> Vec<Address> {
        self.entries
            .read()
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .collect()
    }

    pub(crate) fn high_water_mark(&self) -> Scn {
        self.high_water_mark.load(Ordering::Acquire)
    }

    pub(crate) fn low_water_mark(&self) -> Scn {
        self.low_water_mark.load(Ordering::Acquire)
    }

    pub(crate) fn raise_high_water_mark(&self, scn: Scn) {
        self.high_water_mark.fetch_max(scn, Ordering::AcqRel);
    }

    pub(crate) fn set_low_water_mark(&self, scn: Scn) {
        self.low_water_mark.fetch_max(scn, Ordering::AcqRel);
    }

    pub(crate) fn set_listener(&self, listener: Box<dyn PersistListener>) {
        *self.listener.write() = Some(listener);
    }

    /// Runs `write` between the listener hooks.
    ///
    /// `write` receives the high water mark captured before the image was
    /// taken; on success the low water mark advances to it.
    pub(crate) fn persist_with<F>(&self, write: F) -> CoreResult<()>
    where
        F: FnOnce(Scn) -> CoreResult<()>,
    {
        let listener = self.listener.read();
        if let Some(listener) = listener.as_ref() {
            listener.before_persist()?;
        }

        let hwm = self.high_water_mark();
        write(hwm)?;
        self.set_low_water_mark(hwm);

        if let Some(listener) = listener.as_ref() {
            listener.after_persist()?;
        }
        Ok(())
    }
}
