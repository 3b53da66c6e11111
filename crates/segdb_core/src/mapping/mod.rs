//! Index to address mapping.
//!
//! The record store resolves every index through an address array. Plain
//! lookups go through [`AddressArray`]; anything that changes the mapping,
//! stamps it with an SCN or makes it durable goes through
//! [`VersionedMapping`].
//!
//! Addresses are published with single-word atomic stores, so a reader sees
//! either the old or the new address of an index and never a torn value.

mod file;
mod memory;
mod table;

pub use file::{FileAddressArray, ADDRESS_ARRAY_MAGIC, ADDRESS_ARRAY_VERSION};
pub use memory::MemoryAddressArray;

use crate::error::CoreResult;
use crate::types::{Address, Scn};

/// Hooks run around a durable flush of the mapping.
///
/// `before_persist` must make every byte the mapping points to durable;
/// `after_persist` may release resources the previous durable image still
/// referenced.
pub trait PersistListener: Send + Sync {
    /// Called before the mapping image is written.
    ///
    /// # Errors
    ///
    /// An error aborts the persist; the previous image stays current.
    fn before_persist(&self) -> CoreResult<()>;

    /// Called after the mapping image has been written.
    ///
    /// # Errors
    ///
    /// Errors are returned from the persist call, but the image is already
    /// written.
    fn after_persist(&self) -> CoreResult<()>;
}

/// Read access to an index to address array.
pub trait AddressArray: Send + Sync {
    /// Number of indices.
    fn length(&self) -> usize;

    /// Current address of `index`; [`crate::NO_ADDRESS`] when absent or out
    /// of range.
    fn get(&self, index: usize) -> Address;

    /// Whether `index` is within the array.
    fn has_index(&self, index: usize) -> bool {
        index < self.length()
    }

    /// Makes room for `index`.
    ///
    /// Dynamic arrays grow to the next multiple of their growth unit.
    ///
    /// # Errors
    ///
    /// Fixed-length arrays return [`crate::CoreError::IndexOutOfBounds`].
    fn expand_capacity(&self, index: usize) -> CoreResult<()>;
}

/// A mapping whose updates carry SCNs and can be made durable.
pub trait VersionedMapping: AddressArray {
    /// Points `index` at `address` as of change `scn`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::IndexOutOfBounds`] for indices outside a
    /// fixed array.
    fn set(&self, index: usize, address: Address, scn: Scn) -> CoreResult<()>;

    /// Highest SCN applied to the mapping.
    fn high_water_mark(&self) -> Scn;

    /// SCN of the last durable image; everything at or below it survives a
    /// restart.
    fn low_water_mark(&self) -> Scn;

    /// Raises the high water mark without changing any address.
    ///
    /// # Errors
    ///
    /// Implementations that persist the mark may fail on I/O.
    fn save_hwmark(&self, scn: Scn) -> CoreResult<()>;

    /// Persists and flushes to stable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener or the write fails.
    fn sync(&self) -> CoreResult<()>;

    /// Writes a consistent image; the low water mark catches up with the
    /// high water mark.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener or the write fails.
    fn persist(&self) -> CoreResult<()>;

    /// Resets every index to absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the cleared image cannot be written.
    fn clear(&self) -> CoreResult<()>;

    /// Installs the hooks run around [`Self::persist`] and [`Self::sync`].
    fn set_persist_listener(&self, listener: Box<dyn PersistListener>);
}
