//! # segdb core
//!
//! A record store over append-only segments, with online compaction.
//!
//! This crate provides:
//! - Address encoding: `[size | segment | offset]` packed into a `u64`
//! - Segments and the segment pool, with id reuse
//! - The index to address mapping, in memory or backed by a file
//! - [`RecordStore`]: reads, writes, deletes and rollover
//! - A background compactor that proposes relocations to the writer
//!   through update batches
//!
//! ## Example
//!
//! ```rust
//! use segdb_core::{RecordStore, StoreConfig};
//!
//! let store = RecordStore::in_memory(StoreConfig::new().initial_length(8)).unwrap();
//! store.put(1, b"first", 1).unwrap();
//! store.put(1, b"second", 2).unwrap();
//!
//! assert_eq!(store.get(1).as_deref(), Some(&b"second"[..]));
//! assert_eq!(store.high_water_mark(), 2);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod compaction;
mod config;
mod dir;
mod error;
mod manifest;
mod mapping;
mod segment;
mod stats;
mod store;
mod types;

pub use codec::{AddressFormat, DecodedAddress};
pub use compaction::{
    batch_channel, BatchConsumer, BatchProducer, BatchSender, CompactionSummary, Compactor,
    CompactorState, Relocation, UpdateBatch, COMPACTOR_THREAD_NAME,
};
pub use config::{CompactionConfig, StoreConfig};
pub use dir::StoreDir;
pub use error::{CoreError, CoreResult};
pub use manifest::{StoreManifest, MANIFEST_MAGIC, MANIFEST_VERSION};
pub use mapping::{
    AddressArray, FileAddressArray, MemoryAddressArray, PersistListener, VersionedMapping,
};
pub use segment::{
    Segment, SegmentHeader, SegmentManager, SegmentMode, DATA_START_POSITION, RECORD_HEADER_SIZE,
};
pub use stats::{StatsSnapshot, StoreStats};
pub use store::{RecordStore, SegmentInfo};
pub use types::{Address, Scn, SegmentId, NO_ADDRESS};

/// Version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
