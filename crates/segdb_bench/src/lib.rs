//! Benchmark utilities.

use rand::Rng;
use segdb_core::{RecordStore, StoreConfig};

/// Generate random record data of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate `count` records with payloads of `payload_size` bytes.
pub fn generate_records(count: usize, payload_size: usize) -> Vec<Vec<u8>> {
    (0..count).map(|_| random_data(payload_size)).collect()
}

/// An in-memory store with `length` slots and small segments, so that
/// rollover and compaction show up in short runs.
pub fn bench_store(length: usize) -> RecordStore {
    let config = StoreConfig::new()
        .initial_length(length)
        .segment_capacity(1 << 20);
    RecordStore::in_memory(config).expect("bench store config is valid")
}
