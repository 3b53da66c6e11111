//! Verify command implementation.

use segdb_core::RecordStore;
use std::path::Path;
use tracing::info;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Indices holding an address.
    pub records_checked: usize,
    /// Records read back in full.
    pub valid_records: usize,
    /// Records whose address does not resolve to a readable record.
    pub corrupt_records: usize,
    /// Payload bytes read back.
    pub payload_bytes: u64,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.corrupt_records == 0 && self.errors.is_empty()
    }
}

/// Runs the verify command.
///
/// Opening the store already checks the manifest, the segment headers and
/// the address table checksum.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    info!("Verifying store at {:?}", path);
    println!("Verifying store at {:?}", path);
    println!();

    let store = RecordStore::open_existing(path)?;
    let result = verify_store(&store);
    store.close()?;

    println!("Records:");
    println!("  Checked: {}", result.records_checked);
    println!("  Valid:   {}", result.valid_records);
    println!("  Corrupt: {}", result.corrupt_records);
    for err in &result.errors {
        println!("  Error: {}", err);
    }

    println!();
    if result.is_ok() {
        println!("✓ Store verification passed");
        Ok(())
    } else {
        println!("✗ Store verification failed");
        Err("Verification failed".into())
    }
}

/// Reads every mapped record back and checks the load accounting.
pub fn verify_store(store: &RecordStore) -> VerifyResult {
    let mut result = VerifyResult::default();

    for index in 0..store.length() {
        if !store.has_data(index) {
            continue;
        }
        result.records_checked += 1;
        match store.get(index) {
            Some(data) => {
                result.valid_records += 1;
                result.payload_bytes += data.len() as u64;
            }
            None => {
                result.corrupt_records += 1;
                result
                    .errors
                    .push(format!("index {index}: record cannot be read"));
            }
        }
    }

    let live_bytes = store.live_bytes();
    if result.corrupt_records == 0 && live_bytes != result.payload_bytes {
        result.errors.push(format!(
            "segment loads add up to {live_bytes} bytes, records hold {}",
            result.payload_bytes
        ));
    }

    result
}
