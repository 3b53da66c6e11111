//! Store statistics.
//!
//! Counters for the write path, the read path and compaction.
//!
//! # Usage
//!
//! ```rust,ignore
//! let store = RecordStore::in_memory(StoreConfig::default())?;
//! store.put(0, b"hello", 1)?;
//!
//! let stats = store.stats();
//! println!("Writes: {}", stats.writes);
//! println!("Relocations applied: {}", stats.relocations_applied);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Store statistics.
///
/// All counters are atomic and can be read while operations are in progress.
/// Values only ever increase.
#[derive(Debug, Default)]
pub struct StoreStats {
    reads: AtomicU64,
    read_misses: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    bytes_written: AtomicU64,
    rollovers: AtomicU64,
    batches_applied: AtomicU64,
    relocations_applied: AtomicU64,
    relocations_ignored: AtomicU64,
    ignored_bytes: AtomicU64,
    compaction_runs: AtomicU64,
    compactions_aborted: AtomicU64,
    segments_freed: AtomicU64,
}

impl StoreStats {
    /// Creates a new stats instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a read that found a record.
    pub(crate) fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a read that raced with a free or hit a damaged record.
    pub(crate) fn record_read_miss(&self) {
        self.read_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an appended record.
    pub(crate) fn record_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records a logical delete.
    pub(crate) fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a switch to a new live segment.
    pub(crate) fn record_rollover(&self) {
        self.rollovers.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a reconciled update batch.
    pub(crate) fn record_batch(&self, applied: u64, ignored: u64, ignored_bytes: u64) {
        self.batches_applied.fetch_add(1, Ordering::Relaxed);
        self.relocations_applied.fetch_add(applied, Ordering::Relaxed);
        self.relocations_ignored.fetch_add(ignored, Ordering::Relaxed);
        self.ignored_bytes.fetch_add(ignored_bytes, Ordering::Relaxed);
    }

    /// Records a finished compactor run.
    pub(crate) fn record_compaction(&self, aborted: bool) {
        self.compaction_runs.fetch_add(1, Ordering::Relaxed);
        if aborted {
            self.compactions_aborted.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a segment handed back to the pool.
    pub(crate) fn record_segment_freed(&self) {
        self.segments_freed.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all stats.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            read_misses: self.read_misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            rollovers: self.rollovers.load(Ordering::Relaxed),
            batches_applied: self.batches_applied.load(Ordering::Relaxed),
            relocations_applied: self.relocations_applied.load(Ordering::Relaxed),
            relocations_ignored: self.relocations_ignored.load(Ordering::Relaxed),
            ignored_bytes: self.ignored_bytes.load(Ordering::Relaxed),
            compaction_runs: self.compaction_runs.load(Ordering::Relaxed),
            compactions_aborted: self.compactions_aborted.load(Ordering::Relaxed),
            segments_freed: self.segments_freed.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of store statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Reads that returned a record.
    pub reads: u64,
    /// Reads reported as absent because the record could not be read.
    pub read_misses: u64,
    /// Records appended by the writer.
    pub writes: u64,
    /// Logical deletes.
    pub deletes: u64,
    /// Payload bytes appended by the writer.
    pub bytes_written: u64,
    /// Live segment switches.
    pub rollovers: u64,
    /// Update batches reconciled.
    pub batches_applied: u64,
    /// Relocations written to the mapping.
    pub relocations_applied: u64,
    /// Relocations discarded as stale.
    pub relocations_ignored: u64,
    /// Payload bytes of discarded relocations.
    pub ignored_bytes: u64,
    /// Compactor runs finished.
    pub compaction_runs: u64,
    /// Compactor runs that aborted.
    pub compactions_aborted: u64,
    /// Segments released back to the pool.
    pub segments_freed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        assert_eq!(StoreStats::new().snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn record_operations() {
        let stats = StoreStats::new();
        stats.record_write(100);
        stats.record_write(50);
        stats.record_delete();
        stats.record_batch(8, 2, 64);
        stats.record_compaction(false);
        stats.record_compaction(true);

        let snap = stats.snapshot();
        assert_eq!(snap.writes, 2);
        assert_eq!(snap.bytes_written, 150);
        assert_eq!(snap.deletes, 1);
        assert_eq!(snap.relocations_applied, 8);
        assert_eq!(snap.ignored_bytes, 64);
        assert_eq!(snap.compaction_runs, 2);
        assert_eq!(snap.compactions_aborted, 1);
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(StoreStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..100 {
                        s.record_read();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.snapshot().reads, 800);
    }
}
