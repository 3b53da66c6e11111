//! Relocation batches handed from the compactor to the writer.
//!
//! Full batches travel over a bounded `sync_channel`, so a compactor that
//! runs too far ahead of the writer blocks on send. Reconciled batches go
//! back to a small recycle pool and are reused by the next producer.

use crate::error::{CoreError, CoreResult};
use crate::types::{Address, Scn, SegmentId};
use parking_lot::Mutex;
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::sync::Arc;

/// One proposed relocation: `index` now lives at `address`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Index whose record was copied.
    pub index: usize,
    /// Payload length of the record.
    pub data_size: usize,
    /// Address of the copy in the target segment.
    pub address: Address,
}

/// A bounded run of relocations into one target segment.
#[derive(Debug)]
pub struct UpdateBatch {
    entries: Vec<Relocation>,
    capacity: usize,
    target: Option<SegmentId>,
    scn: Scn,
    completed_sources: Vec<SegmentId>,
}

impl UpdateBatch {
    /// Creates an empty batch holding at most `capacity` relocations.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            target: None,
            scn: 0,
            completed_sources: Vec::new(),
        }
    }

    /// Relocations in the order they were copied.
    #[must_use]
    pub fn entries(&self) -> &[Relocation] {
        &self.entries
    }

    /// Number of relocations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the batch carries no relocations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether another relocation would exceed the capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Segment every relocation in the batch points into.
    #[must_use]
    pub fn target_segment(&self) -> Option<SegmentId> {
        self.target
    }

    /// SCN the relocations are applied with.
    #[must_use]
    pub fn scn(&self) -> Scn {
        self.scn
    }

    /// Sources whose last relocation is in this batch.
    #[must_use]
    pub fn completed_sources(&self) -> &[SegmentId] {
        &self.completed_sources
    }

    fn push(&mut self, relocation: Relocation, target: SegmentId) {
        debug_assert!(self.target.is_none() || self.target == Some(target));
        self.target = Some(target);
        self.entries.push(relocation);
    }

    fn reset(&mut self) {
        self.entries.clear();
        self.target = None;
        self.scn = 0;
        self.completed_sources.clear();
    }
}

struct BatchPool {
    batch_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<UpdateBatch>>,
}

impl BatchPool {
    fn take(&self) -> UpdateBatch {
        self.idle
            .lock()
            .pop()
            .unwrap_or_else(|| UpdateBatch::new(self.batch_size))
    }

    fn give_back(&self, mut batch: UpdateBatch) {
        batch.reset();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(batch);
        }
    }
}

/// Creates a channel carrying batches of `batch_size` relocations, with at
/// most `depth` full batches waiting for the consumer.
#[must_use]
pub fn batch_channel(batch_size: usize, depth: usize) -> (BatchSender, BatchConsumer) {
    let (sender, receiver) = mpsc::sync_channel(depth);
    let pool = Arc::new(BatchPool {
        batch_size: batch_size.max(1),
        max_idle: depth + 2,
        idle: Mutex::new(Vec::new()),
    });
    (
        BatchSender {
            sender,
            pool: Arc::clone(&pool),
        },
        BatchConsumer { receiver, pool },
    )
}

/// The sending half kept by the store; hands out one producer per run.
#[derive(Clone)]
pub struct BatchSender {
    sender: SyncSender<UpdateBatch>,
    pool: Arc<BatchPool>,
}

impl BatchSender {
    /// Creates a producer with an empty open batch.
    #[must_use]
    pub fn producer(&self) -> BatchProducer {
        BatchProducer {
            sender: self.sender.clone(),
            current: self.pool.take(),
            pool: Arc::clone(&self.pool),
        }
    }
}

/// The compactor's end of the channel.
pub struct BatchProducer {
    sender: SyncSender<UpdateBatch>,
    pool: Arc<BatchPool>,
    current: UpdateBatch,
}

impl BatchProducer {
    /// Adds a relocation to the open batch; returns `true` once it is full.
    ///
    /// All relocations of one batch must share `target`; close the batch
    /// before switching targets.
    pub fn add(&mut self, relocation: Relocation, target: SegmentId) -> bool {
        self.current.push(relocation, target);
        self.current.is_full()
    }

    /// Relocations in the open batch.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.current.len()
    }

    /// Stamps and sends the open batch, then opens a fresh one.
    ///
    /// An empty batch is only sent when it completes a source. Blocks while
    /// the channel is full.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CompactionAborted`] once the consumer is gone.
    pub fn close_batch(&mut self, scn: Scn, completed_source: Option<SegmentId>) -> CoreResult<()> {
        if self.current.is_empty() && completed_source.is_none() {
            return Ok(());
        }

        let mut batch = std::mem::replace(&mut self.current, self.pool.take());
        batch.scn = scn;
        batch.completed_sources.extend(completed_source);

        self.sender
            .send(batch)
            .map_err(|_| CoreError::compaction_aborted("update batch consumer is closed"))
    }
}

/// The writer's end of the channel.
pub struct BatchConsumer {
    receiver: Receiver<UpdateBatch>,
    pool: Arc<BatchPool>,
}

impl BatchConsumer {
    /// Takes the next queued batch without blocking.
    pub fn try_next(&self) -> Option<UpdateBatch> {
        match self.receiver.try_recv() {
            Ok(batch) => Some(batch),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Returns a reconciled batch to the pool.
    pub fn recycle(&self, batch: UpdateBatch) {
        self.pool.give_back(batch);
    }
}

impl std::fmt::Debug for BatchConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchConsumer")
            .field("batch_size", &self.pool.batch_size)
            .finish_non_exhaustive()
    }
}
