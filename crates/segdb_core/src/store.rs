//! The record store.
//!
//! A [`RecordStore`] maps integer indices to byte records. Records are
//! appended to the live segment and never modified; an update appends a new
//! record and repoints the index. Sealed segments that have become mostly
//! dead weight are compacted in the background while the writer keeps
//! appending.
//!
//! ## Threads
//!
//! - One writer at a time: every mutating call serializes on the writer
//!   lock. The writer is also the only thread that ever changes the mapping.
//! - Any number of readers, which never take the writer lock.
//! - At most one compactor run. It proposes relocations through update
//!   batches; the writer reconciles them between its own writes.

use crate::codec::AddressFormat;
use crate::compaction::{
    batch_channel, compact, inspect, BatchConsumer, BatchProducer, BatchSender,
    CompactionContext, CompactionSummary, Compactor, UpdateBatch,
};
use crate::config::StoreConfig;
use crate::dir::StoreDir;
use crate::error::{CoreError, CoreResult};
use crate::manifest::StoreManifest;
use crate::mapping::{
    AddressArray, FileAddressArray, MemoryAddressArray, PersistListener, VersionedMapping,
};
use crate::segment::{
    record_size, Segment, SegmentManager, DATA_START_POSITION, RECORD_HEADER_SIZE,
};
use crate::stats::{StatsSnapshot, StoreStats};
use crate::types::{Address, Scn, SegmentId, NO_ADDRESS};
use parking_lot::{Mutex, RwLock};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

/// An index-addressable store of byte records over append-only segments.
///
/// # Example
///
/// ```rust
/// use segdb_core::{RecordStore, StoreConfig};
///
/// let store = RecordStore::in_memory(StoreConfig::new().initial_length(16)).unwrap();
/// store.put(3, b"hello", 1).unwrap();
/// assert_eq!(store.get(3).as_deref(), Some(&b"hello"[..]));
///
/// store.delete(3, 2).unwrap();
/// assert!(!store.has_data(3));
/// ```
pub struct RecordStore {
    inner: Arc<StoreInner>,
    _dir: Option<StoreDir>,
}

struct StoreInner {
    config: StoreConfig,
    format: AddressFormat,
    mapping: Box<dyn VersionedMapping>,
    segments: SegmentManager,
    live: RwLock<Arc<Segment>>,
    writer: Mutex<WriterState>,
    rollover_lock: Mutex<()>,
    compactor: Arc<Compactor>,
    batch_sender: Mutex<Option<BatchSender>>,
    migrated: Mutex<Vec<SegmentId>>,
    stats: StoreStats,
    open: AtomicBool,
}

struct WriterState {
    consumer: Option<BatchConsumer>,
    /// Set once the live segment has started its one compactor run.
    compaction_triggered: bool,
}

impl RecordStore {
    /// Creates a store that keeps everything in memory.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] if the configuration is
    /// rejected.
    pub fn in_memory(config: StoreConfig) -> CoreResult<Self> {
        config.validate()?;
        let mapping =
            MemoryAddressArray::new(config.initial_length, config.dynamic, config.growth_unit);
        let segments = SegmentManager::in_memory(
            config.segment_capacity,
            config.address_format.max_segments(),
        );
        Self::assemble(config, Box::new(mapping), segments, None)
    }

    /// Opens or creates a store in the directory at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid
    /// - Another process holds the store (returns `StoreLocked`)
    /// - The store was created with a different geometry (returns
    ///   `InvalidFormat`)
    /// - Any file is corrupted
    pub fn open(path: &Path, config: StoreConfig) -> CoreResult<Self> {
        config.validate()?;
        let dir = StoreDir::open(path, config.create_if_missing)?;
        Self::open_in(dir, config)
    }

    /// Opens an existing store with the geometry recorded in its manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory holds no store, or any error
    /// [`RecordStore::open`] returns.
    pub fn open_existing(path: &Path) -> CoreResult<Self> {
        let dir = StoreDir::open(path, false)?;
        let manifest = dir.load_manifest()?.ok_or_else(|| {
            CoreError::invalid_format(format!("no store manifest in {}", path.display()))
        })?;
        let config = manifest.apply_to(StoreConfig::default().create_if_missing(false));
        config.validate()?;
        Self::open_in(dir, config)
    }

    fn open_in(dir: StoreDir, config: StoreConfig) -> CoreResult<Self> {
        match dir.load_manifest()? {
            Some(manifest) => manifest.check_compatible(&config)?,
            None => dir.save_manifest(&StoreManifest::from_config(&config))?,
        }

        let mapping = FileAddressArray::open(
            &dir.address_path(),
            config.initial_length,
            config.dynamic,
            config.growth_unit,
        )?;
        let segments = SegmentManager::open(
            &dir.segments_dir(),
            config.segment_capacity,
            config.address_format.max_segments(),
        )?;
        release_empty_segments(&segments)?;
        rebuild_load_sizes(&mapping, &segments, config.address_format)?;

        Self::assemble(config, Box::new(mapping), segments, Some(dir))
    }

    fn assemble(
        config: StoreConfig,
        mapping: Box<dyn VersionedMapping>,
        segments: SegmentManager,
        dir: Option<StoreDir>,
    ) -> CoreResult<Self> {
        let live = segments.next_segment()?;
        let (sender, consumer) = batch_channel(config.batch_size, config.batch_queue_depth);

        tracing::info!(
            path = ?dir.as_ref().map(StoreDir::path),
            length = mapping.length(),
            segments = segments.segment_count(),
            live_segment = live.id(),
            "record store opened"
        );

        let inner = Arc::new(StoreInner {
            format: config.address_format,
            config,
            mapping,
            segments,
            live: RwLock::new(live),
            writer: Mutex::new(WriterState {
                consumer: Some(consumer),
                compaction_triggered: false,
            }),
            rollover_lock: Mutex::new(()),
            compactor: Arc::new(Compactor::new()),
            batch_sender: Mutex::new(Some(sender)),
            migrated: Mutex::new(Vec::new()),
            stats: StoreStats::new(),
            open: AtomicBool::new(true),
        });
        inner
            .mapping
            .set_persist_listener(Box::new(StoreListener {
                inner: Arc::downgrade(&inner),
            }));

        Ok(Self { inner, _dir: dir })
    }

    // === Read path ===

    /// Returns the record at `index`, or `None` if it is absent.
    ///
    /// Never fails: a record that cannot be read (its segment was freed
    /// under the reader, or its bytes are damaged) is reported as absent.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Vec<u8>> {
        let (segment, address) = self.inner.locate(index)?;
        let decoded = self.inner.format.decode(address);
        match segment.read_record(decoded.offset, decoded.data_size) {
            Ok(data) => {
                self.inner.stats.record_read();
                Some(data)
            }
            Err(err) => {
                self.inner.read_miss(index, &err);
                None
            }
        }
    }

    /// Payload length of the record at `index`, or `None` if absent.
    #[must_use]
    pub fn get_length(&self, index: usize) -> Option<usize> {
        let (segment, address) = self.inner.locate(index)?;
        let decoded = self.inner.format.decode(address);
        match segment.record_length(decoded.offset, decoded.data_size) {
            Ok(len) => Some(len),
            Err(err) => {
                self.inner.read_miss(index, &err);
                None
            }
        }
    }

    /// Streams the payload at `index` into `sink`.
    ///
    /// Returns the number of bytes written, or `None` if the record is
    /// absent. Like [`RecordStore::get`], a record that cannot be read is
    /// reported as absent; if that happens part way, `sink` may already
    /// hold a prefix of the payload.
    ///
    /// # Errors
    ///
    /// Returns an error only if writing to `sink` fails.
    pub fn transfer_to(&self, index: usize, sink: &mut dyn Write) -> CoreResult<Option<usize>> {
        let Some((segment, address)) = self.inner.locate(index) else {
            return Ok(None);
        };
        let decoded = self.inner.format.decode(address);
        let len = match segment.record_length(decoded.offset, decoded.data_size) {
            Ok(len) => len,
            Err(err) => {
                self.inner.read_miss(index, &err);
                return Ok(None);
            }
        };

        let mut sink = WatchedSink::new(sink);
        match segment.transfer_to_writer(decoded.offset + RECORD_HEADER_SIZE, len, &mut sink) {
            Ok(_) => {
                self.inner.stats.record_read();
                Ok(Some(len))
            }
            Err(err) if sink.failed => Err(err),
            Err(err) => {
                self.inner.read_miss(index, &err);
                Ok(None)
            }
        }
    }

    /// Whether `index` holds a record.
    #[must_use]
    pub fn has_data(&self, index: usize) -> bool {
        self.inner.is_open() && self.inner.mapping.get(index) != NO_ADDRESS
    }

    /// Whether `index` is within the store.
    #[must_use]
    pub fn has_index(&self, index: usize) -> bool {
        self.inner.mapping.has_index(index)
    }

    /// Number of indices.
    #[must_use]
    pub fn length(&self) -> usize {
        self.inner.mapping.length()
    }

    // === Write path ===

    /// Stores `data` at `index`, or deletes the record when `data` is
    /// `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The store is closed (`StoreClosed`)
    /// - `index` is past the end of a fixed-length store (`IndexOutOfBounds`)
    /// - `data` can never fit in a segment (`RecordTooLarge`)
    /// - No segment is left for a rollover (`SegmentPoolExhausted`)
    /// - Appending fails; the segment's append position is restored first
    pub fn set(&self, index: usize, data: Option<&[u8]>, scn: Scn) -> CoreResult<()> {
        let mut writer = self.inner.writer.lock();
        self.inner.ensure_open()?;
        match data {
            Some(data) => self.inner.write_record(&mut writer, index, data, scn),
            None => self.inner.delete_record(index, scn),
        }
    }

    /// Stores `data` at `index`.
    ///
    /// # Errors
    ///
    /// See [`RecordStore::set`].
    pub fn put(&self, index: usize, data: &[u8], scn: Scn) -> CoreResult<()> {
        self.set(index, Some(data), scn)
    }

    /// Deletes the record at `index`.
    ///
    /// # Errors
    ///
    /// See [`RecordStore::set`].
    pub fn delete(&self, index: usize, scn: Scn) -> CoreResult<()> {
        self.set(index, None, scn)
    }

    /// Applies pending relocations and writes the mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the mapping cannot be
    /// written.
    pub fn persist(&self) -> CoreResult<()> {
        let mut writer = self.inner.writer.lock();
        self.inner.ensure_open()?;
        self.inner.drain_batches(&mut writer);
        self.inner.mapping.persist()
    }

    /// Like [`RecordStore::persist`], and flushes to stable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the mapping cannot be
    /// synced.
    pub fn sync(&self) -> CoreResult<()> {
        let mut writer = self.inner.writer.lock();
        self.inner.ensure_open()?;
        self.inner.drain_batches(&mut writer);
        self.inner.mapping.sync()
    }

    /// Removes every record and segment.
    ///
    /// A compactor run in flight is cancelled and its proposals dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the cleared state cannot
    /// be written.
    pub fn clear(&self) -> CoreResult<()> {
        let inner = &self.inner;
        let mut writer = inner.writer.lock();
        inner.ensure_open()?;

        inner.compactor.cancel();
        inner.compactor.wait_idle(|| inner.discard_batches(&mut writer));
        inner.discard_batches(&mut writer);

        let _guard = inner.rollover_lock.lock();
        inner.migrated.lock().clear();
        inner.mapping.clear()?;
        inner.segments.clear()?;
        *inner.live.write() = inner.segments.next_segment()?;
        writer.compaction_triggered = false;

        tracing::info!("record store cleared");
        Ok(())
    }

    /// Closes the store.
    ///
    /// Pending relocations are applied and the mapping is synced. A
    /// compactor run still in flight is cancelled; whatever it produces
    /// afterwards is discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the final sync fails; the store is closed anyway.
    pub fn close(&self) -> CoreResult<()> {
        let inner = &self.inner;
        let mut writer = inner.writer.lock();
        if !inner.is_open() {
            return Ok(());
        }

        inner.drain_batches(&mut writer);
        let result = inner.mapping.sync();

        inner.open.store(false, Ordering::Release);
        inner.compactor.cancel();
        writer.consumer = None;
        *inner.batch_sender.lock() = None;
        inner.compactor.wait_idle(|| {});

        tracing::info!("record store closed");
        result
    }

    /// Reopens a closed store.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible to mirror [`RecordStore::close`].
    pub fn reopen(&self) -> CoreResult<()> {
        let inner = &self.inner;
        let mut writer = inner.writer.lock();
        if inner.is_open() {
            return Ok(());
        }

        inner.compactor.wait_idle(|| {});
        let (sender, consumer) =
            batch_channel(inner.config.batch_size, inner.config.batch_queue_depth);
        writer.consumer = Some(consumer);
        *inner.batch_sender.lock() = Some(sender);
        inner.open.store(true, Ordering::Release);

        tracing::info!("record store reopened");
        Ok(())
    }

    /// Whether the store accepts operations.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    // === Water marks ===

    /// Highest SCN applied.
    #[must_use]
    pub fn high_water_mark(&self) -> Scn {
        self.inner.mapping.high_water_mark()
    }

    /// SCN of the last durable mapping image.
    #[must_use]
    pub fn low_water_mark(&self) -> Scn {
        self.inner.mapping.low_water_mark()
    }

    /// Raises the high water mark without writing a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed.
    pub fn save_hwmark(&self, scn: Scn) -> CoreResult<()> {
        let _writer = self.inner.writer.lock();
        self.inner.ensure_open()?;
        self.inner.mapping.save_hwmark(scn)
    }

    // === Introspection ===

    /// Sum of the load sizes of all segments.
    ///
    /// Once pending relocations are applied this equals the total payload
    /// length of all records.
    #[must_use]
    pub fn live_bytes(&self) -> u64 {
        self.inner
            .segments
            .segments()
            .iter()
            .map(|seg| seg.load_size())
            .sum()
    }

    /// Number of allocated segments.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.inner.segments.segment_count()
    }

    /// Id of the segment the writer appends to.
    #[must_use]
    pub fn live_segment_id(&self) -> SegmentId {
        self.inner.live_segment().id()
    }

    /// Per-segment view, ordered by id.
    #[must_use]
    pub fn segment_infos(&self) -> Vec<SegmentInfo> {
        let live = self.live_segment_id();
        self.inner
            .segments
            .segments()
            .iter()
            .map(|seg| SegmentInfo {
                id: seg.id(),
                live: seg.id() == live,
                read_only: seg.is_read_only(),
                load_size: seg.load_size(),
                append_position: seg.append_position().unwrap_or(DATA_START_POSITION),
                load_factor: seg.load_factor(),
            })
            .collect()
    }

    /// The configuration the store runs with.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Returns a snapshot of the store counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    // === Compaction ===

    /// Runs one compaction pass to completion and applies its results.
    ///
    /// Returns `None` if no run could be started. Migrated segments are
    /// released to the pool by the next [`RecordStore::persist`].
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the compactor thread
    /// cannot be spawned.
    pub fn compact_now(&self) -> CoreResult<Option<CompactionSummary>> {
        let inner = &self.inner;
        let mut writer = inner.writer.lock();
        inner.ensure_open()?;

        inner.compactor.wait_idle(|| {
            inner.apply_next_batch(&mut writer);
        });
        if !inner.start_compaction(&mut writer)? {
            return Ok(None);
        }
        inner.compactor.wait_idle(|| {
            inner.apply_next_batch(&mut writer);
        });
        inner.drain_batches(&mut writer);

        Ok(inner.compactor.last_summary())
    }

    /// Whether a compactor run is in flight.
    #[must_use]
    pub fn is_compacting(&self) -> bool {
        self.inner.compactor.is_running()
    }
}

impl Drop for RecordStore {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "failed to close record store on drop");
        }
    }
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("length", &self.length())
            .field("segments", &self.segment_count())
            .field("live_segment", &self.live_segment_id())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

/// A segment as seen by [`RecordStore::segment_infos`].
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentInfo {
    /// Segment id.
    pub id: SegmentId,
    /// Whether the writer appends to it.
    pub live: bool,
    /// Whether it is sealed.
    pub read_only: bool,
    /// Payload bytes of live records.
    pub load_size: u64,
    /// Where the next append would land.
    pub append_position: u64,
    /// `load_size` over capacity.
    pub load_factor: f64,
}

impl StoreInner {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CoreError::StoreClosed)
        }
    }

    fn live_segment(&self) -> Arc<Segment> {
        Arc::clone(&self.live.read())
    }

    /// Resolves `index` to its segment, or `None` if absent.
    fn locate(&self, index: usize) -> Option<(Arc<Segment>, Address)> {
        if !self.is_open() {
            return None;
        }
        let address = self.mapping.get(index);
        if address == NO_ADDRESS {
            return None;
        }
        match self.segments.get_segment(self.format.segment(address)) {
            Some(segment) => Some((segment, address)),
            None => {
                self.stats.record_read_miss();
                None
            }
        }
    }

    fn read_miss(&self, index: usize, err: &CoreError) {
        tracing::debug!(index, error = %err, "record unreadable, reporting absent");
        self.stats.record_read_miss();
    }

    /// Removes the record at `address` from its segment's load.
    fn discount(&self, address: Address) {
        if address == NO_ADDRESS {
            return;
        }
        let decoded = self.format.decode(address);
        let Some(segment) = self.segments.get_segment(decoded.segment_id) else {
            return;
        };
        match segment.record_length(decoded.offset, decoded.data_size) {
            Ok(len) => segment.decr_load_size(len as u64),
            Err(err) => {
                tracing::debug!(
                    segment_id = decoded.segment_id,
                    error = %err,
                    "could not size replaced record"
                );
            }
        }
    }

    fn delete_record(&self, index: usize, scn: Scn) -> CoreResult<()> {
        self.mapping.expand_capacity(index)?;
        let previous = self.mapping.get(index);
        self.mapping.set(index, NO_ADDRESS, scn)?;
        self.discount(previous);
        self.stats.record_delete();
        Ok(())
    }

    fn write_record(
        self: &Arc<Self>,
        writer: &mut WriterState,
        index: usize,
        data: &[u8],
        scn: Scn,
    ) -> CoreResult<()> {
        let max = self.config.max_record_size();
        if data.len() > max {
            return Err(CoreError::RecordTooLarge {
                len: data.len(),
                max,
            });
        }
        self.mapping.expand_capacity(index)?;

        loop {
            let live = self.live_segment();
            let offset = match append_record(&live, data) {
                Ok(offset) => offset,
                Err(CoreError::SegmentOverflow { .. }) => {
                    self.rollover(writer)?;
                    continue;
                }
                Err(err) => return Err(err),
            };

            // Read after any rollover: draining batches may have moved it.
            let previous = self.mapping.get(index);
            let address = self.format.encode(offset, live.id(), data.len());
            if let Err(err) = self.mapping.set(index, address, scn) {
                if let Err(reset) = live.set_append_position(offset) {
                    tracing::warn!(error = %reset, "failed to restore append position");
                }
                return Err(err);
            }
            live.incr_load_size(data.len() as u64);
            self.discount(previous);
            self.stats.record_write(data.len() as u64);

            if offset == DATA_START_POSITION {
                if let Err(err) = self.segments.update_meta() {
                    tracing::warn!(error = %err, "failed to record new live segment in pool meta");
                }
            }

            self.maybe_trigger_compaction(writer, &live, offset + record_size(data.len()));
            if self.apply_next_batch(writer) {
                self.flow_control(&live);
            }
            return Ok(());
        }
    }

    /// Starts the live segment's compactor run once its append position
    /// enters the trigger window.
    fn maybe_trigger_compaction(
        self: &Arc<Self>,
        writer: &mut WriterState,
        live: &Segment,
        end: u64,
    ) {
        if writer.compaction_triggered {
            return;
        }
        let config = &self.config.compaction;
        let capacity = live.capacity() as f64;
        let lower = ((config.trigger_fraction - config.trigger_band) * capacity) as u64;
        let upper = ((config.trigger_fraction + config.trigger_band) * capacity) as u64;
        if end < lower || end > upper {
            return;
        }

        writer.compaction_triggered = true;
        match self.start_compaction(writer) {
            Ok(true) => tracing::debug!(live_segment = live.id(), "compaction triggered"),
            Ok(false) => {}
            Err(err) => tracing::warn!(error = %err, "failed to start compaction"),
        }
    }

    fn flow_control(&self, live: &Segment) {
        let Some(target) = self
            .compactor
            .current_target()
            .and_then(|id| self.segments.get_segment(id))
        else {
            return;
        };
        if target.load_size() < live.load_size() {
            thread::sleep(self.config.compaction.flow_control_pause);
        }
    }

    /// Seals the live segment and switches to a fresh one.
    ///
    /// Waits for a compactor run in flight, applying its batches meanwhile,
    /// so no relocation is pending when the live segment changes.
    fn rollover(self: &Arc<Self>, writer: &mut WriterState) -> CoreResult<()> {
        self.compactor.wait_idle(|| {
            self.apply_next_batch(writer);
        });
        self.drain_batches(writer);

        let _guard = self.rollover_lock.lock();
        self.mapping.persist()?;

        let old = self.live_segment();
        let next = self.segments.next_segment()?;
        self.segments.seal(&old)?;
        *self.live.write() = Arc::clone(&next);
        writer.compaction_triggered = false;
        self.stats.record_rollover();

        tracing::debug!(
            sealed = old.id(),
            live_segment = next.id(),
            "rolled over to a new live segment"
        );
        Ok(())
    }

    fn start_compaction(self: &Arc<Self>, writer: &mut WriterState) -> CoreResult<bool> {
        if self.compactor.is_running() {
            return Ok(false);
        }
        self.drain_batches(writer);

        let Some(mut producer) = self.batch_sender.lock().as_ref().map(BatchSender::producer)
        else {
            return Ok(false);
        };
        let inner = Arc::clone(self);
        self.compactor
            .start(move |compactor| inner.run_compaction(compactor, &mut producer))
    }

    /// Body of a compactor run; runs on the compactor thread.
    fn run_compaction(
        &self,
        compactor: &Compactor,
        producer: &mut BatchProducer,
    ) -> CoreResult<CompactionSummary> {
        let _guard = self.rollover_lock.lock();
        let excluded = self.migrated.lock().clone();
        let ctx = CompactionContext {
            mapping: &*self.mapping,
            segments: &self.segments,
            format: self.format,
            config: &self.config.compaction,
            live_segment: self.live_segment().id(),
            excluded: &excluded,
        };

        let sources = inspect(&ctx);
        if sources.is_empty() {
            tracing::debug!("no segment worth compacting");
            return Ok(CompactionSummary::default());
        }
        compactor.enter_compacting();
        tracing::info!(
            sources = ?sources.iter().map(|seg| seg.id()).collect::<Vec<_>>(),
            "compaction started"
        );

        let result = compact(&ctx, &sources, producer, compactor);
        self.stats
            .record_compaction(result.as_ref().map_or(true, |summary| summary.aborted));
        if let Ok(summary) = &result {
            tracing::info!(
                sources_compacted = summary.sources_compacted,
                records_relocated = summary.records_relocated,
                bytes_copied = summary.bytes_copied,
                target_segments = summary.target_segments,
                aborted = summary.aborted,
                "compaction finished"
            );
        }
        result
    }

    /// Reconciles at most one pending batch; returns whether one was
    /// applied.
    fn apply_next_batch(&self, writer: &mut WriterState) -> bool {
        let Some(consumer) = writer.consumer.as_ref() else {
            return false;
        };
        let Some(batch) = consumer.try_next() else {
            return false;
        };
        self.reconcile(&batch);
        consumer.recycle(batch);
        true
    }

    fn drain_batches(&self, writer: &mut WriterState) {
        while self.apply_next_batch(writer) {}
    }

    fn discard_batches(&self, writer: &mut WriterState) {
        if let Some(consumer) = writer.consumer.as_ref() {
            while let Some(batch) = consumer.try_next() {
                consumer.recycle(batch);
            }
        }
    }

    /// Applies the relocations of `batch` that are still current.
    ///
    /// A relocation is stale when its index was deleted or rewritten into
    /// the live segment after the compactor copied it; the writer's version
    /// wins and the relocation is dropped.
    fn reconcile(&self, batch: &UpdateBatch) {
        let live_id = self.live_segment().id();
        let target = batch
            .target_segment()
            .and_then(|id| self.segments.get_segment(id));
        let mut applied = 0u64;
        let mut ignored = 0u64;
        let mut ignored_bytes = 0u64;

        for entry in batch.entries() {
            let size = entry.data_size as u64;
            let current = self.mapping.get(entry.index);
            if current == NO_ADDRESS || self.format.segment(current) == live_id {
                ignored += 1;
                ignored_bytes += size;
                continue;
            }
            if let Err(err) = self.mapping.set(entry.index, entry.address, batch.scn()) {
                tracing::warn!(index = entry.index, error = %err, "failed to apply relocation");
                ignored += 1;
                ignored_bytes += size;
                continue;
            }

            if let Some(source) = self.segments.get_segment(self.format.segment(current)) {
                source.decr_load_size(size);
            }
            if let Some(target) = &target {
                target.incr_load_size(size);
            }
            applied += 1;
        }

        if !batch.completed_sources().is_empty() {
            let mut migrated = self.migrated.lock();
            for &id in batch.completed_sources() {
                if !migrated.contains(&id) {
                    migrated.push(id);
                }
            }
        }

        self.stats.record_batch(applied, ignored, ignored_bytes);
        tracing::trace!(
            target_segment = ?batch.target_segment(),
            applied,
            ignored,
            "update batch reconciled"
        );
    }

    /// Frees sources whose relocations are all in the durable mapping.
    fn release_migrated(&self) -> CoreResult<()> {
        let ids = std::mem::take(&mut *self.migrated.lock());
        let live = self.live_segment().id();
        for id in ids {
            if id == live {
                continue;
            }
            self.segments.free_segment(id)?;
            self.stats.record_segment_freed();
        }
        Ok(())
    }
}

/// Sink wrapper that records whether the caller's writer failed.
struct WatchedSink<'a> {
    inner: &'a mut dyn Write,
    failed: bool,
}

impl<'a> WatchedSink<'a> {
    fn new(inner: &'a mut dyn Write) -> Self {
        Self {
            inner,
            failed: false,
        }
    }

    fn watch<T>(&mut self, result: io::Result<T>) -> io::Result<T> {
        if let Err(err) = &result {
            self.failed |= err.kind() != io::ErrorKind::Interrupted;
        }
        result
    }
}

impl Write for WatchedSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = self.inner.write(buf);
        self.watch(result)
    }

    fn flush(&mut self) -> io::Result<()> {
        let result = self.inner.flush();
        self.watch(result)
    }
}

/// Appends `[len][data]` to `live`, returning the record offset.
///
/// On failure the append position is restored.
fn append_record(live: &Segment, data: &[u8]) -> CoreResult<u64> {
    let position = live.append_position()?;
    if position + record_size(data.len()) > live.capacity() {
        return Err(CoreError::SegmentOverflow {
            segment_id: live.id(),
        });
    }
    let len = i32::try_from(data.len()).map_err(|_| CoreError::RecordTooLarge {
        len: data.len(),
        max: i32::MAX as usize,
    })?;

    if let Err(err) = live.append_int(len).and_then(|_| live.append(data)) {
        if let Err(reset) = live.set_append_position(position) {
            tracing::warn!(error = %reset, "failed to restore append position");
        }
        return Err(err);
    }
    Ok(position)
}

/// Frees reopened segments that never received a record, such as the live
/// segment of a session that wrote nothing.
fn release_empty_segments(segments: &SegmentManager) -> CoreResult<()> {
    for segment in segments.segments() {
        if segment.append_position()? <= DATA_START_POSITION {
            segments.free_segment(segment.id())?;
        }
    }
    Ok(())
}

/// Recomputes every segment's load from the mapping.
fn rebuild_load_sizes(
    mapping: &dyn AddressArray,
    segments: &SegmentManager,
    format: AddressFormat,
) -> CoreResult<()> {
    for index in 0..mapping.length() {
        let address = mapping.get(index);
        if address == NO_ADDRESS {
            continue;
        }
        let decoded = format.decode(address);
        let segment = segments.get_segment(decoded.segment_id).ok_or_else(|| {
            CoreError::segment_corruption(format!(
                "index {index} points into missing segment {}",
                decoded.segment_id
            ))
        })?;
        let len = segment.record_length(decoded.offset, decoded.data_size)?;
        segment.incr_load_size(len as u64);
    }
    Ok(())
}

/// Keeps segment files ahead of the mapping image that references them.
struct StoreListener {
    inner: Weak<StoreInner>,
}

impl PersistListener for StoreListener {
    fn before_persist(&self) -> CoreResult<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        inner.live_segment().force()?;
        inner.segments.update_meta()
    }

    fn after_persist(&self) -> CoreResult<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        inner.release_migrated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompactionConfig;
    use tempfile::tempdir;

    fn small_config() -> StoreConfig {
        StoreConfig::new()
            .initial_length(64)
            .segment_capacity(4096)
            .batch_size(8)
    }

    #[test]
    fn put_get_roundtrip() {
        let store = RecordStore::in_memory(small_config()).unwrap();
        store.put(0, b"hello", 1).unwrap();
        store.put(63, b"world", 2).unwrap();

        assert_eq!(store.get(0).as_deref(), Some(&b"hello"[..]));
        assert_eq!(store.get(63).as_deref(), Some(&b"world"[..]));
        assert_eq!(store.get(1), None);
        assert_eq!(store.get_length(0), Some(5));
        assert_eq!(store.high_water_mark(), 2);
    }

    #[test]
    fn empty_record_is_present() {
        let store = RecordStore::in_memory(small_config()).unwrap();
        store.put(5, b"", 1).unwrap();

        assert_eq!(store.get(5), Some(Vec::new()));
        assert!(store.has_data(5));
        assert_eq!(store.get_length(5), Some(0));
    }

    #[test]
    fn delete_leaves_tombstone() {
        let store = RecordStore::in_memory(small_config()).unwrap();
        store.put(2, b"gone soon", 1).unwrap();
        store.delete(2, 2).unwrap();

        assert_eq!(store.get(2), None);
        assert!(!store.has_data(2));
        assert!(store.has_index(2));
        assert_eq!(store.live_bytes(), 0);
        assert_eq!(store.stats().deletes, 1);
    }

    #[test]
    fn overwrite_moves_load() {
        let store = RecordStore::in_memory(small_config()).unwrap();
        store.put(1, &[0u8; 100], 1).unwrap();
        store.put(1, &[0u8; 30], 2).unwrap();
        assert_eq!(store.live_bytes(), 30);
    }

    #[test]
    fn fixed_store_rejects_out_of_range_writes() {
        let store = RecordStore::in_memory(small_config()).unwrap();
        assert!(matches!(
            store.put(64, b"x", 1),
            Err(CoreError::IndexOutOfBounds {
                index: 64,
                length: 64
            })
        ));
        assert_eq!(store.get(1000), None);
        assert!(!store.has_index(64));
    }

    #[test]
    fn dynamic_store_grows() {
        let config = small_config().dynamic(true).growth_unit(100);
        let store = RecordStore::in_memory(config).unwrap();
        store.put(250, b"far", 1).unwrap();

        assert_eq!(store.length(), 300);
        assert_eq!(store.get(250).as_deref(), Some(&b"far"[..]));
    }

    #[test]
    fn oversized_record_rejected() {
        let store = RecordStore::in_memory(small_config()).unwrap();
        let max = store.config().max_record_size();

        assert!(matches!(
            store.put(0, &vec![0u8; max + 1], 1),
            Err(CoreError::RecordTooLarge { .. })
        ));
        store.put(0, &vec![7u8; max], 1).unwrap();
        assert_eq!(store.get_length(0), Some(max));
    }

    #[test]
    fn rollover_seals_full_segment() {
        let store = RecordStore::in_memory(small_config()).unwrap();
        for index in 0..20 {
            store.put(index, &[index as u8; 400], index as u64).unwrap();
        }

        assert!(store.segment_count() > 1);
        assert!(store.stats().rollovers >= 1);
        for index in 0..20 {
            assert_eq!(store.get(index), Some(vec![index as u8; 400]));
        }
        let infos = store.segment_infos();
        assert!(infos.iter().filter(|info| info.live).count() == 1);
        assert!(infos.iter().any(|info| info.read_only));
    }

    #[test]
    fn transfer_to_streams_payload() {
        let store = RecordStore::in_memory(small_config()).unwrap();
        store.put(4, b"streamed", 1).unwrap();

        let mut sink = Vec::new();
        assert_eq!(store.transfer_to(4, &mut sink).unwrap(), Some(8));
        assert_eq!(sink, b"streamed");
        assert_eq!(store.transfer_to(5, &mut sink).unwrap(), None);
    }

    struct BrokenSink;

    impl Write for BrokenSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn transfer_to_surfaces_sink_errors_only() {
        let store = RecordStore::in_memory(small_config()).unwrap();
        store.put(2, b"payload", 1).unwrap();

        assert!(store.transfer_to(2, &mut BrokenSink).is_err());
        assert_eq!(store.transfer_to(3, &mut BrokenSink).unwrap(), None);
        assert_eq!(store.stats().read_misses, 0);
    }

    #[test]
    fn closed_store_rejects_writes_and_reads_absent() {
        let store = RecordStore::in_memory(small_config()).unwrap();
        store.put(0, b"kept", 1).unwrap();
        store.close().unwrap();

        assert!(!store.is_open());
        assert!(matches!(store.put(1, b"x", 2), Err(CoreError::StoreClosed)));
        assert_eq!(store.get(0), None);

        store.reopen().unwrap();
        assert_eq!(store.get(0).as_deref(), Some(&b"kept"[..]));
        store.put(1, b"again", 3).unwrap();
    }

    #[test]
    fn clear_resets_everything() {
        let store = RecordStore::in_memory(small_config()).unwrap();
        for index in 0..20 {
            store.put(index, &[1u8; 300], 1).unwrap();
        }
        store.clear().unwrap();

        assert_eq!(store.segment_count(), 1);
        assert_eq!(store.live_bytes(), 0);
        assert!((0..20).all(|index| store.get(index).is_none()));
        store.put(0, b"fresh", 2).unwrap();
        assert_eq!(store.get(0).as_deref(), Some(&b"fresh"[..]));
    }

    #[test]
    fn persist_advances_low_water_mark() {
        let store = RecordStore::in_memory(small_config()).unwrap();
        store.put(0, b"a", 7).unwrap();
        assert_eq!(store.low_water_mark(), 0);

        store.persist().unwrap();
        assert_eq!(store.low_water_mark(), 7);

        store.save_hwmark(11).unwrap();
        store.sync().unwrap();
        assert_eq!(store.low_water_mark(), 11);
    }

    #[test]
    fn compact_now_reclaims_sparse_segments() {
        let config = small_config().compaction(CompactionConfig::default().trigger_fraction(1.0));
        let store = RecordStore::in_memory(config).unwrap();
        for index in 0..40 {
            store.put(index, &[index as u8; 200], 1).unwrap();
        }
        // Leave only every fourth record alive.
        for index in (0..40).filter(|i| i % 4 != 0) {
            store.delete(index, 2).unwrap();
        }
        let before = store.segment_count();

        let summary = store.compact_now().unwrap().unwrap();
        assert!(summary.sources_compacted > 0);
        store.persist().unwrap();

        assert!(store.segment_count() < before);
        for index in 0..40 {
            let expected = (index % 4 == 0).then(|| vec![index as u8; 200]);
            assert_eq!(store.get(index), expected);
        }
        assert_eq!(store.live_bytes(), 10 * 200);
    }

    #[test]
    fn relocation_of_overwritten_index_is_dropped() {
        let store = RecordStore::in_memory(small_config()).unwrap();
        store.put(1, b"old", 1).unwrap();
        store.put(2, b"two", 2).unwrap();
        let inner = &store.inner;
        inner.rollover(&mut inner.writer.lock()).unwrap();

        // Copy both records into a target the way a compactor run would.
        let target = inner.segments.next_segment().unwrap();
        let mut producer = inner
            .batch_sender
            .lock()
            .as_ref()
            .map(BatchSender::producer)
            .unwrap();
        for index in [1, 2] {
            let address = inner.mapping.get(index);
            let source = inner
                .segments
                .get_segment(inner.format.segment(address))
                .unwrap();
            let position = source
                .transfer_to(inner.format.offset(address), record_size(3) as usize, &target)
                .unwrap();
            producer.add(
                crate::compaction::Relocation {
                    index,
                    data_size: 3,
                    address: inner.format.encode(position, target.id(), 3),
                },
                target.id(),
            );
        }
        producer.close_batch(2, None).unwrap();

        // The writer wins for index 1; the put also reconciles the batch.
        store.put(1, b"new", 3).unwrap();

        assert_eq!(store.get(1).as_deref(), Some(&b"new"[..]));
        assert_eq!(store.get(2).as_deref(), Some(&b"two"[..]));
        assert_eq!(inner.format.segment(inner.mapping.get(2)), target.id());

        let stats = store.stats();
        assert_eq!(stats.relocations_applied, 1);
        assert_eq!(stats.relocations_ignored, 1);
        assert_eq!(stats.ignored_bytes, 3);
        assert_eq!(target.load_size(), 3);
        assert_eq!(store.live_bytes(), 6);
    }

    #[test]
    fn migrated_source_freed_after_persist() {
        let store = RecordStore::in_memory(small_config()).unwrap();
        store.put(0, b"x", 1).unwrap();
        let inner = &store.inner;
        inner.rollover(&mut inner.writer.lock()).unwrap();
        let sealed = inner.format.segment(inner.mapping.get(0));
        store.delete(0, 2).unwrap();

        let mut producer = inner
            .batch_sender
            .lock()
            .as_ref()
            .map(BatchSender::producer)
            .unwrap();
        producer.close_batch(2, Some(sealed)).unwrap();
        inner.drain_batches(&mut inner.writer.lock());

        assert!(inner.segments.get_segment(sealed).is_some());
        store.persist().unwrap();
        assert!(inner.segments.get_segment(sealed).is_none());
        assert_eq!(store.stats().segments_freed, 1);

        // The freed id is handed out again.
        let reused = inner.segments.next_segment().unwrap();
        assert_eq!(reused.id(), sealed);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        let config = small_config();
        {
            let store = RecordStore::open(&path, config.clone()).unwrap();
            for index in 0..30 {
                store.put(index, format!("value-{index}").as_bytes(), index as u64).unwrap();
            }
            store.delete(3, 100).unwrap();
            store.close().unwrap();
        }

        let store = RecordStore::open(&path, config).unwrap();
        assert_eq!(store.get(7).as_deref(), Some(&b"value-7"[..]));
        assert_eq!(store.get(3), None);
        assert_eq!(store.low_water_mark(), 100);

        let expected: u64 = (0..30)
            .filter(|&i| i != 3)
            .map(|i| format!("value-{i}").len() as u64)
            .sum();
        assert_eq!(store.live_bytes(), expected);
    }

    #[test]
    fn reopen_with_other_geometry_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        drop(RecordStore::open(&path, small_config()).unwrap());

        let result = RecordStore::open(&path, small_config().segment_capacity(8192));
        assert!(matches!(result, Err(CoreError::InvalidFormat { .. })));

        let store = RecordStore::open_existing(&path).unwrap();
        assert_eq!(store.config().segment_capacity, 4096);
    }

    #[test]
    fn idle_sessions_do_not_accumulate_segments() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        {
            let store = RecordStore::open(&path, small_config()).unwrap();
            store.put(0, b"only", 1).unwrap();
        }
        for _ in 0..3 {
            let store = RecordStore::open_existing(&path).unwrap();
            assert_eq!(store.segment_count(), 2);
        }
        let store = RecordStore::open_existing(&path).unwrap();
        assert_eq!(store.get(0).as_deref(), Some(&b"only"[..]));
    }

    #[test]
    fn second_open_is_locked_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        let _store = RecordStore::open(&path, small_config()).unwrap();
        assert!(matches!(
            RecordStore::open(&path, small_config()),
            Err(CoreError::StoreLocked)
        ));
    }
}
