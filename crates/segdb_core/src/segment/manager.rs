//! The segment pool.
//!
//! Segments live in an id-indexed arena. Everyone else holds ids and looks
//! segments up on demand; a lookup of a freed id simply returns `None`.
//!
//! On disk the pool is a directory:
//!
//! ```text
//! segs/
//! ├─ 0.seg
//! ├─ 1.seg
//! └─ segs.meta      # ids that belong to the pool
//! ```
//!
//! Pool membership is only trusted once written to `segs.meta`. A segment
//! file the meta does not list never received a durable record and is
//! removed on open.

use crate::dir::{read_file_if_exists, write_file_atomic};
use crate::error::{CoreError, CoreResult};
use crate::segment::base::Segment;
use crate::types::{compute_crc32, SegmentId};
use parking_lot::{Mutex, RwLock};
use segdb_storage::{FileBackend, InMemoryBackend, StorageBackend};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Magic bytes of the pool meta file.
pub const SEGMENT_META_MAGIC: [u8; 4] = *b"SGMT";

/// Current pool meta version.
pub const SEGMENT_META_VERSION: u16 = 1;

const META_FILE: &str = "segs.meta";
const SEGMENT_EXTENSION: &str = "seg";

/// Owns every segment of a store.
///
/// Pool-mutating operations (allocate, free, seal, meta writes) serialize on
/// one lock. Lookups only take a brief read lock on the arena.
pub struct SegmentManager {
    segment_capacity: u64,
    max_segments: u32,
    dir: Option<PathBuf>,
    slots: RwLock<Vec<Option<Arc<Segment>>>>,
    free_ids: Mutex<BTreeSet<SegmentId>>,
}

impl SegmentManager {
    /// Creates a pool whose segments live in memory.
    #[must_use]
    pub fn in_memory(segment_capacity: u64, max_segments: u32) -> Self {
        Self {
            segment_capacity,
            max_segments,
            dir: None,
            slots: RwLock::new(Vec::new()),
            free_ids: Mutex::new(BTreeSet::new()),
        }
    }

    /// Opens (or creates) a pool in `dir`.
    ///
    /// Segments listed in the meta file are reopened read-only; unlisted
    /// segment files are deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the meta file is damaged, a listed segment is
    /// missing or corrupt, or the directory cannot be read.
    pub fn open(dir: &Path, segment_capacity: u64, max_segments: u32) -> CoreResult<Self> {
        fs::create_dir_all(dir)?;

        let listed = match read_file_if_exists(&dir.join(META_FILE))? {
            Some(data) => decode_meta(&data)?,
            None => Vec::new(),
        };

        let manager = Self {
            segment_capacity,
            max_segments,
            dir: Some(dir.to_path_buf()),
            slots: RwLock::new(Vec::new()),
            free_ids: Mutex::new(BTreeSet::new()),
        };

        let mut slots: Vec<Option<Arc<Segment>>> = Vec::new();
        for &id in &listed {
            if id >= max_segments {
                return Err(CoreError::invalid_format(format!(
                    "segment meta lists id {id}, beyond the pool limit of {max_segments}"
                )));
            }
            let path = manager.segment_path(id);
            if !path.exists() {
                return Err(CoreError::segment_corruption(format!(
                    "segment {id} is listed in {META_FILE} but {} is missing",
                    path.display()
                )));
            }
            let segment = Segment::load(id, segment_capacity, Box::new(FileBackend::open(&path)?))?;
            if !segment.is_read_only() {
                segment.seal_read_only()?;
            }

            let index = id as usize;
            if slots.len() <= index {
                slots.resize(index + 1, None);
            }
            slots[index] = Some(Arc::new(segment));
        }

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(SEGMENT_EXTENSION) {
                continue;
            }
            let known = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<SegmentId>().ok())
                .is_some_and(|id| listed.contains(&id));
            if !known {
                tracing::debug!(path = %path.display(), "removing unlisted segment file");
                fs::remove_file(&path)?;
            }
        }

        let free: BTreeSet<SegmentId> = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(id, _)| id as SegmentId)
            .collect();

        *manager.slots.write() = slots;
        *manager.free_ids.lock() = free;

        tracing::debug!(
            dir = %dir.display(),
            segments = listed.len(),
            "opened segment pool"
        );
        Ok(manager)
    }

    /// Byte capacity of every segment in the pool.
    #[must_use]
    pub fn segment_capacity(&self) -> u64 {
        self.segment_capacity
    }

    /// Most segments the pool can hold at once.
    #[must_use]
    pub fn max_segments(&self) -> u32 {
        self.max_segments
    }

    fn segment_path(&self, id: SegmentId) -> PathBuf {
        let dir = self.dir.as_deref().unwrap_or_else(|| Path::new("."));
        dir.join(format!("{id}.{SEGMENT_EXTENSION}"))
    }

    fn new_backend(&self, id: SegmentId) -> CoreResult<Box<dyn StorageBackend>> {
        Ok(match self.dir {
            Some(_) => Box::new(FileBackend::create(&self.segment_path(id))?),
            None => Box::new(InMemoryBackend::new()),
        })
    }

    /// Allocates a fresh appendable segment, reusing the lowest freed id.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SegmentPoolExhausted`] when every addressable
    /// id is in use, or an I/O error creating the segment.
    pub fn next_segment(&self) -> CoreResult<Arc<Segment>> {
        let mut free_ids = self.free_ids.lock();
        let id = match free_ids.first() {
            Some(&id) => id,
            None => {
                let next = self.slots.read().len();
                if next >= self.max_segments as usize {
                    return Err(CoreError::SegmentPoolExhausted {
                        max_segments: self.max_segments,
                    });
                }
                next as SegmentId
            }
        };

        let segment = Arc::new(Segment::create(
            id,
            self.segment_capacity,
            self.new_backend(id)?,
        )?);
        free_ids.remove(&id);

        let mut slots = self.slots.write();
        let index = id as usize;
        if slots.len() <= index {
            slots.resize(index + 1, None);
        }
        slots[index] = Some(Arc::clone(&segment));

        tracing::trace!(segment_id = id, "allocated segment");
        Ok(segment)
    }

    /// Looks up a segment; `None` if the id is not allocated.
    #[must_use]
    pub fn get_segment(&self, id: SegmentId) -> Option<Arc<Segment>> {
        self.slots.read().get(id as usize).and_then(Clone::clone)
    }

    /// Releases a segment back to the pool.
    ///
    /// Readers still holding the segment keep a valid handle; new lookups
    /// return `None`. The meta file is rewritten before the segment file is
    /// deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the meta file cannot be written.
    pub fn free_segment(&self, id: SegmentId) -> CoreResult<()> {
        let mut free_ids = self.free_ids.lock();
        let removed = {
            let mut slots = self.slots.write();
            slots.get_mut(id as usize).and_then(Option::take)
        };
        if removed.is_none() {
            return Ok(());
        }
        free_ids.insert(id);

        if self.dir.is_some() {
            self.write_meta()?;
            let path = self.segment_path(id);
            if let Err(err) = fs::remove_file(&path) {
                tracing::warn!(
                    segment_id = id,
                    error = %err,
                    "failed to delete freed segment file"
                );
            }
        }

        tracing::debug!(segment_id = id, "freed segment");
        Ok(())
    }

    /// Seals a segment read-only.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be rewritten.
    pub fn seal(&self, segment: &Segment) -> CoreResult<()> {
        let _guard = self.free_ids.lock();
        if !segment.is_read_only() {
            segment.seal_read_only()?;
        }
        Ok(())
    }

    /// Snapshot of every allocated segment, ordered by id.
    #[must_use]
    pub fn segments(&self) -> Vec<Arc<Segment>> {
        self.slots.read().iter().flatten().cloned().collect()
    }

    /// Number of allocated segments.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.slots.read().iter().flatten().count()
    }

    /// Frees every segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the meta file cannot be written.
    pub fn clear(&self) -> CoreResult<()> {
        let mut free_ids = self.free_ids.lock();
        let removed: Vec<SegmentId> = {
            let mut slots = self.slots.write();
            let ids = slots.iter().flatten().map(|seg| seg.id()).collect();
            slots.clear();
            ids
        };
        free_ids.clear();

        if self.dir.is_some() {
            self.write_meta()?;
            for id in removed {
                let _ = fs::remove_file(self.segment_path(id));
            }
        }
        Ok(())
    }

    /// Persists pool membership.
    ///
    /// # Errors
    ///
    /// Returns an error if the meta file cannot be written.
    pub fn update_meta(&self) -> CoreResult<()> {
        let _guard = self.free_ids.lock();
        self.write_meta()
    }

    fn write_meta(&self) -> CoreResult<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let ids: Vec<SegmentId> = self.slots.read().iter().flatten().map(|seg| seg.id()).collect();
        write_file_atomic(&dir.join(META_FILE), &encode_meta(&ids))
    }
}

impl std::fmt::Debug for SegmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentManager")
            .field("segment_capacity", &self.segment_capacity)
            .field("max_segments", &self.max_segments)
            .field("dir", &self.dir)
            .field("segments", &self.segment_count())
            .finish()
    }
}

fn encode_meta(ids: &[SegmentId]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(14 + ids.len() * 4);
    buf.extend_from_slice(&SEGMENT_META_MAGIC);
    buf.extend_from_slice(&SEGMENT_META_VERSION.to_le_bytes());
    buf.extend_from_slice(&(ids.len() as u32).to_le_bytes());
    for id in ids {
        buf.extend_from_slice(&id.to_le_bytes());
    }
    let crc = compute_crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

fn decode_meta(data: &[u8]) -> CoreResult<Vec<SegmentId>> {
    if data.len() < 14 || data[0..4] != SEGMENT_META_MAGIC {
        return Err(CoreError::invalid_format("invalid segment meta magic"));
    }
    let version = u16::from_le_bytes([data[4], data[5]]);
    if version > SEGMENT_META_VERSION {
        return Err(CoreError::invalid_format(format!(
            "unsupported segment meta version: {version}"
        )));
    }
    let count = u32::from_le_bytes([data[6], data[7], data[8], data[9]]) as usize;
    let body_len = 10 + count * 4;
    if data.len() != body_len + 4 {
        return Err(CoreError::invalid_format(format!(
            "segment meta holds {} bytes, expected {}",
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

    Ok(data[10..body_len]
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
