//! Inspect and compact phases of a compactor run.

use crate::codec::AddressFormat;
use crate::compaction::batch::{BatchProducer, Relocation};
use crate::compaction::Compactor;
use crate::config::CompactionConfig;
use crate::error::{CoreError, CoreResult};
use crate::mapping::VersionedMapping;
use crate::segment::{record_size, Segment, SegmentManager};
use crate::types::{SegmentId, NO_ADDRESS};
use std::sync::Arc;

/// What a run sees of the store.
///
/// Built by the store while it holds the rollover lock, so `live_segment`
/// cannot change for the duration of the run.
pub(crate) struct CompactionContext<'a> {
    pub mapping: &'a dyn VersionedMapping,
    pub segments: &'a SegmentManager,
    pub format: AddressFormat,
    pub config: &'a CompactionConfig,
    pub live_segment: SegmentId,
    /// Sources already migrated but not yet released to the pool.
    pub excluded: &'a [SegmentId],
}

/// Outcome of one compactor run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionSummary {
    /// Source segments fully migrated.
    pub sources_compacted: usize,
    /// Records copied into targets.
    pub records_relocated: u64,
    /// Bytes copied, length prefixes included.
    pub bytes_copied: u64,
    /// Target segments the run wrote into.
    pub target_segments: usize,
    /// Whether the run stopped early.
    pub aborted: bool,
}

/// Picks the sources for a run, emptiest first.
///
/// Returns nothing when the only candidate is too full to be worth
/// compacting on its own.
pub(crate) fn inspect(ctx: &CompactionContext<'_>) -> Vec<Arc<Segment>> {
    let config = ctx.config;
    let mut candidates: Vec<Arc<Segment>> = ctx
        .segments
        .segments()
        .into_iter()
        .filter(|seg| {
            seg.is_read_only()
                && seg.id() != ctx.live_segment
                && !ctx.excluded.contains(&seg.id())
                && seg.load_factor() < config.compact_load_factor
        })
        .collect();
    candidates.sort_by_key(|seg| seg.load_size());

    let mut selected = Vec::new();
    let mut cumulative = 0.0;
    for seg in candidates {
        if selected.len() >= config.max_candidates {
            break;
        }
        let load_factor = seg.load_factor();
        if cumulative + load_factor >= config.max_cumulative_load {
            break;
        }
        cumulative += load_factor;
        selected.push(seg);
    }

    if let [only] = selected.as_slice() {
        if only.load_factor() > config.compact_load_factor / 2.0 {
            tracing::debug!(
                segment_id = only.id(),
                load_factor = only.load_factor(),
                "deferring compaction of a single mildly fragmented segment"
            );
            return Vec::new();
        }
    }
    selected
}

struct Targets<'c, 'a> {
    ctx: &'c CompactionContext<'a>,
    compactor: &'c Compactor,
    used: Vec<Arc<Segment>>,
}

impl Targets<'_, '_> {
    fn current(&self) -> Option<&Arc<Segment>> {
        self.used.last()
    }

    fn next(&mut self) -> CoreResult<Arc<Segment>> {
        if self.used.len() >= self.ctx.config.max_target_segments {
            return Err(CoreError::compaction_aborted(format!(
                "a run may fill at most {} target segments",
                self.ctx.config.max_target_segments
            )));
        }
        let target = self.ctx.segments.next_segment()?;
        self.compactor.set_current_target(target.id());
        tracing::debug!(segment_id = target.id(), "compaction target allocated");
        self.used.push(Arc::clone(&target));
        Ok(target)
    }

    fn current_or_next(&mut self) -> CoreResult<Arc<Segment>> {
        match self.current() {
            Some(target) => Ok(Arc::clone(target)),
            None => self.next(),
        }
    }
}

/// Copies the live records of `sources` into target segments and sends
/// the relocations to the writer.
///
/// A batch is closed (after forcing the target) whenever it fills up, the
/// run switches targets, or a source has been fully scanned. Targets are
/// sealed before returning, whether or not the run completed.
pub(crate) fn compact(
    ctx: &CompactionContext<'_>,
    sources: &[Arc<Segment>],
    producer: &mut BatchProducer,
    compactor: &Compactor,
) -> CoreResult<CompactionSummary> {
    let mut summary = CompactionSummary::default();
    let mut targets = Targets {
        ctx,
        compactor,
        used: Vec::new(),
    };

    let result = sources
        .iter()
        .try_for_each(|source| migrate(ctx, source, producer, &mut targets, &mut summary));

    let outcome = match result {
        Ok(()) => Ok(()),
        Err(err @ CoreError::CompactionAborted { .. }) => {
            tracing::warn!(error = %err, "compaction aborted");
            summary.aborted = true;
            let flushed = targets
                .current()
                .map_or(Ok(()), |target| target.force())
                .and_then(|()| producer.close_batch(ctx.mapping.low_water_mark(), None));
            if let Err(flush_err) = flushed {
                tracing::debug!(error = %flush_err, "could not hand over partial batch");
            }
            Ok(())
        }
        Err(err) => Err(err),
    };

    summary.target_segments = targets.used.len();
    for target in &targets.used {
        if let Err(err) = ctx.segments.seal(target) {
            tracing::warn!(
                segment_id = target.id(),
                error = %err,
                "failed to seal compaction target"
            );
        }
    }

    outcome.map(|()| summary)
}

fn migrate(
    ctx: &CompactionContext<'_>,
    source: &Segment,
    producer: &mut BatchProducer,
    targets: &mut Targets<'_, '_>,
    summary: &mut CompactionSummary,
) -> CoreResult<()> {
    let format = ctx.format;

    for index in 0..ctx.mapping.length() {
        if targets.compactor.is_cancelled() {
            return Err(CoreError::compaction_aborted("store is closing"));
        }

        let address = ctx.mapping.get(index);
        if address == NO_ADDRESS {
            continue;
        }
        let decoded = format.decode(address);
        if decoded.segment_id != source.id() {
            continue;
        }

        // The source must never be released while an index still points
        // into it, so an unreadable record ends the run.
        let data_size = source
            .record_length(decoded.offset, decoded.data_size)
            .map_err(|err| {
                CoreError::compaction_aborted(format!(
                    "record {index} in segment {} is unreadable: {err}",
                    source.id()
                ))
            })?;
        let len = usize::try_from(record_size(data_size)).unwrap_or(usize::MAX);

        let mut target = targets.current_or_next()?;
        let offset = match source.transfer_to(decoded.offset, len, &target) {
            Ok(offset) => offset,
            Err(CoreError::SegmentOverflow { .. }) => {
                target.force()?;
                producer.close_batch(ctx.mapping.low_water_mark(), None)?;
                target = targets.next()?;
                source.transfer_to(decoded.offset, len, &target)?
            }
            Err(err) => return Err(err),
        };

        let relocation = Relocation {
            index,
            data_size,
            address: format.encode(offset, target.id(), data_size),
        };
        summary.records_relocated += 1;
        summary.bytes_copied += len as u64;

        if producer.add(relocation, target.id()) {
            target.force()?;
            producer.close_batch(ctx.mapping.low_water_mark(), None)?;
        }
    }

    if let Some(target) = targets.current() {
        target.force()?;
    }
    producer.close_batch(ctx.mapping.low_water_mark(), Some(source.id()))?;
    summary.sources_compacted += 1;

    tracing::debug!(segment_id = source.id(), "source segment migrated");
    Ok(())
}
