//! Compact command implementation.

use super::inspect::format_size;
use segdb_core::RecordStore;
use std::path::Path;
use tracing::info;

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    info!("Compacting store at {:?}", path);
    let store = RecordStore::open_existing(path)?;
    let threshold = store.config().compaction.compact_load_factor;

    println!("Compacting segments at {:?}", path);
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let candidates: Vec<_> = store
        .segment_infos()
        .into_iter()
        .filter(|info| info.read_only && !info.live && info.load_factor < threshold)
        .collect();
    println!(
        "Segments below {:.0}% load: {}",
        threshold * 100.0,
        candidates.len()
    );
    for info in &candidates {
        println!(
            "  [{:>5}] load {:>10} ({:.1}%)",
            info.id,
            format_size(info.load_size),
            info.load_factor * 100.0
        );
    }

    if dry_run {
        store.close()?;
        return Ok(());
    }

    let segments_before = store.segment_count();
    let summary = store.compact_now()?;
    store.sync()?;
    info!(?summary, "compaction pass finished");

    println!();
    match summary {
        Some(summary) if summary.sources_compacted > 0 || summary.aborted => {
            println!("Compaction Summary:");
            println!("  Sources compacted: {}", summary.sources_compacted);
            println!("  Records relocated: {}", summary.records_relocated);
            println!("  Bytes copied:      {}", format_size(summary.bytes_copied));
            println!("  Target segments:   {}", summary.target_segments);
            println!(
                "  Segments:          {} -> {}",
                segments_before,
                store.segment_count()
            );
            if summary.aborted {
                println!("⚠ Run stopped early; run compact again to continue");
            } else {
                println!("✓ Compaction complete");
            }
        }
        _ => println!("No compaction needed - no segment is worth compacting"),
    }

    store.close()?;
    Ok(())
}
