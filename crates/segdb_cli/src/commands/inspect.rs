//! Inspect command implementation.

use crate::OutputFormat;
use segdb_core::{RecordStore, SegmentInfo};
use serde::Serialize;
use std::path::Path;
use tracing::info;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Number of index slots.
    pub length: usize,
    /// Whether the store grows on writes past the end.
    pub dynamic: bool,
    /// Segment capacity in bytes.
    pub segment_capacity: u64,
    /// Address bit layout.
    pub address_format: AddressLayout,
    /// Indices holding a record.
    pub records: usize,
    /// Payload bytes of all records.
    pub live_bytes: u64,
    /// Allocated segments, the fresh live one included.
    pub segment_count: usize,
    /// SCN of the durable mapping image.
    pub low_water_mark: u64,
    /// Highest SCN applied.
    pub high_water_mark: u64,
    /// Per-segment details (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<SegmentReport>>,
}

/// Widths of the address fields.
#[derive(Debug, Serialize)]
pub struct AddressLayout {
    /// Offset field width.
    pub offset_bits: u8,
    /// Segment id field width.
    pub segment_bits: u8,
    /// Embedded size field width.
    pub size_bits: u8,
}

/// One segment of the pool.
#[derive(Debug, Serialize)]
pub struct SegmentReport {
    /// Segment id.
    pub id: u32,
    /// Whether this is the live segment.
    pub live: bool,
    /// Whether the segment is sealed.
    pub read_only: bool,
    /// Payload bytes of live records.
    pub load_size: u64,
    /// Bytes used, header included.
    pub used_bytes: u64,
    /// Load over capacity.
    pub load_factor: f64,
}

impl From<SegmentInfo> for SegmentReport {
    fn from(info: SegmentInfo) -> Self {
        Self {
            id: info.id,
            live: info.live,
            read_only: info.read_only,
            load_size: info.load_size,
            used_bytes: info.append_position,
            load_factor: info.load_factor,
        }
    }
}

/// Runs the inspect command.
pub fn run(
    path: &Path,
    show_segments: bool,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Inspecting store at {:?}", path);
    let store = RecordStore::open_existing(path)?;
    let config = store.config();

    let result = InspectResult {
        path: path.display().to_string(),
        length: store.length(),
        dynamic: config.dynamic,
        segment_capacity: config.segment_capacity,
        address_format: AddressLayout {
            offset_bits: config.address_format.offset_bits(),
            segment_bits: config.address_format.segment_bits(),
            size_bits: config.address_format.size_bits(),
        },
        records: (0..store.length())
            .filter(|&index| store.has_data(index))
            .count(),
        live_bytes: store.live_bytes(),
        segment_count: store.segment_count(),
        low_water_mark: store.low_water_mark(),
        high_water_mark: store.high_water_mark(),
        segments: show_segments.then(|| {
            store
                .segment_infos()
                .into_iter()
                .map(SegmentReport::from)
                .collect()
        }),
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => print_text_output(&result),
    }

    store.close()?;
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("segdb Store Inspection");
    println!("======================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Geometry:");
    println!(
        "  Length:           {}{}",
        result.length,
        if result.dynamic { " (dynamic)" } else { "" }
    );
    println!(
        "  Segment capacity: {}",
        format_size(result.segment_capacity)
    );
    println!(
        "  Address layout:   {} offset / {} segment / {} size bits",
        result.address_format.offset_bits,
        result.address_format.segment_bits,
        result.address_format.size_bits
    );
    println!();
    println!("Records:");
    println!("  Present:    {}", result.records);
    println!("  Live bytes: {}", format_size(result.live_bytes));
    println!(
        "  SCN:        lwm {} / hwm {}",
        result.low_water_mark, result.high_water_mark
    );
    println!();
    println!("Segments: {}", result.segment_count);

    if let Some(segments) = &result.segments {
        for seg in segments {
            let role = if seg.live {
                "live"
            } else if seg.read_only {
                "sealed"
            } else {
                "open"
            };
            println!(
                "  [{:>5}] {:<6} load {:>10} used {:>10} ({:.1}%)",
                seg.id,
                role,
                format_size(seg.load_size),
                format_size(seg.used_bytes),
                seg.load_factor * 100.0
            );
        }
    }
}

pub(crate) fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
