//! Store configuration.

use crate::codec::AddressFormat;
use crate::error::{CoreError, CoreResult};
use crate::segment::{DATA_START_POSITION, RECORD_HEADER_SIZE};
use std::time::Duration;

/// Configuration for opening a record store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Number of index slots the store starts with.
    pub initial_length: usize,

    /// Whether writes past the end grow the store instead of failing.
    pub dynamic: bool,

    /// Slots added per growth step of a dynamic store.
    pub growth_unit: usize,

    /// Byte capacity of every segment, header included.
    pub segment_capacity: u64,

    /// Bit layout of record addresses.
    pub address_format: AddressFormat,

    /// Relocation entries per update batch.
    pub batch_size: usize,

    /// Full batches that may wait for the writer before the compactor blocks.
    pub batch_queue_depth: usize,

    /// Compaction tuning.
    pub compaction: CompactionConfig,

    /// Whether to create the store directory if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            initial_length: 1 << 16,
            dynamic: false,
            growth_unit: 1 << 16,
            segment_capacity: 256 * 1024 * 1024, // 256 MB
            address_format: AddressFormat::default(),
            batch_size: 1000,
            batch_queue_depth: 4,
            compaction: CompactionConfig::default(),
            create_if_missing: true,
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the initial number of slots.
    #[must_use]
    pub const fn initial_length(mut self, length: usize) -> Self {
        self.initial_length = length;
        self
    }

    /// Makes the store grow on writes past the end.
    #[must_use]
    pub const fn dynamic(mut self, value: bool) -> Self {
        self.dynamic = value;
        self
    }

    /// Sets the growth step of a dynamic store.
    #[must_use]
    pub const fn growth_unit(mut self, unit: usize) -> Self {
        self.growth_unit = unit;
        self
    }

    /// Sets the segment capacity in bytes.
    #[must_use]
    pub const fn segment_capacity(mut self, bytes: u64) -> Self {
        self.segment_capacity = bytes;
        self
    }

    /// Sets the address bit layout.
    #[must_use]
    pub const fn address_format(mut self, format: AddressFormat) -> Self {
        self.address_format = format;
        self
    }

    /// Sets the number of entries per update batch.
    #[must_use]
    pub const fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the compaction tuning.
    #[must_use]
    pub const fn compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }

    /// Sets whether to create the store directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Largest payload a single segment can hold.
    #[must_use]
    pub fn max_record_size(&self) -> usize {
        let usable = self
            .segment_capacity
            .saturating_sub(DATA_START_POSITION + RECORD_HEADER_SIZE);
        usize::try_from(usable)
            .unwrap_or(usize::MAX)
            .min(i32::MAX as usize)
    }

    /// Checks the configuration before a store is created.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> CoreResult<()> {
        let format = &self.address_format;

        if self.segment_capacity <= DATA_START_POSITION + RECORD_HEADER_SIZE {
            return Err(CoreError::invalid_config(format!(
                "segment capacity {} leaves no room for records",
                self.segment_capacity
            )));
        }
        if self.segment_capacity > format.max_offset() + 1 {
            return Err(CoreError::invalid_config(format!(
                "segment capacity {} exceeds the {}-bit offset range",
                self.segment_capacity,
                format.offset_bits()
            )));
        }
        if self.dynamic && self.growth_unit == 0 {
            return Err(CoreError::invalid_config("growth unit must be positive"));
        }
        if self.batch_size == 0 || self.batch_queue_depth == 0 {
            return Err(CoreError::invalid_config(
                "batch size and batch queue depth must be positive",
            ));
        }
        self.compaction.validate()
    }
}

/// Tuning for the background compactor.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Sealed segments below this load factor are compaction candidates.
    pub compact_load_factor: f64,

    /// Fraction of the live segment at which a compactor run is started.
    pub trigger_fraction: f64,

    /// Half-width of the trigger window around `trigger_fraction`.
    pub trigger_band: f64,

    /// Most source segments one run will take.
    pub max_candidates: usize,

    /// Ceiling on the summed load factor of one run's sources.
    pub max_cumulative_load: f64,

    /// Most target segments one run may fill before it aborts.
    pub max_target_segments: usize,

    /// How long the writer yields when it runs ahead of the compactor.
    pub flow_control_pause: Duration,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            compact_load_factor: 0.5,
            trigger_fraction: 0.1,
            trigger_band: 0.05,
            max_candidates: 3,
            max_cumulative_load: 0.8,
            max_target_segments: 3,
            flow_control_pause: Duration::from_micros(200),
        }
    }
}

impl CompactionConfig {
    /// Sets the candidate load factor threshold.
    #[must_use]
    pub const fn compact_load_factor(mut self, value: f64) -> Self {
        self.compact_load_factor = value;
        self
    }

    /// Sets where in the live segment a run is triggered.
    #[must_use]
    pub const fn trigger_fraction(mut self, value: f64) -> Self {
        self.trigger_fraction = value;
        self
    }

    /// Sets the writer's flow-control pause.
    #[must_use]
    pub const fn flow_control_pause(mut self, pause: Duration) -> Self {
        self.flow_control_pause = pause;
        self
    }

    /// Checks the tuning values.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] for out-of-range values.
    pub fn validate(&self) -> CoreResult<()> {
        let fractions = [
            ("compact load factor", self.compact_load_factor),
            ("trigger fraction", self.trigger_fraction),
            ("max cumulative load", self.max_cumulative_load),
        ];
        for (name, value) in fractions {
            if !(value > 0.0 && value <= 1.0) {
                return Err(CoreError::invalid_config(format!(
                    "{name} must be in (0, 1], got {value}"
                )));
            }
        }
        if !(0.0..0.5).contains(&self.trigger_band) {
            return Err(CoreError::invalid_config(format!(
                "trigger band must be in [0, 0.5), got {}",
                self.trigger_band
            )));
        }
        if self.max_candidates == 0 || self.max_target_segments == 0 {
            return Err(CoreError::invalid_config(
                "candidate and target segment limits must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = StoreConfig::default();
        assert!(!config.dynamic);
        assert_eq!(config.batch_size, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = StoreConfig::new()
            .initial_length(100)
            .dynamic(true)
            .segment_capacity(64 * 1024)
            .batch_size(16);

        assert_eq!(config.initial_length, 100);
        assert!(config.dynamic);
        assert_eq!(config.segment_capacity, 64 * 1024);
        assert_eq!(config.batch_size, 16);
    }

    #[test]
    fn segment_capacity_must_fit_offset_bits() {
        let format = AddressFormat::new(16, 16, 16).unwrap();
        let config = StoreConfig::new()
            .address_format(format)
            .segment_capacity(1 << 17);
        assert!(matches!(
            config.validate(),
            Err(CoreError::InvalidConfig { .. })
        ));

        let config = config.segment_capacity(1 << 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn tiny_segment_rejected() {
        let config = StoreConfig::new().segment_capacity(DATA_START_POSITION);
        assert!(config.validate().is_err());
    }

    #[test]
    fn max_record_size_accounts_for_header_and_prefix() {
        let config = StoreConfig::new().segment_capacity(1024);
        assert_eq!(config.max_record_size(), 1024 - 64 - 4);
    }

    #[test]
    fn compaction_fractions_validated() {
        let bad = CompactionConfig::default().compact_load_factor(0.0);
        assert!(bad.validate().is_err());

        let bad = CompactionConfig::default().trigger_fraction(1.5);
        assert!(bad.validate().is_err());

        assert!(CompactionConfig::default().validate().is_ok());
    }
}
