use serde::Deserialize;

use crate::error::{Result, SdmError};

/// Records per batch when none is configured; matches the chunk size the
/// observation exports were originally processed with.
pub const DEFAULT_BATCH_SIZE: usize = 1_000_000;

/// Run-wide knobs, built once and handed to each component by reference.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Number of raw records pulled from a source per batch.
    pub batch_size: usize,
    /// Largest tolerated fraction of malformed records before a source is
    /// rejected as invalid.
    pub max_skip_fraction: f64,
    /// Percentile of the presence ratio distribution used for the absence
    /// threshold.
    pub absence_percentile: f64,
    /// Minimum verified observations of the target species before labels are
    /// generated at all.
    pub min_presence_observations: u64,
    /// Fixed absence threshold; when set the adaptive threshold is not computed.
    pub absence_threshold: Option<f64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_skip_fraction: 0.05,
            absence_percentile: 10.0,
            min_presence_observations: 30,
            absence_threshold: None,
        }
    }
}

impl PipelineConfig {
    pub fn validated(self) -> Result<Self> {
        if self.batch_size == 0 {
            return Err(SdmError::InvalidConfig("batch_size must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.max_skip_fraction) {
            return Err(SdmError::InvalidConfig(format!(
                "max_skip_fraction {} outside [0, 1]",
                self.max_skip_fraction
            )));
        }
        if !(self.absence_percentile > 0.0 && self.absence_percentile <= 100.0) {
            return Err(SdmError::InvalidConfig(format!(
                "absence_percentile {} outside (0, 100]",
                self.absence_percentile
            )));
        }
        if let Some(threshold) = self.absence_threshold {
            if !threshold.is_finite() || threshold < 0.0 {
                return Err(SdmError::InvalidConfig(format!(
                    "absence_threshold {threshold} must be a non-negative number"
                )));
            }
        }
        Ok(self)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}
