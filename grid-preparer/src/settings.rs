use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use pentad_sdm::PipelineConfig;

/// Pipeline configuration: an optional TOML file, then any flags given on
/// the command line.
#[derive(Args, Debug, Default)]
pub struct ConfigArgs {
    /// TOML file with pipeline settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Records per batch
    #[arg(long, global = true)]
    batch_size: Option<usize>,

    /// Largest tolerated fraction of malformed records
    #[arg(long, global = true)]
    max_skip_fraction: Option<f64>,

    /// Percentile of presence ratios for the absence threshold
    #[arg(long, global = true)]
    absence_percentile: Option<f64>,

    /// Verified observations required before a species is labelled
    #[arg(long, global = true)]
    min_presence_observations: Option<u64>,

    /// Fixed absence threshold instead of the adaptive one
    #[arg(long, global = true)]
    absence_threshold: Option<f64>,
}

impl ConfigArgs {
    pub fn load(&self) -> Result<PipelineConfig> {
        let base = match &self.config {
            Some(path) => read_config(path)?,
            None => PipelineConfig::default(),
        };
        Ok(self.apply(base).validated()?)
    }

    fn apply(&self, mut config: PipelineConfig) -> PipelineConfig {
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(fraction) = self.max_skip_fraction {
            config.max_skip_fraction = fraction;
        }
        if let Some(percentile) = self.absence_percentile {
            config.absence_percentile = percentile;
        }
        if let Some(minimum) = self.min_presence_observations {
            config.min_presence_observations = minimum;
        }
        if self.absence_threshold.is_some() {
            config.absence_threshold = self.absence_threshold;
        }
        config
    }
}

pub fn read_config(path: &Path) -> Result<PipelineConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}
