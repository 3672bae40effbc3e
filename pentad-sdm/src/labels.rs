//! Presence / pseudo-absence labels for one target species.
//!
//! ```text
//!  1  verified count > 0
//!  0  verified count == 0, unverified count == 0 and
//!     verified effort + unverified effort >= threshold
//! -1  otherwise
//! ```
//!
//! The threshold is the reciprocal of a low percentile of
//! `count / effort` over the cells where the species was verified: a cell
//! needs at least as much effort as the species' sparsest presence cells
//! before a missing record says anything.

use rayon::prelude::*;
use tracing::{debug, info, span, Level};

use crate::combine::TrustTierMatrix;
use crate::config::PipelineConfig;
use crate::error::{Result, SdmError};
use crate::grid::GridCellId;
use crate::species::SpeciesId;

pub const DEFAULT_ABSENCE_PERCENTILE: f64 = 10.0;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Label {
    Presence,
    PseudoAbsence,
    Unknown,
}

impl Label {
    /// Training target: 1, 0 or -1.
    pub fn target(self) -> i8 {
        match self {
            Label::Presence => 1,
            Label::PseudoAbsence => 0,
            Label::Unknown => -1,
        }
    }

    /// Whether the cell is used for training at all.
    pub fn is_known(self) -> bool {
        self != Label::Unknown
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CellLabel {
    pub cell: GridCellId,
    pub label: Label,
    /// Verified observations of the target species.
    pub target_observations: u64,
    /// Verified observations of all species.
    pub total_observations: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LabelCounts {
    pub presence: usize,
    pub pseudo_absence: usize,
    pub unknown: usize,
}

/// One row per cell of the verified tier, in its cell order.
#[derive(Clone, Debug, PartialEq)]
pub struct LabelSet {
    pub species: SpeciesId,
    pub threshold: f64,
    pub rows: Vec<CellLabel>,
}

impl LabelSet {
    pub fn counts(&self) -> LabelCounts {
        self.rows
            .iter()
            .fold(LabelCounts::default(), |mut counts, row| {
                match row.label {
                    Label::Presence => counts.presence += 1,
                    Label::PseudoAbsence => counts.pseudo_absence += 1,
                    Label::Unknown => counts.unknown += 1,
                }
                counts
            })
    }

    pub fn get(&self, cell: &GridCellId) -> Option<&CellLabel> {
        self.rows.iter().find(|row| &row.cell == cell)
    }

    /// Presence and pseudo-absence rows: the set handed to the classifier.
    pub fn training_cells(&self) -> impl Iterator<Item = &CellLabel> {
        self.rows.iter().filter(|row| row.label.is_known())
    }
}

/// Linear-interpolation percentile (the "linear" method: rank `p/100 * (n-1)`
/// between the two closest order statistics). `None` for an empty sample.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

/// Reciprocal of the `p`-th percentile of `count / effort` over the cells
/// where `species` was verified.
pub fn absence_threshold(species: &SpeciesId, verified: &TrustTierMatrix, p: f64) -> Result<f64> {
    let counts = verified.counts();
    let column = counts
        .column(species)
        .ok_or_else(|| SdmError::UnknownSpecies(species.clone()))?;
    let ratios: Vec<f64> = column
        .zip(verified.totals())
        .filter(|&(count, _)| count > 0)
        .map(|(count, &total)| count as f64 / total as f64)
        .collect();

    let tenth = percentile(&ratios, p).ok_or_else(|| SdmError::UndefinedThreshold {
        species: species.clone(),
        reason: "no verified presence cells",
    })?;
    if tenth == 0.0 {
        return Err(SdmError::UndefinedThreshold {
            species: species.clone(),
            reason: "presence ratio percentile is zero",
        });
    }
    debug!(%species, presence_cells = ratios.len(), percentile = tenth, "absence threshold");
    Ok(1.0 / tenth)
}

/// Labels every verified-tier cell for `target`, with the adaptive threshold
/// at the 10th percentile. Inputs are only read.
pub fn label_for(
    target: &SpeciesId,
    verified: &TrustTierMatrix,
    unverified: &TrustTierMatrix,
) -> Result<LabelSet> {
    let threshold = absence_threshold(target, verified, DEFAULT_ABSENCE_PERCENTILE)?;
    Ok(label_with_threshold(target, verified, unverified, threshold))
}

fn label_with_threshold(
    target: &SpeciesId,
    verified: &TrustTierMatrix,
    unverified: &TrustTierMatrix,
    threshold: f64,
) -> LabelSet {
    let rows = verified
        .cells()
        .iter()
        .zip(verified.totals())
        .map(|(cell, &total)| {
            let count = verified.count(cell, target);
            let label = if count > 0 {
                Label::Presence
            } else {
                let effort = (total + unverified.total(cell)) as f64;
                let sighted = unverified.count(cell, target) > 0;
                if effort >= threshold && !sighted {
                    Label::PseudoAbsence
                } else {
                    Label::Unknown
                }
            };
            CellLabel {
                cell: cell.clone(),
                label,
                target_observations: count,
                total_observations: total,
            }
        })
        .collect();
    LabelSet {
        species: target.clone(),
        threshold,
        rows,
    }
}


// --------------------------------------------------------------------------
// LabelGenerator

/// Label generation under a run's configuration: presence guard, configured
/// percentile, optional fixed threshold.
#[derive(Debug)]
pub struct LabelGenerator<'a> {
    config: &'a PipelineConfig,
    verified: &'a TrustTierMatrix,
    unverified: &'a TrustTierMatrix,
}

impl<'a> LabelGenerator<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        verified: &'a TrustTierMatrix,
        unverified: &'a TrustTierMatrix,
    ) -> Self {
        Self {
            config,
            verified,
            unverified,
        }
    }

    pub fn generate(&self, target: &SpeciesId) -> Result<LabelSet> {
        let _span = span!(Level::INFO, "labels", species = %target).entered();

        let observed: u64 = self
            .verified
            .counts()
            .column(target)
            .ok_or_else(|| SdmError::UnknownSpecies(target.clone()))?
            .sum();
        if observed < self.config.min_presence_observations {
            return Err(SdmError::InsufficientPresence {
                species: target.clone(),
                observed,
                required: self.config.min_presence_observations,
            });
        }

        let threshold = match self.config.absence_threshold {
            Some(fixed) => fixed,
            None => absence_threshold(target, self.verified, self.config.absence_percentile)?,
        };
        let labels = label_with_threshold(target, self.verified, self.unverified, threshold);

        let counts = labels.counts();
        info!(
            threshold,
            presence = counts.presence,
            pseudo_absence = counts.pseudo_absence,
            unknown = counts.unknown,
            "labelled cells"
        );
        Ok(labels)
    }

    /// Labels several species on the rayon pool. Results keep input order;
    /// a failure for one species does not affect the others.
    pub fn generate_many(&self, targets: &[SpeciesId]) -> Vec<(SpeciesId, Result<LabelSet>)> {
        targets
            .par_iter()
            .map(|target| (target.clone(), self.generate(target)))
            .collect()
    }
}
