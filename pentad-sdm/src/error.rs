use thiserror::Error;

use crate::grid::GridCellId;
use crate::species::SpeciesId;

/// Failures surfaced by the core. Unmapped species and single malformed
/// records are not errors; they are absorbed and counted in reports.
#[derive(Debug, Error)]
pub enum SdmError {
    #[error(
        "data source appears invalid: {invalid} of {} records malformed (limit {limit})",
        valid + invalid
    )]
    SourceInvalid { valid: u64, invalid: u64, limit: f64 },

    #[error("absence threshold undefined for species {species}: {reason}")]
    UndefinedThreshold { species: SpeciesId, reason: &'static str },

    #[error("species {species} has {observed} verified observations, need at least {required}")]
    InsufficientPresence {
        species: SpeciesId,
        observed: u64,
        required: u64,
    },

    #[error("species {0} is not a column of the matrix")]
    UnknownSpecies(SpeciesId),

    #[error("invalid cell id {id:?}: {reason}")]
    InvalidCell { id: String, reason: &'static str },

    #[error("invalid lookup grid: {0}")]
    InvalidGrid(String),

    #[error("reference list has no name column {0:?}")]
    UnknownNameColumn(String),

    #[error("cannot combine an empty tier")]
    EmptyTier,

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("record source failed: {0}")]
    Source(String),
}

impl SdmError {
    /// Species-level failures; callers skip the species and carry on.
    pub fn is_species_skip(&self) -> bool {
        matches!(
            self,
            SdmError::UndefinedThreshold { .. } | SdmError::InsufficientPresence { .. }
        )
    }

    pub(crate) fn invalid_cell(id: &GridCellId, reason: &'static str) -> Self {
        SdmError::InvalidCell {
            id: id.as_str().to_owned(),
            reason,
        }
    }
}

pub type Result<T> = std::result::Result<T, SdmError>;
