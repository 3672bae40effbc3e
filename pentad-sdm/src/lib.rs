//! Species-distribution training data from citizen-science bird records.
//!
//! Raw observations are binned onto a grid of cells (SABAP2 pentads or a
//! lookup grid), counted per species, summed per trust tier and finally turned
//! into presence / pseudo-absence labels for one target species at a time.
//! Nothing in this crate performs I/O; record sources are plain iterators.

pub mod aggregate;
pub mod combine;
pub mod config;
pub mod covariates;
pub mod error;
pub mod grid;
pub mod labels;
pub mod matrix;
pub mod species;

pub use aggregate::{batched, Aggregation, AggregationReport, Aggregator, CardRecord, RawRecord, RunningTotals};
pub use combine::{combine, TrustTierMatrix};
pub use config::PipelineConfig;
pub use covariates::{CovariateTable, TrainingRow};
pub use error::{Result, SdmError};
pub use grid::{CellCodec, CoordGeo, GridCellId, GridKind, LookupGrid, PentadCodec};
pub use labels::{label_for, Label, LabelGenerator, LabelSet};
pub use matrix::CountMatrix;
pub use species::{FixedSpecies, NameMapping, SpeciesId, SpeciesReference, SpeciesResolver};
