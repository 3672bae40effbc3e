//! Streaming aggregation of raw observations into a dense [`CountMatrix`].
//!
//! Records arrive in batches. Each batch is tallied on its own into
//! (cell, species) counts and folded into a running total, so peak memory
//! follows the number of distinct (cell, species) pairs rather than the number
//! of records. Addition is the only operation on totals: any batching, in any
//! order, on any number of workers, yields the same matrix.

use std::collections::HashMap;
use std::fmt::Display;

use rayon::iter::{ParallelBridge, ParallelIterator};
use tracing::{debug, info, span, trace, warn, Level};

use crate::config::PipelineConfig;
use crate::error::{Result, SdmError};
use crate::grid::{CellCodec, CoordGeo, GridCellId, GridKind};
use crate::matrix::CountMatrix;
use crate::species::{SpeciesId, SpeciesResolver};

/// One raw observation. `None` marks a field that was missing or could not
/// be coerced by the reader.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawRecord {
    pub species: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl RawRecord {
    pub fn new(species: &str, latitude: f64, longitude: f64) -> Self {
        Self {
            species: Some(species.to_owned()),
            latitude: Some(latitude),
            longitude: Some(longitude),
        }
    }
}

/// One per-species checklist card: the species was looked for in `cell` and
/// either recorded or not.
#[derive(Clone, Debug, PartialEq)]
pub struct CardRecord {
    pub species: SpeciesId,
    pub cell: String,
    pub recorded: bool,
}

/// Chunks an in-memory record iterator into batches of `size`.
pub fn batched<I>(records: I, size: usize) -> impl Iterator<Item = std::result::Result<Vec<RawRecord>, SdmError>>
where
    I: IntoIterator<Item = RawRecord>,
{
    let size = size.max(1);
    let mut records = records.into_iter();
    std::iter::from_fn(move || {
        let batch: Vec<RawRecord> = records.by_ref().take(size).collect();
        (!batch.is_empty()).then_some(Ok(batch))
    })
}


// --------------------------------------------------------------------------
// Running totals

/// Sparse (cell, species) counts accumulated across batches.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunningTotals {
    counts: HashMap<(GridCellId, SpeciesId), u64>,
}

impl RunningTotals {
    pub fn add(&mut self, cell: GridCellId, species: SpeciesId, n: u64) {
        *self.counts.entry((cell, species)).or_insert(0) += n;
    }

    pub fn merge(mut self, other: RunningTotals) -> RunningTotals {
        // Fold the smaller map into the larger one.
        let (mut large, small) = if self.counts.len() >= other.counts.len() {
            (std::mem::take(&mut self.counts), other.counts)
        } else {
            (other.counts, std::mem::take(&mut self.counts))
        };
        for (key, n) in small {
            *large.entry(key).or_insert(0) += n;
        }
        RunningTotals { counts: large }
    }

    /// Number of distinct (cell, species) pairs held.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}


// --------------------------------------------------------------------------
// Report

/// Record accounting for one aggregation. Every record ends up in exactly one
/// of `aggregated`, `skipped`, `outside_master_grid` or `not_recorded`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AggregationReport {
    pub batches: u64,
    pub records: u64,
    /// Counted into the matrix.
    pub aggregated: u64,
    /// Malformed: missing species, bad coordinate, outside the grid domain.
    pub skipped: u64,
    /// Counted records that went to the unmapped bucket.
    pub unmapped: u64,
    /// Valid cells that are not part of the master grid.
    pub outside_master_grid: u64,
    /// Cards where the species was looked for but not recorded.
    pub not_recorded: u64,
}

impl AggregationReport {
    pub fn merge(self, other: AggregationReport) -> AggregationReport {
        AggregationReport {
            batches: self.batches + other.batches,
            records: self.records + other.records,
            aggregated: self.aggregated + other.aggregated,
            skipped: self.skipped + other.skipped,
            unmapped: self.unmapped + other.unmapped,
            outside_master_grid: self.outside_master_grid + other.outside_master_grid,
            not_recorded: self.not_recorded + other.not_recorded,
        }
    }

    pub fn valid(&self) -> u64 {
        self.records - self.skipped
    }

    pub fn skip_fraction(&self) -> f64 {
        if self.records == 0 {
            0.0
        } else {
            self.skipped as f64 / self.records as f64
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Aggregation {
    pub matrix: CountMatrix,
    pub report: AggregationReport,
}


// --------------------------------------------------------------------------
// Aggregator

/// Builds count matrices over one master grid for one run.
#[derive(Debug)]
pub struct Aggregator<'a> {
    config: &'a PipelineConfig,
    grid: &'a GridKind,
    master_grid: &'a [GridCellId],
    columns: Vec<SpeciesId>,
}

impl<'a> Aggregator<'a> {
    /// `columns` is the full species column set, unmapped bucket included
    /// (see [`crate::species::SpeciesReference::columns`]).
    pub fn new(
        config: &'a PipelineConfig,
        grid: &'a GridKind,
        master_grid: &'a [GridCellId],
        columns: Vec<SpeciesId>,
    ) -> Self {
        Self {
            config,
            grid,
            master_grid,
            columns,
        }
    }

    /// Aggregates raw observations, one batch at a time.
    pub fn aggregate<I, E>(&self, batches: I, resolver: &dyn SpeciesResolver) -> Result<Aggregation>
    where
        I: IntoIterator<Item = std::result::Result<Vec<RawRecord>, E>>,
        E: Display,
    {
        let _span = span!(Level::INFO, "aggregate", grid = self.grid.name()).entered();

        let mut totals = RunningTotals::default();
        let mut report = AggregationReport::default();
        for batch in batches {
            let batch = batch.map_err(|e| SdmError::Source(e.to_string()))?;
            let (batch_totals, batch_report) = self.tally(&batch, resolver);
            totals = totals.merge(batch_totals);
            report = report.merge(batch_report);
            debug!(
                batch = report.batches,
                records = report.records,
                pairs = totals.len(),
                "processed batch"
            );
        }
        self.finish(totals, report)
    }

    /// Same result as [`Aggregator::aggregate`], with batches tallied on the
    /// rayon pool and the per-worker totals summed.
    pub fn aggregate_parallel<I, E>(
        &self,
        batches: I,
        resolver: &dyn SpeciesResolver,
    ) -> Result<Aggregation>
    where
        I: IntoIterator<Item = std::result::Result<Vec<RawRecord>, E>>,
        I::IntoIter: Send,
        E: Display + Send,
    {
        let _span = span!(Level::INFO, "aggregate_parallel", grid = self.grid.name()).entered();

        let (totals, report) = batches
            .into_iter()
            .par_bridge()
            .map(|batch| -> Result<(RunningTotals, AggregationReport)> {
                let batch = batch.map_err(|e| SdmError::Source(e.to_string()))?;
                Ok(self.tally(&batch, resolver))
            })
            .try_reduce(
                || (RunningTotals::default(), AggregationReport::default()),
                |(a_totals, a_report), (b_totals, b_report)| {
                    Ok((a_totals.merge(b_totals), a_report.merge(b_report)))
                },
            )?;
        self.finish(totals, report)
    }

    /// Aggregates checklist cards: each recorded card adds one to its
    /// (cell, species) pair. Cards carry their cell id, so no codec is used.
    pub fn aggregate_cards<I, E>(&self, batches: I) -> Result<Aggregation>
    where
        I: IntoIterator<Item = std::result::Result<Vec<CardRecord>, E>>,
        E: Display,
    {
        let _span = span!(Level::INFO, "aggregate_cards", grid = self.grid.name()).entered();

        let mut totals = RunningTotals::default();
        let mut report = AggregationReport::default();
        for batch in batches {
            let batch = batch.map_err(|e| SdmError::Source(e.to_string()))?;
            report.batches += 1;
            for card in batch {
                report.records += 1;
                if card.species.is_unmapped() {
                    return Err(SdmError::UnknownSpecies(card.species));
                }
                if card.cell.trim().is_empty() {
                    report.skipped += 1;
                    continue;
                }
                if !card.recorded {
                    report.not_recorded += 1;
                    continue;
                }
                totals.add(self.grid.normalize(&card.cell), card.species, 1);
                report.aggregated += 1;
            }
            trace!(batch = report.batches, cards = report.records, "processed card batch");
        }
        self.finish(totals, report)
    }

    /// Tallies one batch in isolation.
    fn tally(
        &self,
        batch: &[RawRecord],
        resolver: &dyn SpeciesResolver,
    ) -> (RunningTotals, AggregationReport) {
        let mut totals = RunningTotals::default();
        let mut report = AggregationReport {
            batches: 1,
            ..AggregationReport::default()
        };
        for record in batch {
            report.records += 1;
            let Some(species) = resolver.resolve(record.species.as_deref()) else {
                report.skipped += 1;
                continue;
            };
            let Some(cell) = self.cell_of(record) else {
                report.skipped += 1;
                continue;
            };
            if species.is_unmapped() {
                report.unmapped += 1;
            }
            totals.add(cell, species.clone(), 1);
            report.aggregated += 1;
        }
        (totals, report)
    }

    fn cell_of(&self, record: &RawRecord) -> Option<GridCellId> {
        let coord = CoordGeo::checked(record.latitude?, record.longitude?)?;
        self.grid.encode(&coord)
    }

    /// Rejects a source with too many malformed records, then pivots the
    /// totals onto the master grid.
    fn finish(&self, totals: RunningTotals, mut report: AggregationReport) -> Result<Aggregation> {
        if report.skip_fraction() > self.config.max_skip_fraction {
            warn!(
                records = report.records,
                skipped = report.skipped,
                limit = self.config.max_skip_fraction,
                "too many malformed records"
            );
            return Err(SdmError::SourceInvalid {
                valid: report.valid(),
                invalid: report.skipped,
                limit: self.config.max_skip_fraction,
            });
        }

        let mut matrix = CountMatrix::zeros(self.master_grid.to_vec(), self.columns.clone())?;
        for ((cell, species), n) in totals.counts {
            let Some(column) = matrix.column_position(&species) else {
                return Err(SdmError::UnknownSpecies(species));
            };
            match matrix.cell_position(&cell) {
                Some(row) => matrix.add_at(row, column, n),
                None => {
                    trace!(%cell, n, "cell outside master grid");
                    report.outside_master_grid += n;
                    report.aggregated -= n;
                }
            }
        }

        info!(
            records = report.records,
            aggregated = report.aggregated,
            skipped = report.skipped,
            unmapped = report.unmapped,
            outside = report.outside_master_grid,
            cells = matrix.height(),
            columns = matrix.width(),
            "aggregation finished"
        );
        Ok(Aggregation { matrix, report })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::grid::PentadCodec;
    use crate::species::{ReferenceSpecies, SpeciesReference};

    fn reference() -> SpeciesReference {
        SpeciesReference::new(
            ["inat_name".to_owned()],
            vec![ReferenceSpecies {
                id: SpeciesId::from("7"),
                common_name: "Spotted Eagle-Owl".into(),
                scientific_name: "Bubo africanus".into(),
                source_names: BTreeMap::from([("inat_name".into(), "speciesX".into())]),
            }],
        )
        .unwrap()
    }

    const A: (f64, f64) = (-33.92, 18.42);
    const B: (f64, f64) = (-25.70, 28.20);

    fn master() -> Vec<GridCellId> {
        vec![PentadCodec::cell_of(A.0, A.1), PentadCodec::cell_of(B.0, B.1)]
    }

    fn records() -> Vec<RawRecord> {
        vec![
            RawRecord::new("speciesX", A.0, A.1),
            RawRecord::new("unknownSpecies", A.0, A.1),
            RawRecord::new("speciesX", B.0, B.1),
        ]
    }

    #[test]
    fn two_cell_scenario() {
        let config = PipelineConfig::default();
        let reference = reference();
        let master = master();
        let aggregator = Aggregator::new(&config, &GridKind::Formula, &master, reference.columns());
        let resolver = reference.resolver("inat_name").unwrap();

        let result = aggregator.aggregate(batched(records(), 2), &resolver).unwrap();
        let m = &result.matrix;
        assert_eq!(m.row(&master[0]), Some(&[1, 1][..]));
        assert_eq!(m.row(&master[1]), Some(&[1, 0][..]));
        assert_eq!(result.report.records, 3);
        assert_eq!(result.report.unmapped, 1);
        assert_eq!(result.report.batches, 2);
    }

    #[test]
    fn empty_stream_is_dense_zero() {
        let config = PipelineConfig::default();
        let reference = reference();
        let master = master();
        let aggregator = Aggregator::new(&config, &GridKind::Formula, &master, reference.columns());
        let resolver = reference.resolver("inat_name").unwrap();

        let result = aggregator.aggregate(batched(Vec::new(), 10), &resolver).unwrap();
        assert_eq!(result.matrix.height(), 2);
        assert_eq!(result.matrix.width(), 2);
        assert_eq!(result.matrix.total(), 0);
    }

    #[test]
    fn malformed_records_are_counted_then_fatal_past_limit() {
        let reference = reference();
        let master = master();
        let resolver = reference.resolver("inat_name").unwrap();
        let mut input = records();
        input.push(RawRecord {
            species: Some("speciesX".into()),
            latitude: None,
            longitude: Some(18.0),
        });
        input.push(RawRecord::new("speciesX", f64::NAN, 18.0));

        let lenient = PipelineConfig {
            max_skip_fraction: 0.5,
            ..PipelineConfig::default()
        };
        let aggregator = Aggregator::new(&lenient, &GridKind::Formula, &master, reference.columns());
        let result = aggregator.aggregate(batched(input.clone(), 10), &resolver).unwrap();
        assert_eq!(result.report.skipped, 2);
        assert_eq!(result.matrix.total(), 3);

        let strict = PipelineConfig {
            max_skip_fraction: 0.1,
            ..PipelineConfig::default()
        };
        let aggregator = Aggregator::new(&strict, &GridKind::Formula, &master, reference.columns());
        let err = aggregator.aggregate(batched(input, 10), &resolver).unwrap_err();
        assert!(matches!(err, SdmError::SourceInvalid { valid: 3, invalid: 2, .. }));
    }

    #[test]
    fn cells_off_the_master_grid_are_reported() {
        let config = PipelineConfig::default();
        let reference = reference();
        let master = vec![PentadCodec::cell_of(A.0, A.1)];
        let aggregator = Aggregator::new(&config, &GridKind::Formula, &master, reference.columns());
        let resolver = reference.resolver("inat_name").unwrap();

        let result = aggregator.aggregate(batched(records(), 3), &resolver).unwrap();
        assert_eq!(result.report.outside_master_grid, 1);
        assert_eq!(result.report.aggregated, 2);
        assert_eq!(result.matrix.total(), 2);
    }

    #[test]
    fn parallel_matches_sequential() {
        let config = PipelineConfig::default();
        let reference = reference();
        let master = master();
        let aggregator = Aggregator::new(&config, &GridKind::Formula, &master, reference.columns());
        let resolver = reference.resolver("inat_name").unwrap();
        let many: Vec<RawRecord> = records().into_iter().cycle().take(301).collect();

        let sequential = aggregator.aggregate(batched(many.clone(), 7), &resolver).unwrap();
        let parallel = aggregator
            .aggregate_parallel(batched(many, 7), &resolver)
            .unwrap();
        assert_eq!(sequential.matrix, parallel.matrix);
        assert_eq!(sequential.report, parallel.report);
    }

    #[test]
    fn cards_count_recorded_visits_only() {
        let config = PipelineConfig::default();
        let reference = reference();
        let master = master();
        let aggregator = Aggregator::new(&config, &GridKind::Formula, &master, reference.columns());
        let upper = master[0].as_str().to_ascii_uppercase();
        let cards = vec![
            CardRecord { species: "7".into(), cell: upper.clone(), recorded: true },
            CardRecord { species: "7".into(), cell: upper, recorded: false },
            CardRecord { species: "7".into(), cell: master[1].to_string(), recorded: true },
        ];

        let result = aggregator
            .aggregate_cards(std::iter::once(Ok::<_, SdmError>(cards)))
            .unwrap();
        assert_eq!(result.matrix.count(&master[0], &"7".into()), 1);
        assert_eq!(result.matrix.count(&master[1], &"7".into()), 1);
        assert_eq!(result.report.not_recorded, 1);
    }

    #[test]
    fn cards_for_unlisted_species_fail() {
        let config = PipelineConfig::default();
        let reference = reference();
        let master = master();
        let aggregator = Aggregator::new(&config, &GridKind::Formula, &master, reference.columns());
        let cards = vec![CardRecord { species: "99".into(), cell: "3355_1825".into(), recorded: true }];
        let err = aggregator
            .aggregate_cards(std::iter::once(Ok::<_, SdmError>(cards)))
            .unwrap_err();
        assert!(matches!(err, SdmError::UnknownSpecies(_)));
    }
}
