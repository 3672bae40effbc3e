//! Batched readers over observation exports and checklist card files.

use std::collections::VecDeque;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pentad_sdm::{CardRecord, RawRecord, SpeciesId};
use tracing::{debug, info, warn};

use crate::potentially_compressed;

/// Column names of an observation export.
#[derive(Clone, Debug)]
pub struct ObservationColumns {
    pub species: String,
    pub latitude: String,
    pub longitude: String,
    pub delimiter: u8,
}

impl Default for ObservationColumns {
    fn default() -> Self {
        Self {
            species: "species".into(),
            latitude: "decimalLatitude".into(),
            longitude: "decimalLongitude".into(),
            delimiter: b'\t',
        }
    }
}

type Source = csv::Reader<Box<dyn BufRead + Send>>;

fn open_csv(path: &Path, delimiter: u8) -> Result<Source> {
    let stream =
        potentially_compressed::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .quoting(delimiter != b'\t')
        .from_reader(stream))
}

fn position(headers: &csv::StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h.trim() == name)
}


// --------------------------------------------------------------------------
// Observations

/// Yields [`RawRecord`] batches of at most `batch_size` rows. Fields that are
/// missing or do not parse become `None`; the aggregator counts them.
pub struct ObservationBatches {
    reader: Source,
    species: Option<usize>,
    latitude: usize,
    longitude: usize,
    batch_size: usize,
    record: csv::StringRecord,
    done: bool,
}

impl ObservationBatches {
    /// `require_species` is false for single-species exports, which often
    /// carry coordinates only.
    pub fn open(
        path: &Path,
        columns: &ObservationColumns,
        batch_size: usize,
        require_species: bool,
    ) -> Result<Self> {
        let mut reader = open_csv(path, columns.delimiter)?;
        let headers = reader.headers()?.clone();
        let missing = |name: &str| format!("{}: no column {name:?}", path.display());
        let species = position(&headers, &columns.species);
        if require_species && species.is_none() {
            anyhow::bail!(missing(&columns.species));
        }
        let latitude = position(&headers, &columns.latitude).with_context(|| missing(&columns.latitude))?;
        let longitude =
            position(&headers, &columns.longitude).with_context(|| missing(&columns.longitude))?;
        debug!(?species, latitude, longitude, "observation columns");
        Ok(Self {
            reader,
            species,
            latitude,
            longitude,
            batch_size: batch_size.max(1),
            record: csv::StringRecord::new(),
            done: false,
        })
    }

    fn parse(&self) -> RawRecord {
        let field = |i: usize| self.record.get(i).map(str::trim).filter(|f| !f.is_empty());
        let number = |i: usize| field(i).and_then(|f| f.parse::<f64>().ok());
        RawRecord {
            species: self.species.and_then(field).map(str::to_owned),
            latitude: number(self.latitude),
            longitude: number(self.longitude),
        }
    }

    fn next_batch(&mut self) -> Result<Option<Vec<RawRecord>>, csv::Error> {
        if self.done {
            return Ok(None);
        }
        let mut batch = Vec::with_capacity(self.batch_size.min(1 << 16));
        while batch.len() < self.batch_size {
            if !self.reader.read_record(&mut self.record)? {
                self.done = true;
                break;
            }
            batch.push(self.parse());
        }
        Ok((!batch.is_empty()).then_some(batch))
    }
}

impl Iterator for ObservationBatches {
    type Item = Result<Vec<RawRecord>, csv::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.next_batch();
        if next.is_err() {
            self.done = true;
        }
        next.transpose()
    }
}

/// Distinct values of the species column, for name matching.
pub fn distinct_species(path: &Path, columns: &ObservationColumns) -> Result<Vec<String>> {
    let mut names = std::collections::BTreeSet::new();
    for batch in ObservationBatches::open(path, columns, 1 << 16, true)? {
        names.extend(batch?.into_iter().filter_map(|r| r.species));
    }
    info!(path = %path.display(), names = names.len(), "collected species names");
    Ok(names.into_iter().collect())
}


// --------------------------------------------------------------------------
// Cards

pub const CARD_CELL_COLUMN: &str = "Pentad";
pub const CARD_NAME_COLUMN: &str = "Taxonomic_name";
/// `Taxonomic_name` value of a card on which the species was not recorded.
/// Any other value, blank included, counts as recorded.
pub const NOT_RECORDED: &str = "-";

/// Per-species card files named `<species id>.csv`, in id order.
pub fn card_files(dir: &Path) -> Result<Vec<(SpeciesId, PathBuf)>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("csv") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if stem.parse::<u64>().is_err() {
            warn!(path = %path.display(), "card file not named after a species id");
            continue;
        }
        files.push((SpeciesId::new(stem), path));
    }
    files.sort();
    Ok(files)
}

/// Yields card batches across a set of per-species files, one file after
/// another. Empty files are skipped.
pub struct CardBatches {
    files: VecDeque<(SpeciesId, PathBuf)>,
    current: Option<(SpeciesId, Source, usize, usize)>,
    batch_size: usize,
}

impl CardBatches {
    pub fn new(files: Vec<(SpeciesId, PathBuf)>, batch_size: usize) -> Self {
        Self {
            files: files.into(),
            current: None,
            batch_size: batch_size.max(1),
        }
    }

    fn open_next(&mut self) -> Result<bool> {
        while let Some((species, path)) = self.files.pop_front() {
            if std::fs::metadata(&path)?.len() == 0 {
                warn!(path = %path.display(), "empty card file");
                continue;
            }
            let mut reader = open_csv(&path, b',')?;
            let headers = reader.headers()?.clone();
            let cell = position(&headers, CARD_CELL_COLUMN)
                .with_context(|| format!("{}: no column {CARD_CELL_COLUMN}", path.display()))?;
            let name = position(&headers, CARD_NAME_COLUMN)
                .with_context(|| format!("{}: no column {CARD_NAME_COLUMN}", path.display()))?;
            debug!(%species, path = %path.display(), "reading cards");
            self.current = Some((species, reader, cell, name));
            return Ok(true);
        }
        Ok(false)
    }

    fn next_batch(&mut self) -> Result<Option<Vec<CardRecord>>> {
        let mut batch = Vec::new();
        let mut record = csv::StringRecord::new();
        while batch.len() < self.batch_size {
            let Some((species, reader, cell, name)) = self.current.as_mut() else {
                if self.open_next()? {
                    continue;
                }
                break;
            };
            if !reader.read_record(&mut record)? {
                self.current = None;
                continue;
            }
            let taxon = record.get(*name).unwrap_or("").trim();
            batch.push(CardRecord {
                species: species.clone(),
                cell: record.get(*cell).unwrap_or("").to_owned(),
                recorded: taxon != NOT_RECORDED,
            });
        }
        Ok((!batch.is_empty()).then_some(batch))
    }
}

impl Iterator for CardBatches {
    type Item = Result<Vec<CardRecord>>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.next_batch();
        if next.is_err() {
            self.files.clear();
            self.current = None;
        }
        next.transpose()
    }
}
