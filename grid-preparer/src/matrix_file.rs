//! Count matrices on disk.
//!
//! `.csv` (optionally `.csv.gz`): `pentad` first, then one column per
//! species, then `total_pentad_observations` for trust-tier matrices.
//!
//! `.pbm` (optionally `.pbm.gz`): length-delimited protobuf, one
//! [`MatrixHeader`] followed by one [`MatrixRow`] per cell. Rows can be
//! streamed back one at a time with [`MatrixRows`].

use std::io::BufRead;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use pentad_sdm::{CountMatrix, GridCellId, SpeciesId, TrustTierMatrix};
use tracing::{debug, info};

use crate::potentially_compressed;
use crate::protobuf_helpers::{read_delimited, write_delimited};

pub const CELL_COLUMN: &str = "pentad";
pub const TOTAL_COLUMN: &str = "total_pentad_observations";

/// Upper bound on counts preallocated from a `.pbm` header's row count.
const MAX_PREALLOCATED: usize = 1 << 20;

#[derive(Clone, PartialEq, prost::Message)]
pub struct MatrixHeader {
    #[prost(string, repeated, tag = "1")]
    pub columns: Vec<String>,
    #[prost(uint64, tag = "2")]
    pub rows: u64,
    #[prost(bool, tag = "3")]
    pub with_totals: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MatrixRow {
    #[prost(string, tag = "1")]
    pub cell: String,
    #[prost(uint64, repeated, tag = "2")]
    pub counts: Vec<u64>,
    #[prost(uint64, optional, tag = "3")]
    pub total: Option<u64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MatrixFormat {
    Csv,
    Protobuf,
}

impl MatrixFormat {
    pub fn for_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("no file name in {}", path.display()))?;
        let name = name.strip_suffix(".gz").unwrap_or(name);
        if name.ends_with(".csv") {
            Ok(MatrixFormat::Csv)
        } else if name.ends_with(".pbm") {
            Ok(MatrixFormat::Protobuf)
        } else {
            bail!("{}: matrix files must end in .csv or .pbm", path.display())
        }
    }
}

pub fn write_matrix(path: &Path, matrix: &CountMatrix) -> Result<()> {
    write(path, matrix, None)
}

pub fn write_tier(path: &Path, tier: &TrustTierMatrix) -> Result<()> {
    write(path, tier.counts(), Some(tier.totals()))
}

fn write(path: &Path, matrix: &CountMatrix, totals: Option<&[u64]>) -> Result<()> {
    let format = MatrixFormat::for_path(path)?;
    let mut out = potentially_compressed::create(path)
        .with_context(|| format!("creating {}", path.display()))?;
    match format {
        MatrixFormat::Csv => {
            let mut writer = csv::Writer::from_writer(&mut out);
            let mut header = vec![CELL_COLUMN];
            header.extend(matrix.columns().iter().map(SpeciesId::as_str));
            if totals.is_some() {
                header.push(TOTAL_COLUMN);
            }
            writer.write_record(&header)?;
            for (row, (cell, counts)) in matrix.rows().enumerate() {
                let mut record = vec![cell.to_string()];
                record.extend(counts.iter().map(u64::to_string));
                if let Some(totals) = totals {
                    record.push(totals[row].to_string());
                }
                writer.write_record(&record)?;
            }
            writer.flush()?;
        }
        MatrixFormat::Protobuf => {
            let header = MatrixHeader {
                columns: matrix.columns().iter().map(SpeciesId::to_string).collect(),
                rows: matrix.height() as u64,
                with_totals: totals.is_some(),
            };
            write_delimited(&mut out, &header)?;
            for (row, (cell, counts)) in matrix.rows().enumerate() {
                let message = MatrixRow {
                    cell: cell.to_string(),
                    counts: counts.to_vec(),
                    total: totals.map(|t| t[row]),
                };
                write_delimited(&mut out, &message)?;
            }
        }
    }
    out.finish()
        .with_context(|| format!("writing {}", path.display()))?;
    info!(
        path = %path.display(),
        cells = matrix.height(),
        columns = matrix.width(),
        "wrote matrix"
    );
    Ok(())
}

/// Streams rows from a `.pbm` stream after its header.
pub struct MatrixRows<R> {
    stream: R,
    header: MatrixHeader,
    read: u64,
}

impl<R: BufRead> MatrixRows<R> {
    pub fn new(mut stream: R) -> Result<Self> {
        let header: MatrixHeader =
            read_delimited(&mut stream)?.context("matrix stream has no header")?;
        debug!(columns = header.columns.len(), rows = header.rows, "matrix header");
        Ok(Self {
            stream,
            header,
            read: 0,
        })
    }

    pub fn header(&self) -> &MatrixHeader {
        &self.header
    }

    fn next_row(&mut self) -> Result<Option<MatrixRow>> {
        let Some(row) = read_delimited::<MatrixRow, _>(&mut self.stream)? else {
            ensure!(
                self.read == self.header.rows,
                "matrix stream ended after {} of {} rows",
                self.read,
                self.header.rows
            );
            return Ok(None);
        };
        self.read += 1;
        ensure!(
            row.counts.len() == self.header.columns.len(),
            "row {} has {} counts for {} columns",
            row.cell,
            row.counts.len(),
            self.header.columns.len()
        );
        Ok(Some(row))
    }
}

impl<R: BufRead> Iterator for MatrixRows<R> {
    type Item = Result<MatrixRow>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

/// Reads a matrix in either format. A totals column, if present, is dropped;
/// totals are always recomputed from the counts.
pub fn read_matrix(path: &Path) -> Result<CountMatrix> {
    let format = MatrixFormat::for_path(path)?;
    let stream =
        potentially_compressed::open(path).with_context(|| format!("opening {}", path.display()))?;
    let matrix = match format {
        MatrixFormat::Csv => read_csv(stream),
        MatrixFormat::Protobuf => read_protobuf(stream),
    }
    .with_context(|| format!("reading matrix {}", path.display()))?;
    info!(
        path = %path.display(),
        cells = matrix.height(),
        columns = matrix.width(),
        "read matrix"
    );
    Ok(matrix)
}

fn read_csv(stream: impl BufRead) -> Result<CountMatrix> {
    let mut reader = csv::Reader::from_reader(stream);
    let headers = reader.headers()?.clone();
    let mut names = headers.iter();
    names.next().context("empty header")?;
    let mut columns: Vec<SpeciesId> = names.map(SpeciesId::from).collect();
    let with_totals = columns.last().map(SpeciesId::as_str) == Some(TOTAL_COLUMN);
    if with_totals {
        columns.pop();
    }

    let mut cells = Vec::new();
    let mut data = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut fields = record.iter();
        let cell = fields.next().context("row without a cell")?;
        cells.push(GridCellId::from(cell));
        for (field, species) in fields.zip(&columns) {
            let n: u64 = field
                .trim()
                .parse()
                .with_context(|| format!("count {field:?} for {cell}/{species}"))?;
            data.push(n);
        }
    }
    Ok(CountMatrix::from_parts(cells, columns, data)?)
}

fn read_protobuf(stream: impl BufRead) -> Result<CountMatrix> {
    let rows = MatrixRows::new(stream)?;
    let columns: Vec<SpeciesId> = rows.header().columns.iter().map(SpeciesId::new).collect();
    let expected = usize::try_from(rows.header().rows).unwrap_or(usize::MAX);
    let mut cells = Vec::with_capacity(expected.min(MAX_PREALLOCATED));
    let mut data = Vec::with_capacity(
        expected
            .checked_mul(columns.len())
            .unwrap_or(usize::MAX)
            .min(MAX_PREALLOCATED),
    );
    for row in rows {
        let row = row?;
        cells.push(GridCellId::new(row.cell));
        data.extend(row.counts);
    }
    Ok(CountMatrix::from_parts(cells, columns, data)?)
}
