//! CSV tables that feed and leave the pipeline.

use std::collections::{BTreeMap, HashSet};
use std::io::BufRead;
use std::path::Path;

use anyhow::{bail, Context, Result};
use pentad_sdm::covariates::TrainingRow;
use pentad_sdm::grid::LookupCell;
use pentad_sdm::species::{NameMatchReport, ReferenceSpecies};
use pentad_sdm::{CovariateTable, GridCellId, GridKind, LookupGrid, SpeciesId, SpeciesReference};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::potentially_compressed;

const ID_COLUMN: &str = "SABAP2_number";
const COMMON_NAME_COLUMN: &str = "SA_name";
const SCIENTIFIC_NAME_COLUMN: &str = "Scientific_name";
const PENTAD_COLUMN: &str = "pentad";
const IDENTIFIER_COLUMN: &str = "IDENTIFIER";

fn csv_reader(path: &Path) -> Result<csv::Reader<Box<dyn BufRead + Send>>> {
    let stream =
        potentially_compressed::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(csv::Reader::from_reader(stream))
}

fn column(headers: &csv::StringRecord, name: &str, path: &Path) -> Result<usize> {
    headers
        .iter()
        .position(|h| h.trim() == name)
        .with_context(|| format!("{}: no column {name:?}", path.display()))
}


// --------------------------------------------------------------------------
// Species reference

/// Every column ending in `_name`, other than the common and scientific
/// names, is a per-source spelling column.
pub fn read_reference(path: &Path) -> Result<SpeciesReference> {
    let mut reader = csv_reader(path)?;
    let headers = reader.headers()?.clone();
    let id = column(&headers, ID_COLUMN, path)?;
    let common = column(&headers, COMMON_NAME_COLUMN, path)?;
    let scientific = column(&headers, SCIENTIFIC_NAME_COLUMN, path)?;
    let name_columns: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|&(i, h)| h.ends_with("_name") && i != common && i != scientific)
        .map(|(i, h)| (i, h.trim().to_owned()))
        .collect();

    let mut species = Vec::new();
    for record in reader.records() {
        let record = record?;
        let field = |i: usize| record.get(i).unwrap_or("").trim().to_owned();
        let source_names: BTreeMap<String, String> = name_columns
            .iter()
            .map(|(i, name)| (name.clone(), field(*i)))
            .filter(|(_, value)| !value.is_empty())
            .collect();
        species.push(ReferenceSpecies {
            id: SpeciesId::new(field(id)),
            common_name: field(common),
            scientific_name: field(scientific),
            source_names,
        });
    }

    let reference = SpeciesReference::new(name_columns.into_iter().map(|(_, n)| n), species)
        .with_context(|| format!("reference list {}", path.display()))?;
    info!(
        species = reference.len(),
        name_columns = ?reference.name_columns().collect::<Vec<_>>(),
        "loaded reference list"
    );
    Ok(reference)
}


// --------------------------------------------------------------------------
// Grids

/// Master grid cell ids from a `pentad` or `IDENTIFIER` column, in file
/// order, normalized for `grid`. Duplicates are dropped.
pub fn read_master_grid(path: &Path, grid: &GridKind) -> Result<Vec<GridCellId>> {
    let mut reader = csv_reader(path)?;
    let headers = reader.headers()?.clone();
    let index = column(&headers, PENTAD_COLUMN, path)
        .or_else(|_| column(&headers, IDENTIFIER_COLUMN, path))?;

    let mut seen = HashSet::new();
    let mut cells = Vec::new();
    for record in reader.records() {
        let record = record?;
        let raw = record.get(index).unwrap_or("");
        if raw.trim().is_empty() {
            continue;
        }
        let cell = grid.normalize(raw);
        if seen.insert(cell.clone()) {
            cells.push(cell);
        } else {
            warn!(%cell, "duplicate cell in master grid");
        }
    }
    info!(cells = cells.len(), grid = grid.name(), "loaded master grid");
    Ok(cells)
}

/// Raw `IDENTIFIER` values of a lookup grid point list.
pub fn read_identifiers(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv_reader(path)?;
    let headers = reader.headers()?.clone();
    let index = column(&headers, IDENTIFIER_COLUMN, path)?;
    let mut identifiers = Vec::new();
    for record in reader.records() {
        let record = record?;
        if let Some(id) = record.get(index).map(str::trim).filter(|id| !id.is_empty()) {
            identifiers.push(id.to_owned());
        }
    }
    Ok(identifiers)
}

#[derive(Debug, Serialize, Deserialize)]
struct LookupRow {
    #[serde(rename = "IDENTIFIER")]
    id: String,
    x_min: f64,
    x_max: f64,
    y_min: f64,
    y_max: f64,
}

pub fn write_lookup_grid(path: &Path, grid: &LookupGrid) -> Result<()> {
    let mut out = potentially_compressed::create(path)?;
    {
        let mut writer = csv::Writer::from_writer(&mut out);
        for cell in grid.cells() {
            writer.serialize(LookupRow {
                id: cell.id.to_string(),
                x_min: cell.x_min,
                x_max: cell.x_max,
                y_min: cell.y_min,
                y_max: cell.y_max,
            })?;
        }
        writer.flush()?;
    }
    out.finish()?;
    info!(path = %path.display(), cells = grid.len(), "wrote lookup grid");
    Ok(())
}

pub fn read_lookup_grid(path: &Path) -> Result<LookupGrid> {
    let mut reader = csv_reader(path)?;
    let mut cells = Vec::new();
    for row in reader.deserialize() {
        let row: LookupRow = row.with_context(|| format!("reading {}", path.display()))?;
        cells.push(LookupCell {
            id: GridCellId::new(row.id),
            x_min: row.x_min,
            x_max: row.x_max,
            y_min: row.y_min,
            y_max: row.y_max,
        });
    }
    let grid = LookupGrid::from_cells(cells)?;
    info!(cells = grid.len(), "loaded lookup grid");
    Ok(grid)
}


// --------------------------------------------------------------------------
// Covariates

/// First column is the cell id; every other column is numeric. Empty and
/// unparseable fields are missing values.
pub fn read_covariates(path: &Path, grid: &GridKind) -> Result<CovariateTable> {
    let mut reader = csv_reader(path)?;
    let headers = reader.headers()?.clone();
    if headers.is_empty() {
        bail!("{}: empty covariate header", path.display());
    }
    let columns: Vec<String> = headers.iter().skip(1).map(|h| h.trim().to_owned()).collect();
    let mut table = CovariateTable::new(columns)?;
    for record in reader.records() {
        let record = record?;
        let mut fields = record.iter();
        let cell = grid.normalize(fields.next().unwrap_or(""));
        let values = fields
            .map(|f| f.trim().parse::<f64>().ok().filter(|v| v.is_finite()))
            .collect();
        table
            .push_row(cell, values)
            .with_context(|| format!("reading {}", path.display()))?;
    }
    info!(
        path = %path.display(),
        cells = table.len(),
        columns = table.columns().len(),
        "loaded covariates"
    );
    Ok(table)
}

fn optional(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

pub fn write_covariates(path: &Path, table: &CovariateTable) -> Result<()> {
    let mut out = potentially_compressed::create(path)?;
    {
        let mut writer = csv::Writer::from_writer(&mut out);
        let mut header = vec![PENTAD_COLUMN.to_owned()];
        header.extend(table.columns().iter().cloned());
        writer.write_record(&header)?;
        for cell in table.cells() {
            let mut record = vec![cell.to_string()];
            if let Some(row) = table.row(cell) {
                record.extend(row.iter().copied().map(optional));
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
    }
    out.finish()?;
    Ok(())
}

pub fn write_training_rows(path: &Path, columns: &[String], rows: &[TrainingRow]) -> Result<()> {
    let mut out = potentially_compressed::create(path)?;
    {
        let mut writer = csv::Writer::from_writer(&mut out);
        let mut header = vec![PENTAD_COLUMN.to_owned()];
        header.extend(columns.iter().cloned());
        header.extend(
            ["target_observations", "total_observations", "target"].map(str::to_owned),
        );
        writer.write_record(&header)?;
        for row in rows {
            let mut record = vec![row.cell.to_string()];
            record.extend(row.covariates.iter().copied().map(optional));
            record.push(row.target_observations.to_string());
            record.push(row.total_observations.to_string());
            record.push(row.target.target().to_string());
            writer.write_record(&record)?;
        }
        writer.flush()?;
    }
    out.finish()?;
    Ok(())
}


// --------------------------------------------------------------------------
// Name report

/// Writes matched `(SABAP2_number, Scientific_name, <column>)` rows to
/// `mapping` and the reference species left unmatched to `unmatched`.
pub fn write_name_report(
    mapping: &Path,
    unmatched: &Path,
    column_name: &str,
    report: &NameMatchReport,
) -> Result<()> {
    let mut writer = csv::Writer::from_path(mapping)
        .with_context(|| format!("creating {}", mapping.display()))?;
    writer.write_record([ID_COLUMN, SCIENTIFIC_NAME_COLUMN, column_name])?;
    for (id, name) in &report.matched {
        writer.write_record([id.as_str(), name.as_str(), name.as_str()])?;
    }
    writer.flush()?;

    let mut writer = csv::Writer::from_path(unmatched)
        .with_context(|| format!("creating {}", unmatched.display()))?;
    writer.write_record([ID_COLUMN, SCIENTIFIC_NAME_COLUMN, COMMON_NAME_COLUMN])?;
    for species in &report.unmatched {
        writer.write_record([
            species.id.as_str(),
            species.scientific_name.as_str(),
            species.common_name.as_str(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pentad_sdm::labels::Label;
    use pretty_assertions::assert_eq;

    fn write(dir: &Path, name: &str, text: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn reference_picks_up_source_name_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "birds.csv",
            "SABAP2_number,SA_name,Scientific_name,ebirds_name,inat_name\n\
             7,Spotted Eagle-Owl,Bubo africanus,Bubo africanus,\n\
             12,Cape Sparrow,Passer melanurus,Passer melanurus,Passer melanurus\n",
        );
        let reference = read_reference(&path).unwrap();
        assert_eq!(reference.len(), 2);
        assert_eq!(reference.name_columns().collect::<Vec<_>>(), ["ebirds_name", "inat_name"]);
        let owl = reference.get(&"7".into()).unwrap();
        assert_eq!(owl.common_name, "Spotted Eagle-Owl");
        assert!(!owl.source_names.contains_key("inat_name"));
    }

    #[test]
    fn master_grid_is_normalized_and_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "pentads.csv", "pentad\n3355_1825\n0100C0200\n3355_1825\n");
        let cells = read_master_grid(&path, &GridKind::Formula).unwrap();
        assert_eq!(cells, vec![GridCellId::from("3355_1825"), GridCellId::from("0100c0200")]);
    }

    #[test]
    fn lookup_grid_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let ids = ["1800_3300", "1802_3300", "1800_3302", "1802_3302"];
        let grid = LookupGrid::from_identifiers(ids).unwrap();
        let path = dir.path().join("grid_2km.csv");
        write_lookup_grid(&path, &grid).unwrap();
        let back = read_lookup_grid(&path).unwrap();
        assert_eq!(back.cells(), grid.cells());
    }

    #[test]
    fn covariates_treat_blanks_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "cov.csv", "pentad,rain,elev\n3355_1825,1.5,\n0100C0200,,NaN\n");
        let table = read_covariates(&path, &GridKind::Formula).unwrap();
        assert_eq!(table.row(&"3355_1825".into()).unwrap(), &[Some(1.5), None]);
        assert_eq!(table.row(&"0100c0200".into()).unwrap(), &[None, None]);
    }

    #[test]
    fn training_rows_are_written_with_targets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("7.csv");
        let rows = vec![TrainingRow {
            cell: "3355_1825".into(),
            covariates: vec![Some(0.5), None],
            target_observations: 3,
            total_observations: 9,
            target: Label::PseudoAbsence,
        }];
        write_training_rows(&path, &["rain".into(), "elev".into()], &rows).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "pentad,rain,elev,target_observations,total_observations,target\n3355_1825,0.5,,3,9,0\n"
        );
    }
}
