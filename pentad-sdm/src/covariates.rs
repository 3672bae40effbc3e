//! Environmental covariates per grid cell and the labelled training rows
//! built from them.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::error::{Result, SdmError};
use crate::grid::GridCellId;
use crate::labels::{Label, LabelSet};

/// Cells x named numeric columns, row-major. `None` is a missing value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CovariateTable {
    columns: Vec<String>,
    cells: Vec<GridCellId>,
    index: HashMap<GridCellId, usize>,
    values: Vec<Option<f64>>,
}

impl CovariateTable {
    pub fn new(columns: Vec<String>) -> Result<Self> {
        let mut seen = HashSet::new();
        if let Some(duplicate) = columns.iter().find(|c| !seen.insert(c.as_str())) {
            return Err(SdmError::ShapeMismatch(format!("duplicate covariate column {duplicate}")));
        }
        Ok(Self {
            columns,
            ..Self::default()
        })
    }

    pub fn push_row(&mut self, cell: GridCellId, values: Vec<Option<f64>>) -> Result<()> {
        if values.len() != self.columns.len() {
            return Err(SdmError::ShapeMismatch(format!(
                "{} values for {} covariate columns in cell {cell}",
                values.len(),
                self.columns.len()
            )));
        }
        if self.index.contains_key(&cell) {
            return Err(SdmError::ShapeMismatch(format!("duplicate covariate cell {cell}")));
        }
        self.index.insert(cell.clone(), self.cells.len());
        self.cells.push(cell);
        self.values.extend(values);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn cells(&self) -> &[GridCellId] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn row(&self, cell: &GridCellId) -> Option<&[Option<f64>]> {
        let row = *self.index.get(cell)?;
        Some(self.row_at(row))
    }

    fn row_at(&self, row: usize) -> &[Option<f64>] {
        let width = self.columns.len();
        &self.values[row * width..(row + 1) * width]
    }

    pub fn get(&self, cell: &GridCellId, column: &str) -> Option<f64> {
        let column = self.columns.iter().position(|c| c == column)?;
        self.row(cell)?[column]
    }

    /// Merges two covariate sources by cell. Columns are `self`'s followed by
    /// `other`'s; a cell present in only one side gets `None` for the other
    /// side's columns. Column names must not overlap.
    pub fn outer_join(&self, other: &CovariateTable) -> Result<CovariateTable> {
        let mut columns = self.columns.clone();
        columns.extend(other.columns.iter().cloned());
        let mut joined = CovariateTable::new(columns)?;

        let missing_left = vec![None; self.columns.len()];
        let missing_right = vec![None; other.columns.len()];
        for cell in &self.cells {
            let mut values = self.row(cell).map(<[_]>::to_vec).unwrap_or_default();
            values.extend_from_slice(other.row(cell).unwrap_or(&missing_right[..]));
            joined.push_row(cell.clone(), values)?;
        }
        for cell in other.cells.iter().filter(|c| !self.index.contains_key(*c)) {
            let mut values = missing_left.clone();
            values.extend_from_slice(other.row(cell).unwrap_or(&missing_right[..]));
            joined.push_row(cell.clone(), values)?;
        }
        debug!(
            left = self.len(),
            right = other.len(),
            joined = joined.len(),
            "outer joined covariates"
        );
        Ok(joined)
    }

    /// Z-scores every column in place using the population standard deviation
    /// over present values. A constant column becomes all zeros. Missing
    /// values are then filled with the standardized column mean, zero; a
    /// column with no values at all is zero throughout.
    pub fn standardize(&mut self) {
        let width = self.columns.len();
        for column in 0..width {
            let present: Vec<f64> = self
                .values
                .iter()
                .skip(column)
                .step_by(width)
                .filter_map(|v| *v)
                .collect();
            let (mean, std) = if present.is_empty() {
                (0.0, 0.0)
            } else {
                let n = present.len() as f64;
                let mean = present.iter().sum::<f64>() / n;
                let variance = present.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
                (mean, variance.sqrt())
            };

            for value in self.values.iter_mut().skip(column).step_by(width) {
                *value = Some(match *value {
                    Some(v) if std > 0.0 => (v - mean) / std,
                    _ => 0.0,
                });
            }
        }
        info!(cells = self.len(), columns = width, "standardized covariates");
    }

    /// One training row per covariate cell, joined with the labels of one
    /// species. Cells without a label get `Label::Unknown` and zero counts.
    pub fn training_rows(&self, labels: &LabelSet) -> Vec<TrainingRow> {
        let by_cell: HashMap<&GridCellId, _> =
            labels.rows.iter().map(|row| (&row.cell, row)).collect();
        self.cells
            .iter()
            .enumerate()
            .map(|(position, cell)| {
                let label = by_cell.get(cell);
                TrainingRow {
                    cell: cell.clone(),
                    covariates: self.row_at(position).to_vec(),
                    target_observations: label.map_or(0, |l| l.target_observations),
                    total_observations: label.map_or(0, |l| l.total_observations),
                    target: label.map_or(Label::Unknown, |l| l.label),
                }
            })
            .collect()
    }
}

/// Covariates of one cell with its label for one species.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainingRow {
    pub cell: GridCellId,
    /// In [`CovariateTable::columns`] order.
    pub covariates: Vec<Option<f64>>,
    pub target_observations: u64,
    pub total_observations: u64,
    pub target: Label,
}
