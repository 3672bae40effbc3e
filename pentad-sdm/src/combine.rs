//! Merging per-source count matrices into a trust tier.

use std::collections::HashSet;

use tracing::info;

use crate::error::{Result, SdmError};
use crate::grid::GridCellId;
use crate::matrix::CountMatrix;
use crate::species::{ordered_columns, SpeciesId};

/// Summed counts of every source in one tier, with the per-cell grand total
/// used as a measure of survey effort.
#[derive(Clone, Debug, PartialEq)]
pub struct TrustTierMatrix {
    counts: CountMatrix,
    totals: Vec<u64>,
}

impl TrustTierMatrix {
    pub fn counts(&self) -> &CountMatrix {
        &self.counts
    }

    pub fn cells(&self) -> &[GridCellId] {
        self.counts.cells()
    }

    pub fn count(&self, cell: &GridCellId, species: &SpeciesId) -> u64 {
        self.counts.count(cell, species)
    }

    /// `total_cell_observations` of `cell`; zero for cells outside the tier.
    pub fn total(&self, cell: &GridCellId) -> u64 {
        self.counts
            .cell_position(cell)
            .map(|row| self.totals[row])
            .unwrap_or(0)
    }

    pub fn totals(&self) -> &[u64] {
        &self.totals
    }
}

impl From<CountMatrix> for TrustTierMatrix {
    fn from(counts: CountMatrix) -> Self {
        let totals = counts.row_totals();
        Self { counts, totals }
    }
}

/// Sums the matrices of one tier cell by cell and species by species. A cell
/// or column missing from an input contributes zero.
///
/// Output cells are the union of input cells in first-seen order; output
/// columns are the union of input columns in matrix column order.
pub fn combine<'a, I>(matrices: I) -> Result<TrustTierMatrix>
where
    I: IntoIterator<Item = &'a CountMatrix>,
{
    let matrices: Vec<&CountMatrix> = matrices.into_iter().collect();
    if matrices.is_empty() {
        return Err(SdmError::EmptyTier);
    }

    let mut cells: Vec<GridCellId> = Vec::new();
    let mut seen: HashSet<&GridCellId> = HashSet::new();
    for matrix in &matrices {
        for cell in matrix.cells() {
            if seen.insert(cell) {
                cells.push(cell.clone());
            }
        }
    }
    let columns = ordered_columns(
        matrices
            .iter()
            .flat_map(|m| m.columns().iter().cloned()),
    );

    let mut combined = CountMatrix::zeros(cells, columns)?;
    for matrix in &matrices {
        let column_map: Vec<usize> = matrix
            .columns()
            .iter()
            .map(|species| combined.column_position(species))
            .collect::<Option<_>>()
            .ok_or_else(|| SdmError::ShapeMismatch("column vanished while combining".into()))?;
        for (cell, row) in matrix.rows() {
            let Some(target_row) = combined.cell_position(cell) else {
                continue;
            };
            for (&column, &n) in column_map.iter().zip(row) {
                if n > 0 {
                    combined.add_at(target_row, column, n);
                }
            }
        }
    }

    let tier = TrustTierMatrix::from(combined);
    info!(
        sources = matrices.len(),
        cells = tier.cells().len(),
        columns = tier.counts().width(),
        observations = tier.totals().iter().sum::<u64>(),
        "combined tier"
    );
    Ok(tier)
}
