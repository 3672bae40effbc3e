use std::collections::HashMap;

use crate::error::{Result, SdmError};
use crate::grid::GridCellId;
use crate::species::SpeciesId;

/// Dense grid-cell x species counts, stored row-major: one row per cell,
/// one column per species with the unmapped bucket last.
#[derive(Clone, Debug, PartialEq)]
pub struct CountMatrix {
    cells: Vec<GridCellId>,
    columns: Vec<SpeciesId>,
    cell_index: HashMap<GridCellId, usize>,
    column_index: HashMap<SpeciesId, usize>,
    data: Vec<u64>,
}

impl CountMatrix {
    /// All-zero matrix over the given cells and columns.
    pub fn zeros(cells: Vec<GridCellId>, columns: Vec<SpeciesId>) -> Result<Self> {
        let data = vec![0; cells.len() * columns.len()];
        Self::from_parts(cells, columns, data)
    }

    pub fn from_parts(
        cells: Vec<GridCellId>,
        columns: Vec<SpeciesId>,
        data: Vec<u64>,
    ) -> Result<Self> {
        if data.len() != cells.len() * columns.len() {
            return Err(SdmError::ShapeMismatch(format!(
                "{} values for {} cells x {} columns",
                data.len(),
                cells.len(),
                columns.len()
            )));
        }
        let cell_index = index_of(&cells, "cell")?;
        let column_index = index_of(&columns, "species column")?;
        Ok(Self {
            cells,
            columns,
            cell_index,
            column_index,
            data,
        })
    }

    pub fn cells(&self) -> &[GridCellId] {
        &self.cells
    }

    pub fn columns(&self) -> &[SpeciesId] {
        &self.columns
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn height(&self) -> usize {
        self.cells.len()
    }

    pub fn cell_position(&self, cell: &GridCellId) -> Option<usize> {
        self.cell_index.get(cell).copied()
    }

    pub fn column_position(&self, species: &SpeciesId) -> Option<usize> {
        self.column_index.get(species).copied()
    }

    /// `None` if either the cell or the species is not part of the matrix.
    pub fn get(&self, cell: &GridCellId, species: &SpeciesId) -> Option<u64> {
        let row = self.cell_position(cell)?;
        let column = self.column_position(species)?;
        Some(self.data[row * self.width() + column])
    }

    /// Like [`CountMatrix::get`], reading anything absent as zero.
    pub fn count(&self, cell: &GridCellId, species: &SpeciesId) -> u64 {
        self.get(cell, species).unwrap_or(0)
    }

    pub fn row(&self, cell: &GridCellId) -> Option<&[u64]> {
        self.cell_position(cell).map(|row| self.row_at(row))
    }

    pub fn row_at(&self, row: usize) -> &[u64] {
        let width = self.width();
        &self.data[row * width..(row + 1) * width]
    }

    pub fn rows(&self) -> impl Iterator<Item = (&GridCellId, &[u64])> {
        self.cells
            .iter()
            .enumerate()
            .map(move |(row, cell)| (cell, self.row_at(row)))
    }

    /// Counts of one species down all cells, in cell order.
    pub fn column(&self, species: &SpeciesId) -> Option<impl Iterator<Item = u64> + '_> {
        let column = self.column_position(species)?;
        let width = self.width();
        Some(self.data.iter().skip(column).step_by(width).copied())
    }

    pub fn row_totals(&self) -> Vec<u64> {
        (0..self.height())
            .map(|row| self.row_at(row).iter().sum())
            .collect()
    }

    pub fn total(&self) -> u64 {
        self.data.iter().sum()
    }

    pub(crate) fn add_at(&mut self, row: usize, column: usize, n: u64) {
        let width = self.width();
        self.data[row * width + column] += n;
    }
}

fn index_of<K>(keys: &[K], what: &str) -> Result<HashMap<K, usize>>
where
    K: Clone + Eq + std::hash::Hash + std::fmt::Display,
{
    let mut index = HashMap::with_capacity(keys.len());
    for (position, key) in keys.iter().enumerate() {
        if index.insert(key.clone(), position).is_some() {
            return Err(SdmError::ShapeMismatch(format!("duplicate {what} {key}")));
        }
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix() -> CountMatrix {
        CountMatrix::from_parts(
            vec![GridCellId::from("A"), GridCellId::from("B")],
            vec![SpeciesId::from("7"), SpeciesId::unmapped()],
            vec![1, 1, 1, 0],
        )
        .unwrap()
    }

    #[test]
    fn reads_row_major() {
        let m = matrix();
        assert_eq!(m.get(&"A".into(), &"0".into()), Some(1));
        assert_eq!(m.get(&"B".into(), &"0".into()), Some(0));
        assert_eq!(m.row(&"B".into()), Some(&[1, 0][..]));
        assert_eq!(m.column(&"7".into()).unwrap().collect::<Vec<_>>(), vec![1, 1]);
        assert_eq!(m.row_totals(), vec![2, 1]);
        assert_eq!(m.total(), 3);
    }

    #[test]
    fn absent_keys_count_as_zero() {
        let m = matrix();
        assert_eq!(m.get(&"C".into(), &"7".into()), None);
        assert_eq!(m.count(&"C".into(), &"7".into()), 0);
        assert_eq!(m.count(&"A".into(), &"8".into()), 0);
    }

    #[test]
    fn rejects_bad_shapes() {
        let short = CountMatrix::from_parts(vec!["A".into()], vec!["7".into()], vec![]);
        assert!(matches!(short, Err(SdmError::ShapeMismatch(_))));
        let duplicate = CountMatrix::zeros(vec!["A".into(), "A".into()], vec!["7".into()]);
        assert!(matches!(duplicate, Err(SdmError::ShapeMismatch(_))));
    }
}
