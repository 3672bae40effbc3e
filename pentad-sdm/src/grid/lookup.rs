//! The 2km grid. Cells are named `"{x*100}_{y*100}"` (longitude, negated
//! latitude, both in hundredths of a degree) and resolved by bounding box.

use std::collections::HashMap;

use tracing::debug;

use super::{CellCodec, CoordGeo, GridCellId};
use crate::error::{Result, SdmError};

/// One cell of the lookup table with its inclusive bounding box. `x` is
/// longitude, `y` latitude, both in decimal degrees.
#[derive(Clone, Debug, PartialEq)]
pub struct LookupCell {
    pub id: GridCellId,
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

impl LookupCell {
    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.x_min <= x && x <= self.x_max && self.y_min <= y && y <= self.y_max
    }
}

/// Bounding-box table plus an index over its column and row edges.
///
/// Tables are expected to tile the domain rectilinearly (as the ones built by
/// [`LookupGrid::from_identifiers`] do); each query checks at most four cells.
#[derive(Clone, Debug)]
pub struct LookupGrid {
    cells: Vec<LookupCell>,
    /// Distinct `x_min` values, ascending.
    columns: Vec<f64>,
    /// Distinct `y_max` values, descending.
    rows: Vec<f64>,
    /// (column, row) -> cell indices in table order.
    slots: HashMap<(usize, usize), Vec<usize>>,
}

impl LookupGrid {
    /// Builds the table from raw grid-point identifiers. Each point is the
    /// north-west corner of its cell; a cell extends to the next point east
    /// and south, and the last column / row reuses the previous spacing.
    pub fn from_identifiers<'a, I>(identifiers: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut points = Vec::new();
        for raw in identifiers {
            let id = GridCellId::from(raw.trim());
            let corner = decode_identifier(&id)?;
            points.push((id, hundredths(corner.longitude), hundredths(corner.latitude)));
        }

        let mut xs: Vec<i64> = points.iter().map(|(_, x, _)| *x).collect();
        xs.sort_unstable();
        xs.dedup();
        let mut ys: Vec<i64> = points.iter().map(|(_, _, y)| *y).collect();
        ys.sort_unstable_by(|a, b| b.cmp(a));
        ys.dedup();

        let x_next = next_value_mapping(&xs, "x")?;
        let y_next = next_value_mapping(&ys, "y")?;

        let cells = points
            .into_iter()
            .map(|(id, x, y)| LookupCell {
                id,
                x_min: x as f64 / 100.0,
                x_max: x_next[&x] as f64 / 100.0,
                y_min: y_next[&y] as f64 / 100.0,
                y_max: y as f64 / 100.0,
            })
            .collect();
        Self::from_cells(cells)
    }

    /// Wraps a precomputed table.
    pub fn from_cells(cells: Vec<LookupCell>) -> Result<Self> {
        if cells.is_empty() {
            return Err(SdmError::InvalidGrid("no cells".into()));
        }
        for cell in &cells {
            let ordered = cell.x_min <= cell.x_max && cell.y_min <= cell.y_max;
            let finite = [cell.x_min, cell.x_max, cell.y_min, cell.y_max]
                .iter()
                .all(|v| v.is_finite());
            if !ordered || !finite {
                return Err(SdmError::InvalidGrid(format!("bad bounds for cell {}", cell.id)));
            }
        }

        let mut columns: Vec<f64> = cells.iter().map(|c| c.x_min).collect();
        columns.sort_by(f64::total_cmp);
        columns.dedup();
        let mut rows: Vec<f64> = cells.iter().map(|c| c.y_max).collect();
        rows.sort_by(|a, b| b.total_cmp(a));
        rows.dedup();

        let mut slots: HashMap<(usize, usize), Vec<usize>> = HashMap::new();
        for (index, cell) in cells.iter().enumerate() {
            let column = columns.partition_point(|&x| x < cell.x_min);
            let row = rows.partition_point(|&y| y > cell.y_max);
            slots.entry((column, row)).or_default().push(index);
        }

        debug!(
            cells = cells.len(),
            columns = columns.len(),
            rows = rows.len(),
            "built lookup grid"
        );
        Ok(Self {
            cells,
            columns,
            rows,
            slots,
        })
    }

    pub fn cells(&self) -> &[LookupCell] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// The first cell, in table order, whose box contains (x, y).
    pub fn cell_of(&self, x: f64, y: f64) -> Option<&LookupCell> {
        if !x.is_finite() || !y.is_finite() {
            return None;
        }
        // Last column starting at or west of x, and its western neighbour
        // which shares the edge when x sits exactly on it.
        let column = self.columns.partition_point(|&c| c <= x);
        let row = self.rows.partition_point(|&r| r >= y);
        let column_candidates = [column.checked_sub(1), column.checked_sub(2)];
        let row_candidates = [row.checked_sub(1), row.checked_sub(2)];

        column_candidates
            .iter()
            .flatten()
            .flat_map(|&c| row_candidates.iter().flatten().map(move |&r| (c, r)))
            .filter_map(|slot| self.slots.get(&slot))
            .flatten()
            .copied()
            .filter(|&index| self.cells[index].contains(x, y))
            .min()
            .map(|index| &self.cells[index])
    }
}

impl CellCodec for LookupGrid {
    fn encode(&self, coord: &CoordGeo) -> Option<GridCellId> {
        self.cell_of(coord.longitude, coord.latitude).map(|cell| cell.id.clone())
    }

    fn decode(&self, id: &GridCellId) -> Result<CoordGeo> {
        decode_identifier(id)
    }
}

/// `"x_y"` -> (latitude -y/100, longitude x/100).
pub fn decode_identifier(id: &GridCellId) -> Result<CoordGeo> {
    let (x, y) = id
        .as_str()
        .split_once('_')
        .ok_or_else(|| SdmError::invalid_cell(id, "expected x_y"))?;
    let x: f64 = x
        .trim()
        .parse()
        .map_err(|_| SdmError::invalid_cell(id, "x is not a number"))?;
    let y: f64 = y
        .trim()
        .parse()
        .map_err(|_| SdmError::invalid_cell(id, "y is not a number"))?;
    if !x.is_finite() || !y.is_finite() {
        return Err(SdmError::invalid_cell(id, "non-finite coordinate"));
    }
    Ok(CoordGeo::new(-y / 100.0, x / 100.0))
}

fn hundredths(degrees: f64) -> i64 {
    (degrees * 100.0).round() as i64
}

/// Maps each sorted value to its successor; the last value is pushed one
/// more step with the final gap.
fn next_value_mapping(sorted: &[i64], axis: &str) -> Result<HashMap<i64, i64>> {
    if sorted.len() < 2 {
        return Err(SdmError::InvalidGrid(format!(
            "need at least two distinct {axis} values, found {}",
            sorted.len()
        )));
    }
    let mut mapping: HashMap<i64, i64> = sorted.windows(2).map(|w| (w[0], w[1])).collect();
    let last = sorted[sorted.len() - 1];
    let last_delta = last - sorted[sorted.len() - 2];
    mapping.insert(last, last + last_delta);
    Ok(mapping)
}

#[cfg(test)]
mod tests {
    use super::*;

    // 3 x 2 points spaced 0.02 degrees around 18.00E 33.00S
    const IDS: [&str; 6] = [
        "1800_3300", "1802_3300", "1804_3300", "1800_3302", "1802_3302", "1804_3302",
    ];

    fn grid() -> LookupGrid {
        LookupGrid::from_identifiers(IDS).unwrap()
    }

    #[test]
    fn builds_boxes_with_extrapolated_edges() {
        let grid = grid();
        let first = &grid.cells()[0];
        assert_eq!(first.id.as_str(), "1800_3300");
        assert!((first.x_min - 18.00).abs() < 1e-9);
        assert!((first.x_max - 18.02).abs() < 1e-9);
        assert!((first.y_max + 33.00).abs() < 1e-9);
        assert!((first.y_min + 33.02).abs() < 1e-9);

        let south_east = &grid.cells()[5];
        assert!((south_east.x_max - 18.06).abs() < 1e-9);
        assert!((south_east.y_min + 33.04).abs() < 1e-9);
    }

    #[test]
    fn finds_containing_cell() {
        let grid = grid();
        let cell = grid.cell_of(18.03, -33.01).unwrap();
        assert_eq!(cell.id.as_str(), "1802_3300");
        let cell = grid.cell_of(18.05, -33.03).unwrap();
        assert_eq!(cell.id.as_str(), "1804_3302");
    }

    #[test]
    fn shared_edges_resolve_to_first_cell() {
        let grid = grid();
        // on the border between the first two columns
        let cell = grid.cell_of(18.02, -33.01).unwrap();
        assert_eq!(cell.id.as_str(), "1800_3300");
    }

    #[test]
    fn outside_domain_is_none() {
        let grid = grid();
        assert!(grid.cell_of(17.99, -33.01).is_none());
        assert!(grid.cell_of(18.01, -32.99).is_none());
        assert!(grid.cell_of(18.07, -33.01).is_none());
        assert!(grid.cell_of(f64::NAN, -33.01).is_none());
    }

    #[test]
    fn decode_negates_y() {
        let coord = decode_identifier(&GridCellId::from("1802_3304")).unwrap();
        assert!((coord.longitude - 18.02).abs() < 1e-12);
        assert!((coord.latitude + 33.04).abs() < 1e-12);
    }

    #[test]
    fn decoded_corner_lies_in_own_box() {
        let grid = grid();
        for cell in grid.cells() {
            let corner = grid.decode(&cell.id).unwrap();
            assert!(cell.contains(corner.longitude, corner.latitude));
        }
    }

    #[test]
    fn single_column_cannot_be_extrapolated() {
        let err = LookupGrid::from_identifiers(["1800_3300", "1800_3302"]).unwrap_err();
        assert!(matches!(err, SdmError::InvalidGrid(_)));
    }
}
