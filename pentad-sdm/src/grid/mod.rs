//! Geographic grids: the formula-derived pentad grid and the table-driven
//! 2km grid. A run picks one [`GridKind`] and uses it for every stage.

mod lookup;
mod pentad;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use lookup::{LookupCell, LookupGrid};
pub use pentad::{Quadrant, PentadCodec};

// --------------------------------------------------------------------------
// CoordGeo

/// A point in decimal degrees.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CoordGeo {
    pub latitude: f64,
    pub longitude: f64,
}

impl CoordGeo {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Returns the coordinate only if both axes are finite and on the globe.
    pub fn checked(latitude: f64, longitude: f64) -> Option<Self> {
        let on_globe = latitude.is_finite()
            && longitude.is_finite()
            && latitude.abs() <= 90.0
            && longitude.abs() <= 180.0;
        on_globe.then_some(Self { latitude, longitude })
    }
}

impl fmt::Display for CoordGeo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ latitude: {}, longitude: {} }}", self.latitude, self.longitude)
    }
}


// --------------------------------------------------------------------------
// GridCellId

/// Identifier of one grid cell. Formula ids and lookup ids share this type but
/// are never comparable across grid kinds.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GridCellId(String);

impl GridCellId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for GridCellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GridCellId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for GridCellId {
    fn from(id: String) -> Self {
        Self(id)
    }
}


// --------------------------------------------------------------------------
// Codec

/// Mapping between coordinates and cells of one grid.
pub trait CellCodec {
    /// The cell containing `coord`, or `None` when the point lies outside the
    /// grid's domain.
    fn encode(&self, coord: &CoordGeo) -> Option<GridCellId>;

    /// The representative corner of `id`.
    fn decode(&self, id: &GridCellId) -> Result<CoordGeo>;
}

/// The grid in use for a run.
#[derive(Clone, Debug)]
pub enum GridKind {
    Formula,
    Lookup(Arc<LookupGrid>),
}

impl GridKind {
    pub fn lookup(grid: LookupGrid) -> Self {
        GridKind::Lookup(Arc::new(grid))
    }

    /// Brings an externally supplied id into the canonical form of this grid.
    /// Card exports spell pentad separators in upper case.
    pub fn normalize(&self, raw: &str) -> GridCellId {
        match self {
            GridKind::Formula => GridCellId(raw.trim().to_ascii_lowercase()),
            GridKind::Lookup(_) => GridCellId(raw.trim().to_owned()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GridKind::Formula => "pentad",
            GridKind::Lookup(_) => "lookup",
        }
    }
}

impl CellCodec for GridKind {
    fn encode(&self, coord: &CoordGeo) -> Option<GridCellId> {
        match self {
            GridKind::Formula => PentadCodec.encode(coord),
            GridKind::Lookup(grid) => grid.encode(coord),
        }
    }

    fn decode(&self, id: &GridCellId) -> Result<CoordGeo> {
        match self {
            GridKind::Formula => PentadCodec.decode(id),
            GridKind::Lookup(grid) => grid.decode(id),
        }
    }
}
