//! The pentad grid: 5 x 5 arc-minute cells named `<lat><sep><lon>`, where each
//! numeral is `degrees ‖ tens-of-minutes ‖ 0|5` and the separator encodes the
//! hemisphere pair.

use super::{CellCodec, CoordGeo, GridCellId};
use crate::error::{Result, SdmError};

const MAS_PER_DEGREE: i64 = 3_600_000;
const MAS_PER_MINUTE: i64 = 60_000;

/// Hemisphere pair of a pentad, one separator character each.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Quadrant {
    /// South of the equator, east of Greenwich.
    SouthEast,
    /// South and west.
    SouthWest,
    /// North and west.
    NorthWest,
    /// North and east.
    NorthEast,
}

impl Quadrant {
    /// Zero counts as north / east; a negative zero (as produced when decoding
    /// a southern or western cell at 0°00') counts as south / west so decoding
    /// and re-encoding stay in the same cell.
    pub fn of(latitude: f64, longitude: f64) -> Self {
        match (latitude.is_sign_negative(), longitude.is_sign_negative()) {
            (true, false) => Quadrant::SouthEast,
            (true, true) => Quadrant::SouthWest,
            (false, true) => Quadrant::NorthWest,
            (false, false) => Quadrant::NorthEast,
        }
    }

    pub fn separator(self) -> char {
        match self {
            Quadrant::SouthEast => '_',
            Quadrant::SouthWest => 'a',
            Quadrant::NorthWest => 'b',
            Quadrant::NorthEast => 'c',
        }
    }

    pub fn from_separator(c: char) -> Option<Self> {
        match c {
            '_' => Some(Quadrant::SouthEast),
            'a' | 'A' => Some(Quadrant::SouthWest),
            'b' | 'B' => Some(Quadrant::NorthWest),
            'c' | 'C' => Some(Quadrant::NorthEast),
            _ => None,
        }
    }

    /// (latitude sign, longitude sign)
    pub fn signs(self) -> (f64, f64) {
        match self {
            Quadrant::SouthEast => (-1.0, 1.0),
            Quadrant::SouthWest => (-1.0, -1.0),
            Quadrant::NorthWest => (1.0, -1.0),
            Quadrant::NorthEast => (1.0, 1.0),
        }
    }
}

/// Codec for the formula grid. Stateless.
#[derive(Copy, Clone, Debug, Default)]
pub struct PentadCodec;

impl PentadCodec {
    pub fn cell_of(latitude: f64, longitude: f64) -> GridCellId {
        let separator = Quadrant::of(latitude, longitude).separator();
        GridCellId::new(format!(
            "{}{}{}",
            axis_numeral(latitude),
            separator,
            axis_numeral(longitude)
        ))
    }

    pub fn cell_to_coord(id: &GridCellId) -> Result<CoordGeo> {
        let text = id.as_str();
        let mut separators = text.char_indices().filter(|(_, c)| !c.is_ascii_digit());
        let (at, sep) = separators
            .next()
            .ok_or_else(|| SdmError::invalid_cell(id, "missing quadrant separator"))?;
        if separators.next().is_some() {
            return Err(SdmError::invalid_cell(id, "more than one separator"));
        }
        let quadrant = Quadrant::from_separator(sep)
            .ok_or_else(|| SdmError::invalid_cell(id, "unknown quadrant separator"))?;
        let (lat_sign, lon_sign) = quadrant.signs();

        let latitude = parse_numeral(id, &text[..at])?;
        let longitude = parse_numeral(id, &text[at + sep.len_utf8()..])?;
        Ok(CoordGeo::new(lat_sign * latitude, lon_sign * longitude))
    }
}

impl CellCodec for PentadCodec {
    fn encode(&self, coord: &CoordGeo) -> Option<GridCellId> {
        Some(Self::cell_of(coord.latitude, coord.longitude))
    }

    fn decode(&self, id: &GridCellId) -> Result<CoordGeo> {
        Self::cell_to_coord(id)
    }
}

/// `degrees ‖ tens ‖ fives`, left-padded with zeros to four characters.
fn axis_numeral(value: f64) -> String {
    // Round once to whole milli-arc-seconds; every bucket boundary below is an
    // integer comparison.
    let mas = (value.abs() * MAS_PER_DEGREE as f64).round() as i64;
    let degrees = mas / MAS_PER_DEGREE;
    let minutes = (mas % MAS_PER_DEGREE) / MAS_PER_MINUTE;
    let tens = minutes / 10;
    let fives = if minutes % 10 < 5 { 0 } else { 5 };
    format!("{:0>4}", format!("{degrees}{tens}{fives}"))
}

fn parse_numeral(id: &GridCellId, numeral: &str) -> Result<f64> {
    if numeral.len() < 3 {
        return Err(SdmError::invalid_cell(id, "numeral shorter than three digits"));
    }
    let (degrees, minutes) = numeral.split_at(numeral.len() - 2);
    let degrees: u32 = degrees
        .parse()
        .map_err(|_| SdmError::invalid_cell(id, "degrees are not a number"))?;
    let minutes: u32 = minutes
        .parse()
        .map_err(|_| SdmError::invalid_cell(id, "minutes are not a number"))?;
    if minutes >= 60 {
        return Err(SdmError::invalid_cell(id, "minutes out of range"));
    }
    Ok(f64::from(degrees) + f64::from(minutes) / 60.0)
}
