use serde::{Deserialize, Serialize};
use std::fmt;

// WGS84 radii
const EQUATOR_RADIUS_M: f64 = 6_371_000.0;
const POLAR_RADIUS_M: f64 = 6_356_800.0;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum BoundingBoxError {
    #[error("Interval begin {begin} is greater than end {end}")]
    InvalidInterval { begin: f64, end: f64 },
    #[error("Expected an even number of coordinates, got {0}")]
    OddCoordinates(usize),
    #[error("Operation requires {expected} dimensions, bounding box has {actual}")]
    WrongDimension { expected: usize, actual: usize },
}

/// A closed interval `[begin, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub begin: f64,
    pub end: f64,
}

impl Interval {
    pub fn new(begin: f64, end: f64) -> Result<Self, BoundingBoxError> {
        if begin > end {
            return Err(BoundingBoxError::InvalidInterval { begin, end });
        }
        Ok(Self { begin, end })
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.begin <= other.end && other.begin <= self.end
    }

    pub fn extent(&self) -> f64 {
        self.end - self.begin
    }

    fn pad(&self, amount: f64) -> Interval {
        Interval {
            begin: self.begin - amount,
            end: self.end + amount,
        }
    }
}

/// An axis-aligned bounding box with an arbitrary number of dimensions.
///
/// A box without any dimension is the full space: it intersects every
/// other box, including boxes of a different dimensionality.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Hyperrectangle {
    extents: Vec<Interval>,
}

impl Hyperrectangle {
    pub fn full_space() -> Self {
        Self::default()
    }

    pub fn new(extents: Vec<Interval>) -> Self {
        Self { extents }
    }

    /// Builds a box from `low0, high0, low1, high1, ...`.
    pub fn from_coordinates(coordinates: &[f64]) -> Result<Self, BoundingBoxError> {
        if coordinates.len() % 2 != 0 {
            return Err(BoundingBoxError::OddCoordinates(coordinates.len()));
        }
        let extents = coordinates
            .chunks_exact(2)
            .map(|pair| Interval::new(pair[0], pair[1]))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { extents })
    }

    pub fn is_full_space(&self) -> bool {
        self.extents.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.extents.len()
    }

    pub fn extents(&self) -> &[Interval] {
        &self.extents
    }

    pub fn low(&self, dimension: usize) -> Option<f64> {
        self.extents.get(dimension).map(|i| i.begin)
    }

    pub fn high(&self, dimension: usize) -> Option<f64> {
        self.extents.get(dimension).map(|i| i.end)
    }

    pub fn intersects(&self, other: &Hyperrectangle) -> bool {
        if self.is_full_space() || other.is_full_space() {
            return true;
        }
        if self.dimension() != other.dimension() {
            return false;
        }
        self.extents
            .iter()
            .zip(&other.extents)
            .all(|(a, b)| a.overlaps(b))
    }

    /// Returns the overlapping part of both boxes, `None` if they are disjoint.
    pub fn intersection(&self, other: &Hyperrectangle) -> Option<Hyperrectangle> {
        if !self.intersects(other) {
            return None;
        }
        if self.is_full_space() {
            return Some(other.clone());
        }
        if other.is_full_space() {
            return Some(self.clone());
        }
        let extents = self
            .extents
            .iter()
            .zip(&other.extents)
            .map(|(a, b)| Interval {
                begin: a.begin.max(b.begin),
                end: a.end.min(b.end),
            })
            .collect();
        Some(Self { extents })
    }

    /// Pads every side of every dimension by `amount`.
    pub fn enlarge_by_amount(&self, amount: f64) -> Hyperrectangle {
        Self {
            extents: self.extents.iter().map(|i| i.pad(amount)).collect(),
        }
    }

    /// Scales every dimension around its center by `factor`.
    pub fn enlarge_by_factor(&self, factor: f64) -> Hyperrectangle {
        Self {
            extents: self
                .extents
                .iter()
                .map(|i| i.pad(i.extent() * (factor - 1.0) / 2.0))
                .collect(),
        }
    }

    /// Enlarges a 2-D box of `(latitude, longitude)` degrees by the given
    /// distances in meters.
    pub fn enlarge_by_meters(
        &self,
        meters_lat: f64,
        meters_lon: f64,
    ) -> Result<Hyperrectangle, BoundingBoxError> {
        if self.dimension() != 2 {
            return Err(BoundingBoxError::WrongDimension {
                expected: 2,
                actual: self.dimension(),
            });
        }
        let latitude = self.extents[0];
        let longitude = self.extents[1];

        let lat0 = latitude.begin.to_radians();
        let deg_per_meter_lon = 360.0 / POLAR_RADIUS_M;
        let deg_per_meter_lat = (360.0 / (lat0.cos() * EQUATOR_RADIUS_M)).abs();

        let diff_lat = meters_lat * deg_per_meter_lat;
        let diff_lon = meters_lon * deg_per_meter_lon;

        Ok(Self {
            extents: vec![latitude.pad(diff_lat / 2.0), longitude.pad(diff_lon / 2.0)],
        })
    }
}

impl fmt::Display for Hyperrectangle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_full_space() {
            return write!(f, "[*]");
        }
        let parts = self
            .extents
            .iter()
            .map(|i| format!("[{},{}]", i.begin, i.end))
            .collect::<Vec<_>>();
        write!(f, "{}", parts.join("x"))
    }
}
