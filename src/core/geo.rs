//! Geodetic Points and Distances
//!
//! WGS-84 latitude/longitude pairs and great-circle distance on a
//! spherical Earth. All distances are in meters.

use std::fmt;
use serde::{Serialize, Deserialize};
use thiserror::Error;

/// Mean Earth radius (meters) for the spherical model.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Maximum absolute latitude (degrees).
pub const MAX_LATITUDE: f64 = 90.0;

/// Maximum absolute longitude (degrees).
pub const MAX_LONGITUDE: f64 = 180.0;

/// Coordinate validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum GeoError {
    /// Latitude or longitude is NaN or infinite.
    #[error("coordinate is not finite: ({latitude}, {longitude})")]
    NonFinite {
        /// Offending latitude.
        latitude: f64,
        /// Offending longitude.
        longitude: f64,
    },
    /// Latitude outside [-90, 90].
    #[error("latitude {0} out of range [-90, 90]")]
    LatitudeOutOfRange(f64),
    /// Longitude outside [-180, 180].
    #[error("longitude {0} out of range [-180, 180]")]
    LongitudeOutOfRange(f64),
}

/// A point on the Earth's surface in degrees. No altitude.
///
/// Fields are public so callers can carry raw, unvalidated input;
/// [`GeoPoint::validate`] is the gate before any distance math.
#[derive(Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees, positive north.
    pub latitude: f64,
    /// Longitude in degrees, positive east.
    pub longitude: f64,
}

impl GeoPoint {
    /// Create a point without validating it.
    #[inline]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Check that both coordinates are finite and in range.
    pub fn validate(&self) -> Result<(), GeoError> {
        if !self.latitude.is_finite() || !self.longitude.is_finite() {
            return Err(GeoError::NonFinite {
                latitude: self.latitude,
                longitude: self.longitude,
            });
        }
        if self.latitude.abs() > MAX_LATITUDE {
            return Err(GeoError::LatitudeOutOfRange(self.latitude));
        }
        if self.longitude.abs() > MAX_LONGITUDE {
            return Err(GeoError::LongitudeOutOfRange(self.longitude));
        }
        Ok(())
    }

    /// Whether [`GeoPoint::validate`] would succeed.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Great-circle distance to another point in meters (haversine).
    pub fn distance_to(&self, other: &GeoPoint) -> f64 {
        haversine_distance(self, other)
    }

    /// Point displaced `meters` due north (negative = south).
    ///
    /// Exact on the spherical model, used to place test fixtures and
    /// catalog entries at known distances.
    pub fn offset_north(&self, meters: f64) -> GeoPoint {
        let dlat = (meters / EARTH_RADIUS_M).to_degrees();
        GeoPoint::new(self.latitude + dlat, self.longitude)
    }

    /// Point displaced `meters` due east along the parallel (negative = west).
    pub fn offset_east(&self, meters: f64) -> GeoPoint {
        let parallel_radius = EARTH_RADIUS_M * self.latitude.to_radians().cos();
        let dlon = (meters / parallel_radius).to_degrees();
        GeoPoint::new(self.latitude, self.longitude + dlon)
    }
}

impl fmt::Debug for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GeoPoint({:.7}, {:.7})", self.latitude, self.longitude)
    }
}

impl fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.latitude, self.longitude)
    }
}

/// Haversine distance between two points, in meters.
///
/// Inputs are assumed valid; the result for NaN coordinates is NaN.
pub fn haversine_distance(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let sin_dlat = (dlat / 2.0).sin();
    let sin_dlon = (dlon / 2.0).sin();
    let h = sin_dlat * sin_dlat + lat_a.cos() * lat_b.cos() * sin_dlon * sin_dlon;

    // Rounding can push h a hair above 1 for antipodal points
    let h = h.clamp(0.0, 1.0);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}
