//! Core geodesy primitives.
//!
//! Everything in this module is pure and allocation-free.

pub mod geo;

// Re-export core types
pub use geo::{GeoPoint, GeoError, haversine_distance, EARTH_RADIUS_M};
