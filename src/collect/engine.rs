//! Geofence Collection Engine
//!
//! Decides which item drops a position newly satisfies.
//!
//! The engine is a pure function: it reads a position, the ordered drop
//! list and the already-collected set, and returns the identifiers that
//! just came into range. Merging the result and persisting it is the
//! caller's job. A drop that is already collected is never looked at
//! again, so a result can only ever grow the collected set.

use std::collections::BTreeSet;
use thiserror::Error;

use crate::collect::drop::ItemDrop;
use crate::core::geo::{GeoError, GeoPoint};

/// Identifiers a user has already obtained.
pub type CollectedSet = BTreeSet<String>;

/// Collection errors.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum CollectError {
    /// The avatar position is non-finite or out of range.
    #[error("invalid avatar position: {0}")]
    InvalidInput(#[from] GeoError),
}

/// Drops that came into range, in input order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollectionResult {
    newly_collected: Vec<String>,
}

impl CollectionResult {
    /// Newly collected identifiers in drop order.
    pub fn ids(&self) -> &[String] {
        &self.newly_collected
    }

    /// True if nothing new was collected.
    pub fn is_empty(&self) -> bool {
        self.newly_collected.is_empty()
    }

    /// Number of newly collected drops.
    pub fn len(&self) -> usize {
        self.newly_collected.len()
    }

    /// Iterate identifiers in drop order.
    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.newly_collected.iter()
    }

    /// Add every identifier to `collected`. Returns how many were new.
    pub fn merge_into(&self, collected: &mut CollectedSet) -> usize {
        self.newly_collected
            .iter()
            .filter(|id| collected.insert((*id).clone()))
            .count()
    }

    /// Take the identifiers.
    pub fn into_ids(self) -> Vec<String> {
        self.newly_collected
    }
}

impl IntoIterator for CollectionResult {
    type Item = String;
    type IntoIter = std::vec::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.newly_collected.into_iter()
    }
}

/// Check whether a position lies inside a drop's geofence (inclusive).
#[inline]
pub fn within_range(position: &GeoPoint, drop: &ItemDrop) -> bool {
    position.distance_to(&drop.position) <= drop.radius_m
}

/// Evaluate a position against the drops.
///
/// Drops whose identifier is in `collected` are skipped. The result lists
/// newly satisfied drops in the order they appear in `drops`.
pub fn evaluate(
    position: GeoPoint,
    drops: &[ItemDrop],
    collected: &CollectedSet,
) -> Result<CollectionResult, CollectError> {
    position.validate()?;

    let newly_collected = drops
        .iter()
        .filter(|drop| !collected.contains(&drop.id))
        .filter(|drop| within_range(&position, drop))
        .map(|drop| drop.id.clone())
        .collect();

    Ok(CollectionResult { newly_collected })
}
