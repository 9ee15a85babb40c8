//! Item Drops and the Drop Catalog
//!
//! Item drops are fixed geofences with a cosmetic attached. The catalog is
//! loaded once at startup and validated up front: a malformed drop stops
//! the load instead of being skipped.

use std::collections::BTreeMap;
use std::path::Path;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::info;

use crate::core::geo::GeoPoint;

/// Cosmetic slot an item occupies on the avatar.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemSlot {
    /// Worn on the head.
    Hat,
    /// Worn on the body.
    Body,
    /// Held or floating around the avatar.
    Outside,
}

impl ItemSlot {
    /// All slots in display order.
    pub const ALL: [ItemSlot; 3] = [ItemSlot::Hat, ItemSlot::Body, ItemSlot::Outside];

    /// Wire name of the slot.
    pub fn as_str(self) -> &'static str {
        match self {
            ItemSlot::Hat => "hat",
            ItemSlot::Body => "body",
            ItemSlot::Outside => "outside",
        }
    }
}

/// A collectible item pinned to a circular geofence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemDrop {
    /// Unique key, e.g. `hat_crown`.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Display description.
    #[serde(default)]
    pub description: String,
    /// Icon reference (path or URL), opaque to the server.
    #[serde(default)]
    pub icon: String,
    /// Slot the item is equipped in.
    pub slot: ItemSlot,
    /// Geofence center.
    #[serde(flatten)]
    pub position: GeoPoint,
    /// Geofence radius in meters.
    pub radius_m: f64,
}

impl ItemDrop {
    /// Create a drop with empty description and icon.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        slot: ItemSlot,
        position: GeoPoint,
        radius_m: f64,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            icon: String::new(),
            slot,
            position,
            radius_m,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the icon reference.
    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = icon.into();
        self
    }

    /// Check a single drop in isolation.
    fn validate(&self) -> Result<(), CatalogError> {
        if self.id.trim().is_empty() {
            return Err(CatalogError::invalid(&self.id, "empty identifier"));
        }
        if !self.radius_m.is_finite() {
            return Err(CatalogError::invalid(&self.id, "radius is not finite"));
        }
        if self.radius_m < 0.0 {
            return Err(CatalogError::invalid(
                &self.id,
                format!("negative radius {}", self.radius_m),
            ));
        }
        self.position
            .validate()
            .map_err(|e| CatalogError::invalid(&self.id, e.to_string()))
    }
}

/// Catalog load errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// A drop failed validation.
    #[error("invalid drop '{id}': {reason}")]
    InvalidConfiguration {
        /// Identifier of the rejected drop.
        id: String,
        /// What was wrong with it.
        reason: String,
    },
    /// Catalog file could not be read.
    #[error("failed to read catalog: {0}")]
    Io(#[from] std::io::Error),
    /// Catalog JSON is malformed.
    #[error("failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),
}

impl CatalogError {
    fn invalid(id: &str, reason: impl Into<String>) -> Self {
        CatalogError::InvalidConfiguration {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

/// The immutable, ordered set of active drops.
///
/// Order is the load order and is what the collection engine reports in.
#[derive(Clone, Debug, Default)]
pub struct DropCatalog {
    drops: Vec<ItemDrop>,
    index: BTreeMap<String, usize>,
}

impl DropCatalog {
    /// Build a catalog, rejecting malformed or duplicate drops.
    pub fn new(drops: Vec<ItemDrop>) -> Result<Self, CatalogError> {
        let mut index = BTreeMap::new();

        for (i, drop) in drops.iter().enumerate() {
            drop.validate()?;
            if index.insert(drop.id.clone(), i).is_some() {
                return Err(CatalogError::invalid(&drop.id, "duplicate identifier"));
            }
        }

        Ok(Self { drops, index })
    }

    /// Parse a JSON array of drops.
    pub fn from_json_str(json: &str) -> Result<Self, CatalogError> {
        let drops: Vec<ItemDrop> = serde_json::from_str(json)?;
        Self::new(drops)
    }

    /// Load a JSON catalog file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let catalog = Self::from_json_str(&raw)?;
        info!("Loaded {} item drops from {}", catalog.len(), path.display());
        Ok(catalog)
    }

    /// Default drops around the SNHU campus.
    pub fn builtin() -> Self {
        let drops = builtin_drops();
        let mut index = BTreeMap::new();
        for (i, drop) in drops.iter().enumerate() {
            index.insert(drop.id.clone(), i);
        }
        Self { drops, index }
    }

    /// Drops in load order.
    pub fn drops(&self) -> &[ItemDrop] {
        &self.drops
    }

    /// Look up a drop by identifier.
    pub fn get(&self, id: &str) -> Option<&ItemDrop> {
        self.index.get(id).map(|&i| &self.drops[i])
    }

    /// Whether an identifier is part of the catalog.
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Number of drops.
    pub fn len(&self) -> usize {
        self.drops.len()
    }

    /// True if there are no drops.
    pub fn is_empty(&self) -> bool {
        self.drops.is_empty()
    }

    /// Iterate drops in load order.
    pub fn iter(&self) -> std::slice::Iter<'_, ItemDrop> {
        self.drops.iter()
    }
}

impl<'a> IntoIterator for &'a DropCatalog {
    type Item = &'a ItemDrop;
    type IntoIter = std::slice::Iter<'a, ItemDrop>;

    fn into_iter(self) -> Self::IntoIter {
        self.drops.iter()
    }
}

/// Default collection radius (meters).
pub const DEFAULT_DROP_RADIUS_M: f64 = 30.0;

fn builtin_drops() -> Vec<ItemDrop> {
    vec![
        ItemDrop::new(
            "hat_crown",
            "Crown",
            ItemSlot::Hat,
            GeoPoint::new(43.03881471145394, -71.45190238952638),
            DEFAULT_DROP_RADIUS_M,
        )
        .with_description("A golden crown left behind by the campus royalty.")
        .with_icon("/items/hat_crown.png"),
        ItemDrop::new(
            "body_cape",
            "Explorer's Cape",
            ItemSlot::Body,
            GeoPoint::new(43.04012213815280, -71.45140083791992),
            DEFAULT_DROP_RADIUS_M,
        )
        .with_description("Flaps heroically even when there is no wind.")
        .with_icon("/items/body_cape.png"),
        ItemDrop::new(
            "shield",
            "Penmen Shield",
            ItemSlot::Outside,
            GeoPoint::new(43.04135718620547, -71.45318150520325),
            DEFAULT_DROP_RADIUS_M,
        )
        .with_description("Sturdy oak, painted in school colors.")
        .with_icon("/items/shield.png"),
        ItemDrop::new(
            "hat_beanie",
            "Winter Beanie",
            ItemSlot::Hat,
            GeoPoint::new(43.03942337617021, -71.44948840141296),
            DEFAULT_DROP_RADIUS_M,
        )
        .with_description("New Hampshire winters are no joke.")
        .with_icon("/items/hat_beanie.png"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drop_at(id: &str, radius: f64) -> ItemDrop {
        ItemDrop::new(id, id, ItemSlot::Hat, GeoPoint::new(43.0, -71.0), radius)
    }

    #[test]
    fn test_builtin_catalog_is_valid() {
        let builtin = DropCatalog::builtin();
        let rebuilt = DropCatalog::new(builtin.drops().to_vec()).unwrap();
        assert_eq!(rebuilt.len(), builtin.len());

        let crown = builtin.get("hat_crown").unwrap();
        assert_eq!(crown.radius_m, 30.0);
        assert_eq!(crown.slot, ItemSlot::Hat);
    }

    #[test]
    fn test_negative_radius_rejected() {
        let result = DropCatalog::new(vec![drop_at("a", 10.0), drop_at("b", -1.0)]);
        match result {
            Err(CatalogError::InvalidConfiguration { id, .. }) => assert_eq!(id, "b"),
            other => panic!("expected InvalidConfiguration, got {:?}", other),
        }
    }

    #[test]
    fn test_non_finite_rejected() {
        let mut bad = drop_at("nan", 10.0);
        bad.position.latitude = f64::NAN;
        assert!(matches!(
            DropCatalog::new(vec![bad]),
            Err(CatalogError::InvalidConfiguration { .. })
        ));

        let inf_radius = drop_at("inf", f64::INFINITY);
        assert!(matches!(
            DropCatalog::new(vec![inf_radius]),
            Err(CatalogError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let result = DropCatalog::new(vec![drop_at("a", 1.0), drop_at("a", 2.0)]);
        assert!(matches!(
            result,
            Err(CatalogError::InvalidConfiguration { ref reason, .. }) if reason.contains("duplicate")
        ));
    }

    #[test]
    fn test_zero_radius_allowed() {
        assert!(DropCatalog::new(vec![drop_at("point", 0.0)]).is_ok());
    }

    #[test]
    fn test_from_json() {
        let json = r#"[
            {"id": "hat_crown", "title": "Crown", "slot": "hat",
             "latitude": 43.03881471145394, "longitude": -71.45190238952638,
             "radius_m": 30.0},
            {"id": "shield", "title": "Shield", "description": "oak", "icon": "s.png",
             "slot": "outside", "latitude": 43.04, "longitude": -71.45, "radius_m": 15}
        ]"#;

        let catalog = DropCatalog::from_json_str(json).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.drops()[0].id, "hat_crown");
        assert_eq!(catalog.get("shield").unwrap().slot, ItemSlot::Outside);
        assert!(catalog.get("shield").unwrap().description == "oak");
    }

    #[test]
    fn test_from_json_invalid() {
        let json = r#"[{"id": "x", "title": "X", "slot": "hat",
                        "latitude": 43.0, "longitude": -71.0, "radius_m": -5}]"#;
        assert!(matches!(
            DropCatalog::from_json_str(json),
            Err(CatalogError::InvalidConfiguration { .. })
        ));

        assert!(matches!(
            DropCatalog::from_json_str("not json"),
            Err(CatalogError::Parse(_))
        ));
    }

    #[test]
    fn test_from_json_file_missing() {
        let result = DropCatalog::from_json_file("/definitely/not/here.json");
        assert!(matches!(result, Err(CatalogError::Io(_))));
    }
}
