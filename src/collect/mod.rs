//! Collection Logic Module
//!
//! Item drops, the geofence collection engine, and the avatar loadout.
//! Nothing here performs I/O except catalog loading.
//!
//! ## Module Structure
//!
//! - `drop`: Item drops and the validated drop catalog
//! - `engine`: Pure geofence evaluation
//! - `equip`: Equipped cosmetics per slot
//! - `events`: Notification payloads for collected items

pub mod drop;
pub mod engine;
pub mod equip;
pub mod events;

// Re-export key types
pub use drop::{DropCatalog, ItemDrop, ItemSlot, CatalogError};
pub use engine::{evaluate, CollectedSet, CollectionResult, CollectError};
pub use equip::{Equipped, EquipError};
pub use events::CollectionEvent;
