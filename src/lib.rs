//! # Roamie Server
//!
//! Backend for Roamie, a map app where an avatar walks around and picks up
//! cosmetic items placed at real-world coordinates.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ROAMIE SERVER                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Geodesy                                   │
//! │  └── geo.rs      - Points, validation, haversine distance    │
//! │                                                              │
//! │  collect/        - Collection rules (pure)                   │
//! │  ├── drop.rs     - Item drops and the drop catalog           │
//! │  ├── engine.rs   - Geofence evaluation                       │
//! │  ├── equip.rs    - Per-slot loadout                          │
//! │  └── events.rs   - Collection notifications                  │
//! │                                                              │
//! │  store/          - Users, markers, collected items           │
//! │  ├── model.rs    - Persisted records                         │
//! │  └── backend.rs  - JSON file / memory backends               │
//! │                                                              │
//! │  network/        - WebSocket server                          │
//! │  ├── server.rs   - Connection handling                       │
//! │  ├── protocol.rs - Message types                             │
//! │  ├── session.rs  - Per-user sessions                         │
//! │  └── auth.rs     - ID token validation                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Collection Guarantees
//!
//! - `collect::evaluate` is a pure function of position, catalog and
//!   collected set; calling it twice with the merged result collects nothing
//! - An item is collected at most once per user
//! - A user's collected set only grows through moves, and concurrent moves
//!   for the same user are serialized by that user's session

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod collect;
pub mod network;
pub mod store;

// Re-export commonly used types
pub use core::geo::{GeoPoint, GeoError, haversine_distance, EARTH_RADIUS_M};
pub use collect::drop::{DropCatalog, ItemDrop, ItemSlot, DEFAULT_DROP_RADIUS_M};
pub use collect::engine::{evaluate, CollectedSet, CollectionResult, CollectError};
pub use collect::equip::Equipped;
pub use store::{UserStore, UserId, UserRecord};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
