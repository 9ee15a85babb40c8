//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Text frames carry JSON messages tagged by `type`. Binary frames carry a
//! bincode-encoded [`AvatarMove`] for clients that stream drag updates.

use serde::{Serialize, Deserialize};

use crate::collect::equip::Equipped;
use crate::collect::events::CollectionEvent;
use crate::core::geo::GeoPoint;
use crate::store::model::{Marker, UserId, UserRecord};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Log in (or sign up) by username.
    Login { username: String },

    /// Log in with a provider ID token.
    Auth(AuthRequest),

    /// Request the current user state.
    GetState,

    /// List all registered users.
    ListUsers,

    /// Drop a pin on the map.
    AddMarker { latitude: f64, longitude: f64 },

    /// Remove all of this user's pins.
    ClearMarkers,

    /// Replace the equipped loadout.
    Equip(Equipped),

    /// Replace the collected set (client sync or reset).
    SetCollected { items: Vec<String> },

    /// Avatar moved (drag released).
    Move(AvatarMove),

    /// Ping for latency measurement.
    Ping { timestamp: u64 },

    /// End the session without closing the socket.
    Logout,
}

/// Token login request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    /// Provider ID token (JWT).
    pub token: String,
    /// Client version for compatibility check.
    #[serde(default)]
    pub client_version: String,
}

/// New avatar position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AvatarMove {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

impl AvatarMove {
    /// Position as a (not yet validated) point.
    pub fn to_point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Login succeeded.
    LoginResult(UserState),

    /// Current user state.
    State(UserState),

    /// Registered users, ordered by id.
    Users { users: Vec<UserSummary> },

    /// Marker stored.
    MarkerAdded(Marker),

    /// All markers removed.
    MarkersCleared,

    /// Loadout stored.
    Equipped(Equipped),

    /// Collected set replaced.
    CollectedUpdated { collected_items: Vec<String> },

    /// Move processed.
    MoveResult(MoveResult),

    /// Items collected by the last move, for on-screen notification.
    ItemsCollected { items: Vec<CollectedItem> },

    /// Pong response.
    Pong { timestamp: u64, server_time: u64 },

    /// Error message.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown { reason: String },
}

/// A user's full state as the client sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserState {
    /// User id.
    pub id: UserId,
    /// Username.
    pub username: String,
    /// Dropped pins.
    pub markers: Vec<Marker>,
    /// Collected item identifiers.
    pub collected_items: Vec<String>,
    /// Equipped cosmetics.
    pub equipped: Equipped,
}

impl From<UserRecord> for UserState {
    fn from(user: UserRecord) -> Self {
        Self {
            id: user.id,
            username: user.username,
            markers: user.markers,
            collected_items: user.collected_items.into_iter().collect(),
            equipped: user.equipped,
        }
    }
}

/// Public view of another user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    /// User id.
    pub id: UserId,
    /// Username.
    pub username: String,
}

impl From<&UserRecord> for UserSummary {
    fn from(user: &UserRecord) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
        }
    }
}

/// Outcome of a move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveResult {
    /// Accepted position.
    pub latitude: f64,
    /// Accepted position.
    pub longitude: f64,
    /// Identifiers collected by this move, in catalog order.
    pub newly_collected: Vec<String>,
    /// Total number of items collected so far.
    pub total_collected: usize,
}

/// Display data for a collected item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectedItem {
    /// Item identifier.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Display description.
    pub description: String,
    /// Icon reference.
    pub icon: String,
    /// Ready-made notification text.
    pub message: String,
}

impl From<&CollectionEvent> for CollectedItem {
    fn from(event: &CollectionEvent) -> Self {
        Self {
            id: event.item_id.clone(),
            title: event.title.clone(),
            description: event.description.clone(),
            icon: event.icon.clone(),
            message: event.message(),
        }
    }
}

/// Server error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ServerError {
    /// Build an error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Authentication failed.
    AuthFailed,
    /// Not authenticated.
    NotAuthenticated,
    /// JWT token has expired.
    TokenExpired,
    /// Invalid JWT token (signature, format, claims).
    InvalidToken,
    /// Invalid input (bad coordinates, empty username, unknown item).
    InvalidInput,
    /// Loadout rejected.
    InvalidLoadout,
    /// User does not exist.
    UserNotFound,
    /// Persisting a change failed.
    StorageFailure,
    /// Server overloaded.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
