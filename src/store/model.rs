//! Persisted Records
//!
//! On-disk shape of the user database. Field names follow the existing
//! `db.json` layout (camelCase) so old files keep loading.

use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use uuid::Uuid;

use crate::collect::engine::CollectedSet;
use crate::collect::equip::Equipped;
use crate::core::geo::GeoPoint;

/// Numeric user identifier, assigned from a monotonic counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Marker identifier.
///
/// New markers get a UUID. Databases written by the old backend used
/// millisecond timestamps, which are kept as-is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MarkerId {
    /// UUID v4 (current).
    Uuid(Uuid),
    /// Timestamp id from an older database.
    Legacy(u64),
}

impl MarkerId {
    /// Fresh random id.
    pub fn new() -> Self {
        MarkerId::Uuid(Uuid::new_v4())
    }
}

impl Default for MarkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MarkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkerId::Uuid(id) => write!(f, "{}", id),
            MarkerId::Legacy(id) => write!(f, "{}", id),
        }
    }
}

/// A pin dropped on the map by a user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Marker {
    /// Marker id.
    pub id: MarkerId,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Creation time (absent on markers from older databases).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Marker {
    /// New marker at a point, stamped now.
    pub fn new(point: GeoPoint) -> Self {
        Self {
            id: MarkerId::new(),
            latitude: point.latitude,
            longitude: point.longitude,
            created_at: Some(Utc::now()),
        }
    }
}

/// A stored user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    /// User id.
    pub id: UserId,
    /// Normalized username (trimmed, lower-case).
    pub username: String,
    /// Dropped pins, in creation order.
    #[serde(default)]
    pub markers: Vec<Marker>,
    /// Collected item identifiers.
    #[serde(default)]
    pub collected_items: CollectedSet,
    /// Equipped cosmetics.
    #[serde(default)]
    pub equipped: Equipped,
    /// Provider account (`issuer|subject`) this user belongs to. Bound
    /// users can only log in with a token from that account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_subject: Option<String>,
}

impl UserRecord {
    /// Fresh user with nothing collected.
    pub fn new(id: UserId, username: String) -> Self {
        Self {
            id,
            username,
            markers: Vec::new(),
            collected_items: CollectedSet::new(),
            equipped: Equipped::default(),
            auth_subject: None,
        }
    }
}

/// The whole database.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Database {
    /// Next id to hand out.
    pub next_user_id: u64,
    /// Users in creation order.
    #[serde(default)]
    pub users: Vec<UserRecord>,
}

impl Default for Database {
    fn default() -> Self {
        Self {
            next_user_id: 1,
            users: Vec::new(),
        }
    }
}

impl Database {
    /// Find a user by id.
    pub fn user(&self, id: UserId) -> Option<&UserRecord> {
        self.users.iter().find(|u| u.id == id)
    }

    /// Find a user by id, mutably.
    pub fn user_mut(&mut self, id: UserId) -> Option<&mut UserRecord> {
        self.users.iter_mut().find(|u| u.id == id)
    }

    /// Find a user by normalized username.
    pub fn user_by_name(&self, username: &str) -> Option<&UserRecord> {
        self.users.iter().find(|u| u.username == username)
    }

    /// Find the user bound to a provider account.
    pub fn user_by_subject(&self, subject: &str) -> Option<&UserRecord> {
        self.users
            .iter()
            .find(|u| u.auth_subject.as_deref() == Some(subject))
    }

    /// `base` if no user has it yet, otherwise `base~2`, `base~3`, ...
    pub fn available_username(&self, base: &str) -> String {
        if self.user_by_name(base).is_none() {
            return base.to_string();
        }
        let mut n = 2u64;
        loop {
            let candidate = format!("{}~{}", base, n);
            if self.user_by_name(&candidate).is_none() {
                return candidate;
            }
            n += 1;
        }
    }

    /// Create a user with the next id.
    pub fn create_user(&mut self, username: String) -> &mut UserRecord {
        // Never reuse an id, even if the counter in an old file lags behind
        let max_existing = self.users.iter().map(|u| u.id.0).max().unwrap_or(0);
        let id = self.next_user_id.max(max_existing + 1);
        self.next_user_id = id + 1;

        self.users.push(UserRecord::new(UserId(id), username));
        let last = self.users.len() - 1;
        &mut self.users[last]
    }
}
