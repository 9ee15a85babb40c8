//! User Store
//!
//! Users, their markers, equipped cosmetics and collected items.
//!
//! The full database lives in memory behind a `RwLock`. Every mutation is
//! applied to a copy of the database, written through to the backend on
//! the blocking pool, and only then committed, so a failed write leaves
//! the store exactly as it was.
//!
//! Users created by a token login are bound to their provider account and
//! are unreachable through plain username login.

pub mod backend;
pub mod model;

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::collect::engine::CollectedSet;
use crate::collect::equip::Equipped;
use crate::core::geo::{GeoError, GeoPoint};

pub use backend::{StoreBackend, JsonFileBackend, MemoryBackend};
pub use model::{Database, Marker, MarkerId, UserId, UserRecord};

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Login without a usable username.
    #[error("username required")]
    UsernameRequired,
    /// Username belongs to a provider-bound account.
    #[error("account '{0}' signs in with a token")]
    TokenAccount(String),
    /// No user with this id.
    #[error("user {0} not found")]
    UserNotFound(UserId),
    /// Marker coordinates rejected.
    #[error("invalid marker position: {0}")]
    InvalidPosition(#[from] GeoError),
    /// File I/O failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Database could not be (de)serialized.
    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Backend-specific failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Which backend to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    /// JSON file at `StoreConfig::db_path`.
    Json,
    /// Nothing persisted beyond the process.
    Memory,
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Backend kind.
    pub kind: StoreKind,
    /// Database file for the JSON backend.
    pub db_path: std::path::PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Json,
            db_path: "db.json".into(),
        }
    }
}

impl StoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            kind: match std::env::var("ROAMIE_STORE").as_deref() {
                Ok("memory") => StoreKind::Memory,
                _ => StoreKind::Json,
            },
            db_path: std::env::var("ROAMIE_DB_PATH")
                .map(Into::into)
                .unwrap_or(defaults.db_path),
        }
    }

    /// Instantiate the configured backend.
    pub fn backend(&self) -> Arc<dyn StoreBackend> {
        match self.kind {
            StoreKind::Json => Arc::new(JsonFileBackend::new(self.db_path.clone())),
            StoreKind::Memory => Arc::new(MemoryBackend::new()),
        }
    }
}

/// Normalize a username the way logins compare them.
pub fn normalize_username(username: &str) -> Option<String> {
    let clean = username.trim().to_lowercase();
    if clean.is_empty() {
        None
    } else {
        Some(clean)
    }
}

/// Shared user store.
pub struct UserStore {
    db: RwLock<Database>,
    backend: Arc<dyn StoreBackend>,
}

impl UserStore {
    /// Open a store, loading the current database from the backend.
    pub fn open(backend: Arc<dyn StoreBackend>) -> Result<Self, StoreError> {
        let db = backend.load()?;
        info!(
            "Opened user store ({}) with {} users",
            backend.describe(),
            db.users.len()
        );
        Ok(Self {
            db: RwLock::new(db),
            backend,
        })
    }

    /// Store backed by memory only.
    pub fn in_memory() -> Self {
        Self {
            db: RwLock::new(Database::default()),
            backend: Arc::new(MemoryBackend::new()),
        }
    }

    /// Find or create a user by username.
    #[instrument(skip(self))]
    pub async fn login(&self, username: &str) -> Result<UserRecord, StoreError> {
        let clean = normalize_username(username).ok_or(StoreError::UsernameRequired)?;

        // Fast path: existing users only need a read lock
        {
            let db = self.db.read().await;
            if let Some(user) = db.user_by_name(&clean) {
                return username_login(user);
            }
        }

        let mut db = self.db.write().await;
        // Another login may have created it between the two locks
        if let Some(user) = db.user_by_name(&clean) {
            return username_login(user);
        }

        let mut next = db.clone();
        let user = next.create_user(clean).clone();
        *db = self.persist(next).await?;

        info!("Created user {} ({})", user.id, user.username);
        Ok(user)
    }

    /// Find or create the user bound to a provider account.
    ///
    /// `subject` identifies the account (`issuer|subject`). A new user gets
    /// `username` if it is free, otherwise the first free `username~N`.
    #[instrument(skip(self))]
    pub async fn login_with_token(&self, subject: &str, username: &str) -> Result<UserRecord, StoreError> {
        let preferred = normalize_username(username).ok_or(StoreError::UsernameRequired)?;

        {
            let db = self.db.read().await;
            if let Some(user) = db.user_by_subject(subject) {
                return Ok(user.clone());
            }
        }

        let mut db = self.db.write().await;
        if let Some(user) = db.user_by_subject(subject) {
            return Ok(user.clone());
        }

        let mut next = db.clone();
        let name = next.available_username(&preferred);
        let created = next.create_user(name);
        created.auth_subject = Some(subject.to_string());
        let user = created.clone();
        *db = self.persist(next).await?;

        info!("Created token user {} ({})", user.id, user.username);
        Ok(user)
    }

    /// Fetch a user.
    pub async fn user(&self, id: UserId) -> Result<UserRecord, StoreError> {
        let db = self.db.read().await;
        db.user(id).cloned().ok_or(StoreError::UserNotFound(id))
    }

    /// All users ordered by id.
    pub async fn users(&self) -> Vec<UserRecord> {
        let db = self.db.read().await;
        let mut users = db.users.clone();
        users.sort_by_key(|u| u.id);
        users
    }

    /// Number of users.
    pub async fn user_count(&self) -> usize {
        self.db.read().await.users.len()
    }

    /// Drop a marker for a user.
    #[instrument(skip(self))]
    pub async fn add_marker(&self, id: UserId, position: GeoPoint) -> Result<Marker, StoreError> {
        position.validate()?;
        let marker = Marker::new(position);

        let added = marker.clone();
        self.update_user(id, move |user| user.markers.push(marker)).await?;

        debug!("User {} added marker {}", id, added.id);
        Ok(added)
    }

    /// Remove all of a user's markers.
    pub async fn clear_markers(&self, id: UserId) -> Result<(), StoreError> {
        self.update_user(id, |user| user.markers.clear()).await?;
        debug!("User {} cleared markers", id);
        Ok(())
    }

    /// Replace a user's loadout.
    pub async fn set_equipped(&self, id: UserId, equipped: Equipped) -> Result<Equipped, StoreError> {
        let user = self
            .update_user(id, move |user| user.equipped = equipped)
            .await?;
        Ok(user.equipped)
    }

    /// Replace a user's collected items.
    ///
    /// Equipped items that are no longer collected are unequipped in the
    /// same write.
    pub async fn set_collected(&self, id: UserId, collected: CollectedSet) -> Result<UserRecord, StoreError> {
        self.update_user(id, move |user| {
            user.equipped.retain_collected(&collected);
            user.collected_items = collected;
        })
        .await
    }

    /// Apply `f` to a copy of the user, persist, then commit.
    async fn update_user<F>(&self, id: UserId, f: F) -> Result<UserRecord, StoreError>
    where
        F: FnOnce(&mut UserRecord),
    {
        let mut db = self.db.write().await;

        let mut next = db.clone();
        let user = next.user_mut(id).ok_or(StoreError::UserNotFound(id))?;
        f(user);
        let updated = user.clone();

        *db = self.persist(next).await?;
        Ok(updated)
    }

    /// Save `next` off the async workers and hand it back for commit.
    async fn persist(&self, next: Database) -> Result<Database, StoreError> {
        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || backend.save(&next).map(|()| next))
            .await
            .map_err(|e| StoreError::Backend(format!("save task failed: {}", e)))?
    }
}

fn username_login(user: &UserRecord) -> Result<UserRecord, StoreError> {
    match user.auth_subject {
        Some(_) => Err(StoreError::TokenAccount(user.username.clone())),
        None => Ok(user.clone()),
    }
}
