//! User Session Management
//!
//! One session per logged-in user, shared by all of that user's
//! connections. The session owns the avatar position and the in-memory
//! collected set, and its mutex is what serializes collection for a user:
//! evaluate, merge and persist all happen under the same lock, so two
//! racing moves cannot lose an item. Different users never contend.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::collect::drop::DropCatalog;
use crate::collect::engine::{evaluate, CollectedSet, CollectError};
use crate::collect::equip::{Equipped, EquipError};
use crate::collect::events::CollectionEvent;
use crate::core::geo::GeoPoint;
use crate::store::{StoreError, UserId, UserRecord, UserStore};

/// Session state for one user.
#[derive(Debug)]
pub struct UserSession {
    /// Owner.
    pub user_id: UserId,
    /// Last accepted avatar position.
    pub position: Option<GeoPoint>,
    /// Items collected so far (mirrors the persisted set).
    pub collected: CollectedSet,
    /// Connections currently attached.
    pub connections: usize,
    /// Last time anything touched this session.
    pub last_activity: Instant,
}

impl UserSession {
    /// New session seeded from the persisted user.
    pub fn new(user: &UserRecord) -> Self {
        Self {
            user_id: user.id,
            position: None,
            collected: user.collected_items.clone(),
            connections: 0,
            last_activity: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Result of a committed move.
#[derive(Debug, Clone)]
pub struct MoveOutcome {
    /// Accepted position.
    pub position: GeoPoint,
    /// Newly collected identifiers in catalog order.
    pub newly_collected: Vec<String>,
    /// One notification per newly collected item.
    pub events: Vec<CollectionEvent>,
    /// Size of the collected set after the move.
    pub total_collected: usize,
}

/// Session errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Position rejected by the engine.
    #[error(transparent)]
    Collect(#[from] CollectError),

    /// Loadout rejected.
    #[error(transparent)]
    Equip(#[from] EquipError),

    /// Collected set refers to items outside the catalog.
    #[error("unknown item '{0}'")]
    UnknownItem(String),

    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

/// Manages all active user sessions.
pub struct SessionManager {
    sessions: RwLock<BTreeMap<UserId, Arc<Mutex<UserSession>>>>,
    store: Arc<UserStore>,
    catalog: Arc<DropCatalog>,
}

impl SessionManager {
    /// Create a session manager over a store and catalog.
    pub fn new(store: Arc<UserStore>, catalog: Arc<DropCatalog>) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            store,
            catalog,
        }
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<UserStore> {
        &self.store
    }

    /// Active drop catalog.
    pub fn catalog(&self) -> &Arc<DropCatalog> {
        &self.catalog
    }

    /// Attach a connection to a user's session, creating it if needed.
    pub async fn attach(&self, user: &UserRecord) -> Arc<Mutex<UserSession>> {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions
                .entry(user.id)
                .or_insert_with(|| Arc::new(Mutex::new(UserSession::new(user))))
                .clone()
        };

        {
            let mut guard = session.lock().await;
            guard.connections += 1;
            guard.touch();
            debug!("User {} attached ({} connections)", user.id, guard.connections);
        }

        session
    }

    /// Detach a connection. The session stays until the cleanup pass.
    pub async fn detach(&self, user_id: UserId) {
        if let Some(session) = self.get_session(user_id).await {
            let mut guard = session.lock().await;
            guard.connections = guard.connections.saturating_sub(1);
            guard.touch();
            debug!("User {} detached ({} connections)", user_id, guard.connections);
        }
    }

    /// Get a user's session.
    pub async fn get_session(&self, user_id: UserId) -> Option<Arc<Mutex<UserSession>>> {
        let sessions = self.sessions.read().await;
        sessions.get(&user_id).cloned()
    }

    async fn require_session(&self, user_id: UserId) -> Result<Arc<Mutex<UserSession>>, SessionError> {
        match self.get_session(user_id).await {
            Some(session) => Ok(session),
            None => {
                // Connection outlived a cleanup pass; rebuild from the store
                let user = self.store.user(user_id).await?;
                let session = {
                    let mut sessions = self.sessions.write().await;
                    sessions
                        .entry(user_id)
                        .or_insert_with(|| Arc::new(Mutex::new(UserSession::new(&user))))
                        .clone()
                };
                Ok(session)
            }
        }
    }

    /// Move the avatar and collect whatever comes into range.
    ///
    /// On any error the session's position and collected set are left
    /// unchanged.
    pub async fn apply_move(&self, user_id: UserId, position: GeoPoint) -> Result<MoveOutcome, SessionError> {
        let session = self.require_session(user_id).await?;
        let mut guard = session.lock().await;
        guard.touch();

        let result = evaluate(position, self.catalog.drops(), &guard.collected)?;

        if !result.is_empty() {
            let mut next = guard.collected.clone();
            result.merge_into(&mut next);
            self.store.set_collected(user_id, next.clone()).await?;
            guard.collected = next;

            info!("User {} collected {:?}", user_id, result.ids());
        }

        guard.position = Some(position);

        let events = CollectionEvent::from_result(user_id, &result, &self.catalog, Utc::now());
        Ok(MoveOutcome {
            position,
            newly_collected: result.into_ids(),
            events,
            total_collected: guard.collected.len(),
        })
    }

    /// Replace the collected set.
    ///
    /// Every identifier must exist in the catalog.
    pub async fn set_collected(&self, user_id: UserId, items: Vec<String>) -> Result<UserRecord, SessionError> {
        if let Some(unknown) = items.iter().find(|id| !self.catalog.contains(id)) {
            return Err(SessionError::UnknownItem(unknown.clone()));
        }

        let session = self.require_session(user_id).await?;
        let mut guard = session.lock().await;
        guard.touch();

        let collected: CollectedSet = items.into_iter().collect();
        let user = self.store.set_collected(user_id, collected.clone()).await?;
        guard.collected = collected;

        info!("User {} collected set replaced ({} items)", user_id, guard.collected.len());
        Ok(user)
    }

    /// Validate and store a loadout.
    pub async fn equip(&self, user_id: UserId, equipped: Equipped) -> Result<Equipped, SessionError> {
        let session = self.require_session(user_id).await?;
        let mut guard = session.lock().await;
        guard.touch();

        equipped.validate(&self.catalog, &guard.collected)?;
        Ok(self.store.set_equipped(user_id, equipped).await?)
    }

    /// Last accepted position for a user.
    pub async fn position(&self, user_id: UserId) -> Option<GeoPoint> {
        let session = self.get_session(user_id).await?;
        let guard = session.lock().await;
        guard.position
    }

    /// Active session count.
    pub async fn session_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }

    /// Remove sessions with no connections idle longer than `idle_timeout`.
    pub async fn cleanup(&self, idle_timeout: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let now = Instant::now();
        let mut to_remove = Vec::new();

        for (id, session) in sessions.iter() {
            // A busy session is in use, so not idle
            let Ok(s) = session.try_lock() else { continue };
            if s.connections == 0 && now.duration_since(s.last_activity) > idle_timeout {
                to_remove.push(*id);
            }
        }

        for id in &to_remove {
            sessions.remove(id);
        }

        if !to_remove.is_empty() {
            warn!("Dropped {} idle sessions", to_remove.len());
        }
        to_remove.len()
    }
}
