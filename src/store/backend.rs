//! Storage Backends
//!
//! A backend loads and saves a whole [`Database`] snapshot. The store
//! writes through after every mutation, so a backend only needs to make a
//! single save atomic.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::store::model::Database;
use crate::store::StoreError;

/// Snapshot persistence.
pub trait StoreBackend: Send + Sync {
    /// Load the database, creating an empty one if none exists yet.
    fn load(&self) -> Result<Database, StoreError>;

    /// Replace the persisted database.
    fn save(&self, db: &Database) -> Result<(), StoreError>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// Pretty-printed JSON file, compatible with the old `db.json`.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    /// Backend for the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "db.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StoreBackend for JsonFileBackend {
    fn load(&self) -> Result<Database, StoreError> {
        if !self.path.exists() {
            let initial = Database::default();
            self.save(&initial)?;
            info!("Created new database at {}", self.path.display());
            return Ok(initial);
        }

        let raw = std::fs::read_to_string(&self.path)?;
        let db: Database = serde_json::from_str(&raw)?;
        debug!("Loaded {} users from {}", db.users.len(), self.path.display());
        Ok(db)
    }

    fn save(&self, db: &Database) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(db)?;
        let tmp = self.temp_path();

        // Write then rename so a crash never leaves a half-written file
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }
}

/// In-process backend. Keeps the last saved snapshot in memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    snapshot: Mutex<Option<Database>>,
    /// Fail every save (tests exercise write-failure handling with this).
    fail_saves: bool,
}

impl MemoryBackend {
    /// Empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend pre-loaded with a database.
    pub fn with_database(db: Database) -> Self {
        Self {
            snapshot: Mutex::new(Some(db)),
            fail_saves: false,
        }
    }

    /// Make every subsequent save fail. Loads still succeed.
    pub fn rejecting_saves(mut self) -> Self {
        self.fail_saves = true;
        self
    }

    /// Last saved snapshot.
    pub fn snapshot(&self) -> Option<Database> {
        self.snapshot.lock().ok().and_then(|s| s.clone())
    }
}

impl StoreBackend for MemoryBackend {
    fn load(&self) -> Result<Database, StoreError> {
        Ok(self.snapshot().unwrap_or_default())
    }

    fn save(&self, db: &Database) -> Result<(), StoreError> {
        if self.fail_saves {
            return Err(StoreError::Backend("memory backend configured to fail".into()));
        }
        let mut guard = self
            .snapshot
            .lock()
            .map_err(|_| StoreError::Backend("snapshot lock poisoned".into()))?;
        *guard = Some(db.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
