//! Sled-backed settings and credential store.
//!
//! Values are bincode-encoded under fixed keys in two trees, one for engine
//! settings and one for the credentials of the last connected identity.

use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::StorageConfig;
use crate::connection::Credentials;
use crate::sync::EngineSettings;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

const TREE_SETTINGS: &str = "settings";
const TREE_CREDENTIALS: &str = "credentials";

const KEY_ENGINE_SETTINGS: &[u8] = b"engine";
const KEY_LAST_IDENTITY: &[u8] = b"last_identity";

/// Persistent store for [`EngineSettings`] and [`Credentials`]
#[derive(Clone)]
pub struct SettingsStore {
    db: Arc<Db>,
    settings: Tree,
    credentials: Tree,
}

impl SettingsStore {
    /// Open or create a store at the configured path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        if !config.temporary {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::InitFailed(format!("Failed to create directory: {}", e))
                })?;
            }
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .temporary(config.temporary)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let settings = db.open_tree(TREE_SETTINGS)?;
        let credentials = db.open_tree(TREE_CREDENTIALS)?;

        debug!("Opened settings store at {}", config.path);

        Ok(Self {
            db: Arc::new(db),
            settings,
            credentials,
        })
    }

    /// Open a throwaway store that is removed when dropped
    pub fn open_temporary() -> StorageResult<Self> {
        let path = std::env::temp_dir().join(format!("duo-sync-{}", uuid::Uuid::new_v4()));
        Self::open(StorageConfig::new(path.to_string_lossy().to_string()).temporary(true))
    }

    /// Load persisted settings, if any were saved
    pub fn load_settings(&self) -> StorageResult<Option<EngineSettings>> {
        match self.settings.get(KEY_ENGINE_SETTINGS)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn save_settings(&self, settings: &EngineSettings) -> StorageResult<()> {
        let bytes = bincode::serialize(settings)?;
        self.settings.insert(KEY_ENGINE_SETTINGS, bytes)?;
        Ok(())
    }

    /// Credentials of the last identity that connected from this device
    pub fn load_credentials(&self) -> StorageResult<Option<Credentials>> {
        match self.credentials.get(KEY_LAST_IDENTITY)? {
            Some(bytes) => match bincode::deserialize(&bytes) {
                Ok(credentials) => Ok(Some(credentials)),
                Err(e) => {
                    // Unreadable credentials are as good as none
                    warn!("Discarding unreadable stored credentials: {}", e);
                    self.credentials.remove(KEY_LAST_IDENTITY)?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub fn save_credentials(&self, credentials: &Credentials) -> StorageResult<()> {
        let bytes = bincode::serialize(credentials)?;
        self.credentials.insert(KEY_LAST_IDENTITY, bytes)?;
        Ok(())
    }

    pub fn clear_credentials(&self) -> StorageResult<()> {
        self.credentials.remove(KEY_LAST_IDENTITY)?;
        Ok(())
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl Drop for SettingsStore {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.db.flush();
    }
}
