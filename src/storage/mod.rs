//! Storage module for persisting client settings and credentials using Sled.
//!
//! Runtime settings survive restarts so a tuned poll interval or TTL does not
//! have to be reapplied, and the last identity's credentials are kept so a
//! returning user can resume instead of registering again.

mod sled_store;

pub use sled_store::{SettingsStore, StorageError, StorageResult};

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 16MB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = flush on every write)
    pub flush_interval_ms: u64,
    /// Drop the database when the store is closed
    pub temporary: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/duo-sync.sled".to_string(),
            cache_size: 16 * 1024 * 1024,
            flush_interval_ms: 500,
            temporary: false,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_flush_interval_ms(mut self, interval_ms: u64) -> Self {
        self.flush_interval_ms = interval_ms;
        self
    }

    pub fn temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        self
    }
}
