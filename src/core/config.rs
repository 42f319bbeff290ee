//! Sync configuration loaded from `<data-dir>/offsync.toml`.

use crate::core::db;
use crate::core::error::SyncError;
use crate::sync::mutation::validate_segment;
use crate::sync::remote::MAX_BATCH_OPERATIONS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Records per commit; kept below the remote store's 500-operation ceiling.
pub const DEFAULT_CHUNK_SIZE: usize = 490;
pub const DEFAULT_ROOT_COLLECTION: &str = "users";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// First path segment of every destination document.
    pub root_collection: String,
    /// Maximum number of mutations committed in one batch.
    pub chunk_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root_collection: DEFAULT_ROOT_COLLECTION.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.chunk_size == 0 {
            return Err(SyncError::ConfigError(
                "chunk_size must be at least 1".to_string(),
            ));
        }
        if self.chunk_size > MAX_BATCH_OPERATIONS {
            return Err(SyncError::ConfigError(format!(
                "chunk_size {} exceeds the {} operation batch limit",
                self.chunk_size, MAX_BATCH_OPERATIONS
            )));
        }
        validate_segment("root_collection", &self.root_collection)
            .map_err(|e| SyncError::ConfigError(e.to_string()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self, SyncError> {
        let config: SyncConfig =
            toml::from_str(content).map_err(|e| SyncError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `offsync.toml` from the data directory. A missing file means defaults.
    pub fn load(data_dir: &Path) -> Result<Self, SyncError> {
        let config_path = db::config_path(data_dir);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }
}
