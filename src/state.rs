//! Durable key-value storage
//!
//! The relay keeps four independently addressable records: the resumable
//! session, the conversation log, the snapshot collection, and the backup
//! collection. A `StateStore` persists each as a JSON value under its key.

use crate::error::{RelayError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Storage key for the resumable session record
pub const SESSION_KEY: &str = "sessionState";
/// Storage key for the conversation log
pub const LOG_KEY: &str = "conversationLog";
/// Storage key for the snapshot collection
pub const SNAPSHOTS_KEY: &str = "snapshots";
/// Storage key for the backup collection
pub const BACKUPS_KEY: &str = "backups";

/// Trait for persisting relay state
pub trait StateStore: Send + Sync {
    /// Save a value under a key, replacing any previous value
    fn save(&self, key: &str, value: &serde_json::Value) -> Result<()>;

    /// Load the value under a key
    fn load(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// Remove a key; removing a missing key is not an error
    fn remove(&self, key: &str) -> Result<()>;
}

/// JSON file-based state store
///
/// One file per key inside a directory. Atomic writes via temp file +
/// rename to prevent corruption.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// Create a new file state store rooted at the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding one JSON file per key
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl StateStore for FileStateStore {
    fn save(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        let path = self.path_for(key);
        let tmp_path = path.with_extension("tmp");

        std::fs::create_dir_all(&self.dir).map_err(|e| {
            RelayError::Persistence(format!(
                "Failed to create state directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        std::fs::write(&tmp_path, json).map_err(|e| {
            RelayError::Persistence(format!(
                "Failed to write state file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        std::fs::rename(&tmp_path, &path).map_err(|e| {
            RelayError::Persistence(format!(
                "Failed to rename state file {} → {}: {}",
                tmp_path.display(),
                path.display(),
                e
            ))
        })?;

        tracing::debug!(key, path = %path.display(), "State saved");
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }

        let json = std::fs::read_to_string(&path).map_err(|e| {
            RelayError::Persistence(format!(
                "Failed to read state file {}: {}",
                path.display(),
                e
            ))
        })?;

        let value = serde_json::from_str(&json).map_err(|e| {
            RelayError::Persistence(format!(
                "Failed to parse state file {}: {}",
                path.display(),
                e
            ))
        })?;

        tracing::debug!(key, path = %path.display(), "State loaded");
        Ok(Some(value))
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RelayError::Persistence(format!(
                "Failed to remove state file {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// In-memory state store for testing
///
/// Stores state in memory; lost on drop.
#[derive(Default)]
pub struct MemoryStateStore {
    state: std::sync::RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryStateStore {
    /// Keys currently stored
    pub fn keys(&self) -> Vec<String> {
        self.state
            .read()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl StateStore for MemoryStateStore {
    fn save(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let mut state = self.state.write().map_err(|e| {
            RelayError::Persistence(format!("Failed to acquire state lock: {}", e))
        })?;
        state.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let state = self.state.read().map_err(|e| {
            RelayError::Persistence(format!("Failed to acquire state lock: {}", e))
        })?;
        Ok(state.get(key).cloned())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut state = self.state.write().map_err(|e| {
            RelayError::Persistence(format!("Failed to acquire state lock: {}", e))
        })?;
        state.remove(key);
        Ok(())
    }
}
