//! Persistence subsystem
//!
//! Four independently addressable records live in a [`StateStore`]:
//!
//! - the resumable session (`sessionState`), saved on an interval
//! - the conversation log (`conversationLog`), saved after every append
//! - the snapshot collection (`snapshots`), newest first, bounded
//! - the backup collection (`backups`), newest first, bounded
//!
//! Snapshot and backup bodies are packed through a [`Codec`]. Storage
//! failures surface as `RelayError::Persistence`; the controller logs them
//! and keeps the live session running.

mod backup;
mod snapshot;

pub use backup::{BackupInfo, BackupPayload, BackupRecord};
pub use snapshot::{SnapshotInfo, SnapshotPayload, SnapshotRecord};

use crate::codec::{Codec, GzipCodec};
use crate::config::PersistenceConfig;
use crate::error::Result;
use crate::recovery::BackoffState;
use crate::session::ConversationSession;
use crate::state::{MemoryStateStore, StateStore, LOG_KEY, SESSION_KEY};
use crate::stats::Stats;
use crate::types::LogEntry;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Crash-recovery record for the live session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub session: ConversationSession,
    pub stats: Stats,
    pub backoff: BackoffState,
    pub log_session_id: Option<String>,
    /// Unix milliseconds of the save
    pub saved_at: u64,
}

/// Durable relay state behind a store and a codec
#[derive(Clone)]
pub struct Persistence {
    store: Arc<dyn StateStore>,
    codec: Arc<dyn Codec>,
    config: PersistenceConfig,
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("codec", &self.codec.name())
            .field("config", &self.config)
            .finish()
    }
}

impl Persistence {
    pub fn new(
        store: Arc<dyn StateStore>,
        codec: Arc<dyn Codec>,
        config: PersistenceConfig,
    ) -> Self {
        Self {
            store,
            codec,
            config,
        }
    }

    /// In-memory store with gzip, for tests and the demo binary
    pub fn in_memory(config: PersistenceConfig) -> Self {
        Self::new(
            Arc::new(MemoryStateStore::default()),
            Arc::new(GzipCodec::default()),
            config,
        )
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    // ========================================================================
    // Session
    // ========================================================================

    pub fn save_session(&self, record: &PersistedSession) -> Result<()> {
        self.store.save(SESSION_KEY, &serde_json::to_value(record)?)?;
        tracing::debug!(turns = record.session.history.len(), "Session state saved");
        Ok(())
    }

    pub fn load_session(&self) -> Result<Option<PersistedSession>> {
        match self.store.load(SESSION_KEY)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Saved session young enough to resume; stale or unreadable records
    /// are removed
    pub fn resumable_session(&self, now: u64) -> Result<Option<PersistedSession>> {
        let record = match self.load_session() {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable session state");
                self.clear_session()?;
                return Ok(None);
            }
        };

        let age_ms = now.saturating_sub(record.saved_at);
        if age_ms >= self.config.resume_max_age_ms {
            tracing::info!(age_ms, "Discarding stale session state");
            self.clear_session()?;
            return Ok(None);
        }
        Ok(Some(record))
    }

    pub fn clear_session(&self) -> Result<()> {
        self.store.remove(SESSION_KEY)
    }

    // ========================================================================
    // Conversation log
    // ========================================================================

    pub fn save_log(&self, entries: &[LogEntry]) -> Result<()> {
        self.store.save(LOG_KEY, &serde_json::to_value(entries)?)
    }

    pub fn load_log(&self) -> Result<Vec<LogEntry>> {
        self.load_list(LOG_KEY)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Load a JSON array, skipping elements that no longer decode
    fn load_list<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>> {
        let items = match self.store.load(key)? {
            Some(serde_json::Value::Array(items)) => items,
            Some(_) => {
                tracing::warn!(key, "Stored collection is not an array, ignoring");
                return Ok(Vec::new());
            }
            None => return Ok(Vec::new()),
        };

        let total = items.len();
        let decoded: Vec<T> = items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect();
        if decoded.len() < total {
            tracing::warn!(key, skipped = total - decoded.len(), "Skipped undecodable records");
        }
        Ok(decoded)
    }

    fn save_list<T: Serialize>(&self, key: &str, items: &[T]) -> Result<()> {
        self.store.save(key, &serde_json::to_value(items)?)
    }
}

/// Unix milliseconds as a UTC timestamp
pub(crate) fn datetime_from_millis(millis: u64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis as i64).unwrap_or_default()
}
