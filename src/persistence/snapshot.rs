//! On-demand session snapshots

use super::{datetime_from_millis, Persistence};
use crate::codec::{pack, unpack};
use crate::config::validate_address;
use crate::error::{RelayError, Result};
use crate::session::ConversationSession;
use crate::state::SNAPSHOTS_KEY;
use crate::types::LogEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Decompressed body of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    pub session: ConversationSession,
    pub log_session_id: Option<String>,
    /// Log entries of `log_session_id` at capture time
    pub entries: Vec<LogEntry>,
}

/// Stored snapshot: metadata plus packed payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub id: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub topic: String,
    pub turns: usize,
    /// base64(gzip(json(SnapshotPayload)))
    pub data: String,
}

/// Snapshot metadata for listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    pub id: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub topic: String,
    pub turns: usize,
}

impl SnapshotRecord {
    pub fn info(&self) -> SnapshotInfo {
        SnapshotInfo {
            id: self.id.clone(),
            description: self.description.clone(),
            created_at: self.created_at,
            topic: self.topic.clone(),
            turns: self.turns,
        }
    }
}

impl Persistence {
    /// Capture a session and its log entries; newest first, oldest evicted
    pub fn create_snapshot(
        &self,
        description: &str,
        payload: &SnapshotPayload,
        now: u64,
    ) -> Result<SnapshotInfo> {
        let record = SnapshotRecord {
            id: format!("snap-{}", uuid::Uuid::new_v4()),
            description: description.to_string(),
            created_at: datetime_from_millis(now),
            topic: payload.session.topic.clone(),
            turns: payload.session.history.len(),
            data: pack(self.codec.as_ref(), payload)?,
        };
        let info = record.info();

        let mut snapshots = self.snapshot_records()?;
        snapshots.insert(0, record);
        snapshots.truncate(self.config.snapshot_capacity);
        self.save_list(SNAPSHOTS_KEY, &snapshots)?;

        tracing::info!(snapshot = %info.id, turns = info.turns, "Snapshot created");
        Ok(info)
    }

    pub fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        Ok(self.snapshot_records()?.iter().map(SnapshotRecord::info).collect())
    }

    pub(crate) fn snapshot_records(&self) -> Result<Vec<SnapshotRecord>> {
        self.load_list(SNAPSHOTS_KEY)
    }

    pub(crate) fn replace_snapshots(&self, snapshots: &[SnapshotRecord]) -> Result<()> {
        self.save_list(SNAPSHOTS_KEY, snapshots)
    }

    pub fn load_snapshot(&self, id: &str) -> Result<SnapshotPayload> {
        let record = self
            .snapshot_records()?
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| RelayError::NotFound(format!("snapshot {}", id)))?;
        unpack(self.codec.as_ref(), &record.data)
    }

    pub fn delete_snapshot(&self, id: &str) -> Result<()> {
        let mut snapshots = self.snapshot_records()?;
        let before = snapshots.len();
        snapshots.retain(|s| s.id != id);
        if snapshots.len() == before {
            return Err(RelayError::NotFound(format!("snapshot {}", id)));
        }
        self.save_list(SNAPSHOTS_KEY, &snapshots)?;
        tracing::info!(snapshot = %id, "Snapshot deleted");
        Ok(())
    }

    /// Drop snapshots that no longer decode or whose addresses are invalid.
    /// Returns how many were dropped.
    pub fn validate_snapshots(&self) -> Result<usize> {
        let raw = match self.store.load(SNAPSHOTS_KEY)? {
            Some(serde_json::Value::Array(items)) => items,
            Some(_) => {
                tracing::warn!("Snapshot collection is not an array, clearing");
                self.save_list::<SnapshotRecord>(SNAPSHOTS_KEY, &[])?;
                return Ok(1);
            }
            None => return Ok(0),
        };

        let total = raw.len();
        let valid: Vec<SnapshotRecord> = raw
            .into_iter()
            .filter_map(|item| serde_json::from_value::<SnapshotRecord>(item).ok())
            .filter(|record| match self.check_snapshot(record) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(snapshot = %record.id, error = %e, "Dropping invalid snapshot");
                    false
                }
            })
            .collect();

        let dropped = total - valid.len();
        if dropped > 0 {
            self.save_list(SNAPSHOTS_KEY, &valid)?;
        }
        tracing::debug!(total, dropped, "Snapshot sweep complete");
        Ok(dropped)
    }

    fn check_snapshot(&self, record: &SnapshotRecord) -> Result<()> {
        let payload: SnapshotPayload = unpack(self.codec.as_ref(), &record.data)?;
        for address in &payload.session.addresses {
            validate_address(address)?;
        }
        Ok(())
    }
}
