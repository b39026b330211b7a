//! Periodic backups of snapshots, log, and stats

use super::{datetime_from_millis, Persistence, SnapshotRecord};
use crate::codec::{pack, unpack};
use crate::error::{RelayError, Result};
use crate::state::{BACKUPS_KEY, LOG_KEY, SNAPSHOTS_KEY};
use crate::stats::Stats;
use crate::types::LogEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Decompressed body of a backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupPayload {
    pub snapshots: Vec<SnapshotRecord>,
    pub log: Vec<LogEntry>,
    pub stats: Stats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    /// Unix milliseconds; unique within the collection
    pub timestamp: u64,
    pub created_at: DateTime<Utc>,
    pub snapshot_count: usize,
    pub log_entries: usize,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub timestamp: u64,
    pub created_at: DateTime<Utc>,
    pub snapshot_count: usize,
    pub log_entries: usize,
}

impl BackupRecord {
    pub fn info(&self) -> BackupInfo {
        BackupInfo {
            timestamp: self.timestamp,
            created_at: self.created_at,
            snapshot_count: self.snapshot_count,
            log_entries: self.log_entries,
        }
    }
}

impl Persistence {
    /// Back up the stored snapshots plus the given log and stats
    pub fn create_backup(&self, log: &[LogEntry], stats: &Stats, now: u64) -> Result<BackupInfo> {
        let payload = BackupPayload {
            snapshots: self.snapshot_records()?,
            log: log.to_vec(),
            stats: stats.clone(),
        };

        let mut backups: Vec<BackupRecord> = self.load_list(BACKUPS_KEY)?;
        // timestamps key the collection, so never reuse one
        let timestamp = match backups.first() {
            Some(newest) if newest.timestamp >= now => newest.timestamp + 1,
            _ => now,
        };

        let record = BackupRecord {
            timestamp,
            created_at: datetime_from_millis(timestamp),
            snapshot_count: payload.snapshots.len(),
            log_entries: payload.log.len(),
            data: pack(self.codec.as_ref(), &payload)?,
        };
        let info = record.info();

        backups.insert(0, record);
        backups.truncate(self.config.backup_capacity);
        self.save_list(BACKUPS_KEY, &backups)?;

        tracing::info!(
            timestamp,
            snapshots = info.snapshot_count,
            log_entries = info.log_entries,
            "Backup created"
        );
        Ok(info)
    }

    pub fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        let backups: Vec<BackupRecord> = self.load_list(BACKUPS_KEY)?;
        Ok(backups.iter().map(BackupRecord::info).collect())
    }

    /// Write the backup's snapshots and log back to the store and return
    /// the payload so the caller can replace its in-memory state
    pub fn restore_backup(&self, timestamp: u64) -> Result<BackupPayload> {
        let backups: Vec<BackupRecord> = self.load_list(BACKUPS_KEY)?;
        let record = backups
            .iter()
            .find(|b| b.timestamp == timestamp)
            .ok_or_else(|| RelayError::NotFound(format!("backup {}", timestamp)))?;

        let payload: BackupPayload = unpack(self.codec.as_ref(), &record.data)?;
        self.save_list(SNAPSHOTS_KEY, &payload.snapshots)?;
        self.save_list(LOG_KEY, &payload.log)?;

        tracing::info!(
            timestamp,
            snapshots = payload.snapshots.len(),
            log_entries = payload.log.len(),
            "Backup restored"
        );
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersistenceConfig;
    use crate::persistence::SnapshotPayload;
    use crate::session::ConversationSession;
    use crate::stats::ErrorKind;
    use crate::types::{EndpointId, EntryKind};

    fn entry(content: &str) -> LogEntry {
        LogEntry {
            timestamp: 1,
            session_id: None,
            kind: EntryKind::Response,
            content: content.into(),
            speaker_index: Some(0),
        }
    }

    fn snapshot_payload() -> SnapshotPayload {
        SnapshotPayload {
            session: ConversationSession::new(
                [EndpointId(1), EndpointId(2)],
                ["https://a.example".into(), "https://b.example".into()],
                "T",
                0,
            ),
            log_session_id: None,
            entries: Vec::new(),
        }
    }

    #[test]
    fn test_restore_replaces_wholesale() {
        let persistence = Persistence::in_memory(PersistenceConfig::default());
        persistence.create_snapshot("kept", &snapshot_payload(), 1).unwrap();

        let mut stats = Stats::default();
        stats.record_message(100, 10);
        stats.record_error(ErrorKind::Timeout, 10);
        let info = persistence.create_backup(&[entry("A1")], &stats, 1_000).unwrap();
        assert_eq!(info.snapshot_count, 1);
        assert_eq!(info.log_entries, 1);

        // diverge after the backup
        persistence.create_snapshot("later", &snapshot_payload(), 2).unwrap();
        persistence.save_log(&[entry("X"), entry("Y")]).unwrap();

        let payload = persistence.restore_backup(info.timestamp).unwrap();
        assert_eq!(payload.stats, stats);
        assert_eq!(persistence.list_snapshots().unwrap().len(), 1);
        assert_eq!(persistence.list_snapshots().unwrap()[0].description, "kept");
        assert_eq!(persistence.load_log().unwrap(), vec![entry("A1")]);
    }

    #[test]
    fn test_backups_bounded_with_unique_timestamps() {
        let config = PersistenceConfig {
            backup_capacity: 3,
            ..Default::default()
        };
        let persistence = Persistence::in_memory(config);
        for _ in 0..5 {
            persistence.create_backup(&[], &Stats::default(), 500).unwrap();
        }

        let timestamps: Vec<u64> = persistence
            .list_backups()
            .unwrap()
            .into_iter()
            .map(|b| b.timestamp)
            .collect();
        assert_eq!(timestamps, vec![504, 503, 502]);
    }

    #[test]
    fn test_restore_unknown_backup() {
        let persistence = Persistence::in_memory(PersistenceConfig::default());
        assert!(matches!(
            persistence.restore_backup(42),
            Err(RelayError::NotFound(_))
        ));
    }
}
