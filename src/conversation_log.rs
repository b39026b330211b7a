//! Rolling conversation log
//!
//! A bounded ring buffer of `LogEntry` records shared across sessions.
//! When full, the oldest entry is evicted. Entries are tagged with the
//! session id that was current when they were appended.

use crate::types::{EntryKind, LogEntry};
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct ConversationLog {
    entries: VecDeque<LogEntry>,
    max_entries: usize,
    current_session_id: Option<String>,
}

impl ConversationLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries.min(1024)),
            max_entries,
            current_session_id: None,
        }
    }

    /// Begin a new session; subsequent entries carry the returned id
    pub fn start_session(&mut self) -> String {
        let id = format!("ses-{}", uuid::Uuid::new_v4());
        self.current_session_id = Some(id.clone());
        id
    }

    pub fn set_session_id(&mut self, session_id: Option<String>) {
        self.current_session_id = session_id;
    }

    pub fn session_id(&self) -> Option<&str> {
        self.current_session_id.as_deref()
    }

    pub fn append(
        &mut self,
        kind: EntryKind,
        content: impl Into<String>,
        speaker_index: Option<usize>,
        timestamp: u64,
    ) -> &LogEntry {
        self.entries.push_back(LogEntry {
            timestamp,
            session_id: self.current_session_id.clone(),
            kind,
            content: content.into(),
            speaker_index,
        });

        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }

        // push_back above guarantees at least one entry
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Entries belonging to one session, oldest first
    pub fn entries_for(&self, session_id: &str) -> Vec<LogEntry> {
        self.entries
            .iter()
            .filter(|e| e.session_id.as_deref() == Some(session_id))
            .cloned()
            .collect()
    }

    /// Replace the whole log (backup restore / load from storage)
    pub fn replace(&mut self, entries: Vec<LogEntry>) {
        let skip = entries.len().saturating_sub(self.max_entries);
        self.entries = entries.into_iter().skip(skip).collect();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
