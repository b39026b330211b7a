//! Core relay types
//!
//! Everything that crosses a boundary (controller ⇄ agent, controller ⇄ UI,
//! controller ⇄ storage) is defined here. Persisted types use camelCase JSON.

use crate::stats::StatsReport;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle for a bound endpoint (one per opened surface)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(pub u64);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep-{}", self.0)
    }
}

/// One completed turn in a conversation session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Speaker index (0 or 1) that produced the text
    pub source: usize,

    /// Reply text as observed
    pub text: String,

    /// Unix timestamp in milliseconds
    pub timestamp: u64,
}

/// Kind of conversation log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    /// Session opened with this topic
    Topic,
    /// A reply relayed from one endpoint to the other
    Response,
}

/// A single conversation log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Unix timestamp in milliseconds
    pub timestamp: u64,

    /// Session this entry belongs to
    pub session_id: Option<String>,

    pub kind: EntryKind,

    pub content: String,

    /// Speaker index for responses; `None` for topic entries
    #[serde(default)]
    pub speaker_index: Option<usize>,
}

/// Connectivity reported by an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Online,
    Offline,
}

/// Controller → agent command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCommand {
    /// Type `text` into the endpoint and wait for its reply
    Submit { text: String },
    /// Liveness probe
    CheckAlive,
    /// Drop any in-flight observation and return to idle
    Reset,
}

impl AgentCommand {
    pub fn name(&self) -> &'static str {
        match self {
            AgentCommand::Submit { .. } => "submit",
            AgentCommand::CheckAlive => "checkAlive",
            AgentCommand::Reset => "reset",
        }
    }
}

/// Agent → controller acknowledgement for a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentResponse {
    /// Prompt was written and submitted; observation has begun
    Submitted,
    /// Agent is still observing a previous submission
    Busy,
    /// Submission failed locally (already reported as `SendError`)
    Failed { reason: String },
    /// Reply to `CheckAlive`
    Alive { alive: bool, identity: String },
    /// Reply to `Reset`
    ResetDone,
}

/// Asynchronous event emitted by an agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEvent {
    /// Endpoint the emitting agent is bound to
    pub endpoint: EndpointId,
    pub kind: AgentEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEventKind {
    /// A reply was judged complete
    ReplyObserved {
        text: String,
        /// Delivered by the force timer rather than by stability
        forced: bool,
        /// Delivered by the final scrape after the total timeout
        from_timeout: bool,
        /// Per-agent delivery counter
        sequence: u64,
    },
    /// Could not submit the prompt
    SendError(String),
    /// Submitted, but no usable reply arrived
    ResponseError(String),
    /// Agent-side connectivity change
    ConnectionStatus(ConnectionState),
    /// The surface went away and the agent terminated
    Lost,
}

/// Relay controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelayPhase {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl RelayPhase {
    /// A session is being brought up or is live
    pub fn is_active(&self) -> bool {
        matches!(self, RelayPhase::Starting | RelayPhase::Running)
    }
}

/// Broadcast on every controller state change
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub enabled: bool,
    pub phase: RelayPhase,
    pub stats: StatsReport,
    pub log: Vec<LogEntry>,
}

/// Severity of a user-visible notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NoticeLevel {
    Info,
    Error,
}

/// User-visible notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
}

impl Notice {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            title: "Chat Relay Error".to_string(),
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            title: "Chat Relay".to_string(),
            message: message.into(),
        }
    }
}

/// Everything the controller broadcasts to UI listeners
#[derive(Debug, Clone)]
pub enum RelayEvent {
    Status(Box<StatusUpdate>),
    Notice(Notice),
}

/// Current time in Unix milliseconds
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_id_display_and_json() {
        let id = EndpointId(7);
        assert_eq!(id.to_string(), "ep-7");
        assert_eq!(serde_json::to_string(&id).unwrap(), "7");
    }

    #[test]
    fn test_log_entry_serialization() {
        let entry = LogEntry {
            timestamp: 1_700_000_000_000,
            session_id: Some("ses-1".to_string()),
            kind: EntryKind::Response,
            content: "hello there".to_string(),
            speaker_index: Some(1),
        };

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["sessionId"], "ses-1");
        assert_eq!(json["kind"], "response");
        assert_eq!(json["speakerIndex"], 1);

        let parsed: LogEntry = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_log_entry_missing_speaker_defaults() {
        let json = r#"{"timestamp": 1, "sessionId": null, "kind": "topic", "content": "T"}"#;
        let entry: LogEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.kind, EntryKind::Topic);
        assert!(entry.speaker_index.is_none());
    }

    #[test]
    fn test_command_names() {
        assert_eq!(AgentCommand::Submit { text: "x".into() }.name(), "submit");
        assert_eq!(AgentCommand::CheckAlive.name(), "checkAlive");
        assert_eq!(AgentCommand::Reset.name(), "reset");
    }

    #[test]
    fn test_now_millis_advances() {
        let a = now_millis();
        assert!(a > 1_600_000_000_000);
        assert!(now_millis() >= a);
    }
}
