//! Conversation session and controller state
//!
//! `ConversationSession` holds the turn bookkeeping for one relay run and
//! `ControllerState` bundles everything the controller mutates. Both are
//! plain values: turn acceptance here is synchronous and side-effect free,
//! so the alternation rules can be tested without any endpoints.

use crate::conversation_log::ConversationLog;
use crate::prompt;
use crate::recovery::BackoffState;
use crate::stats::Stats;
use crate::types::{EndpointId, HistoryEntry, RelayPhase};
use serde::{Deserialize, Serialize};

/// The unit of an active relay run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSession {
    /// Bound endpoints; index 0 speaks first
    pub endpoints: [EndpointId; 2],

    /// Addresses the endpoints were opened from, used to rebind on restore
    pub addresses: [String; 2],

    /// Index of the endpoint whose reply is awaited. After a reply is
    /// accepted this flips, and the follow-up goes to the new value.
    pub current_speaker: usize,

    /// Immutable seed text
    pub topic: String,

    /// Completed turns in completion order
    pub history: Vec<HistoryEntry>,

    /// Unix milliseconds of the last turn completion (or of arming)
    pub last_message_time: u64,
}

/// A reply accepted by the session, with the prompt to forward
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    /// Speaker index that produced the reply
    pub from: usize,
    /// Speaker index that receives the follow-up
    pub to: usize,
    /// Endpoint bound to `to`
    pub endpoint: EndpointId,
    /// Follow-up prompt for `to`
    pub prompt: String,
    /// Time since the previous completion
    pub response_time_ms: u64,
}

/// Why a reply was not accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnRejected {
    /// The reply came from the endpoint that is not expected to speak
    OutOfTurn { expected: usize, got: usize },
    /// Speaker index out of range
    UnknownSpeaker(usize),
}

impl ConversationSession {
    pub fn new(
        endpoints: [EndpointId; 2],
        addresses: [String; 2],
        topic: impl Into<String>,
        now: u64,
    ) -> Self {
        Self {
            endpoints,
            addresses,
            current_speaker: 0,
            topic: topic.into(),
            history: Vec::new(),
            last_message_time: now,
        }
    }

    /// Speaker index bound to an endpoint
    pub fn speaker_of(&self, endpoint: EndpointId) -> Option<usize> {
        self.endpoints.iter().position(|e| *e == endpoint)
    }

    pub fn expected_sender(&self) -> usize {
        self.current_speaker
    }

    /// Validate, record, and flip the turn
    pub fn accept_reply(
        &mut self,
        speaker: usize,
        text: &str,
        now: u64,
    ) -> std::result::Result<Turn, TurnRejected> {
        if speaker >= self.endpoints.len() {
            return Err(TurnRejected::UnknownSpeaker(speaker));
        }
        if speaker != self.current_speaker {
            return Err(TurnRejected::OutOfTurn {
                expected: self.current_speaker,
                got: speaker,
            });
        }

        let response_time_ms = now.saturating_sub(self.last_message_time);
        self.history.push(HistoryEntry {
            source: speaker,
            text: text.to_string(),
            timestamp: now,
        });
        self.last_message_time = now;
        self.current_speaker = 1 - speaker;

        let prompt = if self.history.len() == 1 {
            prompt::first_follow_up(&self.topic, text)
        } else {
            prompt::follow_up(&self.topic, text)
        };

        Ok(Turn {
            from: speaker,
            to: self.current_speaker,
            endpoint: self.endpoints[self.current_speaker],
            prompt,
            response_time_ms,
        })
    }

    /// Rebind to freshly opened endpoints, keeping turn position and history
    pub fn rebind(&mut self, endpoints: [EndpointId; 2], now: u64) {
        self.endpoints = endpoints;
        self.last_message_time = now;
    }

    /// Prompt to re-issue to the current speaker after a rebind
    pub fn resume_prompt(&self) -> String {
        prompt::resume(&self.topic, self.history.last().map(|h| h.text.as_str()))
    }
}

/// Everything the controller owns and mutates
#[derive(Debug, Clone)]
pub struct ControllerState {
    pub phase: RelayPhase,
    /// Cleared by the circuit breaker; requires explicit re-enable
    pub enabled: bool,
    pub session: Option<ConversationSession>,
    pub stats: Stats,
    pub backoff: BackoffState,
    pub log: ConversationLog,
    /// Consecutive failed health checks
    pub health_failures: u32,
}

impl ControllerState {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            phase: RelayPhase::Idle,
            enabled: true,
            session: None,
            stats: Stats::default(),
            backoff: BackoffState::default(),
            log: ConversationLog::new(log_capacity),
            health_failures: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase == RelayPhase::Running && self.session.is_some()
    }
}
