//! Relay statistics
//!
//! Raw counters are kept in `Stats` (persisted with the session and inside
//! backups); `StatsReport` adds the derived running time and success rate.

use serde::{Deserialize, Serialize};

/// Error buckets tracked by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Network,
    Timeout,
    ConnectionDrop,
    Other,
}

impl ErrorKind {
    /// Bucket a free-form error reason reported by an agent
    pub fn classify(reason: &str) -> Self {
        let reason = reason.to_lowercase();
        if reason.contains("timeout") || reason.contains("timed out") {
            ErrorKind::Timeout
        } else if reason.contains("network")
            || reason.contains("connection")
            || reason.contains("channel")
            || reason.contains("fetch")
        {
            ErrorKind::Network
        } else {
            ErrorKind::Other
        }
    }
}

/// Error counters by kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorCounts {
    pub network: u64,
    pub timeout: u64,
    pub connection_drop: u64,
    pub other: u64,
}

impl ErrorCounts {
    pub fn total(&self) -> u64 {
        self.network + self.timeout + self.connection_drop + self.other
    }
}

/// Raw relay counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub messages_exchanged: u64,
    pub errors: ErrorCounts,
    pub total_response_time_ms: u64,
    /// Unix milliseconds the counters started running at
    pub start_time: Option<u64>,
}

impl Stats {
    /// Fresh counters running since `now`
    pub fn started_at(now: u64) -> Self {
        Self {
            start_time: Some(now),
            ..Default::default()
        }
    }

    /// Mark the start if a restored record carried none
    pub fn touch(&mut self, now: u64) {
        self.start_time.get_or_insert(now);
    }

    pub fn record_message(&mut self, response_time_ms: u64, now: u64) {
        self.touch(now);
        self.messages_exchanged += 1;
        self.total_response_time_ms += response_time_ms;
    }

    pub fn record_error(&mut self, kind: ErrorKind, now: u64) {
        self.touch(now);
        match kind {
            ErrorKind::Network => self.errors.network += 1,
            ErrorKind::Timeout => self.errors.timeout += 1,
            ErrorKind::ConnectionDrop => self.errors.connection_drop += 1,
            ErrorKind::Other => self.errors.other += 1,
        }
    }

    /// Zero the counters; the running time restarts at `now`
    pub fn reset(&mut self, now: u64) {
        *self = Stats::started_at(now);
    }

    pub fn average_response_time_ms(&self) -> f64 {
        if self.messages_exchanged == 0 {
            0.0
        } else {
            self.total_response_time_ms as f64 / self.messages_exchanged as f64
        }
    }

    /// Success rate as a percentage; zero before any message
    pub fn success_rate(&self) -> f64 {
        if self.messages_exchanged == 0 {
            return 0.0;
        }
        let messages = self.messages_exchanged as f64;
        let errors = self.errors.total() as f64;
        (((messages - errors) / messages) * 100.0).max(0.0)
    }

    pub fn report(&self, now: u64) -> StatsReport {
        StatsReport {
            messages_exchanged: self.messages_exchanged,
            errors: self.errors.clone(),
            total_response_time_ms: self.total_response_time_ms,
            average_response_time_ms: self.average_response_time_ms(),
            start_time: self.start_time,
            running_time_ms: self.start_time.map(|s| now.saturating_sub(s)).unwrap_or(0),
            success_rate: self.success_rate(),
        }
    }
}

/// Stats plus derived figures, as served to the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub messages_exchanged: u64,
    pub errors: ErrorCounts,
    pub total_response_time_ms: u64,
    pub average_response_time_ms: f64,
    pub start_time: Option<u64>,
    pub running_time_ms: u64,
    pub success_rate: f64,
}
