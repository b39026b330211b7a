//! Relay configuration
//!
//! Every timing constant and bound used by the relay lives here, grouped by
//! the subsystem that consumes it. All structs deserialize from camelCase
//! JSON with per-field defaults, so a config file only needs the values it
//! overrides.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default settle delay when the settings omit `timeoutMs`
pub const DEFAULT_SETTLE_MS: u64 = 5_000;

/// Number of endpoints a relay drives
pub const ENDPOINT_COUNT: usize = 2;

// ============================================================================
// Detector
// ============================================================================

/// Response-completion detector timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectorConfig {
    /// How long content must hold still before it counts as a complete reply
    pub stability_ms: u64,
    /// Escape hatch: accept whatever is rendered after this long
    pub force_ms: u64,
    /// Overall budget from submit to delivery
    pub total_timeout_ms: u64,
    /// Replies shorter than this (in chars) are treated as fragments
    pub min_reply_chars: usize,
    /// Attempts to locate the input and submit controls before giving up
    pub locate_attempts: u32,
    /// Delay between surface location attempts
    pub locate_retry_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            stability_ms: 1_500,
            force_ms: 10_000,
            total_timeout_ms: 60_000,
            min_reply_chars: 5,
            locate_attempts: 3,
            locate_retry_ms: 500,
        }
    }
}

impl DetectorConfig {
    pub fn stability(&self) -> Duration {
        Duration::from_millis(self.stability_ms)
    }

    pub fn force(&self) -> Duration {
        Duration::from_millis(self.force_ms)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }
}

// ============================================================================
// Channel
// ============================================================================

/// Controller ⇄ agent message channel behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelConfig {
    /// Round-trip budget for a single request
    pub request_timeout_ms: u64,
    /// Attempts per command before surfacing a send failure
    pub send_attempts: u32,
    /// Fixed delay between send attempts
    pub send_retry_ms: u64,
    /// Readiness polls during startup before giving up on an agent
    pub readiness_attempts: u32,
    /// Wait after injecting an agent before re-checking it
    pub inject_settle_ms: u64,
    /// Wait after focusing an endpoint before submitting to it
    pub focus_settle_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            send_attempts: 3,
            send_retry_ms: 1_000,
            readiness_attempts: 3,
            inject_settle_ms: 500,
            focus_settle_ms: 500,
        }
    }
}

impl ChannelConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ============================================================================
// Recovery
// ============================================================================

/// Watchdog, health check, circuit breaker, and backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecoveryConfig {
    /// How often the watchdog looks at the conversation
    pub watchdog_interval_ms: u64,
    /// Silence longer than this marks the conversation as stalled
    pub stall_timeout_ms: u64,
    /// How often bound endpoints are verified
    pub health_interval_ms: u64,
    /// Consecutive health-check failures before the relay disables itself
    pub health_failure_limit: u32,
    /// Consecutive errors before the session fails and the relay disables
    pub error_threshold: u32,
    /// First backoff delay
    pub backoff_base_ms: u64,
    /// Cap for exponential growth
    pub backoff_max_ms: u64,
    /// Delay used instead when the failure looks rate-limited
    pub rate_limit_delay_ms: u64,
    /// Retries before the original error is re-raised
    pub max_retries: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            watchdog_interval_ms: 10_000,
            stall_timeout_ms: 120_000,
            health_interval_ms: 60_000,
            health_failure_limit: 3,
            error_threshold: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            rate_limit_delay_ms: 60_000,
            max_retries: 3,
        }
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Bounds and cadence for durable state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistenceConfig {
    /// Conversation log ring-buffer size
    pub log_capacity: usize,
    /// Maximum retained snapshots (newest first)
    pub snapshot_capacity: usize,
    /// Maximum retained backups (newest first)
    pub backup_capacity: usize,
    /// How often the live session is saved for crash recovery
    pub session_save_interval_ms: u64,
    /// How often a backup is taken
    pub backup_interval_ms: u64,
    /// How often stored snapshots are validated
    pub snapshot_sweep_interval_ms: u64,
    /// Saved sessions older than this are not resumed
    pub resume_max_age_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            log_capacity: 100,
            snapshot_capacity: 10,
            backup_capacity: 5,
            session_save_interval_ms: 30_000,
            backup_interval_ms: 30 * 60 * 1_000,
            snapshot_sweep_interval_ms: 10 * 60 * 1_000,
            resume_max_age_ms: 30 * 60 * 1_000,
        }
    }
}

// ============================================================================
// Root
// ============================================================================

/// Complete relay configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    pub detector: DetectorConfig,
    pub channel: ChannelConfig,
    pub recovery: RecoveryConfig,
    pub persistence: PersistenceConfig,
}

impl RelayConfig {
    /// Load configuration from a JSON file, defaulting anything omitted
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: RelayConfig = serde_json::from_str(&json).map_err(|e| {
            RelayError::Configuration(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        config.validate()?;
        tracing::debug!(path = %path.display(), "Relay config loaded");
        Ok(config)
    }

    /// Reject values that would make the relay misbehave
    pub fn validate(&self) -> Result<()> {
        let d = &self.detector;
        if d.stability_ms == 0 {
            return Err(RelayError::Configuration(
                "detector.stabilityMs must be greater than zero".to_string(),
            ));
        }
        if d.force_ms <= d.stability_ms {
            return Err(RelayError::Configuration(
                "detector.forceMs must exceed detector.stabilityMs".to_string(),
            ));
        }
        if d.total_timeout_ms <= d.force_ms {
            return Err(RelayError::Configuration(
                "detector.totalTimeoutMs must exceed detector.forceMs".to_string(),
            ));
        }
        if self.channel.send_attempts == 0 || self.channel.readiness_attempts == 0 {
            return Err(RelayError::Configuration(
                "channel attempts must be at least 1".to_string(),
            ));
        }
        if self.recovery.error_threshold == 0 || self.recovery.health_failure_limit == 0 {
            return Err(RelayError::Configuration(
                "recovery thresholds must be at least 1".to_string(),
            ));
        }
        let p = &self.persistence;
        if p.log_capacity == 0 || p.snapshot_capacity == 0 || p.backup_capacity == 0 {
            return Err(RelayError::Configuration(
                "persistence capacities must be at least 1".to_string(),
            ));
        }
        let intervals = [
            ("recovery.watchdogIntervalMs", self.recovery.watchdog_interval_ms),
            ("recovery.healthIntervalMs", self.recovery.health_interval_ms),
            ("persistence.sessionSaveIntervalMs", p.session_save_interval_ms),
            ("persistence.backupIntervalMs", p.backup_interval_ms),
            ("persistence.snapshotSweepIntervalMs", p.snapshot_sweep_interval_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, ms)| *ms == 0) {
            return Err(RelayError::Configuration(format!(
                "{} must be greater than zero",
                name
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Settings (pushed by the settings collaborator)
// ============================================================================

/// User-facing settings: which endpoints to drive and what to talk about
///
/// Updates always replace the whole value; there is no partial merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelaySettings {
    /// Endpoint addresses; index 0 speaks first
    #[serde(default)]
    pub endpoint_addresses: Vec<String>,

    /// Settle delay after opening endpoints, in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Default conversation topic
    #[serde(default)]
    pub topic: String,
}

impl RelaySettings {
    pub fn new(addresses: [&str; 2], topic: impl Into<String>) -> Self {
        Self {
            endpoint_addresses: addresses.iter().map(|a| a.to_string()).collect(),
            timeout_ms: None,
            topic: topic.into(),
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Settle delay to wait for freshly opened endpoints
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_SETTLE_MS))
    }

    /// Exactly two absolute-URL addresses
    pub fn validate(&self) -> Result<()> {
        self.validated_addresses().map(|_| ())
    }

    /// Check the address pair and return it in speaking order
    pub fn validated_addresses(&self) -> Result<[String; 2]> {
        if self.endpoint_addresses.len() != ENDPOINT_COUNT {
            return Err(RelayError::Configuration(format!(
                "Need exactly {} endpoint addresses, got {}",
                ENDPOINT_COUNT,
                self.endpoint_addresses.len()
            )));
        }
        for address in &self.endpoint_addresses {
            validate_address(address)?;
        }
        Ok([
            self.endpoint_addresses[0].clone(),
            self.endpoint_addresses[1].clone(),
        ])
    }
}

/// An endpoint address must be an absolute URL
pub fn validate_address(address: &str) -> Result<()> {
    url::Url::parse(address)
        .map(|_| ())
        .map_err(|e| RelayError::Configuration(format!("Invalid endpoint address '{}': {}", address, e)))
}
