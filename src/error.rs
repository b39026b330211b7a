//! Error types for a3s-relay

use thiserror::Error;

/// Errors that can occur in the relay engine
#[derive(Debug, Error)]
pub enum RelayError {
    /// Bad or missing settings (fatal to the `start` call, not the process)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The surface adapter could not locate input, submit, or output
    #[error("Surface element not found: {0}")]
    SurfaceNotFound(String),

    /// Message delivery to or from an endpoint agent failed
    #[error("Channel error: {0}")]
    Channel(String),

    /// No stable reply (or channel answer) within budget
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// A bound endpoint disappeared
    #[error("Endpoint lost: {0}")]
    EndpointLost(String),

    /// Durable storage read or write failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Compression or decompression failure
    #[error("Codec error: {0}")]
    Codec(String),

    /// Operation is not valid in the current relay phase
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Relay was disabled by the circuit breaker or by the user
    #[error("Relay is disabled")]
    Disabled,

    /// Snapshot, backup, or endpoint not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    /// Whether a retry with backoff may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::Channel(_) | RelayError::Timeout(_) | RelayError::SurfaceNotFound(_)
        )
    }

    /// Whether the failure looks rate-limit shaped
    pub fn is_rate_limited(&self) -> bool {
        let message = self.to_string().to_lowercase();
        message.contains("rate limit") || message.contains("too many requests")
    }
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
