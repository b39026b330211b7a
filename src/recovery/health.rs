//! Periodic endpoint health check
//!
//! Verifies that both bound endpoints still exist and that their agents
//! answer. The controller turns a failed report into a failure count and
//! disables the relay once the limit is reached.

use super::delivery::ensure_ready;
use crate::config::ChannelConfig;
use crate::endpoint::EndpointHost;
use crate::types::EndpointId;

/// Result of checking both endpoints of a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Speaker indices whose endpoint no longer exists
    pub missing: Vec<usize>,
    /// Speaker indices whose agent could not be made ready
    pub unresponsive: Vec<usize>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.missing.is_empty() && self.unresponsive.is_empty()
    }

    pub fn has_missing(&self) -> bool {
        !self.missing.is_empty()
    }
}

pub async fn check_endpoints(
    host: &dyn EndpointHost,
    endpoints: &[EndpointId; 2],
    config: &ChannelConfig,
) -> HealthReport {
    let mut report = HealthReport::default();

    for (index, endpoint) in endpoints.iter().enumerate() {
        if !host.exists(*endpoint).await {
            report.missing.push(index);
            continue;
        }
        if !ensure_ready(host, *endpoint, config).await {
            report.unresponsive.push(index);
        }
    }

    if report.is_healthy() {
        tracing::debug!(endpoints = ?endpoints, "Endpoints healthy");
    } else {
        tracing::warn!(
            missing = ?report.missing,
            unresponsive = ?report.unresponsive,
            "Endpoint health check failed"
        );
    }
    report
}
