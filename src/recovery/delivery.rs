//! Command delivery with readiness checks and fixed-delay retry
//!
//! Every attempt first makes sure the agent answers `CheckAlive`,
//! injecting it again when it does not. Exhausted retries come back as
//! `SendOutcome::Exhausted` so the controller can notify and carry on.

use crate::config::ChannelConfig;
use crate::endpoint::EndpointHost;
use crate::error::RelayError;
use crate::types::{AgentCommand, AgentResponse, EndpointId};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered(AgentResponse),
    Exhausted { attempts: u32, last_error: String },
}

async fn is_alive(host: &dyn EndpointHost, endpoint: EndpointId) -> bool {
    match host.request(endpoint, AgentCommand::CheckAlive).await {
        Ok(AgentResponse::Alive { alive, identity }) => {
            tracing::debug!(endpoint = %endpoint, identity = %identity, alive, "Agent liveness");
            alive
        }
        Ok(other) => {
            tracing::debug!(endpoint = %endpoint, response = ?other, "Unexpected liveness response");
            false
        }
        Err(e) => {
            tracing::debug!(endpoint = %endpoint, error = %e, "Liveness check failed");
            false
        }
    }
}

/// Check the agent, injecting it once if it does not answer
pub async fn ensure_ready(
    host: &dyn EndpointHost,
    endpoint: EndpointId,
    config: &ChannelConfig,
) -> bool {
    if is_alive(host, endpoint).await {
        return true;
    }

    tracing::info!(endpoint = %endpoint, "Agent not responding, injecting");
    if let Err(e) = host.inject_agent(endpoint).await {
        tracing::warn!(endpoint = %endpoint, error = %e, "Agent injection failed");
        return false;
    }
    tokio::time::sleep(Duration::from_millis(config.inject_settle_ms)).await;

    let ready = is_alive(host, endpoint).await;
    if !ready {
        tracing::warn!(endpoint = %endpoint, "Agent still unresponsive after injection");
    }
    ready
}

/// Poll readiness up to `readiness_attempts` times
pub async fn wait_until_ready(
    host: &dyn EndpointHost,
    endpoint: EndpointId,
    config: &ChannelConfig,
) -> bool {
    for attempt in 1..=config.readiness_attempts {
        if ensure_ready(host, endpoint, config).await {
            return true;
        }
        if attempt < config.readiness_attempts {
            tokio::time::sleep(Duration::from_millis(config.inject_settle_ms)).await;
        }
    }
    false
}

pub async fn send_with_retry(
    host: &dyn EndpointHost,
    endpoint: EndpointId,
    command: AgentCommand,
    config: &ChannelConfig,
) -> SendOutcome {
    let mut last_error = String::new();

    for attempt in 1..=config.send_attempts {
        let result = if ensure_ready(host, endpoint, config).await {
            host.request(endpoint, command.clone()).await
        } else {
            Err(RelayError::Channel("Agent not available".to_string()))
        };

        match result {
            Ok(response) => {
                tracing::debug!(
                    endpoint = %endpoint,
                    command = command.name(),
                    response = ?response,
                    "Command delivered"
                );
                return SendOutcome::Delivered(response);
            }
            Err(e) => {
                tracing::debug!(
                    endpoint = %endpoint,
                    command = command.name(),
                    attempt,
                    max_attempts = config.send_attempts,
                    error = %e,
                    "Command delivery failed"
                );
                last_error = e.to_string();
                if attempt < config.send_attempts {
                    tokio::time::sleep(Duration::from_millis(config.send_retry_ms)).await;
                }
            }
        }
    }

    SendOutcome::Exhausted {
        attempts: config.send_attempts,
        last_error,
    }
}
