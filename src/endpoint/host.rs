//! Endpoint host: the controller's message channel to endpoint agents

use super::agent::{AgentRequest, EndpointAgent};
use super::{Probes, SurfaceFactory};
use crate::config::{ChannelConfig, DetectorConfig, RelayConfig};
use crate::error::{RelayError, Result};
use crate::types::{AgentCommand, AgentEvent, AgentResponse, EndpointId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

/// Commands queued per agent before senders wait
const AGENT_QUEUE_DEPTH: usize = 16;

/// Opens endpoints and carries commands to their agents
#[async_trait]
pub trait EndpointHost: Send + Sync {
    /// Open both addresses and bind an agent to each, in order
    async fn open(&self, addresses: &[String; 2]) -> Result<[EndpointId; 2]>;

    /// Whether the endpoint is still bound and its surface still open
    async fn exists(&self, endpoint: EndpointId) -> bool;

    /// Tear down the agent and close the surface
    async fn close(&self, endpoint: EndpointId) -> Result<()>;

    /// Bring the endpoint to the foreground
    async fn focus(&self, endpoint: EndpointId) -> Result<()>;

    /// Re-establish the agent if it is no longer running
    async fn inject_agent(&self, endpoint: EndpointId) -> Result<()>;

    /// One request/response round trip, bounded by the request timeout
    async fn request(&self, endpoint: EndpointId, command: AgentCommand) -> Result<AgentResponse>;
}

struct Binding {
    address: String,
    commands: mpsc::Sender<AgentRequest>,
    task: JoinHandle<()>,
}

/// In-process host running one agent task per endpoint
pub struct LocalHost {
    factory: Arc<dyn SurfaceFactory>,
    probes: Probes,
    detector: DetectorConfig,
    channel: ChannelConfig,
    bindings: RwLock<HashMap<EndpointId, Binding>>,
    next_id: AtomicU64,
    events: mpsc::UnboundedSender<AgentEvent>,
}

impl LocalHost {
    /// Create a host and the receiver all agent events arrive on
    pub fn new(
        factory: Arc<dyn SurfaceFactory>,
        config: &RelayConfig,
        probes: Probes,
    ) -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let host = Self {
            factory,
            probes,
            detector: config.detector.clone(),
            channel: config.channel.clone(),
            bindings: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events,
        };
        (host, event_rx)
    }

    async fn spawn_agent(&self, endpoint: EndpointId, address: &str) -> Result<Binding> {
        let attached = self.factory.attach(address).await?;
        let (commands, command_rx) = mpsc::channel(AGENT_QUEUE_DEPTH);
        let agent = EndpointAgent::new(
            endpoint,
            attached,
            self.probes.clone(),
            self.detector.clone(),
            self.events.clone(),
        );
        let task = agent.spawn(command_rx);
        tracing::info!(endpoint = %endpoint, address = %address, "Agent bound");
        Ok(Binding {
            address: address.to_string(),
            commands,
            task,
        })
    }

    async fn bind(&self, address: &str) -> Result<EndpointId> {
        let endpoint = EndpointId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let binding = self.spawn_agent(endpoint, address).await?;
        self.bindings.write().await.insert(endpoint, binding);
        Ok(endpoint)
    }

    async fn address_of(&self, endpoint: EndpointId) -> Result<String> {
        self.bindings
            .read()
            .await
            .get(&endpoint)
            .map(|b| b.address.clone())
            .ok_or_else(|| RelayError::NotFound(format!("endpoint {}", endpoint)))
    }

    /// Number of live bindings
    pub async fn bound(&self) -> usize {
        self.bindings.read().await.len()
    }
}

#[async_trait]
impl EndpointHost for LocalHost {
    async fn open(&self, addresses: &[String; 2]) -> Result<[EndpointId; 2]> {
        let first = self.bind(&addresses[0]).await?;
        match self.bind(&addresses[1]).await {
            Ok(second) => Ok([first, second]),
            Err(e) => {
                if let Err(close_err) = self.close(first).await {
                    tracing::warn!(endpoint = %first, error = %close_err, "Failed to close after partial open");
                }
                Err(e)
            }
        }
    }

    async fn exists(&self, endpoint: EndpointId) -> bool {
        match self.address_of(endpoint).await {
            Ok(address) => self.factory.is_open(&address).await,
            Err(_) => false,
        }
    }

    async fn close(&self, endpoint: EndpointId) -> Result<()> {
        let binding = self
            .bindings
            .write()
            .await
            .remove(&endpoint)
            .ok_or_else(|| RelayError::NotFound(format!("endpoint {}", endpoint)))?;
        binding.task.abort();
        self.factory.detach(&binding.address).await?;
        tracing::info!(endpoint = %endpoint, address = %binding.address, "Endpoint closed");
        Ok(())
    }

    async fn focus(&self, endpoint: EndpointId) -> Result<()> {
        let address = self.address_of(endpoint).await?;
        self.factory.focus(&address).await
    }

    async fn inject_agent(&self, endpoint: EndpointId) -> Result<()> {
        let (address, running) = {
            let bindings = self.bindings.read().await;
            let binding = bindings
                .get(&endpoint)
                .ok_or_else(|| RelayError::NotFound(format!("endpoint {}", endpoint)))?;
            (binding.address.clone(), !binding.task.is_finished())
        };
        if running {
            return Ok(());
        }
        if !self.factory.is_open(&address).await {
            return Err(RelayError::EndpointLost(address));
        }

        tracing::info!(endpoint = %endpoint, address = %address, "Re-injecting agent");
        let binding = self.spawn_agent(endpoint, &address).await?;
        self.bindings.write().await.insert(endpoint, binding);
        Ok(())
    }

    async fn request(&self, endpoint: EndpointId, command: AgentCommand) -> Result<AgentResponse> {
        let sender = self
            .bindings
            .read()
            .await
            .get(&endpoint)
            .map(|b| b.commands.clone())
            .ok_or_else(|| RelayError::Channel(format!("No agent bound to {}", endpoint)))?;

        let name = command.name();
        let round_trip = async move {
            let (reply, response) = oneshot::channel();
            sender
                .send(AgentRequest { command, reply })
                .await
                .map_err(|_| RelayError::Channel(format!("Agent for {} is not running", endpoint)))?;
            response
                .await
                .map_err(|_| RelayError::Channel(format!("Agent for {} dropped the request", endpoint)))
        };

        tokio::time::timeout(self.channel.request_timeout(), round_trip)
            .await
            .map_err(|_| {
                RelayError::Timeout(format!("{} to {} got no answer", name, endpoint))
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::SimulatedEndpoints;
    use crate::types::AgentEventKind;

    fn addresses() -> [String; 2] {
        ["https://a.example".into(), "https://b.example".into()]
    }

    fn setup() -> (LocalHost, mpsc::UnboundedReceiver<AgentEvent>, SimulatedEndpoints) {
        let sims = SimulatedEndpoints::new();
        sims.add("https://a.example");
        sims.add("https://b.example");
        let (host, events) = LocalHost::new(
            Arc::new(sims.clone()),
            &RelayConfig::default(),
            Probes::default(),
        );
        (host, events, sims)
    }

    #[tokio::test]
    async fn test_open_binds_in_order() {
        let (host, _events, _sims) = setup();
        let [a, b] = host.open(&addresses()).await.unwrap();
        assert_ne!(a, b);
        assert!(host.exists(a).await);
        assert!(host.exists(b).await);

        let response = host.request(a, AgentCommand::CheckAlive).await.unwrap();
        assert_eq!(
            response,
            AgentResponse::Alive {
                alive: true,
                identity: "https://a.example".into()
            }
        );
    }

    #[tokio::test]
    async fn test_partial_open_closes_first() {
        let sims = SimulatedEndpoints::new();
        let first = sims.add("https://a.example");
        let (host, _events) = LocalHost::new(
            Arc::new(sims.clone()),
            &RelayConfig::default(),
            Probes::default(),
        );

        let result = host.open(&addresses()).await;
        assert!(matches!(result, Err(RelayError::EndpointLost(_))));
        assert_eq!(host.bound().await, 0);
        assert!(!first.is_open());
    }

    #[tokio::test]
    async fn test_close_and_missing() {
        let (host, _events, sims) = setup();
        let [a, _] = host.open(&addresses()).await.unwrap();

        host.close(a).await.unwrap();
        assert!(!host.exists(a).await);
        assert!(sims.get("https://a.example").is_some_and(|s| !s.is_open()));
        assert!(matches!(host.close(a).await, Err(RelayError::NotFound(_))));
        assert!(matches!(
            host.request(a, AgentCommand::CheckAlive).await,
            Err(RelayError::Channel(_))
        ));
    }

    #[tokio::test]
    async fn test_inject_respawns_dead_agent() {
        let (host, _events, _sims) = setup();
        let [a, _] = host.open(&addresses()).await.unwrap();

        if let Some(binding) = host.bindings.read().await.get(&a) {
            binding.task.abort();
        }
        tokio::task::yield_now().await;
        assert!(host.request(a, AgentCommand::CheckAlive).await.is_err());

        host.inject_agent(a).await.unwrap();
        assert!(matches!(
            host.request(a, AgentCommand::CheckAlive).await,
            Ok(AgentResponse::Alive { alive: true, .. })
        ));
    }

    #[tokio::test]
    async fn test_closed_surface_emits_lost() {
        let (host, mut events, sims) = setup();
        let [a, _] = host.open(&addresses()).await.unwrap();

        if let Some(sim) = sims.get("https://a.example") {
            sim.close();
        }
        loop {
            let event = events.recv().await.unwrap();
            if event.kind == AgentEventKind::Lost {
                assert_eq!(event.endpoint, a);
                break;
            }
        }
        assert!(!host.exists(a).await);
        assert!(matches!(
            host.inject_agent(a).await,
            Err(RelayError::EndpointLost(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out() {
        let (host, _events, sims) = setup();
        let [a, _] = host.open(&addresses()).await.unwrap();
        if let Some(sim) = sims.get("https://a.example") {
            // agent stalls locating controls for the full retry budget
            sim.set_controls_present(false);
        }

        let config = RelayConfig::default();
        let slow = LocalHost {
            channel: ChannelConfig {
                request_timeout_ms: 100,
                ..config.channel
            },
            ..host
        };
        let result = slow
            .request(a, AgentCommand::Submit { text: "hi".into() })
            .await;
        assert!(matches!(result, Err(RelayError::Timeout(_))));
    }
}
