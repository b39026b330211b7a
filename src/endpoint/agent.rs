//! Endpoint agent
//!
//! One task per endpoint. The task is the only thing that touches the
//! surface and the detector, so all of its state lives on a single logical
//! thread: a `select!` over controller commands, surface mutation batches,
//! and the detector's next deadline.

use super::detector::{CompletionDetector, DetectorOutcome};
use super::{AttachedSurface, ChangeSource, ElementRef, Probes, Surface};
use crate::config::DetectorConfig;
use crate::error::{RelayError, Result};
use crate::types::{AgentCommand, AgentEvent, AgentEventKind, AgentResponse, ConnectionState, EndpointId};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A command plus the channel its answer goes back on
#[derive(Debug)]
pub struct AgentRequest {
    pub command: AgentCommand,
    pub reply: oneshot::Sender<AgentResponse>,
}

pub struct EndpointAgent {
    endpoint: EndpointId,
    surface: Box<dyn Surface>,
    changes: Box<dyn ChangeSource>,
    probes: Probes,
    config: DetectorConfig,
    detector: CompletionDetector,
    events: mpsc::UnboundedSender<AgentEvent>,
    online: bool,
}

impl EndpointAgent {
    pub fn new(
        endpoint: EndpointId,
        attached: AttachedSurface,
        probes: Probes,
        config: DetectorConfig,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Self {
        let online = attached.surface.online();
        Self {
            endpoint,
            surface: attached.surface,
            changes: attached.changes,
            probes,
            detector: CompletionDetector::new(config.clone()),
            config,
            events,
            online,
        }
    }

    pub fn spawn(self, commands: mpsc::Receiver<AgentRequest>) -> JoinHandle<()> {
        tokio::spawn(self.run(commands))
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<AgentRequest>) {
        tracing::debug!(endpoint = %self.endpoint, identity = %self.surface.identity(), "Agent started");
        self.emit(AgentEventKind::ConnectionStatus(self.connection_state()));

        loop {
            let deadline = self.detector.next_deadline();
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                request = commands.recv() => {
                    let Some(request) = request else {
                        tracing::debug!(endpoint = %self.endpoint, "Command channel closed, agent exiting");
                        break;
                    };
                    let response = self.handle(request.command).await;
                    // requester may have timed out
                    let _ = request.reply.send(response);
                }
                batch = self.changes.next_batch() => {
                    if batch.is_none() {
                        tracing::info!(endpoint = %self.endpoint, "Surface gone, agent exiting");
                        self.emit(AgentEventKind::Lost);
                        break;
                    }
                    self.on_changes();
                }
                _ = timer => {
                    self.on_deadline();
                }
            }
        }
    }

    async fn handle(&mut self, command: AgentCommand) -> AgentResponse {
        match command {
            AgentCommand::Submit { text } => self.submit(&text).await,
            AgentCommand::CheckAlive => AgentResponse::Alive {
                alive: true,
                identity: self.surface.identity(),
            },
            AgentCommand::Reset => {
                self.detector.reset();
                tracing::debug!(endpoint = %self.endpoint, "Detector reset");
                AgentResponse::ResetDone
            }
        }
    }

    async fn submit(&mut self, text: &str) -> AgentResponse {
        if !self.detector.is_idle() {
            tracing::debug!(endpoint = %self.endpoint, phase = ?self.detector.phase(), "Submit while busy");
            return AgentResponse::Busy;
        }

        match self.try_submit(text).await {
            Ok(()) => {
                tracing::debug!(endpoint = %self.endpoint, chars = text.chars().count(), "Prompt submitted");
                AgentResponse::Submitted
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(endpoint = %self.endpoint, error = %reason, "Submit failed");
                self.emit(AgentEventKind::SendError(reason.clone()));
                AgentResponse::Failed { reason }
            }
        }
    }

    async fn try_submit(&mut self, text: &str) -> Result<()> {
        let (input, button) = self.locate_controls().await?;
        let baseline = self.probes.observe(self.surface.as_ref()).candidate;

        self.surface.write_input(&input, text)?;
        self.surface.signal_input(&input)?;
        self.surface.activate(&button)?;

        self.detector.begin(Instant::now(), baseline);
        Ok(())
    }

    /// Find the input and submit controls, retrying while the surface settles
    async fn locate_controls(&mut self) -> Result<(ElementRef, ElementRef)> {
        let mut found = (None, None);
        for attempt in 1..=self.config.locate_attempts {
            found = (
                Probes::first_match(self.surface.as_ref(), &self.probes.input),
                Probes::first_match(self.surface.as_ref(), &self.probes.submit),
            );
            if let (Some(input), Some(button)) = &found {
                return Ok((input.clone(), button.clone()));
            }
            if attempt < self.config.locate_attempts {
                tokio::time::sleep(Duration::from_millis(self.config.locate_retry_ms)).await;
            }
        }

        Err(RelayError::SurfaceNotFound(format!(
            "Chat interface elements not found. Input: {}, Button: {}",
            found.0.is_some(),
            found.1.is_some()
        )))
    }

    fn on_changes(&mut self) {
        let online = self.surface.online();
        if online != self.online {
            self.online = online;
            tracing::info!(endpoint = %self.endpoint, online, "Connection status changed");
            self.emit(AgentEventKind::ConnectionStatus(self.connection_state()));
        }

        if self.detector.is_watching() {
            let observation = self.probes.observe(self.surface.as_ref());
            self.detector.on_mutations(&observation, Instant::now());
        }
    }

    fn on_deadline(&mut self) {
        let observation = self.probes.observe(self.surface.as_ref());
        match self.detector.on_timer(&observation, Instant::now()) {
            Some(DetectorOutcome::Delivered(delivery)) => {
                tracing::debug!(
                    endpoint = %self.endpoint,
                    sequence = delivery.sequence,
                    forced = delivery.forced,
                    from_timeout = delivery.from_timeout,
                    "Reply observed"
                );
                self.emit(AgentEventKind::ReplyObserved {
                    text: delivery.text,
                    forced: delivery.forced,
                    from_timeout: delivery.from_timeout,
                    sequence: delivery.sequence,
                });
            }
            Some(DetectorOutcome::TimedOut) => {
                tracing::warn!(endpoint = %self.endpoint, "No response within timeout");
                self.emit(AgentEventKind::ResponseError(
                    "No response received within timeout.".to_string(),
                ));
            }
            None => {}
        }
    }

    fn connection_state(&self) -> ConnectionState {
        if self.online {
            ConnectionState::Online
        } else {
            ConnectionState::Offline
        }
    }

    fn emit(&self, kind: AgentEventKind) {
        let event = AgentEvent {
            endpoint: self.endpoint,
            kind,
        };
        if self.events.send(event).is_err() {
            tracing::debug!(endpoint = %self.endpoint, "No event listener");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{SimulatedEndpoint, SimulatedEndpoints, SurfaceFactory};

    const ADDRESS: &str = "https://a.example/chat";

    fn detector_config() -> DetectorConfig {
        DetectorConfig {
            stability_ms: 1_000,
            force_ms: 5_000,
            total_timeout_ms: 20_000,
            ..Default::default()
        }
    }

    struct Harness {
        sim: SimulatedEndpoint,
        commands: mpsc::Sender<AgentRequest>,
        events: mpsc::UnboundedReceiver<AgentEvent>,
        task: JoinHandle<()>,
    }

    async fn harness() -> Harness {
        let endpoints = SimulatedEndpoints::new();
        let sim = endpoints.add(ADDRESS);
        let attached = endpoints.attach(ADDRESS).await.unwrap();

        let (event_tx, events) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::channel(8);
        let agent = EndpointAgent::new(
            EndpointId(1),
            attached,
            Probes::default(),
            detector_config(),
            event_tx,
        );
        let task = agent.spawn(command_rx);
        Harness {
            sim,
            commands,
            events,
            task,
        }
    }

    async fn request(h: &Harness, command: AgentCommand) -> AgentResponse {
        let (reply, rx) = oneshot::channel();
        h.commands.send(AgentRequest { command, reply }).await.unwrap();
        rx.await.unwrap()
    }

    fn kinds(events: &mut mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEventKind> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event.kind);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_then_stable_reply() {
        let mut h = harness().await;
        assert_eq!(
            request(&h, AgentCommand::CheckAlive).await,
            AgentResponse::Alive {
                alive: true,
                identity: ADDRESS.into()
            }
        );

        let response = request(&h, AgentCommand::Submit { text: "Hi there".into() }).await;
        assert_eq!(response, AgentResponse::Submitted);
        assert_eq!(h.sim.last_submitted().as_deref(), Some("Hi there"));

        h.sim.push_bubble("Hello");
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.sim.render("Hello back");
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.sim.render("Hello back to you");
        tokio::time::sleep(Duration::from_millis(5_000)).await;

        let events = kinds(&mut h.events);
        assert_eq!(
            events,
            vec![
                AgentEventKind::ConnectionStatus(ConnectionState::Online),
                AgentEventKind::ReplyObserved {
                    text: "Hello back to you".into(),
                    forced: false,
                    from_timeout: false,
                    sequence: 1,
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_while_observing() {
        let h = harness().await;
        request(&h, AgentCommand::Submit { text: "one".into() }).await;
        assert_eq!(
            request(&h, AgentCommand::Submit { text: "two".into() }).await,
            AgentResponse::Busy
        );
        assert_eq!(request(&h, AgentCommand::Reset).await, AgentResponse::ResetDone);
        assert_eq!(
            request(&h, AgentCommand::Submit { text: "two".into() }).await,
            AgentResponse::Submitted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_controls_reports_send_error() {
        let mut h = harness().await;
        h.sim.set_controls_present(false);

        let started = Instant::now();
        let response = request(&h, AgentCommand::Submit { text: "hi".into() }).await;
        assert!(matches!(response, AgentResponse::Failed { .. }));
        // three attempts, two waits
        assert_eq!(started.elapsed(), Duration::from_millis(1_000));

        let events = kinds(&mut h.events);
        assert!(events.iter().any(|k| matches!(
            k,
            AgentEventKind::SendError(reason)
                if reason.contains("Chat interface elements not found. Input: false, Button: false")
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_reply() {
        let mut h = harness().await;
        request(&h, AgentCommand::Submit { text: "hello?".into() }).await;
        tokio::time::sleep(Duration::from_millis(21_000)).await;

        let events = kinds(&mut h.events);
        assert_eq!(
            events.last(),
            Some(&AgentEventKind::ResponseError(
                "No response received within timeout.".into()
            ))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_and_lost() {
        let mut h = harness().await;
        h.sim.set_online(false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.sim.close();
        (&mut h.task).await.unwrap();

        let events = kinds(&mut h.events);
        assert_eq!(
            events,
            vec![
                AgentEventKind::ConnectionStatus(ConnectionState::Online),
                AgentEventKind::ConnectionStatus(ConnectionState::Offline),
                AgentEventKind::Lost,
            ]
        );
    }
}
