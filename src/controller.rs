//! Session controller
//!
//! Owns the conversation state machine and drives everything around it:
//!
//! ```text
//! Idle ──start──▶ Starting ──seed sent──▶ Running ──stop──▶ Stopping ──▶ Idle
//!                    │                       │
//!                    └──── failure ──────────┴──breaker──▶ Failed ──▶ Idle (disabled)
//! ```
//!
//! All mutable state sits in one [`ControllerState`] value. Every method is
//! called from the relay service loop, one at a time, so agent events,
//! timer ticks, and UI commands never interleave inside a handler.

use crate::clock::RelayClock;
use crate::config::{validate_address, RelayConfig, RelaySettings};
use crate::endpoint::EndpointHost;
use crate::error::{RelayError, Result};
use crate::persistence::{
    BackupInfo, PersistedSession, Persistence, SnapshotInfo, SnapshotPayload,
};
use crate::prompt;
use crate::recovery::{
    check_endpoints, ensure_ready, send_with_retry, wait_until_ready, with_backoff, BackoffPolicy,
    SendOutcome, Watchdog, WatchdogVerdict,
};
use crate::session::{ConversationSession, ControllerState};
use crate::stats::{ErrorKind, Stats, StatsReport};
use crate::types::{
    AgentCommand, AgentEvent, AgentEventKind, AgentResponse, ConnectionState, EndpointId,
    EntryKind, LogEntry, Notice, RelayEvent, RelayPhase, StatusUpdate,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Broadcast buffer for UI listeners
const EVENT_CAPACITY: usize = 64;

pub struct SessionController {
    config: RelayConfig,
    settings: RelaySettings,
    state: ControllerState,
    host: Arc<dyn EndpointHost>,
    persistence: Persistence,
    backoff_policy: BackoffPolicy,
    watchdog: Watchdog,
    clock: RelayClock,
    events: broadcast::Sender<RelayEvent>,
}

impl SessionController {
    pub fn new(config: RelayConfig, host: Arc<dyn EndpointHost>, persistence: Persistence) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let clock = RelayClock::new();
        let mut state = ControllerState::new(config.persistence.log_capacity);
        state.stats = Stats::started_at(clock.now());
        Self {
            state,
            backoff_policy: BackoffPolicy::from_config(&config.recovery),
            watchdog: Watchdog::new(config.recovery.stall_timeout_ms),
            settings: RelaySettings::default(),
            clock,
            config,
            host,
            persistence,
            events,
        }
    }

    pub fn with_settings(mut self, settings: RelaySettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Sender side of the UI broadcast, for handles that subscribe later
    pub fn event_sender(&self) -> broadcast::Sender<RelayEvent> {
        self.events.clone()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Restore the log and, if possible, resume a recently saved session
    pub async fn initialize(&mut self) {
        match self.persistence.load_log() {
            Ok(entries) => self.state.log.replace(entries),
            Err(e) => tracing::warn!(error = %e, "Failed to load conversation log"),
        }

        if let Err(e) = self.try_resume().await {
            tracing::warn!(error = %e, "Session resumption failed");
        }
        self.broadcast_status();
    }

    async fn try_resume(&mut self) -> Result<()> {
        let now = self.clock.now();
        let Some(record) = self.persistence.resumable_session(now)? else {
            return Ok(());
        };

        for endpoint in record.session.endpoints {
            if !self.host.exists(endpoint).await {
                tracing::info!(endpoint = %endpoint, "Saved session references a missing endpoint, discarding");
                self.persistence.clear_session()?;
                return Ok(());
            }
        }

        for endpoint in record.session.endpoints {
            if !ensure_ready(self.host.as_ref(), endpoint, &self.config.channel).await {
                tracing::warn!(endpoint = %endpoint, "Resumed endpoint agent not ready");
            }
        }

        let mut session = record.session;
        session.last_message_time = now;
        tracing::info!(topic = %session.topic, turns = session.history.len(), "Resuming saved session");

        self.state.session = Some(session);
        self.state.stats = record.stats;
        self.state.backoff = record.backoff;
        self.state.log.set_session_id(record.log_session_id);
        self.state.phase = RelayPhase::Running;
        self.watchdog.arm();
        Ok(())
    }

    /// Replace the settings wholesale; counters start fresh
    pub fn update_settings(&mut self, settings: RelaySettings) {
        tracing::info!(
            addresses = settings.endpoint_addresses.len(),
            topic = %settings.topic,
            "Settings updated"
        );
        self.settings = settings;
        self.state.backoff.reset();
        self.state.health_failures = 0;
        self.broadcast_status();
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Start a relay on `topic`, falling back to the configured topic
    pub async fn start(&mut self, topic: &str) -> Result<()> {
        if !self.state.enabled {
            return Err(RelayError::Disabled);
        }
        if self.state.phase != RelayPhase::Idle {
            return Err(RelayError::InvalidState(format!(
                "Cannot start while {:?}",
                self.state.phase
            )));
        }

        let addresses = self.settings.validated_addresses()?;
        let topic = match topic.trim() {
            "" => self.settings.topic.trim().to_string(),
            t => t.to_string(),
        };
        if topic.is_empty() {
            return Err(RelayError::Configuration(
                "A conversation topic is required".to_string(),
            ));
        }

        tracing::info!(topic = %topic, "Starting chat relay");
        self.state.phase = RelayPhase::Starting;
        self.broadcast_status();

        match self.launch(addresses, topic).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "Relay start failed");
                self.teardown_session().await;
                self.record_error(
                    ErrorKind::classify(&e.to_string()),
                    format!("Failed to start chat relay: {}", e),
                )
                .await;
                self.broadcast_status();
                Err(e)
            }
        }
    }

    async fn launch(&mut self, addresses: [String; 2], topic: String) -> Result<()> {
        let endpoints = self.open_endpoints(&addresses).await?;
        self.state.session = Some(ConversationSession::new(
            endpoints,
            addresses,
            topic.clone(),
            self.clock.now(),
        ));

        tokio::time::sleep(self.settings.settle_delay()).await;
        self.await_agents(&endpoints).await?;

        self.state.log.start_session();
        self.append_log(EntryKind::Topic, &topic, None);
        self.state.stats.touch(self.clock.now());

        if !self.dispatch(endpoints[0], prompt::seed(&topic)).await? {
            return Err(RelayError::SurfaceNotFound(format!(
                "{} could not accept the opening prompt",
                endpoints[0]
            )));
        }
        match self.dispatch(endpoints[1], prompt::holding()).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(endpoint = %endpoints[1], "Holding prompt rejected"),
            Err(e) => tracing::warn!(endpoint = %endpoints[1], error = %e, "Holding prompt not delivered"),
        }

        self.enter_running();
        self.notify(Notice::info(format!("Chat relay started: {}", topic)));
        Ok(())
    }

    async fn open_endpoints(&mut self, addresses: &[String; 2]) -> Result<[EndpointId; 2]> {
        let host = self.host.clone();
        let addresses = addresses.clone();
        with_backoff(
            &self.backoff_policy,
            &mut self.state.backoff,
            "open endpoints",
            |_| {
                let host = host.clone();
                let addresses = addresses.clone();
                async move { host.open(&addresses).await }
            },
        )
        .await
    }

    async fn await_agents(&self, endpoints: &[EndpointId; 2]) -> Result<()> {
        for endpoint in endpoints {
            if !wait_until_ready(self.host.as_ref(), *endpoint, &self.config.channel).await {
                return Err(RelayError::Channel(format!(
                    "Agent for {} did not become ready",
                    endpoint
                )));
            }
        }
        Ok(())
    }

    fn enter_running(&mut self) {
        let now = self.clock.now();
        if let Some(session) = self.state.session.as_mut() {
            session.last_message_time = now;
        }
        self.state.phase = RelayPhase::Running;
        self.watchdog.arm();
        self.save_session();
        self.broadcast_status();
        tracing::info!("Chat relay running");
    }

    /// Stop everything; safe to call in any state and more than once
    pub async fn stop(&mut self) {
        if self.state.phase == RelayPhase::Idle && self.state.session.is_none() {
            tracing::debug!("Stop requested while idle");
            return;
        }

        tracing::info!(phase = ?self.state.phase, "Stopping chat relay");
        self.state.phase = RelayPhase::Stopping;
        self.teardown_session().await;
        self.state.stats.reset(self.clock.now());
        self.state.health_failures = 0;
        self.broadcast_status();
    }

    /// Close endpoints, disarm the watchdog, forget the persisted session
    async fn teardown_session(&mut self) {
        self.watchdog.disarm();
        if let Some(session) = self.state.session.take() {
            for endpoint in session.endpoints {
                if let Err(e) = self.host.close(endpoint).await {
                    tracing::warn!(endpoint = %endpoint, error = %e, "Endpoint teardown failed");
                }
            }
        }
        if let Err(e) = self.persistence.clear_session() {
            tracing::warn!(error = %e, "Failed to clear saved session");
        }
        self.state.phase = RelayPhase::Idle;
    }

    /// Circuit breaker: drop the session and disable the relay
    async fn fail_session(&mut self, reason: &str) {
        tracing::error!(reason = %reason, "Chat relay failed, disabling");
        self.state.phase = RelayPhase::Failed;
        self.broadcast_status();

        self.teardown_session().await;
        self.state.enabled = false;
        self.notify(Notice::error(format!(
            "{}. The relay has been disabled; re-enable it to continue.",
            reason
        )));
        self.broadcast_status();
    }

    pub async fn enable(&mut self) {
        self.state.enabled = true;
        self.state.backoff.reset();
        self.state.health_failures = 0;
        tracing::info!("Chat relay enabled");
        self.broadcast_status();
    }

    pub async fn disable(&mut self) {
        self.state.enabled = false;
        tracing::info!("Chat relay disabled");
        self.stop().await;
        self.broadcast_status();
    }

    // ========================================================================
    // Agent events
    // ========================================================================

    pub async fn handle_agent_event(&mut self, event: AgentEvent) {
        let AgentEvent { endpoint, kind } = event;
        match kind {
            AgentEventKind::ReplyObserved {
                text,
                forced,
                from_timeout,
                sequence,
            } => {
                tracing::debug!(
                    endpoint = %endpoint,
                    sequence,
                    forced,
                    from_timeout,
                    "Reply observed"
                );
                self.on_reply_observed(endpoint, &text).await;
            }
            AgentEventKind::SendError(reason) | AgentEventKind::ResponseError(reason) => {
                self.on_agent_error(endpoint, &reason).await;
            }
            AgentEventKind::ConnectionStatus(ConnectionState::Offline) => {
                if self.running_speaker(endpoint).is_some() {
                    self.record_error(
                        ErrorKind::ConnectionDrop,
                        format!("Connection lost to {}", endpoint),
                    )
                    .await;
                }
            }
            AgentEventKind::ConnectionStatus(ConnectionState::Online) => {
                tracing::debug!(endpoint = %endpoint, "Endpoint online");
            }
            AgentEventKind::Lost => self.on_endpoint_lost(endpoint).await,
        }
    }

    /// Speaker index for `endpoint` if a session is running
    fn running_speaker(&self, endpoint: EndpointId) -> Option<usize> {
        if !self.state.is_running() {
            return None;
        }
        self.state.session.as_ref()?.speaker_of(endpoint)
    }

    pub async fn on_reply_observed(&mut self, endpoint: EndpointId, text: &str) {
        let Some(speaker) = self.running_speaker(endpoint) else {
            tracing::debug!(endpoint = %endpoint, "Ignoring reply outside a running session");
            return;
        };

        let now = self.clock.now();
        let Some(session) = self.state.session.as_mut() else {
            return;
        };
        let turn = match session.accept_reply(speaker, text, now) {
            Ok(turn) => turn,
            Err(rejected) => {
                tracing::warn!(endpoint = %endpoint, rejected = ?rejected, "Ignoring out-of-turn reply");
                return;
            }
        };

        self.state.stats.record_message(turn.response_time_ms, now);
        self.state.backoff.consecutive_errors = 0;
        self.append_log(EntryKind::Response, text, Some(turn.from));
        self.broadcast_status();
        tracing::info!(
            from = turn.from,
            to = turn.to,
            response_time_ms = turn.response_time_ms,
            "Turn complete"
        );

        if let Err(e) = self.host.focus(turn.endpoint).await {
            tracing::warn!(endpoint = %turn.endpoint, error = %e, "Failed to focus endpoint");
        }
        tokio::time::sleep(Duration::from_millis(self.config.channel.focus_settle_ms)).await;

        match self.dispatch(turn.endpoint, turn.prompt).await {
            Ok(true) => {}
            // the agent reports its own send error
            Ok(false) => {}
            Err(e) => {
                self.record_error(ErrorKind::classify(&e.to_string()), e.to_string())
                    .await;
            }
        }
    }

    pub async fn on_agent_error(&mut self, endpoint: EndpointId, reason: &str) {
        let Some(speaker) = self.running_speaker(endpoint) else {
            tracing::debug!(endpoint = %endpoint, reason = %reason, "Ignoring agent error outside a running session");
            return;
        };
        let expected = self
            .state
            .session
            .as_ref()
            .map(ConversationSession::expected_sender);
        if expected != Some(speaker) {
            tracing::warn!(endpoint = %endpoint, speaker, reason = %reason, "Ignoring error from idle speaker");
            return;
        }

        self.record_error(ErrorKind::classify(reason), reason.to_string())
            .await;
    }

    async fn on_endpoint_lost(&mut self, endpoint: EndpointId) {
        let known = self
            .state
            .session
            .as_ref()
            .and_then(|s| s.speaker_of(endpoint))
            .is_some();
        if !known {
            tracing::debug!(endpoint = %endpoint, "Unbound endpoint went away");
            return;
        }

        tracing::warn!(endpoint = %endpoint, "Endpoint lost, discarding session");
        self.state
            .stats
            .record_error(ErrorKind::ConnectionDrop, self.clock.now());
        self.teardown_session().await;
        self.notify(Notice::error(
            "A chat endpoint was closed. The conversation has been stopped.",
        ));
        self.broadcast_status();
    }

    /// Count an error; trips the breaker at the threshold
    async fn record_error(&mut self, kind: ErrorKind, message: String) {
        self.state.stats.record_error(kind, self.clock.now());
        self.state.backoff.consecutive_errors += 1;
        let consecutive = self.state.backoff.consecutive_errors;
        tracing::warn!(kind = ?kind, consecutive, message = %message, "Relay error");

        self.notify(Notice::error(message));
        self.broadcast_status();

        if consecutive >= self.config.recovery.error_threshold {
            self.fail_session("Too many consecutive errors").await;
        }
    }

    // ========================================================================
    // Delivery
    // ========================================================================

    /// Submit a prompt. `Ok(false)` when the agent rejected it (it reports
    /// that itself); `Err` when the command never got through.
    async fn dispatch(&mut self, endpoint: EndpointId, text: String) -> Result<bool> {
        let mut response = self
            .deliver(endpoint, AgentCommand::Submit { text: text.clone() })
            .await?;
        if response == AgentResponse::Busy {
            tracing::debug!(endpoint = %endpoint, "Agent busy, resetting before resubmit");
            self.deliver(endpoint, AgentCommand::Reset).await?;
            response = self.deliver(endpoint, AgentCommand::Submit { text }).await?;
        }

        match response {
            AgentResponse::Submitted => Ok(true),
            AgentResponse::Failed { reason } => {
                tracing::debug!(endpoint = %endpoint, reason = %reason, "Submit rejected by agent");
                Ok(false)
            }
            other => Err(RelayError::Channel(format!(
                "Unexpected submit response from {}: {:?}",
                endpoint, other
            ))),
        }
    }

    async fn deliver(&self, endpoint: EndpointId, command: AgentCommand) -> Result<AgentResponse> {
        match send_with_retry(self.host.as_ref(), endpoint, command, &self.config.channel).await {
            SendOutcome::Delivered(response) => Ok(response),
            SendOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                let message = format!(
                    "Failed to send message after {} attempts: {}",
                    attempts, last_error
                );
                self.notify(Notice::error(message.clone()));
                Err(RelayError::Channel(message))
            }
        }
    }

    // ========================================================================
    // Periodic work
    // ========================================================================

    pub async fn watchdog_tick(&mut self) {
        let Some(last) = self.state.session.as_ref().map(|s| s.last_message_time) else {
            return;
        };
        if !self.state.is_running() {
            return;
        }

        if let WatchdogVerdict::Stalled { silent_ms } = self.watchdog.check(last, self.clock.now()) {
            tracing::warn!(silent_ms, "Conversation stalled");
            self.state
                .stats
                .record_error(ErrorKind::Timeout, self.clock.now());
            self.teardown_session().await;
            self.notify(Notice::error(format!(
                "No response for {} seconds. The conversation has been stopped.",
                silent_ms / 1_000
            )));
            self.broadcast_status();
        }
    }

    pub async fn health_tick(&mut self) {
        let Some(endpoints) = self.state.session.as_ref().map(|s| s.endpoints) else {
            return;
        };
        if !self.state.is_running() {
            return;
        }

        let report = check_endpoints(self.host.as_ref(), &endpoints, &self.config.channel).await;
        if report.is_healthy() {
            self.state.health_failures = 0;
            self.state.backoff.reset();
            return;
        }

        self.state.health_failures += 1;
        let failures = self.state.health_failures;
        tracing::warn!(failures, report = ?report, "Health check failed");

        if report.has_missing() {
            self.state
                .stats
                .record_error(ErrorKind::ConnectionDrop, self.clock.now());
            self.teardown_session().await;
            self.notify(Notice::error(
                "A chat endpoint is no longer available. The conversation has been stopped.",
            ));
        } else {
            self.notify(Notice::error("A chat endpoint is not responding."));
        }

        if failures >= self.config.recovery.health_failure_limit {
            self.fail_session("Health check failed repeatedly").await;
        }
        self.broadcast_status();
    }

    /// Save the live session for crash recovery
    pub fn save_session(&self) {
        let Some(session) = self.state.session.as_ref() else {
            return;
        };
        let record = PersistedSession {
            session: session.clone(),
            stats: self.state.stats.clone(),
            backoff: self.state.backoff.clone(),
            log_session_id: self.state.log.session_id().map(str::to_string),
            saved_at: self.clock.now(),
        };
        if let Err(e) = self.persistence.save_session(&record) {
            tracing::warn!(error = %e, "Failed to save session");
        }
    }

    pub fn backup_tick(&self) {
        if let Err(e) = self.create_backup() {
            tracing::warn!(error = %e, "Periodic backup failed");
        }
    }

    pub fn sweep_snapshots(&self) {
        match self.persistence.validate_snapshots() {
            Ok(0) => {}
            Ok(dropped) => tracing::info!(dropped, "Dropped invalid snapshots"),
            Err(e) => tracing::warn!(error = %e, "Snapshot sweep failed"),
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn phase(&self) -> RelayPhase {
        self.state.phase
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled
    }

    pub fn session(&self) -> Option<&ConversationSession> {
        self.state.session.as_ref()
    }

    pub fn stats(&self) -> StatsReport {
        self.state.stats.report(self.clock.now())
    }

    pub fn conversation_log(&self) -> Vec<LogEntry> {
        self.state.log.entries()
    }

    pub fn snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        self.persistence.list_snapshots()
    }

    pub fn backups(&self) -> Result<Vec<BackupInfo>> {
        self.persistence.list_backups()
    }

    pub fn status(&self) -> StatusUpdate {
        StatusUpdate {
            enabled: self.state.enabled,
            phase: self.state.phase,
            stats: self.stats(),
            log: self.conversation_log(),
        }
    }

    // ========================================================================
    // Snapshots, backups, stats
    // ========================================================================

    pub fn create_snapshot(&self, description: &str) -> Result<SnapshotInfo> {
        let session = self.state.session.as_ref().ok_or_else(|| {
            RelayError::InvalidState("No active conversation to snapshot".to_string())
        })?;
        let log_session_id = self.state.log.session_id().map(str::to_string);
        let entries = log_session_id
            .as_deref()
            .map(|id| self.state.log.entries_for(id))
            .unwrap_or_default();

        let payload = SnapshotPayload {
            session: session.clone(),
            log_session_id,
            entries,
        };
        self.persistence
            .create_snapshot(description, &payload, self.clock.now())
    }

    /// Replace the live session with a snapshot and rebind its endpoints
    pub async fn restore_snapshot(&mut self, id: &str) -> Result<()> {
        if !self.state.enabled {
            return Err(RelayError::Disabled);
        }
        let payload = self.persistence.load_snapshot(id)?;
        for address in &payload.session.addresses {
            validate_address(address)?;
        }

        self.stop().await;
        self.state.phase = RelayPhase::Starting;
        self.broadcast_status();

        match self.rebind(payload).await {
            Ok(()) => {
                tracing::info!(snapshot = %id, "Snapshot restored");
                self.notify(Notice::info("Snapshot restored"));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(snapshot = %id, error = %e, "Snapshot restore failed");
                self.teardown_session().await;
                self.broadcast_status();
                Err(e)
            }
        }
    }

    async fn rebind(&mut self, payload: SnapshotPayload) -> Result<()> {
        let mut session = payload.session;
        let endpoints = self.open_endpoints(&session.addresses).await?;
        session.rebind(endpoints, self.clock.now());
        self.state.session = Some(session);

        tokio::time::sleep(self.settings.settle_delay()).await;
        self.await_agents(&endpoints).await?;

        self.state.log.set_session_id(payload.log_session_id);
        self.enter_running();

        let Some((endpoint, resume)) = self
            .state
            .session
            .as_ref()
            .map(|s| (s.endpoints[s.current_speaker], s.resume_prompt()))
        else {
            return Ok(());
        };
        match self.dispatch(endpoint, resume).await {
            Ok(_) => {}
            Err(e) => {
                self.record_error(ErrorKind::classify(&e.to_string()), e.to_string())
                    .await;
            }
        }
        Ok(())
    }

    pub fn delete_snapshot(&self, id: &str) -> Result<()> {
        self.persistence.delete_snapshot(id)
    }

    pub fn create_backup(&self) -> Result<BackupInfo> {
        self.persistence.create_backup(
            &self.state.log.entries(),
            &self.state.stats,
            self.clock.now(),
        )
    }

    /// Replace snapshots, log, and stats with a backup's contents
    pub fn restore_backup(&mut self, timestamp: u64) -> Result<()> {
        let payload = self.persistence.restore_backup(timestamp)?;
        self.state.log.replace(payload.log);
        self.state.stats = payload.stats;
        self.broadcast_status();
        Ok(())
    }

    pub fn reset_stats(&mut self) {
        self.state.stats.reset(self.clock.now());
        tracing::info!("Stats reset");
        self.broadcast_status();
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn append_log(&mut self, kind: EntryKind, content: &str, speaker: Option<usize>) {
        self.state
            .log
            .append(kind, content, speaker, self.clock.now());
        if let Err(e) = self.persistence.save_log(&self.state.log.entries()) {
            tracing::warn!(error = %e, "Failed to save conversation log");
        }
    }

    fn broadcast_status(&self) {
        // no listeners is fine
        let _ = self
            .events
            .send(RelayEvent::Status(Box::new(self.status())));
    }

    fn notify(&self, notice: Notice) {
        let _ = self.events.send(RelayEvent::Notice(notice));
    }
}
