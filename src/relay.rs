//! Relay service
//!
//! `RelayService` owns the [`SessionController`] and serializes everything
//! that touches it: UI commands from [`RelayHandle`]s, agent events from the
//! endpoint host, and the periodic recovery and persistence timers.

use crate::config::RelaySettings;
use crate::controller::SessionController;
use crate::error::{RelayError, Result};
use crate::persistence::{BackupInfo, SnapshotInfo};
use crate::stats::StatsReport;
use crate::types::{AgentEvent, LogEntry, RelayEvent, StatusUpdate};
use futures::{Stream, StreamExt};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_stream::wrappers::BroadcastStream;

/// Pending UI commands before callers wait
const COMMAND_QUEUE_DEPTH: usize = 32;

/// A request to the service, answered on its oneshot
#[derive(Debug)]
pub enum RelayCommand {
    Start {
        topic: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Enable {
        reply: oneshot::Sender<()>,
    },
    Disable {
        reply: oneshot::Sender<()>,
    },
    UpdateSettings {
        settings: RelaySettings,
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<StatusUpdate>,
    },
    Stats {
        reply: oneshot::Sender<StatsReport>,
    },
    ResetStats {
        reply: oneshot::Sender<()>,
    },
    ConversationLog {
        reply: oneshot::Sender<Vec<LogEntry>>,
    },
    CreateSnapshot {
        description: String,
        reply: oneshot::Sender<Result<SnapshotInfo>>,
    },
    ListSnapshots {
        reply: oneshot::Sender<Result<Vec<SnapshotInfo>>>,
    },
    RestoreSnapshot {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    DeleteSnapshot {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    CreateBackup {
        reply: oneshot::Sender<Result<BackupInfo>>,
    },
    ListBackups {
        reply: oneshot::Sender<Result<Vec<BackupInfo>>>,
    },
    RestoreBackup {
        timestamp: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Periodic timers driven by the service loop
struct Timers {
    watchdog: Interval,
    health: Interval,
    session_save: Interval,
    backup: Interval,
    snapshot_sweep: Interval,
}

impl Timers {
    fn new(controller: &SessionController) -> Self {
        let recovery = &controller.config().recovery;
        let persistence = &controller.config().persistence;
        Self {
            watchdog: ticker(recovery.watchdog_interval_ms),
            health: ticker(recovery.health_interval_ms),
            session_save: ticker(persistence.session_save_interval_ms),
            backup: ticker(persistence.backup_interval_ms),
            snapshot_sweep: ticker(persistence.snapshot_sweep_interval_ms),
        }
    }
}

/// First tick one period from now; late ticks are not bunched up
fn ticker(period_ms: u64) -> Interval {
    let period = Duration::from_millis(period_ms.max(1));
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Single owner of the controller
pub struct RelayService {
    controller: SessionController,
    commands: mpsc::Receiver<RelayCommand>,
    agent_events: mpsc::UnboundedReceiver<AgentEvent>,
}

impl RelayService {
    pub fn new(
        controller: SessionController,
        agent_events: mpsc::UnboundedReceiver<AgentEvent>,
    ) -> (Self, RelayHandle) {
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let handle = RelayHandle {
            commands: command_tx,
            events: controller.event_sender(),
        };
        let service = Self {
            controller,
            commands,
            agent_events,
        };
        (service, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until shut down or every handle is dropped
    pub async fn run(mut self) {
        self.controller.initialize().await;
        let mut timers = Timers::new(&self.controller);
        tracing::info!("Relay service started");

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(RelayCommand::Shutdown { reply }) => {
                            self.controller.stop().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            tracing::debug!("All relay handles dropped");
                            self.controller.stop().await;
                            break;
                        }
                    }
                }
                Some(event) = self.agent_events.recv() => {
                    self.controller.handle_agent_event(event).await;
                }
                _ = timers.watchdog.tick() => self.controller.watchdog_tick().await,
                _ = timers.health.tick() => self.controller.health_tick().await,
                _ = timers.session_save.tick() => self.controller.save_session(),
                _ = timers.backup.tick() => self.controller.backup_tick(),
                _ = timers.snapshot_sweep.tick() => self.controller.sweep_snapshots(),
            }
        }

        tracing::info!("Relay service stopped");
    }

    async fn handle_command(&mut self, command: RelayCommand) {
        let c = &mut self.controller;
        // a dropped reply receiver only means the caller stopped waiting
        match command {
            RelayCommand::Start { topic, reply } => {
                let _ = reply.send(c.start(&topic).await);
            }
            RelayCommand::Stop { reply } => {
                c.stop().await;
                let _ = reply.send(());
            }
            RelayCommand::Enable { reply } => {
                c.enable().await;
                let _ = reply.send(());
            }
            RelayCommand::Disable { reply } => {
                c.disable().await;
                let _ = reply.send(());
            }
            RelayCommand::UpdateSettings { settings, reply } => {
                c.update_settings(settings);
                let _ = reply.send(());
            }
            RelayCommand::Status { reply } => {
                let _ = reply.send(c.status());
            }
            RelayCommand::Stats { reply } => {
                let _ = reply.send(c.stats());
            }
            RelayCommand::ResetStats { reply } => {
                c.reset_stats();
                let _ = reply.send(());
            }
            RelayCommand::ConversationLog { reply } => {
                let _ = reply.send(c.conversation_log());
            }
            RelayCommand::CreateSnapshot { description, reply } => {
                let _ = reply.send(c.create_snapshot(&description));
            }
            RelayCommand::ListSnapshots { reply } => {
                let _ = reply.send(c.snapshots());
            }
            RelayCommand::RestoreSnapshot { id, reply } => {
                let _ = reply.send(c.restore_snapshot(&id).await);
            }
            RelayCommand::DeleteSnapshot { id, reply } => {
                let _ = reply.send(c.delete_snapshot(&id));
            }
            RelayCommand::CreateBackup { reply } => {
                let _ = reply.send(c.create_backup());
            }
            RelayCommand::ListBackups { reply } => {
                let _ = reply.send(c.backups());
            }
            RelayCommand::RestoreBackup { timestamp, reply } => {
                let _ = reply.send(c.restore_backup(timestamp));
            }
            RelayCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }
}

/// Cloneable front door to a running [`RelayService`]
#[derive(Clone)]
pub struct RelayHandle {
    commands: mpsc::Sender<RelayCommand>,
    events: broadcast::Sender<RelayEvent>,
}

impl RelayHandle {
    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> RelayCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| RelayError::Channel("Relay service is not running".to_string()))?;
        response
            .await
            .map_err(|_| RelayError::Channel("Relay service dropped the request".to_string()))
    }

    pub async fn start(&self, topic: impl Into<String>) -> Result<()> {
        let topic = topic.into();
        self.call(|reply| RelayCommand::Start { topic, reply }).await?
    }

    pub async fn stop(&self) -> Result<()> {
        self.call(|reply| RelayCommand::Stop { reply }).await
    }

    pub async fn enable(&self) -> Result<()> {
        self.call(|reply| RelayCommand::Enable { reply }).await
    }

    pub async fn disable(&self) -> Result<()> {
        self.call(|reply| RelayCommand::Disable { reply }).await
    }

    pub async fn update_settings(&self, settings: RelaySettings) -> Result<()> {
        self.call(|reply| RelayCommand::UpdateSettings { settings, reply })
            .await
    }

    pub async fn status(&self) -> Result<StatusUpdate> {
        self.call(|reply| RelayCommand::Status { reply }).await
    }

    pub async fn stats(&self) -> Result<StatsReport> {
        self.call(|reply| RelayCommand::Stats { reply }).await
    }

    pub async fn reset_stats(&self) -> Result<()> {
        self.call(|reply| RelayCommand::ResetStats { reply }).await
    }

    pub async fn conversation_log(&self) -> Result<Vec<LogEntry>> {
        self.call(|reply| RelayCommand::ConversationLog { reply })
            .await
    }

    pub async fn create_snapshot(&self, description: impl Into<String>) -> Result<SnapshotInfo> {
        let description = description.into();
        self.call(|reply| RelayCommand::CreateSnapshot { description, reply })
            .await?
    }

    pub async fn snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        self.call(|reply| RelayCommand::ListSnapshots { reply })
            .await?
    }

    pub async fn restore_snapshot(&self, id: impl Into<String>) -> Result<()> {
        let id = id.into();
        self.call(|reply| RelayCommand::RestoreSnapshot { id, reply })
            .await?
    }

    pub async fn delete_snapshot(&self, id: impl Into<String>) -> Result<()> {
        let id = id.into();
        self.call(|reply| RelayCommand::DeleteSnapshot { id, reply })
            .await?
    }

    pub async fn create_backup(&self) -> Result<BackupInfo> {
        self.call(|reply| RelayCommand::CreateBackup { reply }).await?
    }

    pub async fn backups(&self) -> Result<Vec<BackupInfo>> {
        self.call(|reply| RelayCommand::ListBackups { reply }).await?
    }

    pub async fn restore_backup(&self, timestamp: u64) -> Result<()> {
        self.call(|reply| RelayCommand::RestoreBackup { timestamp, reply })
            .await?
    }

    /// Stop any running session and end the service loop
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| RelayCommand::Shutdown { reply }).await
    }

    /// Every status update and notice, as broadcast
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Status updates only; lagged updates are skipped
    pub fn status_stream(&self) -> impl Stream<Item = StatusUpdate> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| async move {
            match event {
                Ok(RelayEvent::Status(status)) => Some(*status),
                Ok(RelayEvent::Notice(_)) => None,
                Err(e) => {
                    tracing::debug!(error = %e, "Status listener lagged");
                    None
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::endpoint::testing::ScriptedHost;
    use crate::persistence::Persistence;
    use crate::types::{AgentEventKind, EndpointId, RelayPhase};
    use std::sync::Arc;

    fn service(
        config: RelayConfig,
    ) -> (
        RelayHandle,
        mpsc::UnboundedSender<AgentEvent>,
        Arc<ScriptedHost>,
        JoinHandle<()>,
    ) {
        let host = Arc::new(ScriptedHost::new());
        let persistence = Persistence::in_memory(config.persistence.clone());
        let controller = SessionController::new(config, host.clone(), persistence).with_settings(
            RelaySettings::new(["https://a.example", "https://b.example"], "T").with_timeout_ms(10),
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (service, handle) = RelayService::new(controller, events_rx);
        (handle, events_tx, host, service.spawn())
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_round_trip() {
        let (handle, events, host, task) = service(RelayConfig::default());

        handle.start("T").await.unwrap();
        assert_eq!(handle.status().await.unwrap().phase, RelayPhase::Running);

        events
            .send(AgentEvent {
                endpoint: EndpointId(1),
                kind: AgentEventKind::ReplyObserved {
                    text: "A1".into(),
                    forced: false,
                    from_timeout: false,
                    sequence: 1,
                },
            })
            .unwrap();
        // commands queue behind the event
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(handle.stats().await.unwrap().messages_exchanged, 1);
        assert_eq!(host.submitted(EndpointId(2)).len(), 2);

        let snapshot = handle.create_snapshot("mid").await.unwrap();
        assert_eq!(handle.snapshots().await.unwrap()[0].id, snapshot.id);
        handle.delete_snapshot(&snapshot.id).await.unwrap();
        assert!(handle.snapshots().await.unwrap().is_empty());

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert_eq!(host.closed().len(), 2);
        assert!(handle.status().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_stream_sees_phases() {
        let (handle, _events, _host, _task) = service(RelayConfig::default());
        let mut stream = Box::pin(handle.status_stream());

        handle.start("T").await.unwrap();
        let mut saw_running = false;
        while let Some(status) = stream.next().await {
            if status.phase == RelayPhase::Running {
                saw_running = true;
                break;
            }
        }
        assert!(saw_running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_backups() {
        let mut config = RelayConfig::default();
        config.persistence.backup_interval_ms = 1_000;
        let (handle, _events, _host, _task) = service(config);

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        let backups = handle.backups().await.unwrap();
        assert_eq!(backups.len(), 3);
        assert!(backups[0].timestamp > backups[1].timestamp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_timer_stops_stall() {
        let mut config = RelayConfig::default();
        config.recovery.stall_timeout_ms = 5_000;
        config.recovery.watchdog_interval_ms = 1_000;
        let (handle, _events, _host, _task) = service(config);

        handle.start("T").await.unwrap();
        tokio::time::sleep(Duration::from_millis(7_000)).await;

        let status = handle.status().await.unwrap();
        assert_eq!(status.phase, RelayPhase::Idle);
        assert_eq!(status.stats.errors.timeout, 1);
    }

    #[tokio::test]
    async fn test_dropping_handles_ends_service() {
        let (handle, _events, _host, task) = service(RelayConfig::default());
        drop(handle);
        task.await.unwrap();
    }
}
