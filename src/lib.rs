//! # a3s-relay
//!
//! Turn-taking relay engine that drives a conversation between two
//! asynchronous conversational endpoints.
//!
//! ## Overview
//!
//! `a3s-relay` seeds endpoint 0 with a topic, waits until its reply has
//! finished rendering, forwards a bounded follow-up prompt to endpoint 1,
//! and keeps alternating. Around that loop sit the recovery pieces a
//! long-running unattended conversation needs: a stall watchdog, periodic
//! health checks, retried delivery with exponential backoff, and a circuit
//! breaker that disables the relay after repeated failures. Sessions,
//! snapshots, backups, and the conversation log are persisted through a
//! pluggable key-value store.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_relay::{
//!     LocalHost, Persistence, Probes, RelayConfig, RelayService, RelaySettings,
//!     SessionController, SimulatedEndpoints,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> a3s_relay::Result<()> {
//! let config = RelayConfig::default();
//! let endpoints = SimulatedEndpoints::new();
//! endpoints.add("https://a.example");
//! endpoints.add("https://b.example");
//!
//! let (host, agent_events) = LocalHost::new(Arc::new(endpoints), &config, Probes::default());
//! let persistence = Persistence::in_memory(config.persistence.clone());
//! let controller = SessionController::new(config, Arc::new(host), persistence).with_settings(
//!     RelaySettings::new(["https://a.example", "https://b.example"], "tides"),
//! );
//!
//! let (service, relay) = RelayService::new(controller, agent_events);
//! service.spawn();
//!
//! relay.start("tides").await?;
//! println!("{:?}", relay.status().await?.phase);
//! relay.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **SessionController**: conversation state machine, turn validation,
//!   error accounting, snapshots and backups
//! - **RelayService / RelayHandle**: single-owner service loop and its
//!   cloneable command front door
//! - **EndpointHost** trait: opens endpoints and carries agent commands;
//!   `LocalHost` runs one `EndpointAgent` task per endpoint
//! - **CompletionDetector**: decides when a streamed reply is complete
//! - **Surface / SurfaceFactory** traits: what an agent needs from a chat
//!   surface; `SimulatedEndpoints` is the in-process implementation
//! - **StateStore** trait: durable key-value state (`FileStateStore`,
//!   `MemoryStateStore`)

pub mod clock;
pub mod codec;
pub mod config;
pub mod controller;
pub mod conversation_log;
pub mod endpoint;
pub mod error;
pub mod persistence;
pub mod prompt;
pub mod recovery;
pub mod relay;
pub mod session;
pub mod state;
pub mod stats;
pub mod types;

// Re-export core types
pub use clock::RelayClock;
pub use codec::{Codec, GzipCodec};
pub use config::{
    ChannelConfig, DetectorConfig, PersistenceConfig, RecoveryConfig, RelayConfig, RelaySettings,
};
pub use controller::SessionController;
pub use conversation_log::ConversationLog;
pub use error::{RelayError, Result};
pub use persistence::{BackupInfo, PersistedSession, Persistence, SnapshotInfo};
pub use relay::{RelayCommand, RelayHandle, RelayService};
pub use session::{ConversationSession, ControllerState, Turn};
pub use state::{FileStateStore, MemoryStateStore, StateStore};
pub use stats::{ErrorCounts, ErrorKind, Stats, StatsReport};
pub use types::{
    AgentCommand, AgentEvent, AgentEventKind, AgentResponse, ConnectionState, EndpointId,
    EntryKind, HistoryEntry, LogEntry, Notice, NoticeLevel, RelayEvent, RelayPhase, StatusUpdate,
};

// Re-export the endpoint layer for convenience
pub use endpoint::{
    AttachedSurface, ChangeSource, CompletionDetector, EndpointHost, LocalHost, Observation,
    Probes, SimulatedEndpoint, SimulatedEndpoints, Surface, SurfaceFactory,
};
