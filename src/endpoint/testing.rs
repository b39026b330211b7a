//! Scripted `EndpointHost` for unit tests

use super::EndpointHost;
use crate::error::{RelayError, Result};
use crate::types::{AgentCommand, AgentResponse, EndpointId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Default)]
struct Script {
    next_id: u64,
    dead: HashSet<EndpointId>,
    removed: HashSet<EndpointId>,
    failures: HashMap<EndpointId, u32>,
    busy: HashMap<EndpointId, u32>,
    revive_on_inject: bool,
    injections: usize,
    requests: Vec<(EndpointId, AgentCommand)>,
    closed: Vec<EndpointId>,
    focused: Vec<EndpointId>,
    open_error: Option<String>,
}

/// Every endpoint exists and answers unless told otherwise
#[derive(Default)]
pub struct ScriptedHost {
    script: Mutex<Script>,
}

impl ScriptedHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_alive(&self, endpoint: EndpointId, alive: bool) {
        let mut script = self.script.lock().unwrap();
        if alive {
            script.dead.remove(&endpoint);
        } else {
            script.dead.insert(endpoint);
        }
    }

    pub fn revive_on_inject(&self, revive: bool) {
        self.script.lock().unwrap().revive_on_inject = revive;
    }

    /// Fail the next `count` requests to `endpoint` with a channel error
    pub fn fail_requests(&self, endpoint: EndpointId, count: u32) {
        self.script.lock().unwrap().failures.insert(endpoint, count);
    }

    /// Answer the next `count` submits to `endpoint` with `Busy`
    pub fn busy_submits(&self, endpoint: EndpointId, count: u32) {
        self.script.lock().unwrap().busy.insert(endpoint, count);
    }

    pub fn remove(&self, endpoint: EndpointId) {
        self.script.lock().unwrap().removed.insert(endpoint);
    }

    pub fn fail_open(&self, reason: &str) {
        self.script.lock().unwrap().open_error = Some(reason.to_string());
    }

    pub fn injections(&self) -> usize {
        self.script.lock().unwrap().injections
    }

    pub fn requests(&self) -> Vec<(EndpointId, AgentCommand)> {
        self.script.lock().unwrap().requests.clone()
    }

    /// Texts submitted to `endpoint`, in order
    pub fn submitted(&self, endpoint: EndpointId) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter_map(|(id, command)| match command {
                AgentCommand::Submit { text } if id == endpoint => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn closed(&self) -> Vec<EndpointId> {
        self.script.lock().unwrap().closed.clone()
    }

    pub fn focused(&self) -> Vec<EndpointId> {
        self.script.lock().unwrap().focused.clone()
    }
}

#[async_trait]
impl EndpointHost for ScriptedHost {
    async fn open(&self, _addresses: &[String; 2]) -> Result<[EndpointId; 2]> {
        let mut script = self.script.lock().unwrap();
        if let Some(reason) = script.open_error.clone() {
            return Err(RelayError::Channel(reason));
        }
        script.next_id += 2;
        Ok([EndpointId(script.next_id - 1), EndpointId(script.next_id)])
    }

    async fn exists(&self, endpoint: EndpointId) -> bool {
        !self.script.lock().unwrap().removed.contains(&endpoint)
    }

    async fn close(&self, endpoint: EndpointId) -> Result<()> {
        let mut script = self.script.lock().unwrap();
        script.closed.push(endpoint);
        script.removed.insert(endpoint);
        Ok(())
    }

    async fn focus(&self, endpoint: EndpointId) -> Result<()> {
        self.script.lock().unwrap().focused.push(endpoint);
        Ok(())
    }

    async fn inject_agent(&self, endpoint: EndpointId) -> Result<()> {
        let mut script = self.script.lock().unwrap();
        script.injections += 1;
        if script.revive_on_inject {
            script.dead.remove(&endpoint);
        }
        Ok(())
    }

    async fn request(&self, endpoint: EndpointId, command: AgentCommand) -> Result<AgentResponse> {
        let mut script = self.script.lock().unwrap();
        if let Some(remaining) = script.failures.get_mut(&endpoint) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RelayError::Channel("dropped".into()));
            }
        }
        if script.removed.contains(&endpoint) {
            return Err(RelayError::Channel(format!("No agent bound to {}", endpoint)));
        }

        let alive = !script.dead.contains(&endpoint);
        script.requests.push((endpoint, command.clone()));
        Ok(match command {
            AgentCommand::CheckAlive => AgentResponse::Alive {
                alive,
                identity: format!("scripted-{}", endpoint.0),
            },
            _ if !alive => return Err(RelayError::Channel("Agent not available".into())),
            AgentCommand::Submit { .. } => match script.busy.get_mut(&endpoint) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    AgentResponse::Busy
                }
                _ => AgentResponse::Submitted,
            },
            AgentCommand::Reset => AgentResponse::ResetDone,
        })
    }
}
