//! Simulated endpoints
//!
//! An in-memory chat surface: an input box, a submit button, a list of
//! reply bubbles, and a streaming indicator. Tests drive it directly
//! (`push_bubble`, `render`, `set_loading`, `close`); a scripted responder
//! can answer each submitted prompt by rendering frames over time.

use super::{AttachedSurface, ChangeSource, ElementRef, Surface, SurfaceFactory};
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

pub const SIM_INPUT_PROBE: &str = "textarea";
pub const SIM_SUBMIT_PROBE: &str = "button[type=\"submit\"]";
pub const SIM_REPLY_PROBE: &str = ".message-bubble";
pub const SIM_LOADING_PROBE: &str = ".result-streaming";

const INPUT: &str = "input";
const SUBMIT: &str = "submit";
const LOADING: &str = "loading";
const BUBBLE_PREFIX: &str = "bubble-";

/// Produces the frames rendered in reply to a prompt
pub type Responder = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

struct SimState {
    address: String,
    input: String,
    bubbles: Vec<String>,
    loading: bool,
    online: bool,
    controls_present: bool,
    open: bool,
    submitted: Vec<String>,
    focus_count: usize,
    responder: Option<Responder>,
    frame_interval: Duration,
    notifier: Option<watch::Sender<u64>>,
    version: u64,
}

impl SimState {
    fn notify(&mut self) {
        if let Some(tx) = &self.notifier {
            self.version += 1;
            tx.send_replace(self.version);
        }
    }
}

#[derive(Clone)]
pub struct SimulatedEndpoint {
    state: Arc<Mutex<SimState>>,
}

impl std::fmt::Debug for SimulatedEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SimulatedEndpoint")
            .field("address", &state.address)
            .field("open", &state.open)
            .field("bubbles", &state.bubbles.len())
            .finish()
    }
}

impl SimulatedEndpoint {
    /// A closed endpoint at `address`; attaching opens it
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                address: address.into(),
                input: String::new(),
                bubbles: Vec::new(),
                loading: false,
                online: true,
                controls_present: true,
                open: false,
                submitted: Vec::new(),
                focus_count: 0,
                responder: None,
                frame_interval: Duration::from_millis(200),
                notifier: None,
                version: 0,
            })),
        }
    }

    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: Fn(&str) -> Vec<String> + Send + Sync + 'static,
    {
        self.lock().responder = Some(Arc::new(responder));
        self
    }

    pub fn with_frame_interval(self, interval: Duration) -> Self {
        self.lock().frame_interval = interval;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn address(&self) -> String {
        self.lock().address.clone()
    }

    /// Append a new reply bubble
    pub fn push_bubble(&self, text: impl Into<String>) {
        let mut state = self.lock();
        state.bubbles.push(text.into());
        state.notify();
    }

    /// Re-render the latest bubble (or the first one)
    pub fn render(&self, text: impl Into<String>) {
        let mut state = self.lock();
        let text = text.into();
        match state.bubbles.last_mut() {
            Some(last) => *last = text,
            None => state.bubbles.push(text),
        }
        state.notify();
    }

    pub fn set_loading(&self, loading: bool) {
        let mut state = self.lock();
        state.loading = loading;
        state.notify();
    }

    pub fn set_online(&self, online: bool) {
        let mut state = self.lock();
        state.online = online;
        state.notify();
    }

    /// Hide or show the input box and submit button
    pub fn set_controls_present(&self, present: bool) {
        let mut state = self.lock();
        state.controls_present = present;
        state.notify();
    }

    /// Close the endpoint; the current change feed ends
    pub fn close(&self) {
        let mut state = self.lock();
        state.open = false;
        state.notifier = None;
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    pub fn bubbles(&self) -> Vec<String> {
        self.lock().bubbles.clone()
    }

    /// Every prompt submitted so far, in order
    pub fn submitted(&self) -> Vec<String> {
        self.lock().submitted.clone()
    }

    pub fn last_submitted(&self) -> Option<String> {
        self.lock().submitted.last().cloned()
    }

    pub fn focus_count(&self) -> usize {
        self.lock().focus_count
    }

    /// (Re)open and hand out a fresh surface and change feed
    fn open_surface(&self) -> AttachedSurface {
        let (tx, rx) = watch::channel(0);
        {
            let mut state = self.lock();
            state.open = true;
            state.notifier = Some(tx);
        }
        AttachedSurface {
            surface: Box::new(SimSurface {
                endpoint: self.clone(),
            }),
            changes: Box::new(SimChanges { rx }),
        }
    }

    fn submit_input(&self) {
        let (prompt, responder, interval) = {
            let mut state = self.lock();
            let prompt = std::mem::take(&mut state.input);
            state.submitted.push(prompt.clone());
            state.notify();
            (prompt, state.responder.clone(), state.frame_interval)
        };

        if let Some(responder) = responder {
            let frames = responder(&prompt);
            self.stream(frames, interval);
        }
    }

    /// Render `frames` one per interval behind the streaming indicator
    fn stream(&self, frames: Vec<String>, interval: Duration) {
        if frames.is_empty() {
            return;
        }
        let endpoint = self.clone();
        tokio::spawn(async move {
            endpoint.set_loading(true);
            for (i, frame) in frames.into_iter().enumerate() {
                tokio::time::sleep(interval).await;
                if !endpoint.is_open() {
                    return;
                }
                if i == 0 {
                    endpoint.push_bubble(frame);
                } else {
                    endpoint.render(frame);
                }
            }
            endpoint.set_loading(false);
        });
    }
}

/// Cumulative word-by-word frames of `text`
pub fn frames_by_word(text: &str) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    (1..=words.len()).map(|n| words[..n].join(" ")).collect()
}

struct SimSurface {
    endpoint: SimulatedEndpoint,
}

impl Surface for SimSurface {
    fn query(&self, probe: &str) -> Vec<ElementRef> {
        let state = self.endpoint.lock();
        if !state.open {
            return Vec::new();
        }
        match probe {
            SIM_INPUT_PROBE if state.controls_present => vec![ElementRef(INPUT.into())],
            SIM_SUBMIT_PROBE if state.controls_present => vec![ElementRef(SUBMIT.into())],
            SIM_REPLY_PROBE => (0..state.bubbles.len())
                .map(|i| ElementRef(format!("{}{}", BUBBLE_PREFIX, i)))
                .collect(),
            SIM_LOADING_PROBE if state.loading => vec![ElementRef(LOADING.into())],
            _ => Vec::new(),
        }
    }

    fn text(&self, element: &ElementRef) -> Option<String> {
        let state = self.endpoint.lock();
        if element.0 == INPUT {
            return Some(state.input.clone());
        }
        let index: usize = element.0.strip_prefix(BUBBLE_PREFIX)?.parse().ok()?;
        state.bubbles.get(index).map(|t| t.trim().to_string())
    }

    fn write_input(&mut self, element: &ElementRef, text: &str) -> Result<()> {
        if element.0 != INPUT {
            return Err(RelayError::SurfaceNotFound(format!("{} is not an input", element.0)));
        }
        self.endpoint.lock().input = text.to_string();
        Ok(())
    }

    fn signal_input(&mut self, _element: &ElementRef) -> Result<()> {
        Ok(())
    }

    fn activate(&mut self, element: &ElementRef) -> Result<()> {
        if element.0 != SUBMIT {
            return Err(RelayError::SurfaceNotFound(format!("{} is not clickable", element.0)));
        }
        self.endpoint.submit_input();
        Ok(())
    }

    fn identity(&self) -> String {
        self.endpoint.address()
    }

    fn online(&self) -> bool {
        self.endpoint.lock().online
    }
}

struct SimChanges {
    rx: watch::Receiver<u64>,
}

#[async_trait]
impl ChangeSource for SimChanges {
    async fn next_batch(&mut self) -> Option<()> {
        self.rx.changed().await.ok()
    }
}

/// Registry of simulated endpoints keyed by address
#[derive(Clone, Default)]
pub struct SimulatedEndpoints {
    endpoints: Arc<Mutex<HashMap<String, SimulatedEndpoint>>>,
}

impl SimulatedEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SimulatedEndpoint>> {
        self.endpoints.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a plain endpoint at `address`
    pub fn add(&self, address: &str) -> SimulatedEndpoint {
        self.insert(SimulatedEndpoint::new(address))
    }

    pub fn insert(&self, endpoint: SimulatedEndpoint) -> SimulatedEndpoint {
        self.lock().insert(endpoint.address(), endpoint.clone());
        endpoint
    }

    pub fn get(&self, address: &str) -> Option<SimulatedEndpoint> {
        self.lock().get(address).cloned()
    }
}

#[async_trait]
impl SurfaceFactory for SimulatedEndpoints {
    async fn attach(&self, address: &str) -> Result<AttachedSurface> {
        let endpoint = self
            .get(address)
            .ok_or_else(|| RelayError::EndpointLost(format!("No endpoint at {}", address)))?;
        Ok(endpoint.open_surface())
    }

    async fn is_open(&self, address: &str) -> bool {
        self.get(address).is_some_and(|e| e.is_open())
    }

    async fn detach(&self, address: &str) -> Result<()> {
        if let Some(endpoint) = self.get(address) {
            endpoint.close();
        }
        Ok(())
    }

    async fn focus(&self, address: &str) -> Result<()> {
        let endpoint = self
            .get(address)
            .ok_or_else(|| RelayError::EndpointLost(format!("No endpoint at {}", address)))?;
        endpoint.lock().focus_count += 1;
        Ok(())
    }
}
