//! Endpoint layer
//!
//! An endpoint is an external conversational surface. This module defines
//! the seams the relay drives it through:
//!
//! - [`Surface`]: query, read, write, and click elements
//! - [`ChangeSource`]: batches of content mutations; ends when the surface
//!   goes away
//! - [`SurfaceFactory`]: opens and closes surfaces by address
//! - [`EndpointHost`]: the controller's message channel to per-endpoint
//!   agents
//!
//! [`LocalHost`] runs one [`EndpointAgent`] task per endpoint over any
//! factory; [`sim`] provides simulated endpoints for tests and demos.

pub mod agent;
pub mod detector;
pub mod host;
pub mod sim;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::{AgentRequest, EndpointAgent};
pub use detector::{CompletionDetector, Delivery, DetectorOutcome, DetectorPhase};
pub use host::{EndpointHost, LocalHost};
pub use sim::{SimulatedEndpoint, SimulatedEndpoints};

use crate::error::Result;
use async_trait::async_trait;

/// Opaque reference to an element on a surface
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementRef(pub String);

/// A rendered interactive surface
pub trait Surface: Send {
    /// Elements matching `probe`, in document order
    fn query(&self, probe: &str) -> Vec<ElementRef>;

    /// Trimmed text content of an element
    fn text(&self, element: &ElementRef) -> Option<String>;

    fn write_input(&mut self, element: &ElementRef, text: &str) -> Result<()>;

    /// Fire the surface's native input-change signaling
    fn signal_input(&mut self, element: &ElementRef) -> Result<()>;

    /// Click
    fn activate(&mut self, element: &ElementRef) -> Result<()>;

    /// Where the surface is (its address)
    fn identity(&self) -> String;

    fn online(&self) -> bool {
        true
    }
}

/// Content-mutation notifications for a surface
#[async_trait]
pub trait ChangeSource: Send {
    /// Wait for the next batch of mutations; `None` once the surface is gone
    async fn next_batch(&mut self) -> Option<()>;
}

/// A surface plus its change feed
pub struct AttachedSurface {
    pub surface: Box<dyn Surface>,
    pub changes: Box<dyn ChangeSource>,
}

impl std::fmt::Debug for AttachedSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedSurface")
            .field("identity", &self.surface.identity())
            .finish()
    }
}

/// Opens surfaces by address
#[async_trait]
pub trait SurfaceFactory: Send + Sync {
    async fn attach(&self, address: &str) -> Result<AttachedSurface>;

    async fn is_open(&self, address: &str) -> bool;

    async fn detach(&self, address: &str) -> Result<()>;

    /// Bring the surface to the foreground
    async fn focus(&self, _address: &str) -> Result<()> {
        Ok(())
    }
}

/// What the detector sees on one look at the surface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    /// Text of the latest reply candidate
    pub candidate: Option<String>,
    /// An in-progress indicator is present
    pub in_progress: bool,
}

/// Prioritized structural probes; the first probe with a match wins
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probes {
    pub input: Vec<String>,
    pub submit: Vec<String>,
    pub reply: Vec<String>,
    pub in_progress: Vec<String>,
}

impl Default for Probes {
    fn default() -> Self {
        fn list(items: &[&str]) -> Vec<String> {
            items.iter().map(|s| s.to_string()).collect()
        }

        Self {
            input: list(&[
                "textarea[data-testid=\"textbox\"]",
                "textarea[placeholder*=\"Send a message\"]",
                "div[contenteditable=\"true\"]",
                "div[role=\"textbox\"]",
                "textarea",
                "input[type=\"text\"]",
            ]),
            submit: list(&[
                "button[data-testid=\"send-button\"]",
                "button[aria-label=\"Send message\"]",
                "button[type=\"submit\"]",
            ]),
            reply: list(&[
                "div[data-message-author-role=\"assistant\"]",
                ".markdown.prose",
                "div[dir=\"auto\"].message-bubble",
                ".message-bubble",
                ".chat-message",
            ]),
            in_progress: list(&[
                ".result-streaming",
                ".typing-indicator",
                "[role=\"progressbar\"]",
                "div[data-state=\"loading\"]",
            ]),
        }
    }
}

impl Probes {
    /// First element of the first probe that matches anything
    pub fn first_match(surface: &dyn Surface, probes: &[String]) -> Option<ElementRef> {
        probes
            .iter()
            .find_map(|probe| surface.query(probe).into_iter().next())
    }

    /// Last element of the first reply probe that matches anything
    pub fn latest_reply(&self, surface: &dyn Surface) -> Option<ElementRef> {
        self.reply
            .iter()
            .map(|probe| surface.query(probe))
            .find(|matches| !matches.is_empty())
            .and_then(|matches| matches.into_iter().last())
    }

    pub fn in_progress(&self, surface: &dyn Surface) -> bool {
        Self::first_match(surface, &self.in_progress).is_some()
    }

    pub fn observe(&self, surface: &dyn Surface) -> Observation {
        Observation {
            candidate: self
                .latest_reply(surface)
                .and_then(|element| surface.text(&element)),
            in_progress: self.in_progress(surface),
        }
    }
}
