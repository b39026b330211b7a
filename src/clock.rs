//! Wall-clock milliseconds derived from the tokio clock
//!
//! Timestamps are anchored to the Unix time at construction and advanced
//! by the tokio monotonic clock, so paused-time tests see consistent
//! values across timers and stored records.

use crate::types::now_millis;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct RelayClock {
    origin: Instant,
    origin_millis: u64,
}

impl Default for RelayClock {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayClock {
    pub fn new() -> Self {
        Self::starting_at(now_millis())
    }

    pub fn starting_at(origin_millis: u64) -> Self {
        Self {
            origin: Instant::now(),
            origin_millis,
        }
    }

    /// Current Unix milliseconds
    pub fn now(&self) -> u64 {
        self.origin_millis + self.origin.elapsed().as_millis() as u64
    }
}
