//! Conversation watchdog
//!
//! Armed while a session is running. Each tick compares the time since the
//! last completed turn against the stall timeout.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    /// Not armed; nothing to check
    Disarmed,
    Healthy,
    Stalled { silent_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct Watchdog {
    stall_timeout_ms: u64,
    armed: bool,
}

impl Watchdog {
    pub fn new(stall_timeout_ms: u64) -> Self {
        Self {
            stall_timeout_ms,
            armed: false,
        }
    }

    pub fn arm(&mut self) {
        self.armed = true;
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn check(&self, last_message_time: u64, now: u64) -> WatchdogVerdict {
        if !self.armed {
            return WatchdogVerdict::Disarmed;
        }
        let silent_ms = now.saturating_sub(last_message_time);
        if silent_ms > self.stall_timeout_ms {
            WatchdogVerdict::Stalled { silent_ms }
        } else {
            WatchdogVerdict::Healthy
        }
    }
}
