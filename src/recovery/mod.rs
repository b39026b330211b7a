//! Recovery: backoff, watchdog, health checks, and command delivery retry

pub mod backoff;
pub mod delivery;
pub mod health;
pub mod watchdog;

pub use backoff::{with_backoff, BackoffPolicy, BackoffState};
pub use delivery::{ensure_ready, send_with_retry, wait_until_ready, SendOutcome};
pub use health::{check_endpoints, HealthReport};
pub use watchdog::{Watchdog, WatchdogVerdict};
