//! Exponential backoff for retryable operations
//!
//! Delay for retry `n` (0-indexed) is `base * 2^n`, capped at `max`.
//! Rate-limit shaped failures wait `rate_limit_delay` instead. After
//! `max_retries` retries the original error is returned to the caller.

use crate::config::RecoveryConfig;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Process-scoped retry bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffState {
    pub retry_count: u32,
    pub consecutive_errors: u32,
    pub is_rate_limited: bool,
}

impl BackoffState {
    pub fn reset(&mut self) {
        *self = BackoffState::default();
    }
}

/// Backoff delays derived from `RecoveryConfig`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub rate_limit_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&RecoveryConfig::default())
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            base_delay_ms: config.backoff_base_ms,
            max_delay_ms: config.backoff_max_ms,
            rate_limit_delay_ms: config.rate_limit_delay_ms,
            max_retries: config.max_retries,
        }
    }

    /// Delay before retry number `retry_count` (0-indexed)
    pub fn delay_for(&self, retry_count: u32, rate_limited: bool) -> Duration {
        if rate_limited {
            return Duration::from_millis(self.rate_limit_delay_ms);
        }
        let exp_delay = self.base_delay_ms.saturating_mul(1u64 << retry_count.min(20));
        Duration::from_millis(exp_delay.min(self.max_delay_ms))
    }
}

/// Run `operation` until it succeeds, fails non-retryably, or exhausts retries.
///
/// `state.retry_count` tracks progress and is reset on success and on
/// exhaustion.
pub async fn with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    state: &mut BackoffState,
    what: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        match operation(state.retry_count).await {
            Ok(value) => {
                if state.retry_count > 0 {
                    tracing::info!(operation = what, retries = state.retry_count, "Succeeded after retries");
                }
                state.retry_count = 0;
                state.is_rate_limited = false;
                return Ok(value);
            }
            Err(e) => {
                let rate_limited = e.is_rate_limited();
                if !e.is_retryable() && !rate_limited {
                    state.retry_count = 0;
                    return Err(e);
                }
                if state.retry_count >= policy.max_retries {
                    tracing::warn!(
                        operation = what,
                        attempts = state.retry_count + 1,
                        error = %e,
                        "Retries exhausted"
                    );
                    state.retry_count = 0;
                    return Err(e);
                }

                state.is_rate_limited = rate_limited;
                let delay = policy.delay_for(state.retry_count, rate_limited);
                state.retry_count += 1;
                tracing::warn!(
                    operation = what,
                    attempt = state.retry_count,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            rate_limit_delay_ms: 5_000,
            max_retries: 3,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.delay_for(0, false), Duration::from_millis(100));
        assert_eq!(p.delay_for(1, false), Duration::from_millis(200));
        assert_eq!(p.delay_for(2, false), Duration::from_millis(400));
        assert_eq!(p.delay_for(4, false), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(60, false), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(0, true), Duration::from_millis(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_then_reraise() {
        let p = policy();
        let mut state = BackoffState::default();
        let attempts: Arc<Mutex<Vec<Instant>>> = Arc::default();

        let recorder = attempts.clone();
        let result: Result<()> = with_backoff(&p, &mut state, "test", |_| {
            let recorder = recorder.clone();
            async move {
                recorder.lock().unwrap().push(Instant::now());
                Err(RelayError::Channel("dropped".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(RelayError::Channel(_))));
        let attempts = attempts.lock().unwrap();
        assert_eq!(attempts.len(), 4);
        let gaps: Vec<u128> = attempts.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect();
        assert_eq!(gaps, vec![100, 200, 400]);
        assert_eq!(state.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retry_resets_count() {
        let p = policy();
        let mut state = BackoffState::default();

        let value = with_backoff(&p, &mut state, "test", |attempt| async move {
            if attempt < 2 {
                Err(RelayError::Timeout("slow".into()))
            } else {
                Ok(attempt)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 2);
        assert_eq!(state.retry_count, 0);
        assert!(!state.is_rate_limited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_uses_long_delay() {
        let p = policy();
        let mut state = BackoffState::default();
        let start = Instant::now();

        let value = with_backoff(&p, &mut state, "test", |attempt| async move {
            if attempt == 0 {
                Err(RelayError::Channel("429 Too Many Requests".into()))
            } else {
                Ok(())
            }
        })
        .await;

        tokio_test::assert_ok!(value);
        assert_eq!(start.elapsed(), Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let p = policy();
        let mut state = BackoffState::default();
        let mut calls = 0;

        let result: Result<()> = with_backoff(&p, &mut state, "test", |_| {
            calls += 1;
            async { Err(RelayError::Configuration("bad".into())) }
        })
        .await;

        tokio_test::assert_err!(result);
        assert_eq!(calls, 1);
    }
}
