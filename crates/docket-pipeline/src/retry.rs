//! Bounded retries with exponential backoff for capability calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use docket_core::defaults::{MAX_ATTEMPTS, RETRY_BASE_MS, RETRY_MAX_MS};
use docket_core::{Error, Result};

/// Retry policy for transient capability failures.
///
/// Only errors for which [`Error::is_transient`] holds are retried. Every
/// attempt is individually bounded by the caller-supplied timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay_ms: RETRY_BASE_MS,
            max_delay_ms: RETRY_MAX_MS,
        }
    }
}

impl RetryPolicy {
    /// Create a policy from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `PIPELINE_MAX_ATTEMPTS` | `3` | Attempts per capability call |
    /// | `PIPELINE_RETRY_BASE_MS` | `500` | First backoff delay |
    /// | `PIPELINE_RETRY_MAX_MS` | `30000` | Backoff ceiling |
    pub fn from_env() -> Self {
        let max_attempts = std::env::var("PIPELINE_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(MAX_ATTEMPTS)
            .max(1);

        let base_delay_ms = std::env::var("PIPELINE_RETRY_BASE_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(RETRY_BASE_MS);

        let max_delay_ms = std::env::var("PIPELINE_RETRY_MAX_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(RETRY_MAX_MS)
            .max(base_delay_ms);

        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay_ms(mut self, ms: u64) -> Self {
        self.base_delay_ms = ms;
        self
    }

    pub fn with_max_delay_ms(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }

    /// Backoff ceiling before the given retry (1-based).
    pub fn backoff_ceiling(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(20);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Jittered delay in `[ceiling / 2, ceiling]`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let ceiling = self.backoff_ceiling(retry).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        let half = ceiling / 2;
        let jitter = rand::thread_rng().gen_range(0..=ceiling - half);
        Duration::from_millis(half + jitter)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Each attempt is wrapped in `timeout`; an elapsed attempt counts as a
    /// transient `Unavailable` failure.
    pub async fn run<T, F, Fut>(&self, op: &str, timeout: Duration, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Unavailable(format!(
                    "{} timed out after {}s",
                    op,
                    timeout.as_secs()
                ))),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        op,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(op, attempt, error = %e, "Giving up");
                    return Err(e);
                }
            }
        }
    }
}
