//! Retry policy for network operations.
//!
//! [`RetryPolicy`] is a plain value: it decides whether an error is worth
//! another attempt and how long to wait first. [`RetryPolicy::run`] drives an
//! operation with it. Keeping the policy separate from the HTTP code lets it be
//! tested without a network.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, ToolchainError};

/// Default maximum attempts (including the first).
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay between retries in milliseconds.
const DEFAULT_BASE_DELAY_MS: u64 = 1000;

/// Default upper bound on a single backoff delay in milliseconds.
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Do not retry this error.
    NoRetry,
    /// Retry after the given delay.
    RetryAfter(Duration),
}

/// Exponential backoff with an attempt cap.
///
/// The delay before attempt `n + 1` is `base_delay * 2^(n - 1)`, capped at
/// `max_delay`, with +/- 25% jitter when enabled. Only transient errors (see
/// [`ToolchainError::is_transient`]) are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Base delay for backoff, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on backoff delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Randomize each delay by +/- 25%.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// A policy with the given attempt count and base delay, no jitter.
    #[must_use]
    pub fn fixed(max_attempts: u32, base_delay: Duration) -> Self {
        let base_delay_ms = u64::try_from(base_delay.as_millis()).unwrap_or(u64::MAX);
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms: base_delay_ms.saturating_mul(64).max(base_delay_ms),
            jitter: false,
        }
    }

    /// Backoff delay to wait after failed attempt `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = 1u64 << attempt.saturating_sub(1).min(16);
        let raw = self.base_delay_ms.saturating_mul(exp).min(self.max_delay_ms);

        let millis = if self.jitter && raw > 0 {
            let jitter_range = raw / 4;
            let jitter = rand::rng().random_range(0..=jitter_range * 2);
            raw - jitter_range + jitter
        } else {
            raw
        };
        Duration::from_millis(millis)
    }

    /// Decides whether failed attempt `attempt` (1-based) should be retried.
    #[must_use]
    pub fn decide(&self, attempt: u32, error: &ToolchainError) -> RetryDecision {
        if attempt >= self.max_attempts || !error.is_transient() {
            return RetryDecision::NoRetry;
        }
        RetryDecision::RetryAfter(self.backoff(attempt))
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// attempts are exhausted.
    ///
    /// `op` receives the 1-based attempt number. `url` names the resource in
    /// log lines and in the final error.
    ///
    /// # Errors
    ///
    /// Non-transient errors are returned unchanged. A transient error that
    /// outlives every attempt is wrapped in [`ToolchainError::Download`].
    pub fn run<T, F>(&self, url: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(error) => match self.decide(attempt, &error) {
                    RetryDecision::RetryAfter(delay) => {
                        tracing::warn!(
                            %url,
                            attempt,
                            max_attempts = self.max_attempts,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %error,
                            "transient failure, retrying"
                        );
                        std::thread::sleep(delay);
                        attempt += 1;
                    }
                    RetryDecision::NoRetry if error.is_transient() => {
                        return Err(ToolchainError::Download {
                            url: url.to_string(),
                            attempts: attempt,
                            source: Box::new(error),
                        });
                    }
                    RetryDecision::NoRetry => return Err(error),
                },
            }
        }
    }
}
