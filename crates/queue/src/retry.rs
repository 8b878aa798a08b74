//! Bounded exponential backoff around fallible upstream calls.
//!
//! Jitter is drawn from a caller-supplied RNG so backoff timing is
//! deterministic under a seeded generator; seed it from entropy in
//! production and from a constant in tests.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockbridge_core::SyncError;

/// Backoff/retry configuration for upstream calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first (0 behaves like 1).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Uniform jitter range applied multiplicatively to each delay, so
    /// concurrent workers do not retry in lockstep.
    pub jitter: (f64, f64),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter: (0.85, 1.15),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    /// Delay before the attempt after failure number `failed_attempt`
    /// (0-indexed): `min(base * 2^n, max)`, scaled by jitter.
    pub fn delay_after<R: Rng>(&self, failed_attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp = 2_f64.powi(failed_attempt.min(30) as i32);
        let capped = (base_ms * exp).min(max_ms);
        let factor = rng.gen_range(self.jitter.0..=self.jitter.1);
        Duration::from_millis((capped * factor).max(0.0) as u64)
    }

    /// Lower bound on the total backoff slept across `failures` transient
    /// failures, independent of jitter. Used by tests.
    pub fn min_total_backoff(&self, failures: u32) -> Duration {
        let max_ms = self.max_delay.as_millis() as f64;
        let total: f64 = (0..failures)
            .map(|n| {
                let capped = (self.base_delay.as_millis() as f64 * 2_f64.powi(n as i32)).min(max_ms);
                capped * self.jitter.0
            })
            .sum();
        Duration::from_millis(total as u64)
    }
}

/// Successful result of a retried operation, with the attempts consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Final failure of a retried operation: the last error, plus how many
/// attempts were actually made.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct RetryError {
    pub error: SyncError,
    pub attempts: u32,
}

/// Run `op`, retrying transient failures with exponential backoff.
///
/// Fatal failures (4xx, validation, missing config) abort immediately with
/// no further attempts. Exhausting the budget surfaces the last error.
pub async fn with_retry<T, F, Fut, R>(
    policy: &RetryPolicy,
    rng: &mut R,
    mut op: F,
) -> Result<Attempted<T>, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
    R: Rng,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match op().await {
            Ok(value) => return Ok(Attempted { value, attempts }),
            Err(error) => {
                if !error.is_retryable() || attempts >= policy.max_attempts.max(1) {
                    return Err(RetryError { error, attempts });
                }
                let delay = policy.delay_after(attempts - 1, rng);
                tracing::debug!(
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
