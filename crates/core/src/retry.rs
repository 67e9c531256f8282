//! Retry policy with bounded exponential backoff, applied at every
//! collaborator boundary (CRM, email provider, durable queue).

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::OutreachResult;

/// Retry configuration. Only errors whose `is_retryable()` is true are retried.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Backoff before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound for any single backoff.
    pub max_backoff_ms: u64,
    /// Backoff multiplier per attempt.
    pub backoff_multiplier: f64,
    /// Spread each backoff by ±25%.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Compute the backoff duration for a given attempt (0-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms =
            self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped_ms = base_ms.min(self.max_backoff_ms as f64);

        let final_ms = if self.jitter {
            capped_ms * rand::thread_rng().gen_range(0.75..=1.25)
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms as u64)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. The last error is returned on exhaustion.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> OutreachResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = OutreachResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let backoff = self.backoff_for_attempt(attempt);
                    metrics::counter!("retry.attempts", "operation" => operation.to_string())
                        .increment(1);
                    warn!(
                        operation,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_retryable() {
                        metrics::counter!("retry.exhausted", "operation" => operation.to_string())
                            .increment(1);
                        warn!(operation, attempts = attempt + 1, error = %err, "Retries exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }
}
