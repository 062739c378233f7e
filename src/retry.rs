// ============================================================================
// Retry with exponential backoff
// ============================================================================

use std::cell::Cell;
use std::time::{Duration, Instant};

use backoff::ExponentialBackoffBuilder;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 4,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(8),
            multiplier: 2.0,
            randomization_factor: 0.5,
            max_elapsed: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> backoff::ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(self.randomization_factor)
            .with_max_elapsed_time(Some(self.max_elapsed))
            .build()
    }

    /// Run `op` until it succeeds, fails permanently, or the policy gives up.
    /// `what` names the operation in log lines. A server-requested delay that
    /// does not fit in the remaining `max_elapsed` ends the retries.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let max_attempts = self.max_attempts.max(1);
        let attempt = Cell::new(0u32);
        let started = Instant::now();

        let result = backoff::retry_notify(
            self.backoff(),
            || {
                attempt.set(attempt.get() + 1);
                match op() {
                    Ok(value) => Ok(value),
                    Err(e) if !e.is_transient() || attempt.get() >= max_attempts => {
                        Err(backoff::Error::permanent(e))
                    }
                    Err(e) => match e.retry_after() {
                        Some(delay) if delay > self.max_elapsed.saturating_sub(started.elapsed()) => {
                            tracing::warn!(what, ?delay, "server asked for a longer wait than the retry budget");
                            Err(backoff::Error::permanent(e))
                        }
                        Some(delay) => Err(backoff::Error::retry_after(e, delay)),
                        None => Err(backoff::Error::transient(e)),
                    },
                }
            },
            |err: Error, delay: Duration| {
                tracing::warn!(what, attempt = attempt.get(), error = %err, ?delay, "transient failure, retrying");
            },
        );

        result.map_err(|e| match e {
            backoff::Error::Permanent(err) => err,
            backoff::Error::Transient { err, .. } => err,
        })
    }
}
