//! Bounded retry with exponential backoff for backend selection.

use std::future::Future;
use std::io;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::debug;

/// Default number of selection attempts per connection.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Retry policy: attempt count plus exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base: Duration,

    /// Upper bound on any single delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base: Duration::from_millis(10),
            max: Duration::from_secs(1),
            jitter: 0.25,
        }
    }
}

/// Every attempt failed.
#[derive(Debug, Error)]
#[error("gave up after {attempts} attempts: {last}")]
pub struct RetryExhausted {
    pub attempts: u32,
    #[source]
    pub last: io::Error,
}

impl RetryPolicy {
    /// Retry up to `max_attempts` times without waiting in between.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base: Duration::ZERO,
            max: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Delay to wait after the given (zero-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        if delay <= 0.0 || self.jitter <= 0.0 {
            return Duration::from_millis(delay as u64);
        }

        let jitter = delay * self.jitter.min(1.0) * rand::rng().random_range(-1.0..=1.0);
        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }

    /// Run `op` until it succeeds or the attempts are used up.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, RetryExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = io::Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if attempt >= attempts {
                        return Err(RetryExhausted { attempts, last: e });
                    }

                    let delay = self.delay(attempt - 1);
                    debug!(
                        attempt = attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}
