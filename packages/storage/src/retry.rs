//! Retry and polling schedules.

use std::future::Future;
use std::time::Duration;

use crate::StorageError;
use crate::clock::Clock;

/// Exponential backoff schedule with a bounded number of attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (initial + retries).
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Schedule for `PutObjectTagging`. Tags set right after an upload are
    /// sometimes rejected until the object has propagated.
    #[must_use]
    pub const fn tagging() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(16),
        }
    }

    /// Interval schedule for availability polling. Attempts are unbounded;
    /// the caller's deadline ends the loop.
    #[must_use]
    pub const fn polling() -> Self {
        Self {
            max_attempts: u32::MAX,
            base_delay: Duration::from_millis(500),
            multiplier: 1.5,
            max_delay: Duration::from_secs(15),
        }
    }

    /// `max_attempts` attempts without any delay in between.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay to wait after the `attempt`-th failure (1-indexed):
    /// `base_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempts are used up.
    ///
    /// # Errors
    ///
    /// Returns the last error produced by `operation`.
    pub async fn run<T, F, Fut>(
        &self,
        clock: &dyn Clock,
        what: &str,
        mut operation: F,
    ) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, StorageError>> + Send,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.next_delay(attempt);
                    log::warn!(
                        "{what}: attempt {attempt}/{max_attempts} failed ({e}), \
                         retrying in {delay:.1?}"
                    );
                    clock.sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::tagging()
    }
}
