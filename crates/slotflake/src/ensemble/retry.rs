use core::time::Duration;
use std::thread;

use crate::{RandSource, ThreadRandom, ensemble::EnsembleError};

/// Bounded exponential backoff for transient ensemble failures.
///
/// Attempt `n` (starting at 0) sleeps `base_sleep * k` where `k` is drawn
/// uniformly from `[1, 2^(n + 1))`, capped at `max_sleep`. Only errors for
/// which [`EnsembleError::is_retriable`] holds are retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    base_sleep: Duration,
    max_retries: u32,
    max_sleep: Duration,
}

impl Default for RetryPolicy {
    /// 3 retries starting from a 3 second base sleep.
    fn default() -> Self {
        Self::exponential(Duration::from_secs(3), 3)
    }
}

impl RetryPolicy {
    const MAX_SLEEP: Duration = Duration::from_secs(30);

    pub const fn exponential(base_sleep: Duration, max_retries: u32) -> Self {
        Self {
            base_sleep,
            max_retries,
            max_sleep: Self::MAX_SLEEP,
        }
    }

    /// Fails on the first error.
    pub const fn never() -> Self {
        Self::exponential(Duration::ZERO, 0)
    }

    pub const fn with_max_sleep(self, max_sleep: Duration) -> Self {
        Self { max_sleep, ..self }
    }

    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub(crate) fn sleep_for(&self, attempt: u32, rand: &impl RandSource) -> Duration {
        let span = 1u64 << (attempt + 1).min(30);
        let factor = rand.below(span).max(1);
        self.base_sleep
            .saturating_mul(factor.min(u64::from(u32::MAX)) as u32)
            .min(self.max_sleep)
    }

    /// Runs `op` until it succeeds, fails with a non-retriable error, or the
    /// retry budget is spent.
    ///
    /// # Errors
    ///
    /// Returns the last error produced by `op`.
    pub fn run<T>(
        &self,
        mut op: impl FnMut() -> Result<T, EnsembleError>,
    ) -> Result<T, EnsembleError> {
        let mut attempt = 0;
        loop {
            match op() {
                Err(err) if err.is_retriable() && attempt < self.max_retries => {
                    let sleep = self.sleep_for(attempt, &ThreadRandom);
                    tracing::debug!(%err, attempt, ?sleep, "retrying ensemble operation");
                    thread::sleep(sleep);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
