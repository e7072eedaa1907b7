//! Polling engine shared by every wait in the crate.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::debug;

/// Growth factor applied to the poll period when backoff is enabled.
const BACKOFF_FACTOR: f64 = 1.5;

/// Re-runs an async check on a period until it returns `true` or the budget runs out.
///
/// The check runs once immediately. Before each sleep the engine verifies that
/// the elapsed time plus the next sleep still fits in the budget, so it never
/// sleeps past the deadline. Errors from the check are returned as-is; callers
/// use them to fail fast on disqualifying states.
#[derive(Debug, Clone, Copy)]
pub struct RetryablePredicate {
    timeout: Duration,
    period: Duration,
    max_period: Duration,
}

impl RetryablePredicate {
    /// Fixed-period polling.
    pub fn new(timeout: Duration, period: Duration) -> Self {
        Self {
            timeout,
            period,
            max_period: period,
        }
    }

    /// Grow the period by 1.5x per attempt up to `max_period`.
    pub fn with_max_period(mut self, max_period: Duration) -> Self {
        self.max_period = max_period.max(self.period);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Returns `Ok(true)` once the check passes, `Ok(false)` on timeout.
    pub async fn apply<F, Fut, E>(&self, mut check: F) -> Result<bool, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
    {
        let found = self
            .poll::<_, _, (), E>(|| {
                let passed = check();
                async move { passed.await.map(|ok| ok.then_some(())) }
            })
            .await?;
        Ok(found.is_some())
    }

    /// Like [`apply`](Self::apply), but the check yields a value when it
    /// passes. Returns `Ok(None)` on timeout.
    pub async fn poll<F, Fut, T, E>(&self, mut check: F) -> Result<Option<T>, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let start = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            if let Some(value) = check().await? {
                return Ok(Some(value));
            }

            let delay = self.delay_for(attempt);
            let elapsed = start.elapsed();
            if elapsed + delay > self.timeout {
                debug!(
                    attempts = attempt + 1,
                    elapsed_ms = elapsed.as_millis() as u64,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Retry budget exhausted"
                );
                return Ok(None);
            }

            sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        if self.max_period <= self.period {
            return self.period;
        }
        let factor = BACKOFF_FACTOR.powi(attempt.min(64) as i32);
        let secs = self.period.as_secs_f64() * factor;
        Duration::from_secs_f64(secs.min(self.max_period.as_secs_f64()))
    }
}
