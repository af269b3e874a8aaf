//! Retry policy for transport-level failures.
//!
//! Only errors that [`NisyanError::is_transient`] deems retryable get
//! another attempt; everything else surfaces immediately. Delays double
//! per attempt up to a cap, so a long outage costs a bounded amount of
//! waiting instead of an unbounded exponential tail.

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Upper bound on a single between-attempt delay.
const MAX_DELAY: Duration = Duration::from_secs(5);

/// Doubling backoff schedule with a fixed attempt budget.
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    attempts_left: u32,
}

impl Backoff {
    /// `retries` extra attempts after the first, starting at `first_delay`.
    pub fn new(retries: u32, first_delay: Duration) -> Self {
        Self {
            delay: first_delay,
            attempts_left: retries,
        }
    }

    /// The delay to wait before the next attempt, or `None` once the
    /// attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts_left == 0 {
            return None;
        }
        self.attempts_left -= 1;
        let current = self.delay;
        self.delay = (current * 2).min(MAX_DELAY);
        Some(current)
    }
}

/// Drive `op` until it succeeds, fails permanently, or exhausts the policy.
pub async fn run_with_backoff<F, Fut, T>(mut policy: Backoff, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !err.is_transient() {
            return Err(err);
        }
        let Some(delay) = policy.next_delay() else {
            return Err(err);
        };
        tracing::debug!(
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient failure, backing off before retry"
        );
        tokio::time::sleep(delay).await;
    }
}
