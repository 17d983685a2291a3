//! Bounded polling.
//!
//! Every wait in the launcher (readiness, replica set convergence, shard
//! registration, shutdown) runs under a [`RetryPolicy`]. A policy is a plain
//! value: it is passed to the wait, never stored in global state.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Attempt budget and delay schedule for one wait.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Always at least one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Growth factor applied to the delay after each failed attempt.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(60, Duration::from_millis(500))
    }
}

/// Outcome of one polling attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    Done(T),
    /// Not there yet; the string describes the last observation.
    Retry(String),
}

/// A wait that ran out of attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted {
    pub attempts: u32,
    pub last: String,
}

impl RetryPolicy {
    /// Constant delay between attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
        }
    }

    /// Doubling delay, capped at `max_delay`.
    pub fn exponential(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            multiplier: 2.0,
            max_delay: max_delay.max(initial_delay),
        }
    }

    /// No delay at all. Used by tests with in-memory collaborators.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::fixed(max_attempts, Duration::ZERO)
    }

    /// Delay after the failed attempt `attempt` (zero-based).
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Upper bound on the time spent sleeping across all attempts.
    pub fn total_budget(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| self.delay_for(attempt))
            .sum()
    }

    /// Runs `attempt` until it returns [`Attempt::Done`] or the budget runs
    /// out. The closure receives the one-based attempt number.
    pub async fn poll<T, F, Fut>(&self, mut attempt: F) -> Result<T, Exhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        let mut last = String::from("no attempt made");
        for n in 0..self.max_attempts {
            match attempt(n + 1).await {
                Attempt::Done(value) => return Ok(value),
                Attempt::Retry(observed) => last = observed,
            }
            if n + 1 < self.max_attempts {
                let delay = self.delay_for(n);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
        Err(Exhausted {
            attempts: self.max_attempts,
            last,
        })
    }
}
