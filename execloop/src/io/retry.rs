//! Bounded retry with exponential backoff for flaky side effects.

use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, warn};

use crate::cancel::{CancellationToken, is_cancelled_error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay after the first failure; doubled after each further failure.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(300),
        }
    }
}

impl RetryPolicy {
    /// Delay slept after failed attempt number `attempt` (1-indexed).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exponent)
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` attempts have failed.
///
/// The closure receives the 1-indexed attempt number. Cancellation errors are
/// returned immediately and the token is checked before every attempt.
pub fn retry_with_backoff<T>(
    label: &str,
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut op: impl FnMut(u32) -> Result<T>,
) -> Result<T> {
    let max_attempts = policy.max_attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=max_attempts {
        cancel.check("retry")?;
        debug!(label, attempt, "attempt");
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) if is_cancelled_error(&err) => return Err(err),
            Err(err) => {
                warn!(label, attempt, err = %format!("{err:#}"), "attempt failed");
                if attempt < max_attempts {
                    thread::sleep(policy.delay_after(attempt));
                }
                last_err = Some(err);
            }
        }
    }
    let err = last_err.unwrap_or_else(|| anyhow!("{label}: no attempts made"));
    Err(err.context(format!("{label} failed after {max_attempts} attempts")))
}
