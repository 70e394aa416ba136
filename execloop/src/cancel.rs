//! Cooperative cancellation shared across the loop, executor, and scorer.
//!
//! Cancellation is advisory: components check the token at defined points and
//! unwind with [`CancelledError`]. A running subprocess is terminated by the
//! process supervisor when it observes the token, it is never abandoned.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

/// Cloneable cancellation flag. All clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Return `Err(CancelledError)` if cancellation was requested.
    ///
    /// `stage` names the step that observed the signal and ends up in the error message.
    pub fn check(&self, stage: &'static str) -> Result<()> {
        if self.is_cancelled() {
            return Err(CancelledError { stage }.into());
        }
        Ok(())
    }
}

/// Marker error for a run that stopped because cancellation was requested.
///
/// Carried inside `anyhow::Error`; recover it with `downcast_ref::<CancelledError>()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelledError {
    pub stage: &'static str,
}

impl fmt::Display for CancelledError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cancelled before {}", self.stage)
    }
}

impl std::error::Error for CancelledError {}

/// True if `err` (or anything in its chain) is a [`CancelledError`].
pub fn is_cancelled_error(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<CancelledError>().is_some())
}
