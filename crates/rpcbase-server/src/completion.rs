//! One-shot completion signals.
//!
//! A [`Completion`] fires at most once and can be awaited by any number of
//! tasks. Firing is guarded by an atomic test-and-set so concurrent callers
//! race safely: exactly one of them observes `true` from [`Completion::fire`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// A signal that fires exactly once.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    fired: Arc<AtomicBool>,
    token: CancellationToken,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Returns `true` only for the call that fired it.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.token.cancel();
        true
    }

    /// Whether the signal has fired. Never blocks.
    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until the signal fires.
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// An owned future that resolves when the signal fires.
    pub fn wait_owned(&self) -> WaitForCancellationFutureOwned {
        self.token.clone().cancelled_owned()
    }
}
