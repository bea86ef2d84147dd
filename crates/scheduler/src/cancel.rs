//! Abort signals for cooperative cancellation
//!
//! A load task that has already started cannot be preempted by the
//! scheduler. Instead its body is handed an [`AbortSignal`] and is expected
//! to stop early once the owning row aborts it (identity change, unmount, or
//! losing the "loads allowed" hint mid-decode).

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::Notify;

struct AbortState {
    aborted: AtomicBool,
    notify: Notify,
}

/// Owning side of an abort signal
///
/// Dropping the controller does not abort; call [`AbortController::abort`]
/// explicitly.
///
/// # Example
///
/// ```
/// use jobrow_scheduler::AbortController;
///
/// let controller = AbortController::new();
/// let signal = controller.signal();
///
/// assert!(!signal.is_aborted());
/// controller.abort();
/// assert!(signal.is_aborted());
/// ```
#[derive(Clone)]
pub struct AbortController {
    state: Arc<AbortState>,
}

impl AbortController {
    /// Create a new controller in the non-aborted state
    pub fn new() -> Self {
        Self {
            state: Arc::new(AbortState {
                aborted: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Get a signal observing this controller
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            state: Arc::clone(&self.state),
        }
    }

    /// Abort all signals created from this controller
    ///
    /// Idempotent. Tasks parked in [`AbortSignal::aborted`] are woken.
    pub fn abort(&self) {
        if !self.state.aborted.swap(true, Ordering::AcqRel) {
            self.state.notify.notify_waiters();
        }
    }

    /// Check whether `abort()` has been called
    pub fn is_aborted(&self) -> bool {
        self.state.aborted.load(Ordering::Acquire)
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Observing side of an abort controller
#[derive(Clone)]
pub struct AbortSignal {
    state: Arc<AbortState>,
}

impl AbortSignal {
    /// A signal that is never aborted
    pub fn never() -> Self {
        AbortController::new().signal()
    }

    /// Check if the owning controller has aborted
    pub fn is_aborted(&self) -> bool {
        self.state.aborted.load(Ordering::Acquire)
    }

    /// Wait until the owning controller aborts
    ///
    /// Resolves immediately if already aborted. Intended to be raced against
    /// the real work with `tokio::select!`.
    pub async fn aborted(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}
