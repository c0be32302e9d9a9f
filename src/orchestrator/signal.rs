//! Run termination signal and the one-shot timeout timer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;

use super::backend::BackendSet;

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const TIMED_OUT: u8 = 2;
const CANCELLED: u8 = 3;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    /// Still running.
    Pending,
    /// Backends returned on their own.
    Completed,
    /// The timer fired first.
    TimedOut,
    /// Global cancellation arrived first.
    Cancelled,
}

/// Single point where completion, timeout and cancellation race.
///
/// The first transition away from `Pending` wins; later ones are no-ops, so
/// each run is cancelled at most once.
#[derive(Debug, Default)]
pub struct RunSignal {
    state: AtomicU8,
}

impl RunSignal {
    /// Pending signal.
    pub fn new() -> Self {
        Self::default()
    }

    fn finish(&self, to: u8) -> bool {
        self.state
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Record natural completion.
    pub fn complete(&self) -> bool {
        self.finish(COMPLETED)
    }

    /// Record timer expiry.
    pub fn time_out(&self) -> bool {
        self.finish(TIMED_OUT)
    }

    /// Record global cancellation.
    pub fn cancel(&self) -> bool {
        self.finish(CANCELLED)
    }

    /// Current end state.
    pub fn end(&self) -> RunEnd {
        match self.state.load(Ordering::Acquire) {
            COMPLETED => RunEnd::Completed,
            TIMED_OUT => RunEnd::TimedOut,
            CANCELLED => RunEnd::Cancelled,
            _ => RunEnd::Pending,
        }
    }
}

/// Armed one-shot timer; dropping it disarms.
#[derive(Debug)]
pub struct TimeoutGuard {
    handle: JoinHandle<()>,
}

impl TimeoutGuard {
    /// Arm a timer that cancels the backends when `timeout` elapses while
    /// `signal` is still pending. Must be called inside a tokio runtime.
    pub fn arm(timeout: Duration, signal: Arc<RunSignal>, backends: BackendSet) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if signal.time_out() {
                tracing::warn!(?timeout, "test run timed out, cancelling backends");
                backends.cancel_all();
            }
        });
        Self { handle }
    }

    /// Disarm explicitly.
    pub fn disarm(self) {}
}

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
