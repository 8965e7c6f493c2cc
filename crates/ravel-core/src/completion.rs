//! Completion handles: the one-shot rendezvous between a queue and the
//! waiters of one task.
//!
//! A handle is created when a task starts being tracked and signalled
//! exactly once, when the task reaches a terminal state. Clones share the
//! signal; any number of waiters may block on it, before or after it
//! fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{timeout, timeout_at, Instant};

/// One-shot, multi-waiter completion signal.
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    signal: Arc<watch::Sender<bool>>,
}

impl CompletionHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            signal: Arc::new(tx),
        }
    }

    /// Fire the signal. Idempotent.
    pub fn signal(&self) {
        self.signal.send_replace(true);
    }

    pub fn is_signalled(&self) -> bool {
        *self.signal.borrow()
    }

    /// Resolve once the signal has fired (immediately if it already has).
    pub async fn wait(&self) {
        let mut rx = self.signal.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            // The sender lives in `self`, so `changed` cannot error while
            // we are waiting on it.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Like [`wait`], bounded by a duration. Returns whether the signal
    /// fired in time.
    ///
    /// [`wait`]: CompletionHandle::wait
    pub async fn wait_timeout(&self, limit: Duration) -> bool {
        timeout(limit, self.wait()).await.is_ok()
    }

    /// Like [`wait`], bounded by a deadline. Returns whether the signal
    /// fired in time.
    ///
    /// [`wait`]: CompletionHandle::wait
    pub async fn wait_until(&self, deadline: Instant) -> bool {
        timeout_at(deadline, self.wait()).await.is_ok()
    }
}

impl Default for CompletionHandle {
    fn default() -> Self {
        Self::new()
    }
}
