//! Per-task bookkeeping inside one queue.

use std::sync::Arc;
use std::time::Instant;

use crate::domain::{Capabilities, Task};

/// What the queue records about a task it owns.
///
/// The task object itself carries identity, priority, and state; the entry
/// adds what only the owning queue knows: the capability record probed at
/// add time, the insertion sequence number that keeps the sort stable, and
/// the two one-way flags the runtime flips.
pub(crate) struct TaskEntry {
    pub task: Arc<dyn Task>,
    pub caps: Capabilities,
    /// Insertion counter; the final tie-breaker in the waiting-list order.
    pub seq: u64,
    /// Set by `cancel` on a running task that cannot be asked to stop; the
    /// task keeps running and lands in `cancelled` on natural exit.
    pub abandoned: bool,
    /// Set once the terminal bookkeeping (signal, callbacks) has run, so a
    /// cancel-versus-natural-exit race cannot run it twice.
    pub finalized: bool,
    pub enqueued_at: Instant,
}

impl TaskEntry {
    pub(crate) fn new(task: Arc<dyn Task>, seq: u64) -> Self {
        let caps = Capabilities::probe(task.as_ref());
        Self {
            task,
            caps,
            seq,
            abandoned: false,
            finalized: false,
            enqueued_at: Instant::now(),
        }
    }

    pub(crate) fn is_dependent(&self) -> bool {
        self.caps.contains(Capabilities::DEPENDENT)
    }
}
