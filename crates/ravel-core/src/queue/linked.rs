//! Linked queues: dependency resolution across a federation of peers.
//!
//! A linked queue never starts a dependency itself. It assumes the
//! dependency is enqueued somewhere in the federation, takes the owning
//! queue's completion handle, and parks the dependent until every handle
//! has signalled. A dependency found in no federation member is fatal:
//! the dependent can never make progress, so the runtime panics at the
//! point of discovery.

use std::ops::Deref;
use std::sync::Arc;

use bitflags::bitflags;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::completion::CompletionHandle;
use crate::domain::{Dependent, Phase, QueueId, Task, TaskId};
use crate::error::QueueError;
use crate::pool::{default_pool, WorkerPool};

use super::federation::QueueFederation;
use super::runtime::{DependencyOutcome, Mode, QueueCore};
use super::sort;
use super::task_queue::TaskQueue;

bitflags! {
    /// Priority adjustments a linked queue applies while resolving a
    /// dependency, once per dependency.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DependencyOptions: u8 {
        /// Bump each unfinished dependency to the next band.
        const INCREASE_DEPENDENCY_PRIORITY = 1 << 0;
        /// Drop the dependent itself to the previous band.
        const DECREASE_DEPENDENT_PRIORITY = 1 << 1;
    }
}

/// A [`TaskQueue`] whose dependent tasks may reference tasks owned by
/// linked peer queues. Everything else (intake, control, rendezvous,
/// views) is the plain queue surface, reached through `Deref`.
pub struct LinkedTaskQueue {
    queue: TaskQueue,
}

impl LinkedTaskQueue {
    pub fn new(name: impl Into<String>, max_simultaneous: usize, options: DependencyOptions) -> Self {
        Self::with_pool(name, max_simultaneous, options, default_pool())
    }

    pub fn with_pool(
        name: impl Into<String>,
        max_simultaneous: usize,
        options: DependencyOptions,
        pool: Arc<dyn WorkerPool>,
    ) -> Self {
        let mode = Mode::Linked {
            federation: QueueFederation::new(),
            options,
        };
        Self {
            queue: TaskQueue::from_core(QueueCore::new(name.into(), max_simultaneous, pool, mode)),
        }
    }

    /// A linked queue already joined to the given peers.
    pub fn linked_to(
        name: impl Into<String>,
        max_simultaneous: usize,
        options: DependencyOptions,
        peers: &[&LinkedTaskQueue],
    ) -> Self {
        let queue = Self::new(name, max_simultaneous, options);
        for peer in peers {
            queue.link(peer);
        }
        queue
    }

    /// Link two queues. Symmetric (the peer acquires the same link) and
    /// idempotent.
    pub fn link(&self, peer: &LinkedTaskQueue) {
        if self.queue.core.id == peer.queue.core.id {
            return;
        }
        let fresh = self
            .federation()
            .insert(peer.id(), Arc::downgrade(&peer.queue.core));
        peer.federation()
            .insert(self.id(), Arc::downgrade(&self.queue.core));
        if fresh {
            info!(queue = %self.queue.core.name, peer = %peer.queue.core.name, "queues linked");
        }
    }

    pub fn options(&self) -> DependencyOptions {
        match &self.queue.core.mode {
            Mode::Linked { options, .. } => *options,
            Mode::Local => unreachable!("linked queue is built in linked mode"),
        }
    }

    pub fn peer_ids(&self) -> Vec<QueueId> {
        self.federation().peer_ids()
    }

    pub fn is_linked_to(&self, peer: &LinkedTaskQueue) -> bool {
        self.federation().contains(peer.id())
    }

    fn federation(&self) -> &QueueFederation {
        match &self.queue.core.mode {
            Mode::Linked { federation, .. } => federation,
            Mode::Local => unreachable!("linked queue is built in linked mode"),
        }
    }
}

impl Deref for LinkedTaskQueue {
    type Target = TaskQueue;

    fn deref(&self) -> &TaskQueue {
        &self.queue
    }
}

// ---- federated dependency resolution ----------------------------------

/// Prepare a dependent task against the federation.
///
/// For each unfinished dependency: fail fast if it already failed, apply
/// the priority options, locate the owner's completion handle. If any
/// dependency is still outstanding the task parks: it goes back into the
/// waiting list in `currently(waiting)`, releases its slot, and this
/// function stays behind to await the handles. Once they have all
/// signalled the task flips to `done(waiting)` and the loop re-admits it
/// ahead of ready tasks of equal rank.
pub(crate) async fn resolve_federated(
    core: &Arc<QueueCore>,
    task: &Arc<dyn Task>,
    dependent: &dyn Dependent,
    federation: &QueueFederation,
    options: DependencyOptions,
) -> DependencyOutcome {
    let id = task.id();
    let mut pending: Vec<(Arc<dyn Task>, CompletionHandle)> = Vec::new();

    for dep in dependent.dependencies() {
        let dep_id = dep.id();
        let snapshot = dep.state();
        if snapshot.did_succeed() {
            continue;
        }
        task.meta().update_state(|s| s.set_dependency(dep_id));
        if snapshot.did_fail() || snapshot.was_cancelled() {
            warn!(
                queue = %core.name,
                task = %id,
                dependency = %dep_id,
                "dependency already failed"
            );
            task.meta().update_state(|s| s.fail());
            return DependencyOutcome::Failed;
        }

        if options.contains(DependencyOptions::INCREASE_DEPENDENCY_PRIORITY)
            && dep.meta().increase_priority()
        {
            debug!(
                queue = %core.name,
                dependency = %dep_id,
                priority = %dep.priority(),
                "dependency priority raised"
            );
            resort_owner(core, federation, dep_id).await;
        }
        if options.contains(DependencyOptions::DECREASE_DEPENDENT_PRIORITY)
            && task.meta().decrease_priority()
        {
            debug!(
                queue = %core.name,
                task = %id,
                priority = %task.priority(),
                "dependent priority lowered"
            );
            resort(core).await;
        }

        let Some(handle) = federated_handle(core, federation, dep_id).await else {
            let err = QueueError::DependencyNotFound {
                task: id,
                dependency: dep_id,
            };
            error!(queue = %core.name, "{err}");
            panic!("{err}");
        };
        pending.push((dep, handle));
    }

    if pending.is_empty() {
        task.meta().update_state(|s| s.clear_dependency());
        return DependencyOutcome::Satisfied;
    }

    // Park: back into the waiting list, slot released, loop nudged.
    {
        let mut st = core.state.lock().await;
        task.meta().update_state(|s| s.start_to(Phase::Waiting));
        st.active.remove(&id);
        if !st.waiting.contains(&id) {
            st.waiting.push(id);
        }
        let st = &mut *st;
        sort::sort_waiting(&mut st.waiting, &st.entries);
        st.draw_requested = true;
    }
    debug!(
        queue = %core.name,
        task = %id,
        dependencies = pending.len(),
        "parked on dependencies"
    );
    core.wake.notify_one();

    // Await the handles; the channel yields indices in completion order,
    // which is the order the dependency callback must fire in.
    let (tx, mut rx) = mpsc::unbounded_channel::<usize>();
    for (i, (_, handle)) in pending.iter().enumerate() {
        let tx = tx.clone();
        let handle = handle.clone();
        core.pool.spawn(
            task.qos(),
            Box::pin(async move {
                handle.wait().await;
                let _ = tx.send(i);
            }),
        );
    }
    drop(tx);

    let mut done = 0usize;
    while let Some(i) = rx.recv().await {
        let dep = &pending[i].0;
        dependent.dependency_finished(dep.as_ref());
        if dep.state().did_succeed() {
            done += 1;
            if done == pending.len() {
                break;
            }
        } else {
            // Failed or cancelled: the dependent will never run. Pull it
            // out of the waiting list and fail it; the caller finalizes.
            warn!(
                queue = %core.name,
                task = %id,
                dependency = %dep.id(),
                "dependency failed while parked"
            );
            let mut st = core.state.lock().await;
            st.waiting.retain(|t| *t != id);
            task.meta().update_state(|s| {
                s.set_dependency(dep.id());
                s.fail();
            });
            return DependencyOutcome::Failed;
        }
    }

    // Every dependency succeeded: flip to waited and let the loop
    // re-admit the task ahead of ready tasks of equal rank.
    {
        let mut st = core.state.lock().await;
        task.meta().update_state(|s| {
            s.clear_dependency();
            s.finish();
        });
        st.draw_requested = true;
    }
    debug!(queue = %core.name, task = %id, "dependencies satisfied");
    core.wake.notify_one();
    DependencyOutcome::Parked
}

/// Find the completion handle for `dep` in this queue or any peer. A
/// handle taken for an already-terminal task comes back pre-signalled.
async fn federated_handle(
    core: &Arc<QueueCore>,
    federation: &QueueFederation,
    dep: TaskId,
) -> Option<CompletionHandle> {
    if let Some(handle) = handle_in(core, dep).await {
        return Some(handle);
    }
    for peer in federation.peers() {
        if let Some(handle) = handle_in(&peer, dep).await {
            return Some(handle);
        }
    }
    None
}

async fn handle_in(core: &Arc<QueueCore>, dep: TaskId) -> Option<CompletionHandle> {
    let mut st = core.state.lock().await;
    let st = &mut *st;
    let entry = st.entries.get(&dep)?;
    let terminal = entry.task.state().is_terminal();
    let handle = st.handles.entry(dep).or_default().clone();
    if terminal {
        handle.signal();
    }
    Some(handle)
}

async fn resort(core: &Arc<QueueCore>) {
    let mut st = core.state.lock().await;
    let st = &mut *st;
    sort::sort_waiting(&mut st.waiting, &st.entries);
}

/// Re-sort the waiting list of whichever federation member owns `dep`.
async fn resort_owner(core: &Arc<QueueCore>, federation: &QueueFederation, dep: TaskId) {
    {
        let mut st = core.state.lock().await;
        if st.entries.contains_key(&dep) {
            let st = &mut *st;
            sort::sort_waiting(&mut st.waiting, &st.entries);
            return;
        }
    }
    for peer in federation.peers() {
        let mut st = peer.state.lock().await;
        if st.entries.contains_key(&dep) {
            let st = &mut *st;
            sort::sort_waiting(&mut st.waiting, &st.entries);
            return;
        }
    }
}
