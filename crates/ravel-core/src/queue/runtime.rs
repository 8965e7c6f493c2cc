//! The queue runtime: shared state, the scheduling loop, and the per-task
//! lifecycle.
//!
//! All mutable queue state lives in one struct behind one async mutex. The
//! lock is held only to publish a consistent new version: lock, mutate,
//! drop, then signal. No user hook runs and no await happens with the lock
//! held.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::completion::CompletionHandle;
use crate::domain::{Capabilities, Dependent, Phase, QosClass, QueueId, Task, TaskId};
use crate::observability::QueueCounts;
use crate::pool::WorkerPool;

use super::entry::TaskEntry;
use super::federation::QueueFederation;
use super::linked::{self, DependencyOptions};
use super::sort;

/// How a queue resolves the dependencies of its dependent tasks.
pub(crate) enum Mode {
    /// Dependencies are started inline by the dependent itself.
    Local,
    /// Dependencies are assumed to be enqueued somewhere in the
    /// federation; the dependent parks on their completion handles.
    Linked {
        federation: QueueFederation,
        options: DependencyOptions,
    },
}

/// Everything mutable about one queue, guarded as a unit.
pub(crate) struct QueueState {
    /// Queue accepts draws. Cleared by `pause` and `cancel(true)`.
    pub active_flag: bool,
    /// A scheduling loop is alive for this queue.
    pub loop_running: bool,
    /// The get-next trigger: set with the lock held whenever a completed
    /// or parked task frees capacity, consumed by the loop.
    pub draw_requested: bool,
    pub next_seq: u64,
    pub entries: HashMap<TaskId, TaskEntry>,
    /// Sorted waiting list (see `sort`). Holds ready, parked, and waited
    /// tasks.
    pub waiting: Vec<TaskId>,
    /// In flight and not yet terminal: dispatched by the loop or claimed
    /// as a local dependency, paused included. The loop only draws while
    /// `active.len() < max_simultaneous`.
    pub active: HashSet<TaskId>,
    /// One completion handle per tracked task, minted at add (or on first
    /// demand by a federation waiter) and removed once signalled.
    pub handles: HashMap<TaskId, CompletionHandle>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            active_flag: false,
            loop_running: false,
            draw_requested: false,
            next_seq: 0,
            entries: HashMap::new(),
            waiting: Vec::new(),
            active: HashSet::new(),
            handles: HashMap::new(),
        }
    }
}

pub(crate) struct QueueCore {
    pub id: QueueId,
    pub name: String,
    pub max_simultaneous: usize,
    pub pool: Arc<dyn WorkerPool>,
    pub mode: Mode,
    pub state: Mutex<QueueState>,
    /// Wakes the scheduling loop. Paired with `draw_requested`.
    pub wake: Notify,
}

impl QueueCore {
    pub(crate) fn new(
        name: String,
        max_simultaneous: usize,
        pool: Arc<dyn WorkerPool>,
        mode: Mode,
    ) -> Arc<Self> {
        assert!(max_simultaneous >= 1, "max_simultaneous must be at least 1");
        Arc::new(Self {
            id: QueueId::random(),
            name,
            max_simultaneous,
            pool,
            mode,
            state: Mutex::new(QueueState::new()),
            wake: Notify::new(),
        })
    }
}

/// Boxed lifecycle future; boxed so dependents can run dependencies
/// recursively.
pub(crate) type TaskJob = Pin<Box<dyn Future<Output = ()> + Send>>;

enum StageOutcome {
    /// The task reached a terminal state; finalize it.
    Terminal,
    /// The task parked on federated dependencies and released its slot.
    Parked,
}

pub(crate) enum DependencyOutcome {
    Satisfied,
    Parked,
    Failed,
}

// ---- add / start ------------------------------------------------------

/// Insert a task, preserving the sort order. Idempotent on the task id.
pub(crate) async fn add_task(core: &Arc<QueueCore>, task: Arc<dyn Task>) -> bool {
    let id = task.id();
    let nudge = {
        let mut st = core.state.lock().await;
        if st.entries.contains_key(&id) {
            debug!(queue = %core.name, task = %id, "duplicate add ignored");
            return false;
        }
        st.next_seq += 1;
        let seq = st.next_seq;
        st.entries.insert(id, TaskEntry::new(task, seq));
        st.waiting.push(id);
        let st = &mut *st;
        sort::sort_waiting(&mut st.waiting, &st.entries);
        st.handles.entry(id).or_default();
        st.active_flag && st.active.len() < core.max_simultaneous
    };
    debug!(queue = %core.name, task = %id, "task added");
    if nudge {
        ensure_loop(core).await;
        core.wake.notify_one();
    }
    true
}

/// Mark the queue active and begin draining. No-op when already active.
pub(crate) async fn start(core: &Arc<QueueCore>) {
    {
        let mut st = core.state.lock().await;
        if st.active_flag {
            return;
        }
        st.active_flag = true;
    }
    info!(queue = %core.name, "queue started");
    ensure_loop(core).await;
    core.wake.notify_one();
}

/// Spawn the scheduling loop if none is alive.
pub(crate) async fn ensure_loop(core: &Arc<QueueCore>) {
    {
        let mut st = core.state.lock().await;
        if st.loop_running {
            return;
        }
        st.loop_running = true;
    }
    let looped = Arc::clone(core);
    core.pool
        .spawn(QosClass::Default, Box::pin(run_loop(looped)));
}

// ---- the scheduling loop ---------------------------------------------

/// One logical loop per queue: dispatch while capacity allows, then park
/// on the get-next trigger. Exits once the queue has drained; `add` will
/// respawn it.
async fn run_loop(core: Arc<QueueCore>) {
    debug!(queue = %core.name, "scheduling loop up");
    loop {
        {
            let mut st = core.state.lock().await;
            st.draw_requested = false;
            dispatch_up_to_capacity(&core, &mut st);
            if st.waiting.is_empty() && st.active.is_empty() {
                st.loop_running = false;
                debug!(queue = %core.name, "scheduling loop drained");
                return;
            }
        }
        core.wake.notified().await;
    }
}

fn dispatch_up_to_capacity(core: &Arc<QueueCore>, st: &mut QueueState) {
    if !st.active_flag {
        return;
    }
    while st.active.len() < core.max_simultaneous {
        let Some(id) = sort::pick_next(&st.waiting, &st.entries) else {
            return;
        };
        st.waiting.retain(|t| *t != id);
        st.active.insert(id);
        let task = Arc::clone(&st.entries.get(&id).expect("picked id has an entry").task);
        let handle = st.handles.entry(id).or_default().clone();
        // Marked under the lock so no other picker can claim it.
        task.meta().update_state(|s| s.start_to(Phase::Beginning));
        debug!(
            queue = %core.name,
            task = %id,
            priority = %task.priority(),
            "task picked"
        );
        core.pool
            .spawn(task.qos(), run_task(Arc::clone(core), task, handle));
    }
}

// ---- the per-task lifecycle ------------------------------------------

/// The full lifecycle of one task: prepare, configure, execute, finalize.
/// Boxed so local dependency resolution can run dependencies through it
/// recursively.
pub(crate) fn run_task(
    core: Arc<QueueCore>,
    task: Arc<dyn Task>,
    handle: CompletionHandle,
) -> TaskJob {
    Box::pin(async move {
        match run_stages(&core, &task).await {
            StageOutcome::Terminal => finalize(&core, &task, &handle).await,
            // The slot was already released when the task parked.
            StageOutcome::Parked => {}
        }
    })
}

async fn run_stages(core: &Arc<QueueCore>, task: &Arc<dyn Task>) -> StageOutcome {
    let id = task.id();

    // Prepare: resolve dependencies, per mode.
    task.meta().update_state(|s| s.start_to(Phase::Preparing));
    if let Some(dependent) = task.as_dependent() {
        let outcome = match &core.mode {
            Mode::Local => resolve_local(core, task, dependent).await,
            Mode::Linked {
                federation,
                options,
            } => linked::resolve_federated(core, task, dependent, federation, *options).await,
        };
        match outcome {
            DependencyOutcome::Satisfied => {}
            DependencyOutcome::Parked => return StageOutcome::Parked,
            DependencyOutcome::Failed => return StageOutcome::Terminal,
        }
    }
    task.meta().update_state(|s| s.finish());
    debug!(queue = %core.name, task = %id, "prepared");

    // Configure, for tasks that asked for it.
    if let Some(configurable) = task.as_configurable() {
        task.meta().update_state(|s| s.start_to(Phase::Configuring));
        if !configurable.configure().await {
            warn!(queue = %core.name, task = %id, "configure refused");
            task.meta().update_state(|s| s.fail());
            return StageOutcome::Terminal;
        }
        task.meta().update_state(|s| s.finish());
        debug!(queue = %core.name, task = %id, "configured");
    }

    // Execute.
    task.meta().update_state(|s| s.start_to(Phase::Executing));
    let success = task.execute().await;
    let abandoned = {
        let st = core.state.lock().await;
        st.entries.get(&id).map(|e| e.abandoned).unwrap_or(false)
    };
    task.meta()
        .update_state(|s| s.complete_execution(success, abandoned));
    StageOutcome::Terminal
}

/// Local-mode dependency resolution: start each unfinished dependency
/// inline, in the dependent's own lifecycle, and await its handle. The
/// loop never draws a claimed dependency (it is claimed under the state
/// lock), but it does join the active set so `pause` and `cancel` can
/// reach it. The dependency callback fires after every completed
/// dependency, success or not; a failed or cancelled dependency fails the
/// dependent.
async fn resolve_local(
    core: &Arc<QueueCore>,
    task: &Arc<dyn Task>,
    dependent: &dyn Dependent,
) -> DependencyOutcome {
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
                task = %task.id(),
                dependency = %dep_id,
                "dependency already failed"
            );
            task.meta().update_state(|s| s.fail());
            return DependencyOutcome::Failed;
        }

        // Claim the dependency if nothing has started it yet; otherwise
        // somebody else is driving it and we just wait. A claimed
        // dependency joins the active set like any dispatched task, so
        // `pause` and `cancel` reach it while it executes; `finalize`
        // releases it again.
        let (dep_handle, claimed) = {
            let mut st = core.state.lock().await;
            let handle = st.handles.entry(dep_id).or_default().clone();
            let claimed = if dep.state().is_ready() {
                st.waiting.retain(|t| *t != dep_id);
                st.active.insert(dep_id);
                dep.meta().update_state(|s| s.start_to(Phase::Beginning));
                true
            } else {
                false
            };
            (handle, claimed)
        };
        if claimed {
            debug!(
                queue = %core.name,
                task = %task.id(),
                dependency = %dep_id,
                "starting dependency inline"
            );
            run_task(Arc::clone(core), Arc::clone(&dep), dep_handle).await;
        } else {
            debug!(
                queue = %core.name,
                task = %task.id(),
                dependency = %dep_id,
                "awaiting in-flight dependency"
            );
            dep_handle.wait().await;
        }

        dependent.dependency_finished(dep.as_ref());
        if dep.state().did_succeed() {
            task.meta().update_state(|s| s.clear_dependency());
        } else {
            task.meta().update_state(|s| s.fail());
            return DependencyOutcome::Failed;
        }
    }
    DependencyOutcome::Satisfied
}

/// Terminal bookkeeping: release the slot and the handle, fire the
/// signal, run the post-terminal callback, and nudge the loop. Guarded so
/// a cancel-versus-natural-exit race runs it once.
pub(crate) async fn finalize(core: &Arc<QueueCore>, task: &Arc<dyn Task>, handle: &CompletionHandle) {
    let id = task.id();
    let elapsed_ms = {
        let mut st = core.state.lock().await;
        if let Some(entry) = st.entries.get_mut(&id) {
            if entry.finalized {
                return;
            }
            entry.finalized = true;
        }
        st.active.remove(&id);
        st.waiting.retain(|t| *t != id);
        st.handles.remove(&id);
        st.draw_requested = true;
        st.entries
            .get(&id)
            .map(|e| e.enqueued_at.elapsed().as_millis() as u64)
    };
    let state = task.state();
    if state.did_fail() {
        warn!(queue = %core.name, task = %id, state = %state, elapsed_ms, "task failed");
    } else {
        debug!(queue = %core.name, task = %id, state = %state, elapsed_ms, "task done");
    }
    handle.signal();
    task.finish();
    core.wake.notify_one();
}

// ---- pause / resume / cancel -----------------------------------------

/// Suspend the queue: no new draws, and every executing pausable task is
/// asked to pause. Non-pausable tasks keep running to completion.
pub(crate) async fn pause(core: &Arc<QueueCore>) {
    let targets = {
        let mut st = core.state.lock().await;
        st.active_flag = false;
        collect_active(&st, |entry| {
            entry.caps.contains(Capabilities::PAUSABLE) && entry.task.state().is_executing()
        })
    };
    info!(queue = %core.name, asked = targets.len(), "queue pausing");
    for task in targets {
        let marked = task.meta().update_state(|s| {
            if s.is_executing() {
                s.pause();
                true
            } else {
                false
            }
        });
        if !marked {
            continue;
        }
        let pausable = task.as_pausable().expect("capability probed at add");
        let ok = pausable.pause().await;
        let now = settle_hook(&task, ok, Phase::Pausing);
        if now.is_terminal() {
            finalize_by_id(core, &task).await;
        } else if now.is_paused() {
            debug!(queue = %core.name, task = %task.id(), "task paused");
        }
    }
}

/// Reactivate the queue and ask every paused task to resume. A refused
/// resume fails the task.
pub(crate) async fn resume(core: &Arc<QueueCore>) {
    let targets = {
        let mut st = core.state.lock().await;
        st.active_flag = true;
        collect_active(&st, |entry| {
            entry.caps.contains(Capabilities::PAUSABLE) && entry.task.state().is_paused()
        })
    };
    info!(queue = %core.name, asked = targets.len(), "queue resuming");
    for task in targets {
        let marked = task.meta().update_state(|s| {
            if s.is_paused() {
                s.start_to(Phase::Resuming);
                true
            } else {
                false
            }
        });
        if !marked {
            continue;
        }
        let pausable = task.as_pausable().expect("capability probed at add");
        let ok = pausable.resume().await;
        let now = task.meta().update_state(|s| {
            if s.is_terminal() {
                return *s;
            }
            if ok {
                if s.current_phase() == Some(Phase::Resuming) {
                    s.start_to(Phase::Executing);
                }
            } else {
                s.fail();
            }
            *s
        });
        if now.is_terminal() {
            finalize_by_id(core, &task).await;
        }
    }
    ensure_loop(core).await;
    core.wake.notify_one();
}

/// Ask every executing cancellable task to cancel; mark the rest
/// abandoned. Returns the tasks that actually cancelled. `deactivate`
/// additionally stops the queue drawing until the next `start`.
pub(crate) async fn cancel(core: &Arc<QueueCore>, deactivate: bool) -> Vec<Arc<dyn Task>> {
    let (targets, abandoned) = {
        let mut st = core.state.lock().await;
        if deactivate {
            st.active_flag = false;
        }
        let mut targets = Vec::new();
        let mut abandoned = 0usize;
        let ids: Vec<TaskId> = st.active.iter().copied().collect();
        for id in ids {
            let Some(entry) = st.entries.get_mut(&id) else {
                continue;
            };
            if !entry.task.state().is_executing() {
                continue;
            }
            if entry.caps.contains(Capabilities::CANCELLABLE) {
                targets.push(Arc::clone(&entry.task));
            } else {
                entry.abandoned = true;
                abandoned += 1;
            }
        }
        (targets, abandoned)
    };
    if abandoned > 0 {
        warn!(queue = %core.name, abandoned, "non-cancellable running tasks abandoned");
    }

    let mut cancelled = Vec::new();
    for task in targets {
        let marked = task.meta().update_state(|s| {
            if s.is_executing() {
                s.cancel();
                true
            } else {
                false
            }
        });
        if !marked {
            continue;
        }
        let cancellable = task.as_cancellable().expect("capability probed at add");
        let ok = cancellable.cancel().await;
        let now = settle_hook(&task, ok, Phase::Cancelling);
        if now.was_cancelled() {
            cancelled.push(Arc::clone(&task));
        }
        if now.is_terminal() {
            finalize_by_id(core, &task).await;
        }
    }
    info!(
        queue = %core.name,
        cancelled = cancelled.len(),
        deactivate,
        "queue cancel"
    );
    cancelled
}

/// Resolve a hook verdict against the state, tolerating the race where
/// execution completed while the hook was out: the first terminal verdict
/// wins.
fn settle_hook(
    task: &Arc<dyn Task>,
    ok: bool,
    phase: Phase,
) -> crate::domain::TaskState {
    task.meta().update_state(|s| {
        if s.is_terminal() {
            return *s;
        }
        if ok {
            if s.current_phase() == Some(phase) {
                s.finish();
            }
        } else {
            s.fail();
        }
        *s
    })
}

async fn finalize_by_id(core: &Arc<QueueCore>, task: &Arc<dyn Task>) {
    let handle = {
        let st = core.state.lock().await;
        st.handles.get(&task.id()).cloned()
    };
    if let Some(handle) = handle {
        finalize(core, task, &handle).await;
    }
}

fn collect_active(st: &QueueState, pred: impl Fn(&TaskEntry) -> bool) -> Vec<Arc<dyn Task>> {
    let mut tasks: Vec<&TaskEntry> = st
        .active
        .iter()
        .filter_map(|id| st.entries.get(id))
        .filter(|entry| pred(entry))
        .collect();
    tasks.sort_by_key(|entry| entry.seq);
    tasks.into_iter().map(|e| Arc::clone(&e.task)).collect()
}

// ---- waits and views --------------------------------------------------

/// Snapshot of every live completion handle.
pub(crate) async fn tracked_handles(core: &Arc<QueueCore>) -> Vec<CompletionHandle> {
    let st = core.state.lock().await;
    st.handles.values().cloned().collect()
}

/// Block until every currently tracked task has completed.
pub(crate) async fn wait_all(core: &Arc<QueueCore>) {
    for handle in tracked_handles(core).await {
        handle.wait().await;
    }
}

/// Tasks matching a state predicate, in insertion order.
pub(crate) async fn tasks_where(
    core: &Arc<QueueCore>,
    pred: impl Fn(&crate::domain::TaskState) -> bool,
) -> Vec<Arc<dyn Task>> {
    let st = core.state.lock().await;
    let mut hits: Vec<&TaskEntry> = st
        .entries
        .values()
        .filter(|entry| pred(&entry.task.state()))
        .collect();
    hits.sort_by_key(|entry| entry.seq);
    hits.into_iter().map(|e| Arc::clone(&e.task)).collect()
}

/// The waiting list, in pick order.
pub(crate) async fn waiting_tasks(core: &Arc<QueueCore>) -> Vec<Arc<dyn Task>> {
    let st = core.state.lock().await;
    st.waiting
        .iter()
        .filter_map(|id| st.entries.get(id))
        .map(|entry| Arc::clone(&entry.task))
        .collect()
}

pub(crate) async fn counts(core: &Arc<QueueCore>) -> QueueCounts {
    let st = core.state.lock().await;
    let mut counts = QueueCounts::default();
    for entry in st.entries.values() {
        let state = entry.task.state();
        if state.did_succeed() {
            counts.succeeded += 1;
        } else if state.did_fail() {
            counts.failed += 1;
        } else if state.was_cancelled() {
            counts.cancelled += 1;
        } else if state.is_paused() {
            counts.paused += 1;
        } else if state.is_ready() || state.is_waiting() || state.has_waited() {
            counts.waiting += 1;
        } else {
            counts.running += 1;
        }
    }
    counts
}

pub(crate) async fn remaining(core: &Arc<QueueCore>) -> usize {
    let st = core.state.lock().await;
    st.waiting.len() + st.active.len()
}

pub(crate) async fn is_active(core: &Arc<QueueCore>) -> bool {
    core.state.lock().await.active_flag
}
