//! Task contracts and per-task metadata.
//!
//! `Task` is the one required contract; the rest are capabilities a task
//! may also implement. The runtime discovers capabilities once, when a
//! task enters a queue, through the `as_*` probes; there are no runtime
//! type queries at dispatch time.
//!
//! Every task embeds a [`TaskMeta`]: the library-owned identity, QoS hint,
//! priority, and state. The runtime mutates state exclusively through it,
//! and invokes at most one hook on a given task at a time, so the interior
//! mutexes only ever guard single field reads and writes.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bitflags::bitflags;

use super::ids::TaskId;
use super::priority::Priority;
use super::qos::QosClass;
use super::state::TaskState;

/// Library-owned metadata embedded in every task.
#[derive(Debug)]
pub struct TaskMeta {
    id: TaskId,
    qos: QosClass,
    priority: Mutex<Priority>,
    state: Mutex<TaskState>,
}

impl TaskMeta {
    pub fn new(qos: QosClass, priority: Priority) -> Self {
        Self {
            id: TaskId::random(),
            qos,
            priority: Mutex::new(priority),
            state: Mutex::new(TaskState::ready()),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn qos(&self) -> QosClass {
        self.qos
    }

    pub fn priority(&self) -> Priority {
        *self.priority.lock().expect("priority lock poisoned")
    }

    pub fn set_priority(&self, priority: Priority) {
        *self.priority.lock().expect("priority lock poisoned") = priority;
    }

    /// Bump to the next named band; returns whether the rank changed.
    pub fn increase_priority(&self) -> bool {
        self.priority
            .lock()
            .expect("priority lock poisoned")
            .increase()
    }

    /// Drop to the previous named band; returns whether the rank changed.
    pub fn decrease_priority(&self) -> bool {
        self.priority
            .lock()
            .expect("priority lock poisoned")
            .decrease()
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn set_state(&self, state: TaskState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    /// Run a transition (or several) atomically against the state field.
    pub fn update_state<R>(&self, f: impl FnOnce(&mut TaskState) -> R) -> R {
        f(&mut self.state.lock().expect("state lock poisoned"))
    }
}

impl Default for TaskMeta {
    fn default() -> Self {
        Self::new(QosClass::default(), Priority::default())
    }
}

/// A unit of user-supplied work.
///
/// `execute` returns `true` on success. `finish` is invoked exactly once
/// after the task reaches a terminal state (succeeded, failed, or
/// cancelled). The `as_*` probes advertise capabilities; override the ones
/// the task implements.
#[async_trait]
pub trait Task: Send + Sync {
    fn meta(&self) -> &TaskMeta;

    async fn execute(&self) -> bool;

    /// Post-terminal callback. Default: nothing.
    fn finish(&self) {}

    fn as_configurable(&self) -> Option<&dyn Configurable> {
        None
    }

    fn as_pausable(&self) -> Option<&dyn Pausable> {
        None
    }

    fn as_cancellable(&self) -> Option<&dyn Cancellable> {
        None
    }

    fn as_dependent(&self) -> Option<&dyn Dependent> {
        None
    }

    // ---- conveniences over the meta ----------------------------------

    fn id(&self) -> TaskId {
        self.meta().id()
    }

    fn qos(&self) -> QosClass {
        self.meta().qos()
    }

    fn priority(&self) -> Priority {
        self.meta().priority()
    }

    fn state(&self) -> TaskState {
        self.meta().state()
    }
}

/// One-time setup between prepare and execute.
#[async_trait]
pub trait Configurable: Task {
    async fn configure(&self) -> bool;
}

/// Cooperative pause/resume, invoked only while the task is executing /
/// paused respectively.
#[async_trait]
pub trait Pausable: Task {
    async fn pause(&self) -> bool;
    async fn resume(&self) -> bool;
}

/// Cooperative cancellation, invoked only while the task is executing.
#[async_trait]
pub trait Cancellable: Task {
    async fn cancel(&self) -> bool;
}

/// A task that must not execute before other tasks have succeeded.
pub trait Dependent: Task {
    /// The dependencies, in the order they should be considered.
    fn dependencies(&self) -> Vec<Arc<dyn Task>>;

    /// Called once per dependency, in dependency completion order.
    fn dependency_finished(&self, _dep: &dyn Task) {}

    /// Dependencies not yet succeeded.
    fn incomplete_dependencies(&self) -> Vec<Arc<dyn Task>> {
        self.dependencies()
            .into_iter()
            .filter(|dep| !dep.state().did_succeed())
            .collect()
    }

    /// The first incomplete dependency that has not failed or been
    /// cancelled: the next one worth waiting for.
    fn up_next(&self) -> Option<Arc<dyn Task>> {
        self.dependencies().into_iter().find(|dep| {
            let state = dep.state();
            !state.did_succeed() && !state.did_fail() && !state.was_cancelled()
        })
    }
}

bitflags! {
    /// Capability record computed once when a task enters a queue.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u8 {
        const CONFIGURABLE = 1 << 0;
        const PAUSABLE     = 1 << 1;
        const CANCELLABLE  = 1 << 2;
        const DEPENDENT    = 1 << 3;
    }
}

impl Capabilities {
    /// Probe a task's `as_*` hooks once.
    pub fn probe(task: &dyn Task) -> Self {
        let mut caps = Capabilities::empty();
        if task.as_configurable().is_some() {
            caps |= Capabilities::CONFIGURABLE;
        }
        if task.as_pausable().is_some() {
            caps |= Capabilities::PAUSABLE;
        }
        if task.as_cancellable().is_some() {
            caps |= Capabilities::CANCELLABLE;
        }
        if task.as_dependent().is_some() {
            caps |= Capabilities::DEPENDENT;
        }
        caps
    }
}
