//! Task lifecycle state machine.
//!
//! A task's progress is a flat kind (`Ready`, in a phase via `Current`,
//! finished with a phase via `Done`, or `Failed`) plus one decoration: the
//! id of the dependency it is stalled on. The familiar names are spellings
//! of these:
//!
//! - running   = `Current(Executing)`
//! - succeeded = `Done(Executing)`
//! - paused    = `Done(Pausing)`
//! - cancelled = `Done(Cancelling)`
//! - waited    = `Done(Waiting)`
//!
//! `Done(Executing)`, `Done(Cancelling)` and `Failed(_)` are terminal; a
//! task leaves its queue in exactly one of them. Transition preconditions
//! are enforced with assertions: violating one is a bug in the caller, not
//! a runtime condition to handle.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ids::TaskId;

/// A lifecycle stage. `Ready` is not a phase: it is the state before any
/// phase has begun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Beginning,
    Preparing,
    Configuring,
    Executing,
    Pausing,
    Resuming,
    Cancelling,
    Waiting,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Beginning => "beginning",
            Phase::Preparing => "preparing",
            Phase::Configuring => "configuring",
            Phase::Executing => "executing",
            Phase::Pausing => "pausing",
            Phase::Resuming => "resuming",
            Phase::Cancelling => "cancelling",
            Phase::Waiting => "waiting",
        }
    }
}

/// Why a task failed: a phase hook said no, or a dependency never made it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    In(Phase),
    Dependency(TaskId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Kind {
    Ready,
    Current(Phase),
    Done(Phase),
    Failed(FailureReason),
}

/// The state of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    kind: Kind,
    /// Set while the task is stalled on a dependency; folded into the
    /// failure reason if the task fails while stalled.
    stalled_on: Option<TaskId>,
}

impl TaskState {
    pub fn ready() -> Self {
        Self {
            kind: Kind::Ready,
            stalled_on: None,
        }
    }

    // ---- queries ------------------------------------------------------

    pub fn is_ready(&self) -> bool {
        matches!(self.kind, Kind::Ready)
    }

    /// Has any phase begun? Everything except `Ready`.
    pub fn is_started(&self) -> bool {
        !self.is_ready()
    }

    pub fn is_executing(&self) -> bool {
        matches!(self.kind, Kind::Current(Phase::Executing))
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.kind, Kind::Done(Phase::Pausing))
    }

    /// Parked on dependencies that have not all signalled yet.
    pub fn is_waiting(&self) -> bool {
        matches!(self.kind, Kind::Current(Phase::Waiting))
    }

    /// Dependencies have all signalled; the task is first in line for the
    /// next pick.
    pub fn has_waited(&self) -> bool {
        matches!(self.kind, Kind::Done(Phase::Waiting))
    }

    pub fn was_cancelled(&self) -> bool {
        matches!(self.kind, Kind::Done(Phase::Cancelling))
    }

    pub fn did_fail(&self) -> bool {
        matches!(self.kind, Kind::Failed(_))
    }

    pub fn did_succeed(&self) -> bool {
        matches!(self.kind, Kind::Done(Phase::Executing))
    }

    /// Succeeded, failed, or cancelled: no further transitions.
    pub fn is_terminal(&self) -> bool {
        self.did_succeed() || self.did_fail() || self.was_cancelled()
    }

    pub fn failure(&self) -> Option<FailureReason> {
        match self.kind {
            Kind::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn stalled_on(&self) -> Option<TaskId> {
        self.stalled_on
    }

    /// The phase currently in progress, if any.
    pub fn current_phase(&self) -> Option<Phase> {
        match self.kind {
            Kind::Current(phase) => Some(phase),
            _ => None,
        }
    }

    // ---- transitions --------------------------------------------------

    /// Enter `phase`. `Beginning` is the first pick and additionally
    /// requires the task to be ready or waited.
    pub fn start_to(&mut self, phase: Phase) {
        assert!(
            !self.is_terminal(),
            "start_to({}) on terminal state {self}",
            phase.label()
        );
        if phase == Phase::Beginning {
            assert!(
                self.is_ready() || self.has_waited(),
                "start_to(beginning) requires a ready or waited task, got {self}"
            );
        }
        self.kind = Kind::Current(phase);
    }

    /// Close out the phase in progress: `Current(p)` becomes `Done(p)`.
    pub fn finish(&mut self) {
        let Kind::Current(phase) = self.kind else {
            panic!("finish() with no phase in progress: {self}");
        };
        self.kind = Kind::Done(phase);
        if self.is_terminal() {
            self.stalled_on = None;
        }
    }

    /// Fail the task. While stalled on a dependency the reason records that
    /// dependency; otherwise it records the phase that was underway.
    pub fn fail(&mut self) {
        assert!(!self.is_terminal(), "fail() on terminal state {self}");
        assert!(
            self.is_started() || self.stalled_on.is_some(),
            "fail() before any phase began"
        );
        let reason = match self.stalled_on.take() {
            Some(dep) => FailureReason::Dependency(dep),
            None => match self.kind {
                Kind::Current(phase) | Kind::Done(phase) => FailureReason::In(phase),
                Kind::Ready | Kind::Failed(_) => unreachable!(),
            },
        };
        self.kind = Kind::Failed(reason);
    }

    /// Ask-to-pause bookkeeping: only an executing task may be paused.
    pub fn pause(&mut self) {
        assert!(self.is_executing(), "pause() on {self}");
        self.kind = Kind::Current(Phase::Pausing);
    }

    /// Ask-to-cancel bookkeeping: only an executing task may be cancelled.
    pub fn cancel(&mut self) {
        assert!(self.is_executing(), "cancel() on {self}");
        self.kind = Kind::Current(Phase::Cancelling);
    }

    /// Record the execution outcome. Tolerates the pause/cancel races: the
    /// user's `execute` may return while the state says pausing or paused,
    /// and the result still stands, unless a hook already produced a
    /// terminal verdict, in which case the first verdict wins. `abandoned`
    /// forces the cancelled terminal regardless of the result.
    pub fn complete_execution(&mut self, success: bool, abandoned: bool) {
        if self.is_terminal() {
            return;
        }
        assert!(self.is_started(), "complete_execution() before any phase");
        self.stalled_on = None;
        self.kind = if abandoned {
            Kind::Done(Phase::Cancelling)
        } else if success {
            Kind::Done(Phase::Executing)
        } else {
            Kind::Failed(FailureReason::In(Phase::Executing))
        };
    }

    /// Decorate a non-terminal state with the dependency it is stalled on.
    pub fn set_dependency(&mut self, dep: TaskId) {
        assert!(
            !self.is_terminal(),
            "set_dependency({dep}) on terminal state {self}"
        );
        self.stalled_on = Some(dep);
    }

    pub fn clear_dependency(&mut self) {
        self.stalled_on = None;
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::ready()
    }
}

// Display feeds assertion messages and log fields, so it reads the way
// states are spoken about: "executing", "done(pausing)",
// "failed(dependency(task-...))".
impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Kind::Ready => write!(f, "ready")?,
            Kind::Current(Phase::Executing) => write!(f, "executing")?,
            Kind::Current(phase) => write!(f, "currently({})", phase.label())?,
            Kind::Done(phase) => write!(f, "done({})", phase.label())?,
            Kind::Failed(FailureReason::In(phase)) => write!(f, "failed({})", phase.label())?,
            Kind::Failed(FailureReason::Dependency(dep)) => {
                write!(f, "failed(dependency({dep}))")?
            }
        }
        if let Some(dep) = self.stalled_on {
            write!(f, " [stalled on {dep}]")?;
        }
        Ok(())
    }
}
