use thiserror::Error;

use crate::domain::TaskId;

/// Crate-level errors.
///
/// User-task failures are never `Err` values; they are recorded on the
/// task's state and surfaced through the queue views. What remains here is
/// the timed-wait verdict and the one unrecoverable condition, kept as an
/// error type so the fatal report is formatted in one place.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue {queue}: wait timed out before all tracked tasks completed")]
    WaitTimeout { queue: String },

    /// A dependent can never make progress when its dependency is nowhere
    /// in the federation; the runtime reports this and aborts.
    #[error("task {task} depends on {dependency}, which is not in the queue or any linked peer")]
    DependencyNotFound { task: TaskId, dependency: TaskId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_actors() {
        let err = QueueError::WaitTimeout {
            queue: "uploads".into(),
        };
        assert!(err.to_string().contains("uploads"));

        let task = TaskId::random();
        let dependency = TaskId::random();
        let err = QueueError::DependencyNotFound { task, dependency };
        let msg = err.to_string();
        assert!(msg.contains(&task.to_string()));
        assert!(msg.contains(&dependency.to_string()));
    }
}
