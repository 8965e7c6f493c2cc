use std::fmt;

use serde::{Deserialize, Serialize};

/// Snapshot of how many tracked tasks sit in each bucket of one queue.
///
/// Taken under the queue's state lock, so the numbers are mutually
/// consistent (they may of course be stale by the time they are read).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub running: usize,
    pub paused: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueCounts {
    /// Tasks the queue still owes work to.
    pub fn remaining(&self) -> usize {
        self.waiting + self.running + self.paused
    }

    pub fn is_done(&self) -> bool {
        self.remaining() == 0
    }
}

impl fmt::Display for QueueCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "waiting={} running={} paused={} succeeded={} failed={} cancelled={}",
            self.waiting, self.running, self.paused, self.succeeded, self.failed, self.cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_counts_the_unfinished() {
        let counts = QueueCounts {
            waiting: 2,
            running: 1,
            paused: 1,
            succeeded: 5,
            failed: 1,
            cancelled: 0,
        };
        assert_eq!(counts.remaining(), 4);
        assert!(!counts.is_done());
    }

    #[test]
    fn display_is_a_log_line() {
        let line = QueueCounts::default().to_string();
        assert!(line.contains("waiting=0"));
        assert!(line.contains("cancelled=0"));
    }
}
