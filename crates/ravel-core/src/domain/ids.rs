//! Strongly-typed identifiers.
//!
//! Ids are ULIDs behind a phantom-typed wrapper, so a `TaskId` can never be
//! passed where a `QueueId` is expected. A ULID is 128 bits and minted once
//! at construction; tasks and queues compare equal iff their ids do.

use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Marker trait for id kinds. Supplies the `Display` prefix.
pub trait IdKind: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic id. `K` is phantom: zero bytes at runtime, a distinct type at
/// compile time.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<K: IdKind> {
    ulid: Ulid,
    #[serde(skip)]
    _kind: PhantomData<K>,
}

impl<K: IdKind> Id<K> {
    /// Mint a fresh random id.
    pub fn random() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _kind: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<K: IdKind> From<Ulid> for Id<K> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<K: IdKind> fmt::Display for Id<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", K::prefix(), self.ulid)
    }
}

/// Marker for task ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskTag {}

impl IdKind for TaskTag {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Marker for queue ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueTag {}

impl IdKind for QueueTag {
    fn prefix() -> &'static str {
        "queue-"
    }
}

/// Identifier of a task: the stable opaque identity it keeps for life.
pub type TaskId = Id<TaskTag>;

/// Identifier of a queue; federation membership is tracked by this.
pub type QueueId = Id<QueueTag>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_kind_prefix() {
        let task = TaskId::random();
        let queue = QueueId::random();

        assert!(task.to_string().starts_with("task-"));
        assert!(queue.to_string().starts_with("queue-"));
    }

    #[test]
    fn random_ids_are_distinct() {
        let a = TaskId::random();
        let b = TaskId::random();
        assert_ne!(a, b);
    }

    #[test]
    fn ids_round_trip_through_serde() {
        let id = TaskId::random();
        let json = serde_json::to_string(&id).unwrap();
        let back: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn id_is_exactly_a_ulid_in_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<TaskId>(), size_of::<Ulid>());
        assert_eq!(size_of::<Ulid>(), 16);
    }
}
