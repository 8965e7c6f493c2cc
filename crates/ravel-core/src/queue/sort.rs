//! Waiting-list order and the pick rule.
//!
//! The waiting list is kept sorted by a strict comparator, applied stably:
//! higher priority first; on equal priority plain tasks before dependent
//! ones; among dependents, fewer incomplete dependencies first; ties keep
//! insertion order. The pick rule walks that order with one twist: a task
//! whose dependencies have all signalled (`done(waiting)`) beats a merely
//! ready task of equal rank.

use std::cmp::Reverse;
use std::collections::HashMap;

use crate::domain::{Priority, TaskId};

use super::entry::TaskEntry;

/// Re-apply the waiting-list order. Called under the queue's state lock
/// every time the list or a relevant priority changes.
pub(crate) fn sort_waiting(waiting: &mut Vec<TaskId>, entries: &HashMap<TaskId, TaskEntry>) {
    waiting.sort_by_cached_key(|id| {
        let entry = entries.get(id).expect("waiting id has an entry");
        let incomplete = entry
            .task
            .as_dependent()
            .map(|dep| dep.incomplete_dependencies().len())
            .unwrap_or(0);
        (
            Reverse(entry.task.priority()),
            entry.is_dependent(),
            incomplete,
            entry.seq,
        )
    });
}

/// The next task the loop should dispatch, if any.
///
/// Eligible means `ready` or `done(waiting)`. The list is already sorted,
/// so the first eligible entry wins, unless a waited entry of the same
/// priority sits further along, in which case that one does.
pub(crate) fn pick_next(
    waiting: &[TaskId],
    entries: &HashMap<TaskId, TaskEntry>,
) -> Option<TaskId> {
    let mut first_ready: Option<(TaskId, Priority)> = None;
    for id in waiting {
        let entry = entries.get(id).expect("waiting id has an entry");
        let state = entry.task.state();
        if state.has_waited() {
            match first_ready {
                // A waited task at the same rank outranks the ready pick.
                Some((_, pri)) if entry.task.priority() == pri => return Some(*id),
                Some(_) => break,
                None => return Some(*id),
            }
        }
        if !state.is_ready() {
            continue;
        }
        match first_ready {
            None => first_ready = Some((*id, entry.task.priority())),
            // Sorted descending: once the rank drops there is no tie left.
            Some((_, pri)) if entry.task.priority() < pri => break,
            Some(_) => {}
        }
    }
    first_ready.map(|(id, _)| id)
}
