//! Queue module: the core scheduler, the linked (federated) variant, and
//! the supporting order/entry/federation pieces.
//!
//! The waiting-list order, applied stably on every insert and priority
//! change:
//!
//! 1. Higher priority first.
//! 2. On equal priority, plain tasks before dependent tasks.
//! 3. Among dependents of equal priority, fewer incomplete dependencies
//!    first.
//! 4. Ties keep insertion order.
//!
//! One twist at pick time: a task whose dependencies have all signalled
//! (`done(waiting)`) is chosen before a merely ready task of equal rank.

mod entry;
mod federation;
mod linked;
mod runtime;
mod sort;
mod task_queue;

pub use federation::QueueFederation;
pub use linked::{DependencyOptions, LinkedTaskQueue};
pub use task_queue::TaskQueue;
