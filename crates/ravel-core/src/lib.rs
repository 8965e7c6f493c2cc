//! ravel-core
//!
//! A priority task-queue runtime: user-defined tasks are ordered by rank,
//! gated by a concurrency cap, driven through a begin/prepare/configure/
//! execute lifecycle, and may declare dependencies on tasks owned by the
//! same queue or by linked peer queues.
//!
//! Module map:
//! - domain: ids, priority bands, QoS hints, the task state machine, and
//!   the task contracts (`Task` plus optional capabilities)
//! - completion: the one-shot rendezvous signalled when a task terminates
//! - pool: the worker-pool seam the queues dispatch onto
//! - queue: the core scheduler, the linked (federated) variant, and the
//!   peer-set bookkeeping
//! - observability: per-queue state-count snapshots
//! - error: crate-level error types

pub mod completion;
pub mod domain;
pub mod error;
pub mod observability;
pub mod pool;
pub mod queue;
