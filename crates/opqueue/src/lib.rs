//! Bounded-concurrency operation scheduler.
//!
//! Operations are admitted in strict FIFO order and run concurrently up
//! to a limit. The queue only tracks *that* an operation finished, never
//! *how*: a failed or panicked operation frees its slot like any other.
//! An idle signal fires once each time the queue drains completely.

mod operation;
mod queue;

pub use operation::{Operation, OperationFuture, QueuedOperation, ReferenceId};
pub use queue::{DEFAULT_CONCURRENCY, OperationQueue, QueueEvent, QueueSnapshot};
