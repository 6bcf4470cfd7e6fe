//! Appexec: bounded task executors and a shared delay queue for thread-pool
//! based applications.
//!
//! # Overview
//!
//! Applications run many small, independent subsystems that each want "a few
//! threads" of background work. Appexec gives each subsystem its own
//! lightweight executor while one elastic pool supplies the threads:
//!
//! - A [`BoundedTaskExecutor`] admits at most `N` tasks at a time onto any
//!   backend executor and queues the rest in FIFO order. A limit of one makes
//!   it a sequential executor.
//! - A single [`DelayQueue`] with one Dispatch Thread serves every
//!   [`SchedulingWrapper`], so delayed and fixed-delay periodic work costs no
//!   threads of its own.
//! - [`ExecutionContext`] values and cancellation tokens can follow work
//!   across thread hops.
//! - [`KeyedLockSet`] gives per-key mutual exclusion.
//!
//! # Core Guarantees
//!
//! - **Bounded concurrency**: a bounded executor never has more than its
//!   limit of tasks running or handed to its backend
//! - **No lost work**: an admitted task either runs or is cancelled; it is
//!   never dropped silently
//! - **No silent rejection**: work submitted after shutdown fails loudly
//! - **Ordered dispatch**: delayed items dispatch by deadline, then by
//!   creation order
//!
//! # Module Structure
//!
//! - [`types`]: Time, identifiers, and cancellation reasons
//! - [`error`]: Error types
//! - [`context`]: Execution context and cancellation tokens
//! - [`runtime`]: Executors, delay queue, scheduling, configuration
//! - [`sync`]: Count-down latch and per-key locks

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_inception)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod context;
pub mod error;
pub mod runtime;
pub mod sync;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-exports for convenient access to core types
pub use context::{CancelToken, ExecutionContext, Propagation};
pub use error::{Cancelled, Error, ErrorCategory, ErrorKind, Result, TaskError};
pub use runtime::{
    AppConfig, AppExecutors, BackendPool, BackendPoolHandle, BoundedTaskExecutor, DelayQueue,
    Executor, ExecutorConfig, ExecutorExt, ExecutorService, PoolConfig, ScheduledHandle,
    SchedulingOptions, SchedulingWrapper, Task, TaskHandle, TaskState,
};
pub use sync::{CountDownLatch, KeyedLockSet};
pub use types::{CancelKind, CancelReason, ExecutorId, Sequence, Time};
