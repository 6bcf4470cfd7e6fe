//! Executor traits.
//!
//! [`Executor`] accepts opaque [`Task`]s. [`ExecutorService`] adds the
//! shutdown lifecycle. [`ExecutorExt`] is implemented for every executor
//! and layers result handles on top of `execute`.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use crate::context::Propagation;
use crate::error::Result;
use crate::runtime::task::{FutureTask, Task, TaskHandle};

/// Accepts units of work.
pub trait Executor: Send + Sync {
    /// Submits a task for execution.
    ///
    /// Fails with [`ErrorKind::Rejected`](crate::error::ErrorKind::Rejected)
    /// after shutdown. A rejected task is dropped, which resolves any handle
    /// attached to it as cancelled.
    fn execute(&self, task: Task) -> Result<()>;

    /// Diagnostic name.
    fn name(&self) -> &str {
        "executor"
    }

    /// Propagation mode applied to submitted work.
    fn propagation(&self) -> Propagation {
        Propagation::Disabled
    }

    /// Identity of the underlying executor, for executors whose handles
    /// share state. Clones of one handle report the same key. `None` means
    /// the value itself is the identity.
    fn instance_key(&self) -> Option<usize> {
        None
    }

    /// Returns true for executors that own deferred work on a delay queue.
    /// Such executors cannot be wrapped by another scheduler.
    fn is_scheduler(&self) -> bool {
        false
    }
}

/// An executor with a shutdown lifecycle.
pub trait ExecutorService: Executor {
    /// Stops accepting new work. Already accepted work still runs.
    fn shutdown(&self) -> Result<()>;

    /// Stops accepting new work and returns the queued tasks, each already
    /// cancelled. Running tasks are not interrupted.
    fn shutdown_now(&self) -> Result<Vec<Task>>;

    /// Returns true once shutdown was requested.
    fn is_shutdown(&self) -> bool;

    /// Returns true once shut down and all accepted work has finished.
    fn is_terminated(&self) -> bool;

    /// Waits up to `timeout` for termination. Returns `Ok(true)` if
    /// terminated.
    fn await_termination(&self, timeout: Duration) -> Result<bool>;
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, task: Task) -> Result<()> {
        (**self).execute(task)
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn propagation(&self) -> Propagation {
        (**self).propagation()
    }

    fn instance_key(&self) -> Option<usize> {
        (**self).instance_key()
    }

    fn is_scheduler(&self) -> bool {
        (**self).is_scheduler()
    }
}

impl<E: ExecutorService + ?Sized> ExecutorService for Arc<E> {
    fn shutdown(&self) -> Result<()> {
        (**self).shutdown()
    }

    fn shutdown_now(&self) -> Result<Vec<Task>> {
        (**self).shutdown_now()
    }

    fn is_shutdown(&self) -> bool {
        (**self).is_shutdown()
    }

    fn is_terminated(&self) -> bool {
        (**self).is_terminated()
    }

    fn await_termination(&self, timeout: Duration) -> Result<bool> {
        (**self).await_termination(timeout)
    }
}

/// Result-returning submission for any [`Executor`].
pub trait ExecutorExt: Executor {
    /// Submits a closure and returns a handle to its result.
    fn submit<T, F>(&self, f: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (future, handle) = FutureTask::new(f, self.propagation());
        self.execute(future.into_task())?;
        Ok(handle)
    }

    /// Like [`submit`](Self::submit) with a diagnostic label.
    fn submit_labeled<T, F>(&self, label: impl Into<Cow<'static, str>>, f: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (future, handle) = FutureTask::new(f, self.propagation());
        self.execute(future.with_label(label.into()).into_task())?;
        Ok(handle)
    }

    /// Executes a closure without a result handle.
    fn execute_fn<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute(Task::new(f))
    }
}

impl<E: Executor + ?Sized> ExecutorExt for E {}
