//! Bounded task executor.
//!
//! [`BoundedTaskExecutor`] runs tasks on a shared backend while limiting how
//! many of them run at once. Submissions never block: work beyond the limit
//! waits in an unbounded FIFO queue and is picked up by whichever worker
//! frees a slot next.
//!
//! # Packed status
//!
//! Admission state lives in one `AtomicU64`:
//!
//! ```text
//!  63                32 31                 0
//! ┌────────────────────┬────────────────────┐
//! │   stamp (wraps)    │    in progress     │
//! └────────────────────┴────────────────────┘
//! ```
//!
//! Every admission adds `(1 << 32) | 1` in a single `fetch_add`, so the value
//! changes on every update even when the in-progress count returns to an
//! earlier number. Releases are a CAS of the exact observed value down by
//! one, which therefore fails whenever anything was admitted in between.
//!
//! # Hand-off
//!
//! A submitter whose admission overshoots the limit enqueues its task and
//! then runs [`poll_or_give_up`](BoundedInner::poll_or_give_up): either it
//! finds the budget free and a task in the queue (and keeps the slot to run
//! it), or it manages to CAS its reservation away. A worker finishing a task
//! runs the same loop, so a queued task is always claimed by someone.

use core::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;

use crate::context::Propagation;
use crate::error::{Error, ErrorKind, Result};
use crate::runtime::config::ExecutorConfig;
use crate::runtime::executor::{Executor, ExecutorService};
use crate::runtime::task::Task;
use crate::sync::CountDownLatch;
use crate::types::CancelReason;

const IN_PROGRESS_MASK: u64 = 0xFFFF_FFFF;
const ADMIT: u64 = (1 << 32) | 1;

#[inline]
const fn in_progress(status: u64) -> u64 {
    status & IN_PROGRESS_MASK
}

struct BoundedInner {
    name: String,
    max_concurrency: u64,
    status: AtomicU64,
    queue: SegQueue<Task>,
    shutdown: AtomicBool,
    backend: Box<dyn Executor>,
    propagation: Propagation,
}

impl BoundedInner {
    fn execute(self: &Arc<Self>, task: Task) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) && !task.is_marker() {
            tracing::warn!(executor = %self.name, task = %task.label(), "rejected task after shutdown");
            return Err(Error::rejected(&self.name));
        }
        let task = self.propagation.wrap(task);

        let status = self.status.fetch_add(ADMIT, Ordering::AcqRel).wrapping_add(ADMIT);
        if in_progress(status) <= self.max_concurrency {
            return self.hand_off(task);
        }

        tracing::trace!(executor = %self.name, task = %task.label(), "queued task over limit");
        self.queue.push(task);
        match self.poll_or_give_up(status) {
            Some(claimed) => self.hand_off(claimed).map_err(|e| {
                // The worker and whatever it could claim were cancelled. Our
                // own task may have been among them, so report the failure
                // only after nothing of ours is left queued.
                let stranded = self.drain_cancelled();
                tracing::warn!(
                    executor = %self.name,
                    cancelled = stranded.len(),
                    "cancelled queued tasks after backend rejection"
                );
                e
            }),
            None => Ok(()),
        }
    }

    /// Claims a queued task if the budget allows, otherwise releases one
    /// reservation. `status` is the caller's latest observation.
    fn poll_or_give_up(&self, mut status: u64) -> Option<Task> {
        loop {
            if in_progress(status) <= self.max_concurrency {
                if let Some(next) = self.queue.pop() {
                    return Some(next);
                }
            }
            match self.status.compare_exchange(
                status,
                status.wrapping_sub(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return None,
                Err(actual) => status = actual,
            }
        }
    }

    /// Submits a worker that runs `first` and then drains the queue.
    fn hand_off(self: &Arc<Self>, first: Task) -> Result<()> {
        tracing::trace!(executor = %self.name, task = %first.label(), "handing task to backend");
        let label = first.label.clone();
        let hook = first.cancel_hook.clone();
        let mut worker = Task::new({
            let mut chain = Chain {
                inner: Arc::clone(self),
                first: Some(first),
            };
            move || chain.run()
        });
        worker.label = label;
        worker.cancel_hook = hook;

        self.backend.execute(worker).map_err(|e| {
            tracing::error!(executor = %self.name, error = %e, "backend rejected admitted task");
            e
        })
    }

    fn drain_cancelled(&self) -> Vec<Task> {
        let reason = CancelReason::shutdown();
        let mut drained = Vec::new();
        while let Some(task) = self.queue.pop() {
            task.cancel(&reason);
            drained.push(task);
        }
        drained
    }

    fn tasks_in_progress(&self) -> usize {
        in_progress(self.status.load(Ordering::Acquire)) as usize
    }

    fn is_terminated(&self) -> bool {
        self.shutdown.load(Ordering::Acquire) && self.tasks_in_progress() == 0 && self.queue.is_empty()
    }
}

/// The backend-side worker: one admitted slot, run serially.
struct Chain {
    inner: Arc<BoundedInner>,
    first: Option<Task>,
}

impl Chain {
    fn run(&mut self) {
        let mut next = self.first.take();
        while let Some(mut task) = next {
            tracing::trace!(executor = %self.inner.name, task = %task.label(), "running task");
            let released = task.slot_released.take();
            let _ = task.run_catching();
            next = self.inner.poll_or_give_up(self.inner.status.load(Ordering::Acquire));
            if let Some(latch) = released {
                latch.count_down();
            }
        }
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        // The backend discarded the worker without running it. Nothing else
        // will claim work for this slot, so cancel until it is given up.
        let Some(first) = self.first.take() else {
            return;
        };
        let reason = CancelReason::shutdown();
        let mut next = Some(first);
        while let Some(mut task) = next {
            tracing::debug!(executor = %self.inner.name, task = %task.label(), "cancelling task after worker was dropped");
            let released = task.slot_released.take();
            task.cancel(&reason);
            drop(task);
            next = self.inner.poll_or_give_up(self.inner.status.load(Ordering::Acquire));
            if let Some(latch) = released {
                latch.count_down();
            }
        }
    }
}

/// Executor that runs at most `max_concurrency` tasks at a time on a shared
/// backend.
pub struct BoundedTaskExecutor {
    inner: Arc<BoundedInner>,
}

impl BoundedTaskExecutor {
    /// Creates an executor with propagation disabled.
    pub fn new(
        name: impl Into<String>,
        backend: impl Executor + 'static,
        max_concurrency: usize,
    ) -> Result<Self> {
        Self::with_config(ExecutorConfig::new(name, max_concurrency), backend)
    }

    /// Creates an executor from a validated config.
    pub fn with_config(config: ExecutorConfig, backend: impl Executor + 'static) -> Result<Self> {
        config.validate()?;
        tracing::debug!(
            executor = %config.name,
            max_concurrency = config.max_concurrency,
            propagation = ?config.propagation,
            "bounded executor created"
        );
        Ok(Self {
            inner: Arc::new(BoundedInner {
                name: config.name,
                max_concurrency: config.max_concurrency as u64,
                status: AtomicU64::new(0),
                queue: SegQueue::new(),
                shutdown: AtomicBool::new(false),
                backend: Box::new(backend),
                propagation: config.propagation,
            }),
        })
    }

    /// An executor that runs one task at a time, in submission order.
    pub fn sequential(name: impl Into<String>, backend: impl Executor + 'static) -> Self {
        let name = name.into();
        tracing::debug!(executor = %name, "sequential executor created");
        Self {
            inner: Arc::new(BoundedInner {
                name,
                max_concurrency: 1,
                status: AtomicU64::new(0),
                queue: SegQueue::new(),
                shutdown: AtomicBool::new(false),
                backend: Box::new(backend),
                propagation: Propagation::Disabled,
            }),
        }
    }

    /// The concurrency limit.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency as usize
    }

    /// Tasks admitted and not yet finished, including ones about to run.
    #[must_use]
    pub fn tasks_in_progress(&self) -> usize {
        self.inner.tasks_in_progress()
    }

    /// Tasks waiting for a slot.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Returns true if nothing is queued or running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty() && self.tasks_in_progress() == 0
    }

    /// Drains and cancels the queue without shutting down.
    ///
    /// Running tasks are not affected.
    pub fn clear_and_cancel_all(&self) -> Vec<Task> {
        let drained = self.inner.drain_cancelled();
        tracing::debug!(executor = %self.inner.name, cancelled = drained.len(), "cleared queue");
        drained
    }

    /// Blocks until every task submitted before this call has finished.
    ///
    /// Submits `max_concurrency` marker tasks that each hold a slot until all
    /// of them have started, which can only happen once every earlier task
    /// has left its slot. Returns once every marker has given its slot up
    /// again. Markers are accepted after shutdown. The backend must be able
    /// to run `max_concurrency` tasks at once.
    pub fn wait_all_tasks_executed(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let markers = self.max_concurrency();
        let started = Arc::new(CountDownLatch::new(markers));
        let release = Arc::new(CountDownLatch::new(1));
        let freed = Arc::new(CountDownLatch::new(markers));

        for _ in 0..markers {
            let marker_started = Arc::clone(&started);
            let marker_release = Arc::clone(&release);
            let submitted = self.inner.execute(Task::marker(
                move || {
                    marker_started.count_down();
                    marker_release.wait();
                },
                Arc::clone(&freed),
            ));
            if let Err(e) = submitted {
                release.count_down();
                return Err(e);
            }
        }

        let all_started = started.wait_until(deadline);
        release.count_down();
        if !all_started || !freed.wait_until(deadline) {
            tracing::warn!(executor = %self.inner.name, ?timeout, "timed out waiting for tasks to drain");
            return Err(Error::new(ErrorKind::Timeout).with_message(format!(
                "{}: tasks still running after {timeout:?}",
                self.inner.name
            )));
        }
        Ok(())
    }
}

impl Executor for BoundedTaskExecutor {
    fn execute(&self, task: Task) -> Result<()> {
        self.inner.execute(task)
    }

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn propagation(&self) -> Propagation {
        self.inner.propagation
    }

    fn instance_key(&self) -> Option<usize> {
        Some(Arc::as_ptr(&self.inner) as usize)
    }
}

impl ExecutorService for BoundedTaskExecutor {
    fn shutdown(&self) -> Result<()> {
        if !self.inner.shutdown.swap(true, Ordering::AcqRel) {
            tracing::debug!(executor = %self.inner.name, "bounded executor shutdown");
        }
        Ok(())
    }

    fn shutdown_now(&self) -> Result<Vec<Task>> {
        self.shutdown()?;
        Ok(self.inner.drain_cancelled())
    }

    fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    fn is_terminated(&self) -> bool {
        self.inner.is_terminated()
    }

    fn await_termination(&self, timeout: Duration) -> Result<bool> {
        if !self.is_shutdown() {
            return Err(Error::new(ErrorKind::InvalidState).with_message(format!(
                "{} must be shut down before awaiting termination",
                self.inner.name
            )));
        }
        let deadline = Instant::now() + timeout;
        match self.wait_all_tasks_executed(timeout) {
            Ok(()) => {}
            Err(e) if e.is_timeout() => return Ok(false),
            Err(e) => return Err(e),
        }
        // A racing submission may still be unwinding its rejected admission.
        while !self.inner.is_terminated() {
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::yield_now();
        }
        tracing::debug!(executor = %self.inner.name, "bounded executor terminated");
        Ok(true)
    }
}

impl fmt::Display for BoundedTaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (max {}): {} in progress, {} queued",
            self.inner.name,
            self.inner.max_concurrency,
            self.tasks_in_progress(),
            self.queue_len()
        )?;
        if self.is_shutdown() {
            write!(f, ", shut down")?;
        }
        Ok(())
    }
}

impl fmt::Debug for BoundedTaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedTaskExecutor")
            .field("name", &self.inner.name)
            .field("max_concurrency", &self.inner.max_concurrency)
            .field("tasks_in_progress", &self.tasks_in_progress())
            .field("queue_len", &self.queue_len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
