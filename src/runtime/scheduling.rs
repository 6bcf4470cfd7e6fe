//! Scheduling wrapper: delayed and fixed-delay work on top of any backend.
//!
//! A [`SchedulingWrapper`] keeps no threads of its own. Delayed tasks wait in
//! the shared [`DelayQueue`] and are handed to the wrapped backend when due.
//! Immediate work submitted through [`Executor::execute`] goes straight to the
//! backend.
//!
//! # Shutdown
//!
//! `shutdown` sweeps the wrapper's own items out of the queue, cancels them,
//! and enqueues a sentinel behind everything already due. When the Dispatch
//! Thread reaches the sentinel the wrapper releases its backend (shutting it
//! down if owned) and becomes terminated once no owned item remains queued
//! and every task it handed to the backend has finished.
//!
//! ```text
//! Running --shutdown--> ShuttingDown --sentinel--> Terminated
//! ```
//!
//! Fixed-rate scheduling is rejected with
//! [`ErrorKind::Unsupported`](crate::error::ErrorKind::Unsupported): after a
//! suspension it would fire a burst of catch-up runs.

use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::context::Propagation;
use crate::error::{Error, ErrorKind, Result};
use crate::runtime::config::DEFAULT_MAX_SCHEDULE_DELAY;
use crate::runtime::deferred::{
    Deferred, DeferredHook, FixedDelay, OneShot, Period, ScheduledHandle, WrapperSentinel,
};
use crate::runtime::delay_queue::DelayQueue;
use crate::runtime::executor::{Executor, ExecutorService};
use crate::runtime::task::{FutureTask, Task};
use crate::sync::CountDownLatch;
use crate::types::{CancelReason, ExecutorId, Time};

/// Construction options for a [`SchedulingWrapper`].
#[derive(Debug, Clone)]
pub struct SchedulingOptions {
    /// Shut the backend down when the wrapper terminates.
    pub owns_backend: bool,
    /// Reject `shutdown` and `shutdown_now` from callers; only the owner of
    /// the process-wide executors may stop a managed wrapper.
    pub managed: bool,
    /// Context propagation for scheduled and submitted work.
    pub propagation: Propagation,
    /// Largest accepted delay.
    pub max_delay: Duration,
}

impl Default for SchedulingOptions {
    fn default() -> Self {
        Self {
            owns_backend: false,
            managed: false,
            propagation: Propagation::Disabled,
            max_delay: DEFAULT_MAX_SCHEDULE_DELAY,
        }
    }
}

impl SchedulingOptions {
    /// Options for a wrapper that owns its backend.
    #[must_use]
    pub fn owning() -> Self {
        Self {
            owns_backend: true,
            ..Self::default()
        }
    }

    /// Sets the propagation mode.
    #[must_use]
    pub fn with_propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }

    /// Sets the largest accepted delay.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }
}

/// Lifecycle of a [`SchedulingWrapper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WrapperState {
    /// Accepting work.
    Running,
    /// Shutdown requested; the sentinel has not been dispatched yet.
    ShuttingDown,
    /// Sentinel dispatched and no owned item queued.
    Terminated,
}

/// Backend tasks handed off by a wrapper that have not finished yet.
#[derive(Default)]
pub(crate) struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        *self.count.lock() += 1;
        InFlightGuard(Arc::clone(self))
    }

    fn is_idle(&self) -> bool {
        *self.count.lock() == 0
    }

    fn wait_idle_until(&self, deadline: Instant) -> bool {
        let mut count = self.count.lock();
        while *count > 0 {
            if self.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

/// Released when the carrying task has run or been dropped unrun.
struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count -= 1;
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

/// State shared between a wrapper and its deferred items.
pub(crate) struct WrapperCore {
    pub(crate) id: ExecutorId,
    pub(crate) name: String,
    pub(crate) backend: Arc<dyn ExecutorService>,
    pub(crate) queue: DelayQueue,
    backend_key: usize,
    options: SchedulingOptions,
    shutting_down: AtomicBool,
    sentinel_done: CountDownLatch,
    in_flight: Arc<InFlight>,
}

impl WrapperCore {
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Submits `task` to the backend, counting it until it finishes.
    pub(crate) fn hand_off(&self, task: Task) -> Result<()> {
        let guard = self.in_flight.enter();
        self.backend.execute(task.holding(guard))
    }

    /// Stops accepting work and sweeps owned items from the queue.
    ///
    /// Returns the swept items, already cancelled. Only the first call
    /// sweeps; later calls return nothing.
    fn begin_shutdown(self: &Arc<Self>) -> Vec<Arc<dyn Deferred>> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        let swept = self.queue.remove_owned(self.id);
        let reason = CancelReason::shutdown();
        for item in &swept {
            item.cancel(&reason);
        }
        tracing::debug!(executor = %self.name, cancelled = swept.len(), "scheduler shutting down");

        let sentinel: Arc<dyn Deferred> = Arc::new(WrapperSentinel::new(Arc::clone(self)));
        if let Err(e) = self.queue.offer(Arc::clone(&sentinel)) {
            tracing::debug!(executor = %self.name, error = %e, "delay queue stopped; finishing shutdown inline");
            sentinel.cancel(&reason);
        }
        swept
    }

    /// Runs when the sentinel is dispatched.
    pub(crate) fn finish_shutdown(&self) {
        if self.options.owns_backend {
            if let Err(e) = self.backend.shutdown() {
                tracing::warn!(executor = %self.name, error = %e, "failed to shut down owned backend");
            }
        }
        self.queue.unregister_backend(self.backend_key);
        self.sentinel_done.count_down();
        tracing::debug!(executor = %self.name, "scheduler sentinel dispatched");
    }

    fn is_terminated(&self) -> bool {
        self.sentinel_done.count() == 0
            && !self.queue.has_owned(self.id)
            && self.in_flight.is_idle()
            && (!self.options.owns_backend || self.backend.is_terminated())
    }
}

/// Adds delayed and fixed-delay scheduling to an [`ExecutorService`].
pub struct SchedulingWrapper {
    core: Arc<WrapperCore>,
}

impl SchedulingWrapper {
    /// Wraps `backend`, registering it with `queue`.
    ///
    /// Fails with [`ErrorKind::AlreadyScheduled`] if the backend is itself a
    /// scheduler or is already wrapped on this queue.
    pub fn new(
        name: impl Into<String>,
        backend: impl ExecutorService + 'static,
        queue: &DelayQueue,
        options: SchedulingOptions,
    ) -> Result<Self> {
        let name = name.into();
        if backend.is_scheduler() {
            return Err(Error::new(ErrorKind::AlreadyScheduled)
                .with_message(format!("{} is already a scheduler", backend.name())));
        }
        if options.max_delay.is_zero() {
            return Err(Error::invalid_config("max_delay must be positive"));
        }
        let backend: Arc<dyn ExecutorService> = Arc::new(backend);
        let backend_key = backend
            .instance_key()
            .unwrap_or_else(|| Arc::as_ptr(&backend).cast::<()>() as usize);
        queue.register_backend(backend_key, backend.name())?;

        let core = Arc::new(WrapperCore {
            id: ExecutorId::next(),
            name,
            backend,
            queue: queue.detached(),
            backend_key,
            options,
            shutting_down: AtomicBool::new(false),
            sentinel_done: CountDownLatch::new(1),
            in_flight: Arc::default(),
        });
        tracing::debug!(
            executor = %core.name,
            id = %core.id,
            backend = %core.backend.name(),
            owns_backend = core.options.owns_backend,
            "scheduler created"
        );
        Ok(Self { core })
    }

    /// Identity used to tag this wrapper's items in queue dumps.
    #[must_use]
    pub fn id(&self) -> ExecutorId {
        self.core.id
    }

    /// Runs `f` once after `delay`.
    ///
    /// Fails with [`ErrorKind::Rejected`] after shutdown and with
    /// [`ErrorKind::DelayOutOfRange`] if `delay` exceeds the configured
    /// maximum.
    pub fn schedule<T, F>(&self, f: F, delay: Duration) -> Result<ScheduledHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.check_accepting()?;
        self.check_delay(delay)?;

        let (future, handle) = FutureTask::new(f, self.core.options.propagation);
        let future = future.with_label(format!("scheduled task of {}", self.core.name).into());
        let deadline = Time::now() + delay;
        let item: Arc<dyn Deferred> = Arc::new(OneShot::new(Arc::clone(&self.core), deadline, future));
        self.enqueue(&item)?;
        tracing::trace!(executor = %self.core.name, sequence = %item.sequence(), ?delay, "scheduled one-shot");
        Ok(ScheduledHandle::new(handle, item, self.core.queue.clone(), Period::OneShot))
    }

    /// Runs `f` after `initial_delay`, then again `delay` after each
    /// completion until cancelled, failed, or shut down.
    ///
    /// Runs never overlap. A panicking run stops repetition and fails the
    /// handle.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        f: F,
        initial_delay: Duration,
        delay: Duration,
    ) -> Result<ScheduledHandle<()>>
    where
        F: FnMut() + Send + 'static,
    {
        self.check_accepting()?;
        self.check_delay(initial_delay)?;
        self.check_delay(delay)?;
        if delay.is_zero() {
            return Err(Error::new(ErrorKind::DelayOutOfRange).with_message("fixed delay must be positive"));
        }

        let first = Time::now() + initial_delay;
        let periodic = Arc::new(FixedDelay::new(
            Arc::clone(&self.core),
            first,
            delay,
            f,
            self.core.options.propagation,
        ));
        let handle = periodic.handle();
        let item: Arc<dyn Deferred> = periodic;
        self.enqueue(&item)?;
        tracing::trace!(
            executor = %self.core.name,
            sequence = %item.sequence(),
            ?initial_delay,
            ?delay,
            "scheduled fixed-delay task"
        );
        Ok(ScheduledHandle::new(handle, item, self.core.queue.clone(), Period::FixedDelay(delay)))
    }

    /// Always fails with [`ErrorKind::Unsupported`]; use
    /// [`schedule_with_fixed_delay`](Self::schedule_with_fixed_delay).
    pub fn schedule_at_fixed_rate<F>(
        &self,
        _f: F,
        _initial_delay: Duration,
        _period: Duration,
    ) -> Result<ScheduledHandle<()>>
    where
        F: FnMut() + Send + 'static,
    {
        Err(Error::fixed_rate_unsupported())
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WrapperState {
        if self.core.is_terminated() {
            WrapperState::Terminated
        } else if self.core.is_shutting_down() {
            WrapperState::ShuttingDown
        } else {
            WrapperState::Running
        }
    }

    /// Number of this wrapper's items waiting in the delay queue.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.core.queue.owned_count(self.core.id)
    }

    /// The wrapped backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn ExecutorService> {
        &self.core.backend
    }

    /// Returns true if callers cannot shut this wrapper down.
    #[must_use]
    pub fn is_managed(&self) -> bool {
        self.core.options.managed
    }

    /// Owner-side shutdown that bypasses the managed check.
    pub(crate) fn shutdown_managed(&self) -> Vec<Arc<dyn Deferred>> {
        self.core.begin_shutdown()
    }

    fn check_accepting(&self) -> Result<()> {
        if self.core.is_shutting_down() {
            tracing::warn!(executor = %self.core.name, "rejecting work after shutdown");
            return Err(Error::rejected(&self.core.name));
        }
        Ok(())
    }

    fn check_delay(&self, delay: Duration) -> Result<()> {
        if delay > self.core.options.max_delay {
            return Err(Error::new(ErrorKind::DelayOutOfRange).with_message(format!(
                "delay {delay:?} exceeds the maximum of {:?}",
                self.core.options.max_delay
            )));
        }
        Ok(())
    }

    fn enqueue(&self, item: &Arc<dyn Deferred>) -> Result<()> {
        if let Err(e) = self.core.queue.offer(Arc::clone(item)) {
            item.cancel(&CancelReason::shutdown());
            return Err(e);
        }
        // A concurrent shutdown may have swept the queue before this offer.
        if self.core.is_shutting_down() {
            self.core.queue.remove(&**item);
            item.cancel(&CancelReason::shutdown());
            return Err(Error::rejected(&self.core.name));
        }
        Ok(())
    }

    fn check_unmanaged(&self, operation: &str) -> Result<()> {
        if self.core.options.managed {
            tracing::warn!(executor = %self.core.name, operation, "refusing to stop a managed scheduler");
            return Err(Error::managed(&self.core.name, operation));
        }
        Ok(())
    }
}

impl Executor for SchedulingWrapper {
    fn execute(&self, task: Task) -> Result<()> {
        self.check_accepting()?;
        self.core.hand_off(self.core.options.propagation.wrap(task))
    }

    fn name(&self) -> &str {
        &self.core.name
    }

    fn propagation(&self) -> Propagation {
        self.core.options.propagation
    }

    fn is_scheduler(&self) -> bool {
        true
    }
}

impl ExecutorService for SchedulingWrapper {
    fn shutdown(&self) -> Result<()> {
        self.check_unmanaged("shutdown")?;
        self.core.begin_shutdown();
        Ok(())
    }

    /// Returns the swept scheduled items as cancelled tasks, followed by the
    /// backend's queued tasks when the backend is owned.
    fn shutdown_now(&self) -> Result<Vec<Task>> {
        self.check_unmanaged("shutdown_now")?;
        let swept = self.core.begin_shutdown();
        let mut tasks: Vec<Task> = swept
            .into_iter()
            .map(|item| Task::labeled(item.describe(), || {}).with_cancel_hook(Arc::new(DeferredHook(item))))
            .collect();
        if self.core.options.owns_backend {
            tasks.extend(self.core.backend.shutdown_now()?);
        }
        Ok(tasks)
    }

    fn is_shutdown(&self) -> bool {
        self.core.is_shutting_down()
    }

    fn is_terminated(&self) -> bool {
        self.core.is_terminated()
    }

    fn await_termination(&self, timeout: Duration) -> Result<bool> {
        if !self.core.is_shutting_down() {
            return Err(Error::new(ErrorKind::InvalidState)
                .with_message(format!("{} must be shut down before awaiting termination", self.core.name)));
        }
        let deadline = Instant::now() + timeout;
        if !self.core.sentinel_done.wait_until(deadline) {
            return Ok(false);
        }
        if self.core.options.owns_backend {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self.core.backend.await_termination(remaining)? {
                return Ok(false);
            }
        }
        // A borrowed backend may still be running work handed off earlier.
        if !self.core.in_flight.wait_idle_until(deadline) {
            return Ok(false);
        }
        Ok(self.core.is_terminated())
    }
}

impl fmt::Debug for SchedulingWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulingWrapper")
            .field("name", &self.core.name)
            .field("id", &self.core.id)
            .field("backend", &self.core.backend.name())
            .field("state", &self.state())
            .finish()
    }
}
