//! Deferred work items.
//!
//! A [`Deferred`] item waits in the [`DelayQueue`](super::delay_queue::DelayQueue)
//! until its deadline and is then dispatched by the Dispatch Thread. Items
//! are ordered by `(deadline, sequence)`; the sequence is allocated once at
//! creation, so equal deadlines dispatch in creation order and a periodic
//! item keeps its place relative to items created after it.
//!
//! Dispatch must be cheap: it only checks whether the item is still live and
//! hands its payload to the owning wrapper's backend.

use core::fmt;
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::context::{ExecutionContext, Propagation};
use crate::error::TaskError;
use crate::runtime::delay_queue::DelayQueue;
use crate::runtime::scheduling::WrapperCore;
use crate::runtime::task::{run_guarded, Cancellable, FutureTask, Task, TaskCell, TaskHandle, TaskState};
use crate::types::{CancelReason, ExecutorId, Sequence, Time};

/// An item in the delay queue.
pub trait Deferred: Send + Sync {
    /// When the item becomes eligible for dispatch.
    fn deadline(&self) -> Time;

    /// Creation order, used to break deadline ties.
    fn sequence(&self) -> Sequence;

    /// The wrapper that scheduled the item.
    fn owner(&self) -> ExecutorId;

    /// Returns true once the item must not be dispatched again.
    fn is_done(&self) -> bool;

    /// Cancels the item. Returns true if this call had an effect.
    fn cancel(&self, reason: &CancelReason) -> bool;

    /// Hands the payload to its backend.
    ///
    /// Returns false only to stop the Dispatch Thread.
    fn dispatch(self: Arc<Self>) -> bool;

    /// Human-readable description for queue dumps.
    fn describe(&self) -> String;
}

/// How a scheduled task repeats.
///
/// Fixed-rate repetition has no representation: after a process
/// suspension it would fire a burst of catch-up runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    /// Runs once.
    OneShot,
    /// Runs again `delay` after each completion.
    FixedDelay(Duration),
}

impl Period {
    /// Returns true for repeating schedules.
    #[must_use]
    pub const fn is_periodic(self) -> bool {
        matches!(self, Self::FixedDelay(_))
    }
}

/// A delayed one-shot task.
pub(crate) struct OneShot<T, F> {
    core: Arc<WrapperCore>,
    deadline: Time,
    sequence: Sequence,
    cell: Arc<TaskCell<T>>,
    task: Mutex<Option<FutureTask<T, F>>>,
}

impl<T, F> OneShot<T, F>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    pub(crate) fn new(core: Arc<WrapperCore>, deadline: Time, task: FutureTask<T, F>) -> Self {
        Self {
            core,
            deadline,
            sequence: Sequence::next(),
            cell: Arc::clone(task.cell()),
            task: Mutex::new(Some(task)),
        }
    }
}

impl<T, F> Deferred for OneShot<T, F>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    fn deadline(&self) -> Time {
        self.deadline
    }

    fn sequence(&self) -> Sequence {
        self.sequence
    }

    fn owner(&self) -> ExecutorId {
        self.core.id
    }

    fn is_done(&self) -> bool {
        self.cell.is_done()
    }

    fn cancel(&self, reason: &CancelReason) -> bool {
        self.cell.cancel(reason)
    }

    fn dispatch(self: Arc<Self>) -> bool {
        if self.is_done() {
            tracing::trace!(executor = %self.core.name, sequence = %self.sequence, "skipping cancelled item");
            return true;
        }
        let Some(task) = self.task.lock().take() else {
            return true;
        };
        tracing::trace!(executor = %self.core.name, sequence = %self.sequence, "dispatching one-shot");
        // A rejected task is dropped unrun, which cancels its handle.
        if let Err(e) = self.core.hand_off(task.into_task()) {
            tracing::error!(
                executor = %self.core.name,
                sequence = %self.sequence,
                error = %e,
                "backend rejected scheduled task"
            );
        }
        true
    }

    fn describe(&self) -> String {
        format!("one-shot task of {}", self.core.name)
    }
}

/// A task repeated with a fixed delay between completion and next start.
pub(crate) struct FixedDelay {
    core: Arc<WrapperCore>,
    deadline: AtomicU64,
    delay: Duration,
    sequence: Sequence,
    cell: Arc<TaskCell<()>>,
    body: Mutex<Box<dyn FnMut() + Send>>,
    context: Option<ExecutionContext>,
    label: Cow<'static, str>,
}

impl FixedDelay {
    pub(crate) fn new<F>(
        core: Arc<WrapperCore>,
        first_deadline: Time,
        delay: Duration,
        body: F,
        propagation: Propagation,
    ) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let context = propagation.capture();
        let token = context.as_ref().and_then(|cx| cx.token().cloned());
        let label = Cow::Owned(format!("periodic task of {}", core.name));
        Self {
            core,
            deadline: AtomicU64::new(first_deadline.as_nanos()),
            delay,
            sequence: Sequence::next(),
            cell: Arc::new(TaskCell::new(token)),
            body: Mutex::new(Box::new(body)),
            context,
            label,
        }
    }

    pub(crate) fn handle(&self) -> TaskHandle<()> {
        TaskHandle::from_cell(Arc::clone(&self.cell))
    }

    /// One run on the backend, followed by re-arming.
    fn run_once(self: Arc<Self>) {
        if !self.cell.try_start() {
            return;
        }
        if let Some(token) = self.cell.token() {
            if let Err(cancelled) = token.check() {
                self.cell.complete(Err(TaskError::Cancelled(cancelled.reason)));
                return;
            }
        }

        let outcome = {
            let _guard = self.context.clone().map(ExecutionContext::enter);
            let mut body = self.body.lock();
            run_guarded(&self.label, || (&mut **body)())
        };

        match outcome {
            Ok(()) => self.reschedule(),
            // A failed periodic task is not run again.
            Err(e) => self.cell.complete(Err(e)),
        }
    }

    fn reschedule(self: Arc<Self>) {
        if self.core.is_shutting_down() {
            self.cell.cancel(&CancelReason::shutdown());
        }
        if !self.cell.rearm() {
            return;
        }

        let next = Time::now() + self.delay;
        self.deadline.store(next.as_nanos(), Ordering::Release);
        let item: Arc<dyn Deferred> = Arc::clone(&self) as Arc<dyn Deferred>;
        match self.core.queue.offer(item) {
            Ok(()) => {
                // Cancel or shutdown may have swept the queue before the offer.
                if self.is_done() || self.core.is_shutting_down() {
                    self.core.queue.remove(&*self);
                    self.cell.cancel(&CancelReason::shutdown());
                } else {
                    tracing::trace!(
                        executor = %self.core.name,
                        sequence = %self.sequence,
                        deadline = %next,
                        "re-armed periodic task"
                    );
                }
            }
            Err(_) => {
                self.cell.cancel(&CancelReason::shutdown());
            }
        }
    }
}

impl Deferred for FixedDelay {
    fn deadline(&self) -> Time {
        Time::from_nanos(self.deadline.load(Ordering::Acquire))
    }

    fn sequence(&self) -> Sequence {
        self.sequence
    }

    fn owner(&self) -> ExecutorId {
        self.core.id
    }

    fn is_done(&self) -> bool {
        self.cell.is_done()
    }

    fn cancel(&self, reason: &CancelReason) -> bool {
        self.cell.cancel(reason)
    }

    fn dispatch(self: Arc<Self>) -> bool {
        if self.is_done() {
            tracing::trace!(executor = %self.core.name, sequence = %self.sequence, "skipping cancelled item");
            return true;
        }
        let hook: Arc<dyn Cancellable> = self.cell.clone();
        let item = Arc::clone(&self);
        let step = Task::new(move || item.run_once())
            .with_label(self.label.clone())
            .with_cancel_hook(hook)
            .mark_propagated();
        if let Err(e) = self.core.hand_off(step) {
            tracing::error!(
                executor = %self.core.name,
                sequence = %self.sequence,
                error = %e,
                "backend rejected periodic task"
            );
            self.cell.cancel(&CancelReason::shutdown());
        }
        true
    }

    fn describe(&self) -> String {
        format!("{} every {:?}", self.label, self.delay)
    }
}

/// Per-wrapper shutdown sentinel.
///
/// Enqueued with deadline "now" once the wrapper has swept its own items,
/// so it is dispatched only after every earlier item in the shared queue.
pub(crate) struct WrapperSentinel {
    core: Arc<WrapperCore>,
    deadline: Time,
    sequence: Sequence,
    fired: AtomicBool,
}

impl WrapperSentinel {
    pub(crate) fn new(core: Arc<WrapperCore>) -> Self {
        Self {
            core,
            deadline: Time::now(),
            sequence: Sequence::next(),
            fired: AtomicBool::new(false),
        }
    }

    fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.core.finish_shutdown();
        true
    }
}

impl Deferred for WrapperSentinel {
    fn deadline(&self) -> Time {
        self.deadline
    }

    fn sequence(&self) -> Sequence {
        self.sequence
    }

    fn owner(&self) -> ExecutorId {
        self.core.id
    }

    fn is_done(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// A sentinel cannot be skipped: cancelling it (when the queue itself
    /// shuts down first) performs the teardown immediately.
    fn cancel(&self, _reason: &CancelReason) -> bool {
        self.fire()
    }

    fn dispatch(self: Arc<Self>) -> bool {
        self.fire();
        true
    }

    fn describe(&self) -> String {
        format!("shutdown sentinel of {}", self.core.name)
    }
}

/// Process-wide sentinel that stops the Dispatch Thread.
pub(crate) struct PoisonPill {
    deadline: Time,
    sequence: Sequence,
}

impl PoisonPill {
    pub(crate) fn new() -> Self {
        Self {
            deadline: Time::now(),
            sequence: Sequence::next(),
        }
    }
}

impl Deferred for PoisonPill {
    fn deadline(&self) -> Time {
        self.deadline
    }

    fn sequence(&self) -> Sequence {
        self.sequence
    }

    fn owner(&self) -> ExecutorId {
        ExecutorId::QUEUE
    }

    fn is_done(&self) -> bool {
        false
    }

    fn cancel(&self, _reason: &CancelReason) -> bool {
        false
    }

    fn dispatch(self: Arc<Self>) -> bool {
        false
    }

    fn describe(&self) -> String {
        "dispatch thread shutdown".to_string()
    }
}

/// Cancels a deferred item through the [`Cancellable`] interface.
pub(crate) struct DeferredHook(pub(crate) Arc<dyn Deferred>);

impl Cancellable for DeferredHook {
    fn cancel(&self, reason: &CancelReason) -> bool {
        self.0.cancel(reason)
    }

    fn is_cancelled(&self) -> bool {
        self.0.is_done()
    }
}

/// Handle to a scheduled task.
///
/// Cancelling through the handle also removes a still-pending item from the
/// delay queue.
pub struct ScheduledHandle<T> {
    handle: TaskHandle<T>,
    item: Arc<dyn Deferred>,
    queue: DelayQueue,
    period: Period,
}

impl<T> ScheduledHandle<T> {
    pub(crate) fn new(
        handle: TaskHandle<T>,
        item: Arc<dyn Deferred>,
        queue: DelayQueue,
        period: Period,
    ) -> Self {
        Self {
            handle,
            item,
            queue,
            period,
        }
    }

    /// Cancels the task and removes it from the delay queue.
    ///
    /// Returns true if the task was prevented from running (again). A run
    /// in progress is only signalled through its token.
    #[allow(clippy::must_use_candidate)]
    pub fn cancel(&self) -> bool {
        let cancelled = self.handle.cancel();
        if self.queue.remove(&*self.item) {
            tracing::trace!(sequence = %self.item.sequence(), "removed cancelled item from delay queue");
        }
        cancelled
    }

    /// Time left until the next dispatch, zero if due.
    #[must_use]
    pub fn remaining_delay(&self) -> Duration {
        self.item.deadline().duration_since(Time::now())
    }

    /// Returns true for fixed-delay tasks.
    #[must_use]
    pub fn is_periodic(&self) -> bool {
        self.period.is_periodic()
    }

    /// The repetition mode.
    #[must_use]
    pub fn period(&self) -> Period {
        self.period
    }

    /// Sequence number of the underlying item.
    #[must_use]
    pub fn sequence(&self) -> Sequence {
        self.item.sequence()
    }

    /// Current state of the task.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.handle.state()
    }

    /// Returns true once the task reached a terminal state.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.handle.is_done()
    }

    /// Returns true if the task ended cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    /// Cancellation token of the task, when propagation is enabled.
    #[must_use]
    pub fn token(&self) -> Option<&crate::context::CancelToken> {
        self.handle.token()
    }

    /// Blocks until the task reaches a terminal state.
    pub fn wait(&self) {
        self.handle.wait();
    }

    /// Blocks until the task finishes or `timeout` elapses.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.handle.wait_timeout(timeout)
    }

    /// Waits for the outcome. A periodic task only finishes by failing or
    /// being cancelled.
    pub fn join(self) -> Result<T, TaskError> {
        self.handle.join()
    }
}

impl<T> fmt::Debug for ScheduledHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledHandle")
            .field("sequence", &self.item.sequence())
            .field("period", &self.period)
            .field("state", &self.state())
            .field("remaining_delay", &self.remaining_delay())
            .finish()
    }
}
