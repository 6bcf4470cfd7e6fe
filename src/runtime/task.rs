//! Units of work and their result handles.
//!
//! A [`Task`] is the opaque unit every executor in this crate accepts: a
//! boxed `FnOnce` plus a label for diagnostics and an optional cancellation
//! hook. Callers that want a result use `submit`, which pairs a
//! [`FutureTask`] (the runnable side) with a [`TaskHandle`] (the waiting
//! side) through a shared cell.
//!
//! # Handle state machine
//!
//! ```text
//! Pending ──start──▶ Running ──finish──▶ Completed | Failed | Cancelled
//!    │                  │
//!    │                  └──rearm (periodic only)──▶ Pending
//!    └──cancel──▶ Cancelled
//! ```
//!
//! Cancelling a running task only sets its token; the body decides whether
//! to stop. A `FutureTask` that is dropped without ever running (for example
//! because a backend rejected it) resolves its handle as cancelled, so a
//! waiter is never left hanging.

use core::fmt;
use std::any::Any;
use std::borrow::Cow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::context::{CancelToken, ExecutionContext, Propagation};
use crate::error::{Cancelled, TaskError};
use crate::sync::CountDownLatch;
use crate::types::CancelReason;

const FLAG_MARKER: u8 = 0b01;
const FLAG_PROPAGATED: u8 = 0b10;

/// Something that can be cancelled from the outside.
pub trait Cancellable: Send + Sync {
    /// Requests cancellation. Returns true if this call had an effect.
    fn cancel(&self, reason: &CancelReason) -> bool;

    /// Returns true if cancellation has been requested.
    fn is_cancelled(&self) -> bool;
}

impl Cancellable for CancelToken {
    fn cancel(&self, reason: &CancelReason) -> bool {
        Self::cancel(self, reason)
    }

    fn is_cancelled(&self) -> bool {
        Self::is_cancelled(self)
    }
}

/// An opaque unit of work.
pub struct Task {
    pub(crate) work: Box<dyn FnOnce() + Send + 'static>,
    pub(crate) label: Option<Cow<'static, str>>,
    pub(crate) cancel_hook: Option<Arc<dyn Cancellable>>,
    pub(crate) flags: u8,
    /// Counted down by a bounded executor once the task's slot is given up.
    pub(crate) slot_released: Option<Arc<CountDownLatch>>,
}

impl Task {
    /// Wraps a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            work: Box::new(f),
            label: None,
            cancel_hook: None,
            flags: 0,
            slot_released: None,
        }
    }

    /// Wraps a closure with a diagnostic label.
    pub fn labeled<F>(label: impl Into<Cow<'static, str>>, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new(f).with_label(label)
    }

    /// Sets the diagnostic label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<Cow<'static, str>>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Attaches a hook invoked by [`Task::cancel`].
    #[must_use]
    pub fn with_cancel_hook(mut self, hook: Arc<dyn Cancellable>) -> Self {
        self.cancel_hook = Some(hook);
        self
    }

    /// A drain marker. Markers are the only tasks a shut-down bounded
    /// executor still admits.
    pub(crate) fn marker<F>(f: F, slot_released: Arc<CountDownLatch>) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let mut task = Self::labeled("drain marker", f);
        task.flags |= FLAG_MARKER;
        task.slot_released = Some(slot_released);
        task
    }

    /// Returns the diagnostic label.
    #[must_use]
    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or("<anonymous>")
    }

    /// Returns true for drain markers.
    #[must_use]
    pub fn is_marker(&self) -> bool {
        self.flags & FLAG_MARKER != 0
    }

    /// Returns true if the task already carries a captured context.
    #[must_use]
    pub fn is_propagated(&self) -> bool {
        self.flags & FLAG_PROPAGATED != 0
    }

    pub(crate) fn mark_propagated(mut self) -> Self {
        self.flags |= FLAG_PROPAGATED;
        self
    }

    /// Keeps `guard` alive until the task has run or been dropped.
    pub(crate) fn holding<G: Send + 'static>(mut self, guard: G) -> Self {
        let work = core::mem::replace(&mut self.work, Box::new(|| {}));
        self.work = Box::new(move || {
            let _held = guard;
            work();
        });
        self
    }

    /// Cancels the task through its hook.
    ///
    /// Returns false when the task has no hook or was already cancelled.
    #[allow(clippy::must_use_candidate)]
    pub fn cancel(&self, reason: &CancelReason) -> bool {
        self.cancel_hook
            .as_ref()
            .is_some_and(|hook| hook.cancel(reason))
    }

    /// Returns true if the hook reports cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_hook
            .as_ref()
            .is_some_and(|hook| hook.is_cancelled())
    }

    /// Runs the task on the current thread.
    pub fn run(self) {
        (self.work)();
    }

    /// Runs the task, catching and logging a panic.
    pub(crate) fn run_catching(self) -> Result<(), TaskError> {
        let Self { work, label, .. } = self;
        run_guarded(label.as_deref().unwrap_or("<anonymous>"), work)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("label", &self.label())
            .field("marker", &self.is_marker())
            .field("propagated", &self.is_propagated())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Runs `f`, converting a panic into a [`TaskError`].
///
/// A [`Cancelled`] unwind payload is expected control flow and is only
/// traced. Any other panic is logged as an error with the task label.
pub(crate) fn run_guarded<T>(label: &str, f: impl FnOnce() -> T) -> Result<T, TaskError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => Err(classify_panic(label, payload)),
    }
}

pub(crate) fn classify_panic(label: &str, payload: Box<dyn Any + Send>) -> TaskError {
    match payload.downcast::<Cancelled>() {
        Ok(cancelled) => {
            tracing::trace!(task = %label, reason = %cancelled.reason, "task observed cancellation");
            TaskError::Cancelled(cancelled.reason)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(task = %label, error = %message, "task panicked");
            TaskError::Panicked { message }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Observable state of a task handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Waiting to run.
    Pending,
    /// Currently executing.
    Running,
    /// Finished and produced a value.
    Completed,
    /// Finished by panicking.
    Failed,
    /// Cancelled before completing.
    Cancelled,
}

impl TaskState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Failed,
            _ => Self::Cancelled,
        }
    }

    /// Returns true for terminal states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

struct Slot<T> {
    finished: bool,
    outcome: Option<Result<T, TaskError>>,
}

/// Shared state between a runnable and its handle.
pub(crate) struct TaskCell<T> {
    state: AtomicU8,
    cancel_requested: AtomicBool,
    slot: Mutex<Slot<T>>,
    done: Condvar,
    token: Option<CancelToken>,
}

impl<T> TaskCell<T> {
    pub(crate) fn new(token: Option<CancelToken>) -> Self {
        Self {
            state: AtomicU8::new(TaskState::Pending as u8),
            cancel_requested: AtomicBool::new(false),
            slot: Mutex::new(Slot {
                finished: false,
                outcome: None,
            }),
            done: Condvar::new(),
            token,
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    pub(crate) fn token(&self) -> Option<&CancelToken> {
        self.token.as_ref()
    }

    /// Pending → Running. Fails if the task was cancelled or already ran.
    pub(crate) fn try_start(&self) -> bool {
        self.state
            .compare_exchange(
                TaskState::Pending as u8,
                TaskState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Running → terminal, publishing the outcome.
    pub(crate) fn complete(&self, outcome: Result<T, TaskError>) {
        let state = match &outcome {
            Ok(_) => TaskState::Completed,
            Err(TaskError::Cancelled(_)) => TaskState::Cancelled,
            Err(TaskError::Panicked { .. }) => TaskState::Failed,
        };
        self.publish(state, outcome);
    }

    /// Running → Pending for the next periodic run, unless a cancel arrived
    /// while the body was running. Returns true if the task was re-armed.
    pub(crate) fn rearm(&self) -> bool {
        if self.cancel_requested.load(Ordering::Acquire) {
            self.publish(
                TaskState::Cancelled,
                Err(TaskError::Cancelled(self.cancel_reason())),
            );
            return false;
        }
        let rearmed = self
            .state
            .compare_exchange(
                TaskState::Running as u8,
                TaskState::Pending as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        // A cancel racing with the swap back to Pending would have found the
        // state Running and left it alone; pick it up now.
        if rearmed && self.cancel_requested.load(Ordering::Acquire) {
            self.cancel_pending(&self.cancel_reason());
            return false;
        }
        rearmed
    }

    /// Requests cancellation.
    ///
    /// Signals the task's token. A pending task is resolved as cancelled
    /// immediately and the call returns true. A running task is left to
    /// finish (or observe its token) and the call returns false.
    pub(crate) fn cancel(&self, reason: &CancelReason) -> bool {
        self.cancel_requested.store(true, Ordering::Release);
        if let Some(token) = &self.token {
            token.cancel(reason);
        }
        self.cancel_pending(reason)
    }

    fn cancel_pending(&self, reason: &CancelReason) -> bool {
        if self
            .state
            .compare_exchange(
                TaskState::Pending as u8,
                TaskState::Cancelled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.publish(TaskState::Cancelled, Err(TaskError::Cancelled(reason.clone())));
            true
        } else {
            false
        }
    }

    fn cancel_reason(&self) -> CancelReason {
        self.token
            .as_ref()
            .and_then(CancelToken::reason)
            .unwrap_or_else(|| CancelReason::user("cancelled while running"))
    }

    fn publish(&self, state: TaskState, outcome: Result<T, TaskError>) {
        let mut slot = self.slot.lock();
        self.state.store(state as u8, Ordering::Release);
        slot.finished = true;
        slot.outcome = Some(outcome);
        drop(slot);
        self.done.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut slot = self.slot.lock();
        while !slot.finished {
            self.done.wait(&mut slot);
        }
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while !slot.finished {
            if self.done.wait_until(&mut slot, deadline).timed_out() {
                return slot.finished;
            }
        }
        true
    }

    fn take(&self) -> Option<Result<T, TaskError>> {
        self.slot.lock().outcome.take()
    }
}

impl<T: Send> Cancellable for TaskCell<T> {
    fn cancel(&self, reason: &CancelReason) -> bool {
        Self::cancel(self, reason)
    }

    fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled || self.cancel_requested.load(Ordering::Acquire)
    }
}

/// Handle to the result of a submitted task.
pub struct TaskHandle<T> {
    pub(crate) cell: Arc<TaskCell<T>>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn from_cell(cell: Arc<TaskCell<T>>) -> Self {
        Self { cell }
    }

    /// Cancels the task.
    ///
    /// Returns true if the task was prevented from running. A task that is
    /// already running only has its cancellation token signalled.
    #[allow(clippy::must_use_candidate)]
    pub fn cancel(&self) -> bool {
        self.cell.cancel(&CancelReason::user("cancelled through handle"))
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.cell.state()
    }

    /// Returns true once the task reached a terminal state.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.cell.is_done()
    }

    /// Returns true if the task ended cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cell.state() == TaskState::Cancelled
    }

    /// The task's cancellation token, present when context propagation is
    /// enabled on the submitting executor.
    #[must_use]
    pub fn token(&self) -> Option<&CancelToken> {
        self.cell.token()
    }

    /// Blocks until the task reaches a terminal state.
    pub fn wait(&self) {
        self.cell.wait();
    }

    /// Blocks until the task finishes or `timeout` elapses.
    ///
    /// Returns true if the task finished.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.cell.wait_timeout(timeout)
    }

    /// Waits for the task and returns its outcome.
    pub fn join(self) -> Result<T, TaskError> {
        self.cell.wait();
        self.take_outcome()
    }

    /// Waits up to `timeout` for the outcome, handing the handle back on
    /// timeout.
    pub fn join_timeout(self, timeout: Duration) -> Result<Result<T, TaskError>, Self> {
        if self.cell.wait_timeout(timeout) {
            Ok(self.take_outcome())
        } else {
            Err(self)
        }
    }

    fn take_outcome(&self) -> Result<T, TaskError> {
        self.cell
            .take()
            .unwrap_or_else(|| Err(TaskError::Cancelled(CancelReason::user("outcome consumed"))))
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("state", &self.state())
            .finish()
    }
}

/// Runnable side of a [`TaskHandle`].
pub(crate) struct FutureTask<T, F> {
    cell: Arc<TaskCell<T>>,
    body: Option<F>,
    context: Option<ExecutionContext>,
    label: Cow<'static, str>,
}

impl<T, F> FutureTask<T, F>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    /// Pairs a body with a fresh handle, capturing the submitter's context
    /// when propagation is enabled.
    pub(crate) fn new(body: F, propagation: Propagation) -> (Self, TaskHandle<T>) {
        let context = propagation.capture();
        let token = context.as_ref().and_then(|cx| cx.token().cloned());
        let cell = Arc::new(TaskCell::new(token));
        let handle = TaskHandle::from_cell(Arc::clone(&cell));
        let task = Self {
            cell,
            body: Some(body),
            context,
            label: Cow::Borrowed("submitted task"),
        };
        (task, handle)
    }

    pub(crate) fn with_label(mut self, label: Cow<'static, str>) -> Self {
        self.label = label;
        self
    }

    pub(crate) fn cell(&self) -> &Arc<TaskCell<T>> {
        &self.cell
    }

    fn run(mut self) {
        let Some(body) = self.body.take() else {
            return;
        };
        if !self.cell.try_start() {
            tracing::trace!(task = %self.label, "skipping cancelled task");
            return;
        }
        if let Some(token) = self.cell.token() {
            if let Err(cancelled) = token.check() {
                self.cell.complete(Err(TaskError::Cancelled(cancelled.reason)));
                return;
            }
        }
        let _guard = self.context.take().map(ExecutionContext::enter);
        let outcome = run_guarded(&self.label, body);
        self.cell.complete(outcome);
    }

    /// Converts into an executor [`Task`] whose cancel hook cancels the handle.
    pub(crate) fn into_task(self) -> Task {
        let label = self.label.clone();
        let hook: Arc<dyn Cancellable> = self.cell.clone();
        // Handles capture their own context, so executors must not wrap again.
        Task::new(move || self.run())
            .with_label(label)
            .with_cancel_hook(hook)
            .mark_propagated()
    }
}

impl<T, F> Drop for FutureTask<T, F> {
    fn drop(&mut self) {
        if self.body.is_some() {
            self.cell.cancel(&CancelReason::new(crate::types::CancelKind::Shutdown));
        }
    }
}
