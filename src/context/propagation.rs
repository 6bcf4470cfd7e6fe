//! Execution context capture and restore.
//!
//! An [`ExecutionContext`] is an immutable bag of typed values plus an
//! optional [`CancelToken`]. One context at a time is installed per thread.
//! When an executor has [`Propagation::Enabled`], submission captures the
//! submitter's context and the worker installs it around the task body, with
//! a child token linked to the submitter's token.

use core::fmt;
use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use super::token::CancelToken;
use crate::error::Cancelled;
use crate::runtime::task::{Cancellable, Task};
use crate::types::CancelReason;

type Values = BTreeMap<&'static str, Arc<dyn Any + Send + Sync>>;

thread_local! {
    static CURRENT: RefCell<Option<ExecutionContext>> = const { RefCell::new(None) };
}

/// Ambient state carried from a submitter to the thread that runs its work.
#[derive(Clone, Default)]
pub struct ExecutionContext {
    values: Arc<Values>,
    token: Option<CancelToken>,
}

impl ExecutionContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of this context with `key` bound to `value`.
    #[must_use]
    pub fn with_value<V>(&self, key: &'static str, value: V) -> Self
    where
        V: Any + Send + Sync,
    {
        let mut values = (*self.values).clone();
        values.insert(key, Arc::new(value));
        Self {
            values: Arc::new(values),
            token: self.token.clone(),
        }
    }

    /// Looks up a value by key and type.
    #[must_use]
    pub fn get<V: Any>(&self, key: &str) -> Option<&V> {
        self.values.get(key).and_then(|v| v.downcast_ref::<V>())
    }

    /// Returns true if `key` is bound.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Bound keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.values.keys().copied()
    }

    /// Returns a copy of this context carrying `token`.
    #[must_use]
    pub fn with_token(&self, token: CancelToken) -> Self {
        Self {
            values: Arc::clone(&self.values),
            token: Some(token),
        }
    }

    /// The cancellation token, if any.
    #[must_use]
    pub fn token(&self) -> Option<&CancelToken> {
        self.token.as_ref()
    }

    /// Same values, with a child of this context's token (or a fresh root
    /// token when there is none).
    #[must_use]
    pub fn fork(&self) -> Self {
        self.with_token(self.child_token())
    }

    fn child_token(&self) -> CancelToken {
        self.token
            .as_ref()
            .map_or_else(CancelToken::new, CancelToken::child)
    }

    /// The context installed on the current thread.
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT.with(|slot| slot.borrow().clone())
    }

    /// Installs this context on the current thread until the guard drops.
    #[must_use]
    pub fn enter(self) -> ContextGuard {
        let prev = CURRENT.with(|slot| slot.borrow_mut().replace(self));
        ContextGuard {
            prev,
            _not_send: PhantomData,
        }
    }

    /// Runs `f` with this context installed.
    pub fn scope<R>(self, f: impl FnOnce() -> R) -> R {
        let _guard = self.enter();
        f()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .field("token", &self.token)
            .finish()
    }
}

/// Restores the previously installed context on drop.
pub struct ContextGuard {
    prev: Option<ExecutionContext>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|slot| {
            *slot.borrow_mut() = prev;
        });
    }
}

impl fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextGuard")
            .field("restores", &self.prev.is_some())
            .finish()
    }
}

/// Token of the current thread's context.
#[must_use]
pub fn current_token() -> Option<CancelToken> {
    CURRENT.with(|slot| slot.borrow().as_ref().and_then(|cx| cx.token.clone()))
}

/// Returns true if the current context's token is cancelled.
#[must_use]
pub fn is_cancelled() -> bool {
    current_token().is_some_and(|t| t.is_cancelled())
}

/// Cooperative cancellation point.
///
/// Unwinds with a [`Cancelled`] payload when the current context's token is
/// cancelled. Executors catch the payload at the task boundary and record the
/// task as cancelled instead of failed.
pub fn checkpoint() {
    if let Some(token) = current_token() {
        if let Err(cancelled) = token.check() {
            std::panic::resume_unwind(Box::new(cancelled));
        }
    }
}

/// Returns `Err(Cancelled)` when the current context's token is cancelled.
pub fn check() -> Result<(), Cancelled> {
    current_token().map_or(Ok(()), |t| t.check())
}

/// Whether an executor carries submitter context into its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Propagation {
    /// Tasks run with whatever context the worker thread has.
    #[default]
    Disabled,
    /// Tasks run with the submitter's context and a linked child token.
    Enabled,
}

impl Propagation {
    /// Maps a boolean switch onto a mode.
    #[must_use]
    pub const fn from_enabled(enabled: bool) -> Self {
        if enabled {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }

    /// Returns true for [`Propagation::Enabled`].
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }

    /// Captures the current context with a forked token.
    ///
    /// Always `Some` when enabled; the context is empty if the thread has
    /// none installed.
    #[must_use]
    pub fn capture(self) -> Option<ExecutionContext> {
        match self {
            Self::Disabled => None,
            Self::Enabled => Some(ExecutionContext::current().unwrap_or_default().fork()),
        }
    }

    /// Wraps a raw task so it runs under the submitter's context.
    ///
    /// Disabled mode, tasks that already carry a context, and submitters with
    /// no installed context are passed through untouched.
    #[must_use]
    pub fn wrap(self, task: Task) -> Task {
        if !self.is_enabled() || task.is_propagated() {
            return task;
        }
        let Some(current) = ExecutionContext::current() else {
            return task.mark_propagated();
        };
        let token = current.child_token();
        let context = current.with_token(token.clone());

        let Task {
            work,
            label,
            cancel_hook,
            flags,
            slot_released,
        } = task;
        let hook: Arc<dyn Cancellable> = Arc::new(LinkedCancel {
            token: token.clone(),
            inner: cancel_hook,
        });
        let task_label = label.clone();
        let wrapped = move || {
            if token.is_cancelled() {
                tracing::trace!(
                    task = task_label.as_deref().unwrap_or("<anonymous>"),
                    "skipping task cancelled before start"
                );
                return;
            }
            let _guard = context.enter();
            work();
        };
        Task {
            work: Box::new(wrapped),
            label,
            cancel_hook: Some(hook),
            flags,
            slot_released,
        }
        .mark_propagated()
    }
}

/// Cancels the propagated token and then the task's own hook.
struct LinkedCancel {
    token: CancelToken,
    inner: Option<Arc<dyn Cancellable>>,
}

impl Cancellable for LinkedCancel {
    fn cancel(&self, reason: &CancelReason) -> bool {
        let signalled = self.token.cancel(reason);
        let inner = self.inner.as_ref().is_some_and(|hook| hook.cancel(reason));
        signalled || inner
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.inner.as_ref().is_some_and(|h| h.is_cancelled())
    }
}
