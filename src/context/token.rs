//! Cooperative cancellation tokens.
//!
//! A [`CancelToken`] is a cheap, cloneable handle to shared cancellation
//! state. Tokens form a tree: cancelling a token cancels every live
//! descendant, while cancelling a child never affects its parent. Nothing is
//! interrupted preemptively; running work observes the flag at its own
//! checkpoints.

use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::error::Cancelled;
use crate::types::CancelReason;

struct TokenState {
    cancelled: AtomicBool,
    reason: RwLock<Option<CancelReason>>,
    /// Held weakly so finished tasks do not pile up under a long-lived parent.
    children: Mutex<Vec<Weak<TokenState>>>,
}

impl TokenState {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            reason: RwLock::new(None),
            children: Mutex::new(Vec::new()),
        }
    }

    fn cancel(&self, reason: &CancelReason) -> bool {
        {
            // The reason is in place before the flag becomes visible.
            let mut slot = self.reason.write();
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason.clone());
            self.cancelled.store(true, Ordering::SeqCst);
        }

        let children = std::mem::take(&mut *self.children.lock());
        let parent_reason = CancelReason::parent_cancelled();
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel(&parent_reason);
        }
        true
    }
}

/// Cooperative cancellation handle.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<TokenState>,
}

impl CancelToken {
    /// Creates a new root token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(TokenState::new()),
        }
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if cancelled.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        self.state.reason.read().clone()
    }

    /// Requests cancellation.
    ///
    /// Returns true if this call performed the cancellation (first caller
    /// wins). All live descendants are cancelled with
    /// [`CancelReason::parent_cancelled`].
    #[allow(clippy::must_use_candidate)]
    pub fn cancel(&self, reason: &CancelReason) -> bool {
        self.state.cancel(reason)
    }

    /// Returns `Err(Cancelled)` if cancellation has been requested.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled {
                reason: self.reason().unwrap_or_default(),
            })
        } else {
            Ok(())
        }
    }

    /// Creates a child token linked to this one.
    ///
    /// A child created after the parent was cancelled starts out cancelled.
    #[must_use]
    pub fn child(&self) -> Self {
        let child = Self::new();

        // cancel() flips the flag before draining children, so checking the
        // flag under the children lock cannot miss a concurrent cancel.
        let mut children = self.state.children.lock();
        if self.is_cancelled() {
            drop(children);
            child.cancel(&CancelReason::parent_cancelled());
        } else {
            children.retain(|weak| weak.strong_count() > 0);
            children.push(Arc::downgrade(&child.state));
        }
        child
    }

    /// Number of live children, for diagnostics.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.state
            .children
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Returns true if both handles refer to the same token.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CancelKind;
    use std::thread;

    #[test]
    fn cancel_first_caller_wins() {
        let token = CancelToken::new();
        assert!(token.cancel(&CancelReason::user("first")));
        assert!(!token.cancel(&CancelReason::shutdown()));
        assert_eq!(token.reason(), Some(CancelReason::user("first")));
    }

    #[test]
    fn parent_cancel_reaches_grandchildren() {
        let root = CancelToken::new();
        let child = root.child();
        let grandchild = child.child();

        root.cancel(&CancelReason::user("stop"));

        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert_eq!(
            grandchild.reason().map(|r| r.kind),
            Some(CancelKind::ParentCancelled)
        );
    }

    #[test]
    fn child_cancel_does_not_touch_parent() {
        let root = CancelToken::new();
        let child = root.child();
        child.cancel(&CancelReason::user("child only"));
        assert!(!root.is_cancelled());
    }

    #[test]
    fn child_of_cancelled_parent_starts_cancelled() {
        let root = CancelToken::new();
        root.cancel(&CancelReason::shutdown());
        let child = root.child();
        assert!(child.is_cancelled());
        assert!(child.check().is_err());
    }

    #[test]
    fn dropped_children_are_pruned() {
        let root = CancelToken::new();
        for _ in 0..10 {
            let _child = root.child();
        }
        let live = root.child();
        assert_eq!(root.child_count(), 1);
        drop(live);
        assert_eq!(root.child_count(), 0);
    }

    #[test]
    fn concurrent_child_creation_and_cancel() {
        for _ in 0..50 {
            let root = CancelToken::new();
            let r = root.clone();
            let creator = thread::spawn(move || (0..20).map(|_| r.child()).collect::<Vec<_>>());
            root.cancel(&CancelReason::user("race"));
            let children = creator.join().expect("creator panicked");
            assert!(children.iter().all(CancelToken::is_cancelled));
        }
    }

    #[test]
    fn observers_never_see_cancel_without_reason() {
        for _ in 0..50 {
            let token = CancelToken::new();
            let observer = {
                let token = token.clone();
                thread::spawn(move || loop {
                    if let Err(cancelled) = token.check() {
                        return cancelled.reason;
                    }
                    thread::yield_now();
                })
            };
            token.cancel(&CancelReason::user("observed"));
            let seen = observer.join().expect("observer panicked");
            assert_eq!(seen, CancelReason::user("observed"));
        }
    }
}
