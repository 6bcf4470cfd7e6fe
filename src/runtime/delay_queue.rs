//! Process-wide delay queue and its Dispatch Thread.
//!
//! The queue is a single ordered map keyed by `(deadline, sequence)`, shared
//! by every scheduling wrapper. One dedicated thread takes the head item once
//! its deadline has passed and calls [`Deferred::dispatch`], which only hands
//! the payload to the owning wrapper's backend. Task bodies never run on the
//! Dispatch Thread.
//!
//! The thread stops when it dispatches a [`PoisonPill`] and cancels every item
//! still queued behind the pill before exiting. The pill is enqueued by
//! [`DelayQueue::shutdown`], or when the last handle returned by
//! [`DelayQueue::start`] is dropped. Scheduling wrappers hold detached handles
//! that do not keep the thread alive.

use core::fmt;
use std::collections::{BTreeMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, ErrorKind, Result};
use crate::runtime::deferred::{Deferred, PoisonPill};
use crate::runtime::task::panic_message;
use crate::types::{CancelReason, ExecutorId, Sequence, Time};

type Key = (Time, u64);

/// Shared delay queue handle. Clones refer to the same queue.
#[derive(Clone)]
pub struct DelayQueue {
    inner: Arc<QueueInner>,
    lifetime: Option<Arc<Lifetime>>,
}

/// Stops the Dispatch Thread when the last owning handle goes away.
struct Lifetime(Arc<QueueInner>);

impl Drop for Lifetime {
    fn drop(&mut self) {
        if self.0.stop() {
            tracing::debug!(queue = %self.0.name, "delay queue dropped without shutdown");
        }
    }
}

struct QueueInner {
    name: String,
    items: Mutex<BTreeMap<Key, Arc<dyn Deferred>>>,
    available: Condvar,
    running: AtomicBool,
    backends: Mutex<HashSet<usize>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Snapshot of one queued item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingItem {
    /// Creation order.
    pub sequence: Sequence,
    /// Scheduling wrapper that owns the item.
    pub owner: ExecutorId,
    /// Dispatch deadline.
    pub deadline: Time,
    /// Nanoseconds until the deadline; negative when overdue.
    pub offset_nanos: i128,
    /// Item description.
    pub description: String,
}

impl fmt::Display for PendingItem {
    #[allow(clippy::cast_precision_loss)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let offset_ms = self.offset_nanos as f64 / 1_000_000.0;
        write!(
            f,
            "{} [{}] due in {offset_ms:.3}ms: {}",
            self.sequence, self.owner, self.description
        )
    }
}

impl DelayQueue {
    /// Creates the queue and starts its Dispatch Thread.
    pub fn start(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let inner = Arc::new(QueueInner {
            name: name.clone(),
            items: Mutex::new(BTreeMap::new()),
            available: Condvar::new(),
            running: AtomicBool::new(true),
            backends: Mutex::new(HashSet::new()),
            thread: Mutex::new(None),
        });

        let worker = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || dispatch_loop(&worker))
            .map_err(|e| {
                Error::new(ErrorKind::ThreadSpawn)
                    .with_message(format!("failed to spawn dispatch thread {name}: {e}"))
            })?;
        *inner.thread.lock() = Some(handle);

        tracing::debug!(queue = %inner.name, "delay queue started");
        Ok(Self {
            lifetime: Some(Arc::new(Lifetime(Arc::clone(&inner)))),
            inner,
        })
    }

    /// A handle to the same queue that does not keep the Dispatch Thread
    /// running.
    pub(crate) fn detached(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            lifetime: None,
        }
    }

    /// Diagnostic name, also the Dispatch Thread's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns true until [`shutdown`](Self::shutdown) is called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Enqueues an item.
    ///
    /// Fails with [`ErrorKind::Rejected`] once the queue is shutting down.
    pub(crate) fn offer(&self, item: Arc<dyn Deferred>) -> Result<()> {
        let mut items = self.inner.items.lock();
        if !self.is_running() {
            return Err(Error::rejected(&self.inner.name));
        }
        let key = (item.deadline(), item.sequence().get());
        let is_head = items.first_key_value().map_or(true, |(head, _)| key < *head);
        items.insert(key, item);
        drop(items);
        if is_head {
            self.inner.available.notify_one();
        }
        Ok(())
    }

    /// Removes a specific item. Returns true if it was queued.
    pub(crate) fn remove(&self, item: &dyn Deferred) -> bool {
        let key = (item.deadline(), item.sequence().get());
        self.inner.items.lock().remove(&key).is_some()
    }

    /// Removes and returns every item owned by `owner`.
    pub(crate) fn remove_owned(&self, owner: ExecutorId) -> Vec<Arc<dyn Deferred>> {
        let mut items = self.inner.items.lock();
        let keys: Vec<Key> = items
            .iter()
            .filter(|(_, item)| item.owner() == owner)
            .map(|(key, _)| *key)
            .collect();
        keys.into_iter()
            .filter_map(|key| items.remove(&key))
            .collect()
    }

    /// Number of items owned by `owner`.
    #[must_use]
    pub fn owned_count(&self, owner: ExecutorId) -> usize {
        self.inner
            .items
            .lock()
            .values()
            .filter(|item| item.owner() == owner)
            .count()
    }

    /// Returns true if any item owned by `owner` is queued.
    #[must_use]
    pub fn has_owned(&self, owner: ExecutorId) -> bool {
        self.inner
            .items
            .lock()
            .values()
            .any(|item| item.owner() == owner)
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.items.lock().is_empty()
    }

    /// Snapshot of the queue in dispatch order.
    #[must_use]
    pub fn dump(&self) -> Vec<PendingItem> {
        let now = Time::now();
        self.inner
            .items
            .lock()
            .values()
            .map(|item| {
                let deadline = item.deadline();
                PendingItem {
                    sequence: item.sequence(),
                    owner: item.owner(),
                    deadline,
                    offset_nanos: deadline.offset_from(now),
                    description: item.describe(),
                }
            })
            .collect()
    }

    /// Multi-line rendering of [`dump`](Self::dump).
    #[must_use]
    pub fn dump_string(&self) -> String {
        let pending = self.dump();
        let mut out = format!("{}: {} pending\n", self.inner.name, pending.len());
        for item in &pending {
            out.push_str("  ");
            out.push_str(&item.to_string());
            out.push('\n');
        }
        out
    }

    /// Claims a backend for a scheduling wrapper.
    ///
    /// Fails with [`ErrorKind::AlreadyScheduled`] if another wrapper on this
    /// queue already wraps the same backend.
    pub(crate) fn register_backend(&self, key: usize, name: &str) -> Result<()> {
        if self.inner.backends.lock().insert(key) {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::AlreadyScheduled)
                .with_message(format!("{name} is already wrapped by a scheduler")))
        }
    }

    pub(crate) fn unregister_backend(&self, key: usize) {
        self.inner.backends.lock().remove(&key);
    }

    /// Stops the Dispatch Thread after every item due by now was dispatched.
    ///
    /// Items with later deadlines are cancelled. Returns true if the thread
    /// exited within `timeout`.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.inner.stop();
        self.join_dispatch_thread(timeout)
    }

    fn join_dispatch_thread(&self, timeout: Duration) -> bool {
        let Some(handle) = self.inner.thread.lock().take() else {
            return true;
        };
        if handle.thread().id() == thread::current().id() {
            tracing::warn!(queue = %self.inner.name, "delay queue shut down from its own dispatch thread");
            return false;
        }
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!(queue = %self.inner.name, "dispatch thread did not stop in time");
                *self.inner.thread.lock() = Some(handle);
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        let _ = handle.join();
        tracing::debug!(queue = %self.inner.name, "dispatch thread stopped");
        true
    }
}

impl QueueInner {
    /// Enqueues the pill once. Returns true on the first call.
    fn stop(&self) -> bool {
        let mut items = self.items.lock();
        if !self.running.swap(false, Ordering::AcqRel) {
            return false;
        }
        let pill = PoisonPill::new();
        items.insert((pill.deadline(), pill.sequence().get()), Arc::new(pill));
        self.available.notify_one();
        true
    }

    /// Cancels whatever is still queued after the pill was dispatched.
    fn cancel_leftovers(&self) {
        let leftover: Vec<_> = core::mem::take(&mut *self.items.lock()).into_values().collect();
        if leftover.is_empty() {
            return;
        }
        tracing::debug!(
            queue = %self.name,
            cancelled = leftover.len(),
            "cancelling items left behind the dispatch thread"
        );
        let reason = CancelReason::shutdown();
        for item in leftover {
            item.cancel(&reason);
        }
    }
}

impl fmt::Debug for DelayQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayQueue")
            .field("name", &self.inner.name)
            .field("len", &self.len())
            .field("running", &self.is_running())
            .field("detached", &self.lifetime.is_none())
            .finish()
    }
}

fn dispatch_loop(inner: &QueueInner) {
    loop {
        let item = next_due(inner);
        let description = item.describe();
        tracing::trace!(queue = %inner.name, item = %description, "dispatching");
        match panic::catch_unwind(AssertUnwindSafe(|| item.dispatch())) {
            Ok(true) => {}
            Ok(false) => break,
            Err(payload) => {
                tracing::error!(
                    queue = %inner.name,
                    item = %description,
                    error = %panic_message(payload.as_ref()),
                    "dispatch failed"
                );
            }
        }
    }
    inner.cancel_leftovers();
    tracing::trace!(queue = %inner.name, "dispatch loop finished");
}

/// Blocks until the head item is due and removes it.
fn next_due(inner: &QueueInner) -> Arc<dyn Deferred> {
    let mut items = inner.items.lock();
    loop {
        let now = Time::now();
        let head_deadline = items.first_key_value().map(|((deadline, _), _)| *deadline);
        match head_deadline {
            Some(deadline) if deadline <= now => {
                if let Some((_, item)) = items.pop_first() {
                    return item;
                }
            }
            Some(deadline) => {
                let wait = deadline.duration_since(now);
                inner.available.wait_for(&mut items, wait);
            }
            None => inner.available.wait(&mut items),
        }
    }
}
