//! Shared, dynamically sized backend thread pool.
//!
//! Every bounded executor and every scheduling wrapper ultimately hands its
//! work to a pool like this one. The pool supports:
//!
//! - **Capacity management**: threads are spawned lazily up to
//!   `max_threads`; threads above `min_threads` retire after `idle_timeout`
//! - **Isolation**: a panicking task is logged and never kills its worker
//! - **Shutdown**: graceful drain, or `shutdown_now` returning the queue
//! - **Managed mode**: the process-wide pool rejects resizing and shutdown
//!   from callers that do not own it
//!
//! # Thread Lifecycle
//!
//! Threads are named `{prefix}-{n}`. The optional start and stop callbacks
//! run on the new thread itself, before it takes work and after it leaves
//! the worker loop.
//!
//! Idle workers re-check the queue while holding the park mutex, and
//! submitters notify while holding it, so a task pushed between a worker's
//! last poll and its wait cannot be missed.

use core::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, ErrorKind, Result};
use crate::runtime::config::{PoolConfig, ThreadCallback};
use crate::runtime::executor::{Executor, ExecutorService};
use crate::runtime::task::Task;
use crate::types::CancelReason;

struct PoolInner {
    /// Thread name prefix, also used as the pool name in logs.
    name: String,
    min_threads: usize,
    max_threads: AtomicUsize,
    /// Threads alive or reserved for spawning.
    active_threads: AtomicUsize,
    /// Threads currently executing a task.
    busy_threads: AtomicUsize,
    pending_count: AtomicUsize,
    next_thread_id: AtomicUsize,
    queue: SegQueue<Task>,
    shutdown: AtomicBool,
    managed: bool,
    condvar: Condvar,
    mutex: Mutex<()>,
    idle_timeout: Duration,
    on_thread_start: Option<ThreadCallback>,
    on_thread_stop: Option<ThreadCallback>,
    thread_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolInner {
    fn execute(self: &Arc<Self>, task: Task) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            tracing::warn!(executor = %self.name, task = %task.label(), "rejected task after shutdown");
            return Err(Error::rejected(&self.name));
        }
        tracing::trace!(executor = %self.name, task = %task.label(), "queued task");
        self.queue.push(task);
        self.pending_count.fetch_add(1, Ordering::SeqCst);
        self.maybe_spawn_thread();
        self.notify_one();
        Ok(())
    }

    /// Spawns a thread if queued work outnumbers idle threads.
    fn maybe_spawn_thread(self: &Arc<Self>) {
        let max = self.max_threads.load(Ordering::Acquire);
        let reserved = self
            .active_threads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                let idle = active.saturating_sub(self.busy_threads.load(Ordering::SeqCst));
                let pending = self.pending_count.load(Ordering::SeqCst);
                (active < max && pending > idle).then_some(active + 1)
            })
            .is_ok();
        if reserved {
            // Queued work is picked up by the next successful spawn.
            let _ = self.spawn_reserved_thread();
        }
    }

    /// Spawns a worker for an already reserved `active_threads` slot.
    fn spawn_reserved_thread(self: &Arc<Self>) -> Result<()> {
        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{id}", self.name);
        let inner = Arc::clone(self);
        match thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_main(&inner))
        {
            Ok(handle) => {
                let mut handles = self.thread_handles.lock();
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
                tracing::debug!(executor = %self.name, thread = %name, "spawned pool thread");
                Ok(())
            }
            Err(e) => {
                self.active_threads.fetch_sub(1, Ordering::SeqCst);
                tracing::error!(executor = %self.name, thread = %name, error = %e, "failed to spawn pool thread");
                Err(Error::new(ErrorKind::ThreadSpawn).with_message(format!("{name}: {e}")))
            }
        }
    }

    /// Gives up one thread slot if the pool stays at or above `min_threads`.
    fn try_retire(&self) -> bool {
        self.active_threads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active > self.min_threads).then(|| active - 1)
            })
            .is_ok()
    }

    fn begin_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            tracing::debug!(executor = %self.name, "pool shutdown started");
        }
        self.notify_all();
    }

    fn drain_cancelled(&self) -> Vec<Task> {
        let reason = CancelReason::shutdown();
        let mut drained = Vec::new();
        while let Some(task) = self.queue.pop() {
            self.pending_count.fetch_sub(1, Ordering::SeqCst);
            task.cancel(&reason);
            drained.push(task);
        }
        drained
    }

    fn is_terminated(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
            && self.active_threads.load(Ordering::Acquire) == 0
            && self.queue.is_empty()
    }

    fn wait_terminated(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_terminated() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(executor = %self.name, ?timeout, "pool termination wait timed out");
                return false;
            }
            // Wake any waiting threads so they notice the shutdown flag
            self.notify_all();
            thread::sleep(Duration::from_millis(5).min(remaining));
        }
        true
    }

    fn check_unmanaged(&self, operation: &str) -> Result<()> {
        if self.managed {
            tracing::warn!(executor = %self.name, operation, "rejected lifecycle call on managed pool");
            return Err(Error::managed("backend pool", operation));
        }
        Ok(())
    }

    fn notify_one(&self) {
        let _guard = self.mutex.lock();
        self.condvar.notify_one();
    }

    fn notify_all(&self) {
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }
}

fn worker_main(inner: &PoolInner) {
    if let Some(callback) = &inner.on_thread_start {
        callback();
    }

    let retired = worker_loop(inner);

    if let Some(callback) = &inner.on_thread_stop {
        callback();
    }
    if !retired {
        inner.active_threads.fetch_sub(1, Ordering::SeqCst);
    }
    tracing::debug!(executor = %inner.name, retired, "pool thread exiting");
}

/// Returns true if the thread retired for idleness and already gave up its
/// slot in `active_threads`.
fn worker_loop(inner: &PoolInner) -> bool {
    loop {
        if let Some(task) = inner.queue.pop() {
            inner.pending_count.fetch_sub(1, Ordering::SeqCst);
            inner.busy_threads.fetch_add(1, Ordering::SeqCst);
            let _ = task.run_catching();
            inner.busy_threads.fetch_sub(1, Ordering::SeqCst);
            continue;
        }

        if inner.shutdown.load(Ordering::Acquire) {
            return false;
        }

        let mut guard = inner.mutex.lock();
        if !inner.queue.is_empty() || inner.shutdown.load(Ordering::Acquire) {
            continue;
        }

        if inner.active_threads.load(Ordering::SeqCst) > inner.min_threads {
            let timed_out = inner
                .condvar
                .wait_for(&mut guard, inner.idle_timeout)
                .timed_out();
            if timed_out && inner.queue.is_empty() && inner.try_retire() {
                // A submitter that saw this thread as idle may have skipped
                // spawning; take the slot back if work arrived meanwhile.
                if inner.queue.is_empty() {
                    return true;
                }
                inner.active_threads.fetch_add(1, Ordering::SeqCst);
            }
        } else {
            inner.condvar.wait(&mut guard);
        }
    }
}

/// Cloneable handle to a [`BackendPool`].
#[derive(Clone)]
pub struct BackendPoolHandle {
    inner: Arc<PoolInner>,
}

impl BackendPoolHandle {
    /// Returns the number of queued tasks.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending_count.load(Ordering::Relaxed)
    }

    /// Returns the number of live threads.
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.inner.active_threads.load(Ordering::Relaxed)
    }

    /// Returns the number of threads currently executing work.
    #[must_use]
    pub fn busy_threads(&self) -> usize {
        self.inner.busy_threads.load(Ordering::Relaxed)
    }

    /// Returns the thread limit.
    #[must_use]
    pub fn max_threads(&self) -> usize {
        self.inner.max_threads.load(Ordering::Relaxed)
    }

    /// Returns the number of threads kept alive while idle.
    #[must_use]
    pub fn min_threads(&self) -> usize {
        self.inner.min_threads
    }

    /// Returns true for the process-wide pool.
    #[must_use]
    pub fn is_managed(&self) -> bool {
        self.inner.managed
    }

    /// Changes the thread limit.
    ///
    /// Fails with [`ErrorKind::ManagedPool`] on the process-wide pool.
    pub fn set_max_threads(&self, max_threads: usize) -> Result<()> {
        self.inner.check_unmanaged("set_max_threads")?;
        if max_threads == 0 {
            return Err(Error::invalid_config("max_threads must be at least 1"));
        }
        let max_threads = max_threads.max(self.inner.min_threads);
        self.inner.max_threads.store(max_threads, Ordering::Release);
        tracing::debug!(executor = %self.inner.name, max_threads, "pool resized");
        Ok(())
    }

    /// Returns true if both handles refer to the same pool.
    #[must_use]
    pub fn same_pool(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Executor for BackendPoolHandle {
    fn execute(&self, task: Task) -> Result<()> {
        self.inner.execute(task)
    }

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn instance_key(&self) -> Option<usize> {
        Some(Arc::as_ptr(&self.inner) as usize)
    }
}

impl ExecutorService for BackendPoolHandle {
    fn shutdown(&self) -> Result<()> {
        self.inner.check_unmanaged("shutdown")?;
        self.inner.begin_shutdown();
        Ok(())
    }

    fn shutdown_now(&self) -> Result<Vec<Task>> {
        self.inner.check_unmanaged("shutdown_now")?;
        self.inner.begin_shutdown();
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
            return Err(Error::new(ErrorKind::InvalidState)
                .with_message(format!("{} must be shut down before awaiting termination", self.inner.name)));
        }
        Ok(self.inner.wait_terminated(timeout))
    }
}

impl fmt::Debug for BackendPoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendPoolHandle")
            .field("name", &self.inner.name)
            .field("active_threads", &self.active_threads())
            .field("pending_tasks", &self.pending_count())
            .finish()
    }
}

/// Owner of a backend thread pool.
///
/// Dropping the owner shuts the pool down and waits briefly for its threads.
pub struct BackendPool {
    handle: BackendPoolHandle,
}

impl BackendPool {
    /// Creates a pool owned by the caller.
    pub fn new(config: PoolConfig) -> Result<Self> {
        Self::build(config, false)
    }

    /// Creates the process-wide pool. Lifecycle calls through
    /// [`ExecutorService`] and resizing fail with
    /// [`ErrorKind::ManagedPool`]; only the owner can tear it down.
    pub fn managed(config: PoolConfig) -> Result<Self> {
        Self::build(config, true)
    }

    /// Creates an unmanaged pool with the given thread bounds and defaults
    /// for everything else.
    pub fn with_threads(min_threads: usize, max_threads: usize) -> Result<Self> {
        Self::new(PoolConfig::default().with_threads(min_threads, max_threads))
    }

    fn build(mut config: PoolConfig, managed: bool) -> Result<Self> {
        config.normalize();
        config.validate()?;

        let inner = Arc::new(PoolInner {
            name: config.thread_name_prefix,
            min_threads: config.min_threads,
            max_threads: AtomicUsize::new(config.max_threads),
            active_threads: AtomicUsize::new(0),
            busy_threads: AtomicUsize::new(0),
            pending_count: AtomicUsize::new(0),
            next_thread_id: AtomicUsize::new(0),
            queue: SegQueue::new(),
            shutdown: AtomicBool::new(false),
            managed,
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
            idle_timeout: config.idle_timeout,
            on_thread_start: config.on_thread_start,
            on_thread_stop: config.on_thread_stop,
            thread_handles: Mutex::new(Vec::with_capacity(config.min_threads)),
        });

        let pool = Self {
            handle: BackendPoolHandle { inner },
        };

        // Spawn minimum threads eagerly
        for _ in 0..config.min_threads {
            pool.handle.inner.active_threads.fetch_add(1, Ordering::SeqCst);
            pool.handle.inner.spawn_reserved_thread()?;
        }

        tracing::debug!(
            executor = %pool.handle.inner.name,
            min_threads = config.min_threads,
            max_threads = config.max_threads,
            managed,
            "backend pool created"
        );
        Ok(pool)
    }

    /// Returns a cloneable handle to this pool.
    #[must_use]
    pub fn handle(&self) -> BackendPoolHandle {
        self.handle.clone()
    }

    /// Returns the number of queued tasks.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.handle.pending_count()
    }

    /// Returns the number of live threads.
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.handle.active_threads()
    }

    /// Returns the number of threads currently executing work.
    #[must_use]
    pub fn busy_threads(&self) -> usize {
        self.handle.busy_threads()
    }

    /// Shuts down and waits for all threads to exit.
    ///
    /// This is the owner's teardown and works on managed pools too.
    /// Returns `true` if all threads exited before `timeout`.
    pub fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        let inner = &self.handle.inner;
        inner.begin_shutdown();
        if !inner.wait_terminated(timeout) {
            return false;
        }

        // All threads have left the worker loop; join the handles to clean up
        let handles: Vec<_> = inner.thread_handles.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        tracing::debug!(executor = %inner.name, "backend pool terminated");
        true
    }
}

impl Executor for BackendPool {
    fn execute(&self, task: Task) -> Result<()> {
        self.handle.execute(task)
    }

    fn name(&self) -> &str {
        self.handle.name()
    }

    fn instance_key(&self) -> Option<usize> {
        self.handle.instance_key()
    }
}

impl ExecutorService for BackendPool {
    fn shutdown(&self) -> Result<()> {
        self.handle.shutdown()
    }

    fn shutdown_now(&self) -> Result<Vec<Task>> {
        self.handle.shutdown_now()
    }

    fn is_shutdown(&self) -> bool {
        self.handle.is_shutdown()
    }

    fn is_terminated(&self) -> bool {
        self.handle.is_terminated()
    }

    fn await_termination(&self, timeout: Duration) -> Result<bool> {
        self.handle.await_termination(timeout)
    }
}

impl Drop for BackendPool {
    fn drop(&mut self) {
        // Give threads a chance to exit gracefully
        let _ = self.shutdown_and_wait(Duration::from_secs(5));
    }
}

impl fmt::Debug for BackendPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = &self.handle.inner;
        f.debug_struct("BackendPool")
            .field("name", &inner.name)
            .field("min_threads", &inner.min_threads)
            .field("max_threads", &inner.max_threads.load(Ordering::Relaxed))
            .field("active_threads", &self.active_threads())
            .field("pending_tasks", &self.pending_count())
            .field("managed", &inner.managed)
            .finish()
    }
}
