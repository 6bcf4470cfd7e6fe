//! Process-wide executor set.
//!
//! [`AppExecutors`] owns one managed [`BackendPool`], the shared
//! [`DelayQueue`] with its Dispatch Thread, and a managed
//! [`SchedulingWrapper`] over the pool. Callers obtain bounded and
//! sequential executors from its factories; those share the pool threads
//! but have their own lifecycle.
//!
//! The managed pieces reject caller-initiated shutdown. Only
//! [`AppExecutors::shutdown`] (or dropping a non-global instance) tears
//! them down, in this order: scheduler, delay queue, pool.

use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorKind, Result};
use crate::runtime::backend::{BackendPool, BackendPoolHandle};
use crate::runtime::bounded::BoundedTaskExecutor;
use crate::runtime::config::{AppConfig, ExecutorConfig};
use crate::runtime::delay_queue::DelayQueue;
use crate::runtime::scheduling::{SchedulingOptions, SchedulingWrapper};

static GLOBAL: OnceLock<AppExecutors> = OnceLock::new();

/// The process-wide executors.
pub struct AppExecutors {
    config: AppConfig,
    pool: BackendPool,
    queue: DelayQueue,
    scheduler: SchedulingWrapper,
    shut_down: AtomicBool,
}

impl AppExecutors {
    /// Builds an executor set from `config`.
    pub fn new(mut config: AppConfig) -> Result<Self> {
        config.validate()?;
        let pool = BackendPool::managed(config.pool.clone())?;
        let queue = DelayQueue::start(config.dispatch_thread_name.clone())?;
        let options = SchedulingOptions {
            owns_backend: false,
            managed: true,
            propagation: config.propagation,
            max_delay: config.max_schedule_delay,
        };
        let scheduler = match SchedulingWrapper::new(
            format!("{}-scheduler", config.pool.thread_name_prefix),
            pool.handle(),
            &queue,
            options,
        ) {
            Ok(scheduler) => scheduler,
            Err(e) => {
                queue.shutdown(Duration::from_secs(1));
                return Err(e);
            }
        };
        tracing::info!(
            pool = %config.pool.thread_name_prefix,
            max_threads = config.pool.max_threads,
            propagation = ?config.propagation,
            "application executors started"
        );
        Ok(Self {
            config,
            pool,
            queue,
            scheduler,
            shut_down: AtomicBool::new(false),
        })
    }

    /// The global instance, created from the environment on first use.
    ///
    /// If configuration from the environment is invalid the defaults are
    /// used and the error is logged.
    pub fn global() -> Result<&'static Self> {
        if let Some(app) = GLOBAL.get() {
            return Ok(app);
        }
        let config = AppConfig::from_env().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "invalid executor environment, using defaults");
            AppConfig::default()
        });
        Self::install(config)
    }

    /// Initializes the global instance with an explicit config.
    ///
    /// Fails with [`ErrorKind::InvalidState`] if it already exists.
    pub fn init_global(config: AppConfig) -> Result<&'static Self> {
        if GLOBAL.get().is_some() {
            return Err(Error::new(ErrorKind::InvalidState)
                .with_message("global executors are already initialized"));
        }
        Self::install(config)
    }

    fn install(config: AppConfig) -> Result<&'static Self> {
        let app = Self::new(config)?;
        if let Err(lost) = GLOBAL.set(app) {
            // Another thread won the race; ours is torn down on drop.
            tracing::debug!("global executors initialized concurrently");
            drop(lost);
        }
        GLOBAL
            .get()
            .ok_or_else(|| Error::new(ErrorKind::InvalidState).with_message("global executors missing"))
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Handle to the shared pool.
    #[must_use]
    pub fn pool(&self) -> BackendPoolHandle {
        self.pool.handle()
    }

    /// The shared delay queue.
    #[must_use]
    pub fn delay_queue(&self) -> &DelayQueue {
        &self.queue
    }

    /// The shared scheduler over the pool.
    #[must_use]
    pub fn scheduler(&self) -> &SchedulingWrapper {
        &self.scheduler
    }

    /// A bounded executor over the shared pool.
    pub fn bounded_executor(&self, name: impl Into<String>, max_concurrency: usize) -> Result<BoundedTaskExecutor> {
        self.check_running()?;
        let config = ExecutorConfig::new(name, max_concurrency).with_propagation(self.config.propagation);
        BoundedTaskExecutor::with_config(config, self.pool.handle())
    }

    /// A sequential executor over the shared pool.
    pub fn sequential_executor(&self, name: impl Into<String>) -> Result<BoundedTaskExecutor> {
        self.bounded_executor(name, 1)
    }

    /// A scheduler over a new bounded executor. Shutting the scheduler down
    /// also shuts down its bounded executor.
    pub fn bounded_scheduled_executor(
        &self,
        name: impl Into<String>,
        max_concurrency: usize,
    ) -> Result<SchedulingWrapper> {
        let name = name.into();
        let bounded = self.bounded_executor(name.clone(), max_concurrency)?;
        let options = SchedulingOptions::owning()
            .with_propagation(self.config.propagation)
            .with_max_delay(self.config.max_schedule_delay);
        SchedulingWrapper::new(name, bounded, &self.queue, options)
    }

    /// Human-readable listing of the delay queue.
    #[must_use]
    pub fn dump_pending(&self) -> String {
        self.queue.dump_string()
    }

    /// Returns true once [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stops the scheduler, the Dispatch Thread, and the pool.
    ///
    /// Returns true if everything stopped within `timeout`.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let swept = self.scheduler.shutdown_managed();
        tracing::info!(cancelled = swept.len(), "shutting down application executors");
        drop(swept);

        let queue_stopped = self.queue.shutdown(deadline.saturating_duration_since(Instant::now()));
        let pool_stopped = self
            .pool
            .shutdown_and_wait(deadline.saturating_duration_since(Instant::now()));
        if !(queue_stopped && pool_stopped) {
            tracing::warn!(queue_stopped, pool_stopped, "application executors did not stop in time");
        }
        queue_stopped && pool_stopped
    }

    fn check_running(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::rejected("application executors"));
        }
        Ok(())
    }
}

impl Drop for AppExecutors {
    fn drop(&mut self) {
        self.shutdown(Duration::from_secs(5));
    }
}

impl fmt::Debug for AppExecutors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppExecutors")
            .field("pool_threads", &self.pool.active_threads())
            .field("queued", &self.queue.len())
            .field("shut_down", &self.is_shutdown())
            .finish()
    }
}
