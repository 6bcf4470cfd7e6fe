//! Executor configuration types.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `pool.min_threads` | 0 |
//! | `pool.max_threads` | 256 |
//! | `pool.idle_timeout` | 60 s |
//! | `pool.thread_name_prefix` | `"appexec-pool"` |
//! | `propagation` | `Disabled` |
//! | `max_schedule_delay` | ~100 years |
//! | `dispatch_thread_name` | `"appexec-delay-queue"` |

use core::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::context::Propagation;
use crate::error::{Error, Result};

/// Default idle timeout before retiring threads above `min_threads`.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Default upper bound on backend pool threads.
pub const DEFAULT_MAX_THREADS: usize = 256;
/// Default pool thread name prefix.
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "appexec-pool";
/// Default name of the Dispatch Thread.
pub const DEFAULT_DISPATCH_THREAD_NAME: &str = "appexec-delay-queue";
/// Default upper bound on a single scheduling delay.
pub const DEFAULT_MAX_SCHEDULE_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Largest concurrency limit that fits the packed status counter.
pub const MAX_CONCURRENCY_LIMIT: usize = u32::MAX as usize;

/// Callback run on pool thread start or stop.
pub type ThreadCallback = Arc<dyn Fn() + Send + Sync>;

/// Configuration for the shared backend pool.
#[derive(Clone)]
pub struct PoolConfig {
    /// Threads kept alive while idle.
    pub min_threads: usize,
    /// Maximum concurrent threads.
    pub max_threads: usize,
    /// Idle time before a thread above `min_threads` retires.
    pub idle_timeout: Duration,
    /// Thread name prefix; threads are named `{prefix}-{n}`.
    pub thread_name_prefix: String,
    /// Called on each new pool thread before it takes work.
    pub on_thread_start: Option<ThreadCallback>,
    /// Called on each pool thread just before it exits.
    pub on_thread_stop: Option<ThreadCallback>,
}

impl PoolConfig {
    /// Sets the thread bounds.
    #[must_use]
    pub fn with_threads(mut self, min_threads: usize, max_threads: usize) -> Self {
        self.min_threads = min_threads;
        self.max_threads = max_threads;
        self
    }

    /// Sets the idle timeout.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Sets the thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Registers a thread start callback.
    #[must_use]
    pub fn on_thread_start<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_thread_start = Some(Arc::new(f));
        self
    }

    /// Registers a thread stop callback.
    #[must_use]
    pub fn on_thread_stop<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_thread_stop = Some(Arc::new(f));
        self
    }

    /// Normalize configuration values to safe defaults.
    pub fn normalize(&mut self) {
        if self.max_threads == 0 {
            self.max_threads = 1;
        }
        if self.max_threads < self.min_threads {
            self.max_threads = self.min_threads;
        }
    }

    /// Rejects values that cannot be normalized.
    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout.is_zero() {
            return Err(Error::invalid_config("pool idle_timeout must be non-zero"));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(Error::invalid_config(
                "pool thread_name_prefix must not be empty",
            ));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_threads: 0,
            max_threads: DEFAULT_MAX_THREADS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            on_thread_start: None,
            on_thread_stop: None,
        }
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("min_threads", &self.min_threads)
            .field("max_threads", &self.max_threads)
            .field("idle_timeout", &self.idle_timeout)
            .field("thread_name_prefix", &self.thread_name_prefix)
            .field("on_thread_start", &self.on_thread_start.is_some())
            .field("on_thread_stop", &self.on_thread_stop.is_some())
            .finish()
    }
}

/// Configuration for a single bounded executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Diagnostic name.
    pub name: String,
    /// Maximum number of tasks running at once.
    pub max_concurrency: usize,
    /// Context propagation mode.
    pub propagation: Propagation,
}

impl ExecutorConfig {
    /// Creates a config with propagation disabled.
    #[must_use]
    pub fn new(name: impl Into<String>, max_concurrency: usize) -> Self {
        Self {
            name: name.into(),
            max_concurrency,
            propagation: Propagation::Disabled,
        }
    }

    /// Sets the propagation mode.
    #[must_use]
    pub fn with_propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }

    /// Checks the concurrency limit.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::invalid_config(format!(
                "{}: max_concurrency must be at least 1",
                self.name
            )));
        }
        if self.max_concurrency > MAX_CONCURRENCY_LIMIT {
            return Err(Error::invalid_config(format!(
                "{}: max_concurrency {} exceeds {MAX_CONCURRENCY_LIMIT}",
                self.name, self.max_concurrency
            )));
        }
        Ok(())
    }
}

/// Configuration for the process-wide executor set.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Shared backend pool.
    pub pool: PoolConfig,
    /// Propagation mode of the process-wide scheduler and the default for
    /// executors created through the factories.
    pub propagation: Propagation,
    /// Largest delay accepted by `schedule` calls.
    pub max_schedule_delay: Duration,
    /// Name of the Dispatch Thread.
    pub dispatch_thread_name: String,
}

impl AppConfig {
    /// Defaults overlaid with `APPEXEC_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        super::env_config::apply_env_overrides(&mut config)?;
        Ok(config)
    }

    /// Defaults overlaid with a TOML file, then the environment.
    #[cfg(feature = "config-file")]
    pub fn from_toml_file(path: &std::path::Path) -> Result<Self> {
        let parsed = super::env_config::parse_toml_file(path)?;
        let mut config = Self::default();
        super::env_config::apply_toml_config(&mut config, &parsed);
        super::env_config::apply_env_overrides(&mut config)?;
        Ok(config)
    }

    /// Normalizes the pool and checks the remaining values.
    pub fn validate(&mut self) -> Result<()> {
        self.pool.normalize();
        self.pool.validate()?;
        if self.max_schedule_delay.is_zero() {
            return Err(Error::invalid_config("max_schedule_delay must be non-zero"));
        }
        if self.dispatch_thread_name.is_empty() {
            return Err(Error::invalid_config(
                "dispatch_thread_name must not be empty",
            ));
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            propagation: Propagation::Disabled,
            max_schedule_delay: DEFAULT_MAX_SCHEDULE_DELAY,
            dispatch_thread_name: DEFAULT_DISPATCH_THREAD_NAME.to_string(),
        }
    }
}
