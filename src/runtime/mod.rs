//! Executors, the delay queue, and the process-wide executor set.
//!
//! - [`config`]: Pool, executor, and application configuration
//! - [`env_config`]: Environment variable and TOML overrides
//! - [`task`]: Tasks, result handles, and task states
//! - [`executor`]: The `Executor` / `ExecutorService` traits
//! - [`backend`]: Elastic thread pool that runs everything
//! - [`bounded`]: Admission control on top of any executor
//! - [`deferred`]: Items waiting in the delay queue
//! - [`delay_queue`]: Shared delay queue and its Dispatch Thread
//! - [`scheduling`]: Delayed and fixed-delay scheduling over any executor
//! - [`app`]: Managed process-wide pool, queue, and scheduler
//!
//! # Layering
//!
//! ```text
//! SchedulingWrapper ──offer──▶ DelayQueue ──dispatch──▶ backend
//!         │                                               ▲
//!         └──────────── execute (immediate) ──────────────┘
//!
//! BoundedTaskExecutor ──hand-off (≤ max in flight)──▶ BackendPool
//! ```
//!
//! Task bodies run only on backend threads. The Dispatch Thread moves items
//! from the queue to their backend and never runs user code beyond that.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use appexec::runtime::{AppConfig, AppExecutors, ExecutorExt};
//!
//! let app = AppExecutors::new(AppConfig::default())?;
//! let indexer = app.bounded_executor("indexer", 2)?;
//! let handle = indexer.submit(|| 6 * 7)?;
//! assert_eq!(handle.join(), Ok(42));
//!
//! let later = app.scheduler().schedule(|| "tick", Duration::from_millis(10))?;
//! assert_eq!(later.join(), Ok("tick"));
//! app.shutdown(Duration::from_secs(5));
//! # Ok::<(), appexec::Error>(())
//! ```

pub mod app;
pub mod backend;
pub mod bounded;
pub mod config;
pub mod deferred;
pub mod delay_queue;
pub mod env_config;
pub mod executor;
pub mod scheduling;
pub mod task;

pub use app::AppExecutors;
pub use backend::{BackendPool, BackendPoolHandle};
pub use bounded::BoundedTaskExecutor;
pub use config::{AppConfig, ExecutorConfig, PoolConfig};
pub use deferred::{Period, ScheduledHandle};
pub use delay_queue::{DelayQueue, PendingItem};
pub use executor::{Executor, ExecutorExt, ExecutorService};
pub use scheduling::{SchedulingOptions, SchedulingWrapper, WrapperState};
pub use task::{Cancellable, Task, TaskHandle, TaskState};
