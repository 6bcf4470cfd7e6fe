//! Environment variable and config file support for [`AppConfig`].
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic**: fields set on the returned [`AppConfig`]
//! 2. **Environment variables**: values from `APPEXEC_*` env vars
//! 3. **Config file**: values loaded from a TOML file (requires `config-file` feature)
//! 4. **Defaults**: built-in defaults from [`AppConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `APPEXEC_POOL_MIN_THREADS` | `usize` | `pool.min_threads` |
//! | `APPEXEC_POOL_MAX_THREADS` | `usize` | `pool.max_threads` |
//! | `APPEXEC_POOL_IDLE_TIMEOUT_MS` | `u64` | `pool.idle_timeout` |
//! | `APPEXEC_THREAD_NAME_PREFIX` | `String` | `pool.thread_name_prefix` |
//! | `APPEXEC_PROPAGATE_CONTEXT` | `bool` | `propagation` |
//! | `APPEXEC_MAX_SCHEDULE_DELAY_SECS` | `u64` | `max_schedule_delay` |

use std::time::Duration;

use crate::context::Propagation;
use crate::error::{Error, Result};
use crate::runtime::config::AppConfig;

/// Environment variable name for the pool's minimum thread count.
pub const ENV_POOL_MIN_THREADS: &str = "APPEXEC_POOL_MIN_THREADS";
/// Environment variable name for the pool's maximum thread count.
pub const ENV_POOL_MAX_THREADS: &str = "APPEXEC_POOL_MAX_THREADS";
/// Environment variable name for the pool idle timeout in milliseconds.
pub const ENV_POOL_IDLE_TIMEOUT_MS: &str = "APPEXEC_POOL_IDLE_TIMEOUT_MS";
/// Environment variable name for the pool thread name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "APPEXEC_THREAD_NAME_PREFIX";
/// Environment variable name for the context propagation toggle.
pub const ENV_PROPAGATE_CONTEXT: &str = "APPEXEC_PROPAGATE_CONTEXT";
/// Environment variable name for the maximum schedule delay in seconds.
pub const ENV_MAX_SCHEDULE_DELAY_SECS: &str = "APPEXEC_MAX_SCHEDULE_DELAY_SECS";

/// Apply environment variable overrides to an [`AppConfig`].
///
/// Only variables that are set in the environment are applied.
/// Returns an error if a variable is set but contains an unparseable value.
pub fn apply_env_overrides(config: &mut AppConfig) -> Result<()> {
    if let Some(val) = read_env(ENV_POOL_MIN_THREADS) {
        config.pool.min_threads = parse_usize(ENV_POOL_MIN_THREADS, &val)?;
    }
    if let Some(val) = read_env(ENV_POOL_MAX_THREADS) {
        config.pool.max_threads = parse_usize(ENV_POOL_MAX_THREADS, &val)?;
    }
    if let Some(val) = read_env(ENV_POOL_IDLE_TIMEOUT_MS) {
        config.pool.idle_timeout =
            Duration::from_millis(parse_u64(ENV_POOL_IDLE_TIMEOUT_MS, &val)?);
    }
    if let Some(val) = read_env(ENV_THREAD_NAME_PREFIX) {
        config.pool.thread_name_prefix = val;
    }
    if let Some(val) = read_env(ENV_PROPAGATE_CONTEXT) {
        config.propagation = Propagation::from_enabled(parse_bool(ENV_PROPAGATE_CONTEXT, &val)?);
    }
    if let Some(val) = read_env(ENV_MAX_SCHEDULE_DELAY_SECS) {
        config.max_schedule_delay =
            Duration::from_secs(parse_u64(ENV_MAX_SCHEDULE_DELAY_SECS, &val)?);
    }
    Ok(())
}

/// Read an environment variable, returning `None` if unset.
fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_usize(var_name: &str, val: &str) -> Result<usize> {
    val.trim().parse::<usize>().map_err(|e| {
        Error::invalid_config(format!(
            "invalid value for {var_name}: expected unsigned integer, got {val:?} ({e})"
        ))
    })
}

fn parse_u64(var_name: &str, val: &str) -> Result<u64> {
    val.trim().parse::<u64>().map_err(|e| {
        Error::invalid_config(format!(
            "invalid value for {var_name}: expected u64, got {val:?} ({e})"
        ))
    })
}

fn parse_bool(var_name: &str, val: &str) -> Result<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(Error::invalid_config(format!(
            "invalid value for {var_name}: expected bool (true/false/1/0/yes/no), got {val:?}"
        ))),
    }
}

// =========================================================================
// TOML config file support (feature-gated)
// =========================================================================

/// TOML-deserializable executor configuration.
///
/// ```toml
/// [pool]
/// min_threads = 1
/// max_threads = 64
/// idle_timeout_ms = 30000
/// thread_name_prefix = "myapp-pool"
///
/// [scheduler]
/// propagate_context = true
/// max_schedule_delay_secs = 86400
/// dispatch_thread_name = "myapp-delay-queue"
/// ```
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct AppTomlConfig {
    /// Backend pool settings.
    #[serde(default)]
    pub pool: PoolToml,
    /// Scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerToml,
}

/// Pool section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct PoolToml {
    /// Minimum number of pool threads.
    pub min_threads: Option<usize>,
    /// Maximum number of pool threads.
    pub max_threads: Option<usize>,
    /// Idle timeout in milliseconds.
    pub idle_timeout_ms: Option<u64>,
    /// Name prefix for pool threads.
    pub thread_name_prefix: Option<String>,
}

/// Scheduler section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct SchedulerToml {
    /// Carry submitter context into tasks.
    pub propagate_context: Option<bool>,
    /// Largest accepted scheduling delay in seconds.
    pub max_schedule_delay_secs: Option<u64>,
    /// Name of the Dispatch Thread.
    pub dispatch_thread_name: Option<String>,
}

/// Apply a parsed TOML config to an [`AppConfig`].
///
/// Only fields that are `Some` in the TOML struct override the config.
#[cfg(feature = "config-file")]
pub fn apply_toml_config(config: &mut AppConfig, toml: &AppTomlConfig) {
    if let Some(v) = toml.pool.min_threads {
        config.pool.min_threads = v;
    }
    if let Some(v) = toml.pool.max_threads {
        config.pool.max_threads = v;
    }
    if let Some(v) = toml.pool.idle_timeout_ms {
        config.pool.idle_timeout = Duration::from_millis(v);
    }
    if let Some(ref v) = toml.pool.thread_name_prefix {
        config.pool.thread_name_prefix.clone_from(v);
    }
    if let Some(v) = toml.scheduler.propagate_context {
        config.propagation = Propagation::from_enabled(v);
    }
    if let Some(v) = toml.scheduler.max_schedule_delay_secs {
        config.max_schedule_delay = Duration::from_secs(v);
    }
    if let Some(ref v) = toml.scheduler.dispatch_thread_name {
        config.dispatch_thread_name.clone_from(v);
    }
}

/// Parse a TOML string into an [`AppTomlConfig`].
#[cfg(feature = "config-file")]
pub fn parse_toml_str(toml_str: &str) -> Result<AppTomlConfig> {
    toml::from_str(toml_str)
        .map_err(|e| Error::invalid_config(format!("failed to parse TOML config: {e}")))
}

/// Read and parse a TOML file into an [`AppTomlConfig`].
#[cfg(feature = "config-file")]
pub fn parse_toml_file(path: &std::path::Path) -> Result<AppTomlConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::invalid_config(format!(
            "failed to read config file {}: {e}",
            path.display()
        ))
    })?;
    parse_toml_str(&content)
}

// =========================================================================
// Tests
// =========================================================================
