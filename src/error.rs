//! Error types and error handling strategy.
//!
//! Errors fall into a small taxonomy:
//!
//! - **Rejection**: work submitted to an executor that has been shut down.
//!   Rejections are always reported to the caller and never dropped silently.
//! - **Invariant**: programmer errors detected at call time, such as a zero
//!   concurrency limit, an out-of-range delay, fixed-rate scheduling, or
//!   wrapping the same backend twice.
//! - **ShutdownRace**: attempts to reconfigure or tear down a process-wide
//!   managed pool whose lifecycle the caller does not own.
//! - **Timeout**: a bounded wait ran out of time.
//! - **Internal**: the operating system refused a resource (thread spawn).
//!
//! Failures inside task bodies are *not* `Error`s. They are caught at the
//! execution boundary, logged, and surfaced through [`TaskError`] on the
//! task's handle.

use core::fmt;

use crate::types::CancelReason;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The executor is shut down and no longer accepts work.
    Rejected,
    /// The requested operation is deliberately not supported.
    Unsupported,
    /// Configuration values are invalid.
    InvalidConfig,
    /// Scheduling delay exceeds the configured maximum.
    DelayOutOfRange,
    /// The backend is already wrapped by a scheduling wrapper on this queue.
    AlreadyScheduled,
    /// The operation is not valid in the current lifecycle state.
    InvalidState,
    /// The target is a managed process-wide pool and cannot be reconfigured.
    ManagedPool,
    /// A bounded wait elapsed.
    Timeout,
    /// A thread could not be spawned.
    ThreadSpawn,
}

/// High-level error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Submission refused after shutdown.
    Rejection,
    /// Programmer error detected at call time.
    Invariant,
    /// Lifecycle violation against a managed pool.
    ShutdownRace,
    /// Bounded wait elapsed.
    Timeout,
    /// Resource failure inside the executor machinery.
    Internal,
}

impl ErrorKind {
    /// Returns the error category for this kind.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Rejected => ErrorCategory::Rejection,
            Self::Unsupported
            | Self::InvalidConfig
            | Self::DelayOutOfRange
            | Self::AlreadyScheduled
            | Self::InvalidState => ErrorCategory::Invariant,
            Self::ManagedPool => ErrorCategory::ShutdownRace,
            Self::Timeout => ErrorCategory::Timeout,
            Self::ThreadSpawn => ErrorCategory::Internal,
        }
    }
}

/// The main error type for executor operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns the message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Returns true if the error is a rejected submission.
    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        matches!(self.kind, ErrorKind::Rejected)
    }

    /// Returns true if a bounded wait elapsed.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }

    /// A submission to `executor` was refused because it is shut down.
    #[must_use]
    pub fn rejected(executor: &str) -> Self {
        Self::new(ErrorKind::Rejected).with_message(format!("{executor} is shut down"))
    }

    /// Fixed-rate scheduling was requested.
    #[must_use]
    pub fn fixed_rate_unsupported() -> Self {
        Self::new(ErrorKind::Unsupported).with_message(
            "fixed-rate scheduling is not supported because it misbehaves across \
             process suspension; use schedule_with_fixed_delay instead",
        )
    }

    /// A configuration value is invalid.
    #[must_use]
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig).with_message(msg)
    }

    /// A managed pool rejected a lifecycle or sizing call.
    #[must_use]
    pub fn managed(what: &str, operation: &str) -> Self {
        Self::new(ErrorKind::ManagedPool).with_message(format!(
            "{operation} is not allowed on the managed {what}; its lifecycle belongs to the process"
        ))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

/// Marker payload for cooperative cancellation.
///
/// Task bodies that observe cancellation through
/// [`checkpoint`](crate::context::checkpoint) unwind with this payload. The
/// executors treat it as expected control flow rather than a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancelled {
    /// The reason for cancellation.
    pub reason: CancelReason,
}

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cancelled ({})", self.reason)
    }
}

impl std::error::Error for Cancelled {}

/// Outcome error of a submitted or scheduled task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The task was cancelled before or while running.
    #[error("task cancelled: {0}")]
    Cancelled(CancelReason),
    /// The task body panicked.
    #[error("task panicked: {message}")]
    Panicked {
        /// Panic message, if the payload was a string.
        message: String,
    },
}

impl TaskError {
    /// Returns true if the task was cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// A specialized Result type for executor operations.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = Error::rejected("indexer");
        assert_eq!(err.to_string(), "Rejected: indexer is shut down");
        assert!(err.is_rejected());
        assert_eq!(err.category(), ErrorCategory::Rejection);
    }

    #[test]
    fn categories_follow_taxonomy() {
        assert_eq!(
            ErrorKind::DelayOutOfRange.category(),
            ErrorCategory::Invariant
        );
        assert_eq!(
            ErrorKind::AlreadyScheduled.category(),
            ErrorCategory::Invariant
        );
        assert_eq!(
            ErrorKind::ManagedPool.category(),
            ErrorCategory::ShutdownRace
        );
        assert_eq!(ErrorKind::Timeout.category(), ErrorCategory::Timeout);
    }

    #[test]
    fn fixed_rate_message_points_to_fixed_delay() {
        let err = Error::fixed_rate_unsupported();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert!(err.message().unwrap().contains("schedule_with_fixed_delay"));
    }

    #[test]
    fn task_error_display() {
        let err = TaskError::Panicked {
            message: "boom".into(),
        };
        assert_eq!(err.to_string(), "task panicked: boom");
        assert!(TaskError::Cancelled(CancelReason::shutdown()).is_cancelled());
    }
}
