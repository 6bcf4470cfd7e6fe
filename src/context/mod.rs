//! Context propagation and cooperative cancellation.
//!
//! - [`CancelToken`]: tree-structured cancellation flag
//! - [`ExecutionContext`]: per-thread ambient values plus a token
//! - [`Propagation`]: per-executor switch that captures the submitter's
//!   context and restores it on the worker
//! - [`checkpoint`]: cooperative cancellation point for task bodies

pub mod propagation;
pub mod token;

pub use propagation::{
    check, checkpoint, current_token, is_cancelled, ContextGuard, ExecutionContext, Propagation,
};
pub use token::CancelToken;
