//! Core value types shared by the executors.

pub mod cancel;
pub mod id;
pub mod time;

pub use cancel::{CancelKind, CancelReason};
pub use id::{ExecutorId, Sequence};
pub use time::Time;
