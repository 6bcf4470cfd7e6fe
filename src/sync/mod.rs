//! Blocking synchronization helpers.
//!
//! - [`CountDownLatch`]: wait until a counter reaches zero
//! - [`KeyedLockSet`]: mutual exclusion per key

mod key_lock;
mod latch;

pub use key_lock::{KeyGuard, KeyedLockSet};
pub use latch::CountDownLatch;
