//! Blocking count-down latch.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Lets threads wait until a counter reaches zero.
///
/// The count only moves down; once it hits zero every current and future
/// waiter is released.
#[derive(Debug)]
pub struct CountDownLatch {
    count: Mutex<usize>,
    zero: Condvar,
}

impl CountDownLatch {
    /// Creates a latch with the given count.
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    /// Decrements the count, releasing waiters when it reaches zero.
    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count == 0 {
            return;
        }
        *count -= 1;
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    /// Current count.
    #[must_use]
    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Blocks until the count reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }

    /// Blocks until the count reaches zero or `timeout` elapses.
    ///
    /// Returns true if the count reached zero.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }

    /// Blocks until the count reaches zero or `deadline` passes.
    #[must_use]
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut count = self.count.lock();
        while *count > 0 {
            if self.zero.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}
