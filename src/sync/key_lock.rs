//! Per-key mutual exclusion.
//!
//! A [`KeyedLockSet`] grants at most one holder per key at a time while
//! unrelated keys proceed independently. Waiting threads park on a shared
//! condition variable and re-check their key whenever any key is released.

use core::fmt;
use std::collections::HashMap;
use std::hash::Hash;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A set of independently lockable keys.
pub struct KeyedLockSet<K> {
    held: Mutex<HashMap<K, ThreadId>>,
    released: Condvar,
}

impl<K> KeyedLockSet<K>
where
    K: Eq + Hash + Clone,
{
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    /// Blocks until `key` is free, then holds it until the guard drops.
    ///
    /// # Panics
    ///
    /// Panics if the current thread already holds `key`. The lock is not
    /// reentrant and waiting would deadlock.
    pub fn lock(&self, key: K) -> KeyGuard<'_, K> {
        let me = thread::current().id();
        let mut held = self.held.lock();
        while let Some(owner) = held.get(&key) {
            assert!(*owner != me, "key is already held by the current thread");
            self.released.wait(&mut held);
        }
        held.insert(key.clone(), me);
        drop(held);
        tracing::trace!("acquired key lock");
        KeyGuard { set: self, key }
    }

    /// Takes `key` if it is free.
    pub fn try_lock(&self, key: K) -> Option<KeyGuard<'_, K>> {
        let mut held = self.held.lock();
        if held.contains_key(&key) {
            return None;
        }
        held.insert(key.clone(), thread::current().id());
        Some(KeyGuard { set: self, key })
    }

    /// Waits up to `timeout` for `key`.
    ///
    /// # Panics
    ///
    /// Panics if the current thread already holds `key`.
    pub fn lock_timeout(&self, key: K, timeout: Duration) -> Option<KeyGuard<'_, K>> {
        let deadline = Instant::now() + timeout;
        let me = thread::current().id();
        let mut held = self.held.lock();
        while let Some(owner) = held.get(&key) {
            assert!(*owner != me, "key is already held by the current thread");
            if self.released.wait_until(&mut held, deadline).timed_out() && held.contains_key(&key) {
                return None;
            }
        }
        held.insert(key.clone(), me);
        Some(KeyGuard { set: self, key })
    }

    /// Returns true if some thread holds `key`.
    #[must_use]
    pub fn is_locked(&self, key: &K) -> bool {
        self.held.lock().contains_key(key)
    }

    /// Number of keys currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    /// Returns true if no key is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.held.lock().is_empty()
    }

    fn release(&self, key: &K) {
        self.held.lock().remove(key);
        self.released.notify_all();
    }
}

impl<K> Default for KeyedLockSet<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> fmt::Debug for KeyedLockSet<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedLockSet")
            .field("held", &self.held.lock().len())
            .finish()
    }
}

/// Holds one key of a [`KeyedLockSet`]; releases it on drop.
pub struct KeyGuard<'a, K>
where
    K: Eq + Hash + Clone,
{
    set: &'a KeyedLockSet<K>,
    key: K,
}

impl<K> KeyGuard<'_, K>
where
    K: Eq + Hash + Clone,
{
    /// The held key.
    #[must_use]
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> Drop for KeyGuard<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        self.set.release(&self.key);
    }
}

impl<K> fmt::Debug for KeyGuard<'_, K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn same_key_is_exclusive() {
        let set = Arc::new(KeyedLockSet::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let set = Arc::clone(&set);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    for _ in 0..20 {
                        let _guard = set.lock("index");
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().expect("worker panicked");
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn different_keys_do_not_block() {
        let set = KeyedLockSet::new();
        let a = set.lock(1_u32);
        let b = set.try_lock(2_u32);
        assert!(b.is_some());
        assert!(set.try_lock(1_u32).is_none());
        assert_eq!(set.len(), 2);
        drop(a);
        assert!(!set.is_locked(&1));
    }

    #[test]
    fn lock_timeout_gives_up() {
        let set = Arc::new(KeyedLockSet::new());
        let _held = set.lock("busy".to_string());
        let other = Arc::clone(&set);
        let acquired = thread::spawn(move || {
            other
                .lock_timeout("busy".to_string(), Duration::from_millis(20))
                .is_some()
        })
        .join()
        .expect("waiter panicked");
        assert!(!acquired);
    }

    #[test]
    fn reentrant_lock_panics() {
        let set = KeyedLockSet::new();
        let _guard = set.lock('k');
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _again = set.lock('k');
        }));
        assert!(result.is_err());
        assert!(set.is_locked(&'k'));
    }
}
