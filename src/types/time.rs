//! Monotonic time used for deadlines.
//!
//! Deadlines are stored as unsigned nanoseconds since a process-wide epoch
//! captured the first time the clock is read. All arithmetic saturates, so a
//! far-future deadline clamps to [`Time::MAX`] instead of wrapping around and
//! sorting ahead of earlier work.

use core::fmt;
use std::ops::Add;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

static EPOCH: OnceLock<Instant> = OnceLock::new();

fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

/// A point on the process-wide monotonic clock.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(u64);

impl Time {
    /// The epoch itself.
    pub const ZERO: Self = Self(0);

    /// The latest representable instant.
    pub const MAX: Self = Self(u64::MAX);

    /// Reads the monotonic clock.
    #[must_use]
    pub fn now() -> Self {
        let elapsed = Instant::now().saturating_duration_since(epoch());
        Self(saturating_nanos(elapsed))
    }

    /// Creates a time from nanoseconds since the epoch.
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Creates a time from milliseconds since the epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Returns nanoseconds since the epoch.
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Adds a duration, saturating at [`Time::MAX`].
    #[must_use]
    pub fn saturating_add(self, delay: Duration) -> Self {
        Self(self.0.saturating_add(saturating_nanos(delay)))
    }

    /// Returns the time elapsed from `earlier` to `self`, or zero if `earlier`
    /// is later.
    #[must_use]
    pub const fn duration_since(self, earlier: Self) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    /// Returns the signed offset of `self` relative to `now`, in nanoseconds.
    ///
    /// Negative values mean the instant is already in the past. Used for
    /// diagnostics only.
    #[must_use]
    pub fn offset_from(self, now: Self) -> i128 {
        i128::from(self.0) - i128::from(now.0)
    }
}

fn saturating_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        self.saturating_add(rhs)
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Time({}ns)", self.0)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis = self.0 / 1_000_000;
        let micros = (self.0 / 1_000) % 1_000;
        write!(f, "{millis}.{micros:03}ms")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic() {
        let a = Time::now();
        std::thread::sleep(Duration::from_millis(2));
        let b = Time::now();
        assert!(b > a);
        assert!(b.duration_since(a) >= Duration::from_millis(2));
    }

    #[test]
    fn far_future_deadline_saturates() {
        let now = Time::now();
        let far = now + Duration::MAX;
        assert_eq!(far, Time::MAX);
        assert!(far > now);
        assert_eq!(Time::MAX + Duration::from_secs(1), Time::MAX);
    }

    #[test]
    fn duration_since_clamps_to_zero() {
        let early = Time::from_millis(5);
        let late = Time::from_millis(9);
        assert_eq!(late.duration_since(early), Duration::from_millis(4));
        assert_eq!(early.duration_since(late), Duration::ZERO);
        assert_eq!(early.offset_from(late), -4_000_000);
    }

    #[test]
    fn display_uses_millis() {
        assert_eq!(Time::from_nanos(1_234_567).to_string(), "1.234ms");
    }
}
