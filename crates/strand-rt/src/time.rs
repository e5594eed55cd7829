//! Monotonic timestamps for timers and I/O deadlines.
//!
//! The reactor's timer fd is armed with `TFD_TIMER_ABSTIME` against
//! `CLOCK_MONOTONIC`, so scheduled times must be absolute readings of that
//! clock. `std::time::Instant` is opaque and cannot be converted to a
//! `timespec`, hence this thin newtype over the raw clock.

use std::ops::{Add, Sub};
use std::time::Duration;

// ---------------------------------------------------------------------------
// MonoTime
// ---------------------------------------------------------------------------

/// An absolute reading of `CLOCK_MONOTONIC`, stored as nanoseconds.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct MonoTime(u64);

impl MonoTime {
    /// Read the current monotonic time.
    pub fn now() -> Self {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // clock_gettime on CLOCK_MONOTONIC cannot fail with a valid pointer.
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        MonoTime(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
    }

    /// Elapsed time since `earlier`, saturating to zero.
    pub fn since(self, earlier: MonoTime) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    /// Time remaining until `self`, measured from now; zero if already past.
    pub fn until(self) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(MonoTime::now().0))
    }

    /// Whether this instant is at or before the current time.
    pub fn is_past(self) -> bool {
        self <= MonoTime::now()
    }

    /// Convert to a `timespec` suitable for `TFD_TIMER_ABSTIME`.
    ///
    /// A zero `itimerspec` value disarms a timer fd, so a `MonoTime` of 0
    /// (only possible immediately after boot) is nudged by one nanosecond.
    pub fn to_timespec(self) -> libc::timespec {
        let ns = self.0.max(1);
        libc::timespec {
            tv_sec: (ns / 1_000_000_000) as libc::time_t,
            tv_nsec: (ns % 1_000_000_000) as libc::c_long,
        }
    }

    /// Raw nanosecond value, used as an ordering key.
    pub fn as_nanos(self) -> u64 {
        self.0
    }

    /// Rebuild from a raw nanosecond value produced by [`MonoTime::as_nanos`].
    pub fn from_nanos(nanos: u64) -> MonoTime {
        MonoTime(nanos)
    }
}

impl Add<Duration> for MonoTime {
    type Output = MonoTime;

    fn add(self, dur: Duration) -> MonoTime {
        MonoTime(self.0.saturating_add(dur.as_nanos() as u64))
    }
}

impl Sub<Duration> for MonoTime {
    type Output = MonoTime;

    fn sub(self, dur: Duration) -> MonoTime {
        MonoTime(self.0.saturating_sub(dur.as_nanos() as u64))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotonic() {
        let a = MonoTime::now();
        let b = MonoTime::now();
        assert!(b >= a);
    }

    #[test]
    fn test_add_and_since() {
        let a = MonoTime::now();
        let b = a + Duration::from_millis(250);
        assert_eq!(b.since(a), Duration::from_millis(250));
        // Saturating: earlier.since(later) is zero, never negative.
        assert_eq!(a.since(b), Duration::ZERO);
    }

    #[test]
    fn test_until_past_time_is_zero() {
        let past = MonoTime::now() - Duration::from_secs(5);
        assert_eq!(past.until(), Duration::ZERO);
        assert!(past.is_past());
    }

    #[test]
    fn test_timespec_roundtrip() {
        let t = MonoTime::now();
        let ts = t.to_timespec();
        let back = ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64;
        assert_eq!(back, t.as_nanos());
    }
}
