//! Time sources
//!
//! Calls are stamped with both wall-clock time (for display and call logs)
//! and monotonic time (for durations). Durations never read the wall clock.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Wall-clock and monotonic time source
pub trait Clock: Send + Sync {
    /// Current wall-clock time
    fn wall_now(&self) -> DateTime<Utc>;

    /// Monotonic time elapsed since the clock's origin
    fn monotonic_now(&self) -> Duration;
}

/// Clock backed by the operating system
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock whose monotonic origin is now
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn wall_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Manually driven clock
///
/// Wall time and monotonic time move independently, so tests can perturb
/// the wall clock without touching durations.
#[derive(Debug)]
pub struct ManualClock {
    inner: Mutex<(DateTime<Utc>, Duration)>,
}

impl ManualClock {
    /// Create a clock frozen at `wall` with a zero monotonic reading
    #[must_use]
    pub fn new(wall: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new((wall, Duration::ZERO)),
        }
    }

    /// Advance both wall and monotonic time
    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock();
        inner.1 += by;
        if let Ok(delta) = chrono::Duration::from_std(by) {
            inner.0 += delta;
        }
    }

    /// Move only the wall clock, as a user or network time update would
    pub fn set_wall(&self, wall: DateTime<Utc>) {
        self.inner.lock().0 = wall;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl Clock for ManualClock {
    fn wall_now(&self) -> DateTime<Utc> {
        self.inner.lock().0
    }

    fn monotonic_now(&self) -> Duration {
        self.inner.lock().1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_wall_jump_leaves_monotonic_alone() {
        let clock = ManualClock::default();
        clock.advance(Duration::from_secs(5));
        clock.set_wall(DateTime::<Utc>::UNIX_EPOCH);

        assert_eq!(clock.monotonic_now(), Duration::from_secs(5));
        assert_eq!(clock.wall_now(), DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let first = clock.monotonic_now();
        let second = clock.monotonic_now();
        assert!(second >= first);
    }
}
