//! Session clock
//!
//! All timestamps inside a session are nanoseconds elapsed since the epoch
//! fixed when the session clock was created. Remote receivers never share this
//! epoch; their playout clock maps it onto their own.

use std::time::{Duration, Instant};

/// Monotonic nanosecond clock anchored at a session epoch
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    epoch: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Nanoseconds since the epoch
    pub fn now_ns(&self) -> u64 {
        self.to_ns(Instant::now())
    }

    /// Convert an instant to nanoseconds since the epoch, saturating at zero
    /// for instants taken before the epoch.
    pub fn to_ns(&self, instant: Instant) -> u64 {
        instant
            .checked_duration_since(self.epoch)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }

    /// Convert a (possibly negative) session time back to an instant
    pub fn to_instant(&self, ns: i64) -> Instant {
        if ns >= 0 {
            self.epoch + Duration::from_nanos(ns as u64)
        } else {
            self.epoch
                .checked_sub(Duration::from_nanos(ns.unsigned_abs()))
                .unwrap_or(self.epoch)
        }
    }

    pub fn epoch(&self) -> Instant {
        self.epoch
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let clock = SessionClock::new();
        let a = clock.now_ns();
        std::thread::sleep(Duration::from_millis(2));
        let b = clock.now_ns();
        assert!(b > a);
        assert!(b - a >= 2_000_000);
    }

    #[test]
    fn test_instant_conversion() {
        let clock = SessionClock::new();
        let at = clock.to_instant(5_000_000);
        assert_eq!(clock.to_ns(at), 5_000_000);
        assert_eq!(clock.to_ns(clock.epoch()), 0);
    }
}
