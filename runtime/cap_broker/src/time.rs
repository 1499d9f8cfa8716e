//! Time base for capability expiry
//!
//! Expiry is absolute. A handle is expired as soon as the registry's clock
//! reads a time at or past its expiry, whatever any cache says.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Point in time on a clock's monotonic time base, in nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Time base origin
    pub const ZERO: Timestamp = Timestamp(0);

    /// Nanoseconds since the time base origin
    #[inline]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Saturating addition of a duration
    pub fn saturating_add(self, duration: Duration) -> Timestamp {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        Timestamp(self.0.saturating_add(nanos))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

/// Absolute expiry of a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Expiry {
    /// Never expires (only revocation invalidates it)
    Never,
    /// Expires once the clock reaches this time
    At(Timestamp),
}

impl Expiry {
    /// Expiry `duration` after `now`
    pub fn after(now: Timestamp, duration: Duration) -> Self {
        Expiry::At(now.saturating_add(duration))
    }

    /// Check whether the expiry has passed at `now`
    #[inline]
    pub fn has_passed(self, now: Timestamp) -> bool {
        match self {
            Expiry::Never => false,
            Expiry::At(at) => now >= at,
        }
    }

    /// The earlier of two expiries
    pub fn min(self, other: Expiry) -> Expiry {
        match (self, other) {
            (Expiry::Never, e) | (e, Expiry::Never) => e,
            (Expiry::At(a), Expiry::At(b)) => Expiry::At(a.min(b)),
        }
    }

    /// Wire representation: `u64::MAX` means never
    pub fn to_raw(self) -> u64 {
        match self {
            Expiry::Never => u64::MAX,
            Expiry::At(at) => at.0,
        }
    }

    /// Inverse of [`Expiry::to_raw`]
    pub fn from_raw(raw: u64) -> Self {
        if raw == u64::MAX {
            Expiry::Never
        } else {
            Expiry::At(Timestamp(raw))
        }
    }
}

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Current time on this clock's time base
    fn now(&self) -> Timestamp;
}

/// Real monotonic clock, origin at construction
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        Timestamp(0).saturating_add(self.origin.elapsed())
    }
}

/// Manually advanced clock for deterministic expiry in tests and simulation
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            nanos: AtomicU64::new(start.0),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        let _ = self
            .nanos
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_add(nanos))
            });
    }

    /// Jump to an absolute time (never backwards)
    pub fn set(&self, at: Timestamp) {
        self.nanos.fetch_max(at.0, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.nanos.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_has_passed() {
        let expiry = Expiry::At(Timestamp(100));
        assert!(!expiry.has_passed(Timestamp(99)));
        assert!(expiry.has_passed(Timestamp(100)));
        assert!(!Expiry::Never.has_passed(Timestamp(u64::MAX)));
    }

    #[test]
    fn test_expiry_min() {
        let a = Expiry::At(Timestamp(10));
        let b = Expiry::At(Timestamp(20));
        assert_eq!(a.min(b), a);
        assert_eq!(Expiry::Never.min(b), b);
        assert_eq!(Expiry::Never.min(Expiry::Never), Expiry::Never);
    }

    #[test]
    fn test_expiry_raw_roundtrip() {
        assert_eq!(Expiry::from_raw(Expiry::Never.to_raw()), Expiry::Never);
        let at = Expiry::At(Timestamp(1234));
        assert_eq!(Expiry::from_raw(at.to_raw()), at);
    }

    #[test]
    fn test_manual_clock_never_goes_backwards() {
        let clock = ManualClock::new(Timestamp(50));
        clock.advance(Duration::from_nanos(25));
        assert_eq!(clock.now(), Timestamp(75));
        clock.set(Timestamp(10));
        assert_eq!(clock.now(), Timestamp(75));
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        std::thread::sleep(Duration::from_millis(1));
        assert!(clock.now() > a);
    }
}
