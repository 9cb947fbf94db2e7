//! Monotonic time source for the reactor: a nanosecond-resolution instant
//! type plus the per-reactor clock that stamps it. Grounded on
//! `flux-timing`'s `Nanos`/`Instant` pair (same `quanta`-backed idiom),
//! trimmed to what the timer wheel and keepalive/heartbeat timers need.

use std::ops::{Add, Sub};

use quanta::Clock;

/// A duration or absolute instant expressed in nanoseconds. Used both for
/// deadlines in the timer wheel and for elapsed-time comparisons.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Nanos(pub u64);

impl Nanos {
    pub const ZERO: Nanos = Nanos(0);
    pub const MAX: Nanos = Nanos(u64::MAX);

    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Nanos(ms * 1_000_000)
    }

    #[inline]
    pub const fn from_secs(s: u64) -> Self {
        Nanos(s * 1_000_000_000)
    }

    #[inline]
    pub fn as_millis(&self) -> u64 {
        self.0 / 1_000_000
    }

    #[inline]
    pub fn saturating_sub(self, rhs: Nanos) -> Nanos {
        Nanos(self.0.saturating_sub(rhs.0))
    }

    #[inline]
    pub fn saturating_add(self, rhs: Nanos) -> Nanos {
        Nanos(self.0.saturating_add(rhs.0))
    }
}

impl Add for Nanos {
    type Output = Nanos;
    #[inline]
    fn add(self, rhs: Nanos) -> Nanos {
        Nanos(self.0 + rhs.0)
    }
}

impl Sub for Nanos {
    type Output = Nanos;
    #[inline]
    fn sub(self, rhs: Nanos) -> Nanos {
        Nanos(self.0.saturating_sub(rhs.0))
    }
}

impl From<std::time::Duration> for Nanos {
    #[inline]
    fn from(d: std::time::Duration) -> Self {
        Nanos(d.as_nanos() as u64)
    }
}

impl From<Nanos> for std::time::Duration {
    #[inline]
    fn from(n: Nanos) -> Self {
        std::time::Duration::from_nanos(n.0)
    }
}

/// Monotonic clock owned by a single reactor. Kept as a per-reactor value
/// (rather than the teacher's process-global `OnceCell<Clock>`) so tests can
/// construct independent reactors without sharing clock state, and so a
/// future mock clock can be injected without global mutable state.
#[derive(Clone)]
pub struct MonotonicClock {
    clock: Clock,
    epoch: quanta::Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        let clock = Clock::new();
        let epoch = clock.now();
        Self { clock, epoch }
    }
}

impl MonotonicClock {
    #[inline]
    pub fn now(&self) -> Nanos {
        Nanos(self.clock.now().duration_since(self.epoch).as_nanos() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nanos_arith() {
        assert_eq!(Nanos::from_millis(100).saturating_sub(Nanos::from_millis(150)), Nanos::ZERO);
        assert_eq!(Nanos::from_secs(1).as_millis(), 1000);
    }

    #[test]
    fn clock_monotonic() {
        let clock = MonotonicClock::default();
        let t0 = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let t1 = clock.now();
        assert!(t1 >= t0);
    }
}
