//! Scalar Lamport clock shared by all three algorithms.
//!
//! Grounded on `lamport_mutex.rs`'s `LamportClock = (u32, u8)` and the
//! `Lamport::send` update rule. Request timestamps and clock values share the
//! same `i64` representation as the rest of the crate so that `-1` can stand
//! for "no request" without an `Option` wrapper, matching the original
//! source's bare `int` fields.

use std::cmp::Ordering;

/// A monotone, non-negative logical clock.
///
/// IR2(a): on send, the attached timestamp is the clock value *after* the
/// local tick. IR2(b): on receive, the clock is set to `max(clock, remote) + 1`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LamportClock(i64);

impl LamportClock {
    pub const fn new() -> Self {
        Self(0)
    }

    pub fn value(self) -> i64 {
        self.0
    }

    /// Local event: advance the clock by one and return the new value.
    pub fn tick(&mut self) -> i64 {
        self.0 += 1;
        self.0
    }

    /// Receive rule: `clock <- max(clock, remote) + 1`.
    pub fn observe(&mut self, remote: i64) -> i64 {
        self.0 = self.0.max(remote) + 1;
        self.0
    }
}

/// Sentinel used throughout the wire schema for "no pending request".
pub const NO_REQUEST: i64 = -1;

/// The `(req_time, id)` total order used by the SPQ and Voting priority
/// queues: smaller request time wins; ties break on smaller node id.
pub fn priority_order(a: (i64, u32), b: (i64, u32)) -> Ordering {
    a.cmp(&b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_is_strictly_increasing() {
        let mut clock = LamportClock::new();
        let a = clock.tick();
        let b = clock.tick();
        assert!(b > a);
    }

    #[test]
    fn observe_is_at_least_remote_plus_one() {
        let mut clock = LamportClock::new();
        clock.tick();
        let v = clock.observe(41);
        assert!(v > 41);
        assert!(v > 1);
    }

    #[test]
    fn priority_order_breaks_ties_on_id() {
        assert_eq!(priority_order((5, 2), (5, 1)), Ordering::Greater);
        assert_eq!(priority_order((3, 9), (5, 0)), Ordering::Less);
    }

    proptest::proptest! {
        #[test]
        fn observe_never_decreases(prev in 0i64..10_000, remote in 0i64..10_000) {
            let mut clock = LamportClock::new();
            // drive clock to `prev` via ticks so the invariant is checked against a
            // realistically-reached state rather than a raw field write
            for _ in 0..prev { clock.tick(); }
            let before = clock.value();
            let after = clock.observe(remote);
            proptest::prop_assert!(after > before);
            proptest::prop_assert!(after > remote);
        }
    }
}
