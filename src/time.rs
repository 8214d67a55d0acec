//! Monotonic timestamps used by timers, sleeps and timeouts.
//!
//! Mirrors the shape of the teacher's `clock`/`fiber` time helpers (wall vs.
//! monotonic, seconds vs. sub-second precision) but is backed entirely by
//! [`std::time::Instant`], since there is no external runtime clock to query
//! here.
//!
//! See also:
//! - [`crate::scheduler`] for how [`Deadline`] feeds the event manager's wait.

use std::time::{Duration, Instant};

/// A duration long enough to stand in for "no timeout" without special-casing
/// `Option` everywhere a timeout is threaded through. Matches the teacher's
/// `clock::INFINITY` / `TIMEOUT_INFINITY` convention.
pub const INFINITY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// A point in monotonic time, relative to an unspecified epoch fixed at
/// process start. Two `Deadline`s are only meaningfully comparable within the
/// same process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    /// The current instant.
    #[inline]
    pub fn now() -> Self {
        Deadline(Instant::now())
    }

    /// A deadline `d` in the future (or past, if `d` is `Duration::ZERO`).
    #[inline]
    pub fn after(d: Duration) -> Self {
        Deadline(Instant::now() + d)
    }

    /// `true` once [`Deadline::now`] would be `>= self`.
    #[inline]
    pub fn has_elapsed(&self) -> bool {
        Instant::now() >= self.0
    }

    /// Time remaining until this deadline, or `Duration::ZERO` if already
    /// elapsed. Never panics on an already-past deadline (unlike naive
    /// `Instant` subtraction).
    #[inline]
    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    #[inline]
    pub fn checked_add(&self, d: Duration) -> Option<Self> {
        self.0.checked_add(d).map(Deadline)
    }
}

impl std::ops::Add<Duration> for Deadline {
    type Output = Deadline;

    fn add(self, rhs: Duration) -> Deadline {
        Deadline(self.0 + rhs)
    }
}

impl std::ops::Sub for Deadline {
    type Output = Duration;

    fn sub(self, rhs: Deadline) -> Duration {
        self.0.saturating_duration_since(rhs.0)
    }
}

/// Returns the earliest of two optional deadlines, treating `None` as "no
/// deadline" (i.e. the larger of the two).
pub(crate) fn earliest(a: Option<Deadline>, b: Option<Deadline>) -> Option<Deadline> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_orders_by_time() {
        let a = Deadline::now();
        let b = a + Duration::from_millis(10);
        assert!(a < b);
        assert_eq!(b - a, Duration::from_millis(10));
    }

    #[test]
    fn earliest_picks_the_sooner_one() {
        let a = Deadline::now();
        let b = a + Duration::from_secs(1);
        assert_eq!(earliest(Some(a), Some(b)), Some(a));
        assert_eq!(earliest(None, Some(b)), Some(b));
        assert_eq!(earliest(None, None), None);
    }

    #[test]
    fn past_deadline_has_elapsed_and_no_remaining() {
        let d = Deadline::now();
        std::thread::sleep(Duration::from_millis(5));
        assert!(d.has_elapsed());
        assert_eq!(d.remaining(), Duration::ZERO);
    }
}
