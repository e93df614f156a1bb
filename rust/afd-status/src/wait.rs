//! Bounded polling.
//!
//! Every suspension point in this crate is a fixed-interval poll with an
//! explicit upper bound; nothing blocks indefinitely.

use std::time::{Duration, Instant};

/// The bound elapsed before the condition held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimeout {
    pub waited: Duration,
}

impl std::fmt::Display for WaitTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "wait timeout after {:?}", self.waited)
    }
}

impl std::error::Error for WaitTimeout {}

/// A point in time `bound` from now. A bound too large to represent never
/// expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    start: Instant,
    at: Option<Instant>,
}

impl Deadline {
    pub fn after(bound: Duration) -> Self {
        let start = Instant::now();
        Self {
            start,
            at: start.checked_add(bound),
        }
    }

    /// Time left, or `Duration::MAX` without a deadline.
    pub fn remaining(&self) -> Duration {
        match self.at {
            Some(at) => at.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    #[inline]
    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Call `condition` every `interval` until it yields a value or `bound` has
/// elapsed.
///
/// `condition` always runs at least once. A timeout is only reported once the
/// full bound has passed, never earlier.
pub fn poll_until<T>(
    interval: Duration,
    bound: Duration,
    mut condition: impl FnMut() -> Option<T>,
) -> Result<T, WaitTimeout> {
    let deadline = Deadline::after(bound);

    loop {
        if let Some(value) = condition() {
            return Ok(value);
        }

        let remaining = deadline.remaining();
        if remaining.is_zero() {
            return Err(WaitTimeout {
                waited: deadline.elapsed(),
            });
        }

        std::thread::sleep(interval.min(remaining));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_as_soon_as_condition_holds() {
        let mut calls = 0;
        let got = poll_until(Duration::from_millis(1), Duration::from_secs(5), || {
            calls += 1;
            (calls == 3).then_some(calls)
        });
        assert_eq!(got, Ok(3));
    }

    #[test]
    fn never_times_out_early() {
        let bound = Duration::from_millis(120);
        let err = poll_until(Duration::from_millis(50), bound, || None::<()>).unwrap_err();
        assert!(err.waited >= bound);
    }

    #[test]
    fn unrepresentable_bound_never_expires() {
        let deadline = Deadline::after(Duration::MAX);
        assert!(!deadline.expired());
        assert_eq!(deadline.remaining(), Duration::MAX);

        let mut calls = 0;
        let got = poll_until(Duration::from_millis(1), Duration::from_secs(u64::MAX), || {
            calls += 1;
            (calls == 2).then_some(calls)
        });
        assert_eq!(got, Ok(2));
    }

    #[test]
    fn zero_bound_still_checks_once() {
        assert_eq!(
            poll_until(Duration::from_millis(10), Duration::ZERO, || Some(7)),
            Ok(7)
        );
    }
}
