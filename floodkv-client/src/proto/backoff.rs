//! Exponential backoff as a plain value, polled by the schedulers.

use std::time::{Duration, Instant};

/// Exponential-step retry budget.
///
/// The backoff keeps no timers of its own: callers report errors and
/// successes and poll [`ExpBackoff::can_try_now`] with an explicit `now`.
/// Each reported error doubles the wait, bounded by `[initial, max]`; a
/// reported success resets to the fresh state where the next attempt is
/// allowed immediately.
#[derive(Clone, Debug)]
pub struct ExpBackoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
    deadline: Option<Instant>,
}

impl ExpBackoff {
    /// A fresh backoff with the given bounds. `can_try_now` is true until
    /// the first reported error.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: None,
            deadline: None,
        }
    }

    /// Whether an attempt is allowed at `now`.
    pub fn can_try_now(&self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) => now >= deadline,
            None => true,
        }
    }

    /// Record a (possibly speculative) attempt and arm the next retry
    /// window: `initial` after the first error, doubling up to `max`.
    pub fn report_error(&mut self, now: Instant) {
        let next = match self.current {
            None => self.initial,
            Some(current) => (current * 2).min(self.max),
        };
        self.current = Some(next);
        self.deadline = Some(now + next);
    }

    /// Reset to the fresh state.
    pub fn report_success(&mut self) {
        self.current = None;
        self.deadline = None;
    }

    /// Time left until the next attempt is allowed. Zero when an attempt is
    /// allowed already.
    pub fn time_until_retry(&self, now: Instant) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn fresh_backoff_allows_immediate_try() {
        let backoff = ExpBackoff::new(4 * MS, 8192 * MS);
        let now = Instant::now();
        assert!(backoff.can_try_now(now));
        assert_eq!(backoff.time_until_retry(now), Duration::ZERO);
    }

    #[test]
    fn errors_double_until_max() {
        let mut backoff = ExpBackoff::new(4 * MS, 20 * MS);
        let now = Instant::now();

        backoff.report_error(now);
        assert!(!backoff.can_try_now(now));
        assert_eq!(backoff.time_until_retry(now), 4 * MS);

        backoff.report_error(now);
        assert_eq!(backoff.time_until_retry(now), 8 * MS);
        backoff.report_error(now);
        assert_eq!(backoff.time_until_retry(now), 16 * MS);
        backoff.report_error(now);
        assert_eq!(backoff.time_until_retry(now), 20 * MS);
        backoff.report_error(now);
        assert_eq!(backoff.time_until_retry(now), 20 * MS);
    }

    #[test]
    fn deadline_elapses() {
        let mut backoff = ExpBackoff::new(4 * MS, 8192 * MS);
        let now = Instant::now();
        backoff.report_error(now);
        assert!(!backoff.can_try_now(now));
        assert!(backoff.can_try_now(now + 4 * MS));
        assert_eq!(backoff.time_until_retry(now + 10 * MS), Duration::ZERO);
    }

    #[test]
    fn success_resets() {
        let mut backoff = ExpBackoff::new(4 * MS, 8192 * MS);
        let now = Instant::now();
        backoff.report_error(now);
        backoff.report_error(now);
        backoff.report_success();
        assert!(backoff.can_try_now(now));
        backoff.report_error(now);
        assert_eq!(backoff.time_until_retry(now), 4 * MS);
    }

    #[test]
    fn near_equal_bounds_are_periodic() {
        // the ttl refresh uses bounds (ttl/4, ttl/4 + 1ms)
        let mut backoff = ExpBackoff::new(100 * MS, 101 * MS);
        let now = Instant::now();
        backoff.report_error(now);
        assert_eq!(backoff.time_until_retry(now), 100 * MS);
        backoff.report_error(now);
        assert_eq!(backoff.time_until_retry(now), 101 * MS);
        backoff.report_error(now);
        assert_eq!(backoff.time_until_retry(now), 101 * MS);
    }
}
