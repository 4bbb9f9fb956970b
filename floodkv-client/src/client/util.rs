//! Utilities for the client actor.

use std::{collections::HashMap, hash::Hash, time::Instant};

use tokio::time::sleep_until;

/// A set of named deadlines with an async method to wait for the earliest.
///
/// Unlike a timer wheel this keeps at most one deadline per key:
/// rescheduling a key replaces its previous deadline, which is exactly the
/// rearm-on-every-run behavior the client's three timers need.
#[derive(Debug, Default)]
pub(super) struct Timers<K> {
    deadlines: HashMap<K, Instant>,
}

impl<K: Eq + Hash + Clone> Timers<K> {
    pub fn new() -> Self {
        Self {
            deadlines: HashMap::new(),
        }
    }

    /// Arm (or move) the deadline for a key.
    pub fn reschedule(&mut self, key: K, at: Instant) {
        self.deadlines.insert(key, at);
    }

    /// Wait until the earliest deadline elapses and return its key.
    ///
    /// Pending forever while no deadline is armed. The future is recreated
    /// by the caller's select loop after every other event, so deadlines
    /// armed meanwhile are picked up on the next iteration.
    pub async fn wait_next(&mut self) -> K {
        let Some((key, at)) = self
            .deadlines
            .iter()
            .min_by_key(|(_, at)| **at)
            .map(|(key, at)| (key.clone(), *at))
        else {
            return std::future::pending().await;
        };
        sleep_until(at.into()).await;
        self.deadlines.remove(&key);
        key
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn fires_in_deadline_order() {
        let mut timers = Timers::new();
        let now = Instant::now();
        timers.reschedule("b", now + Duration::from_millis(20));
        timers.reschedule("a", now + Duration::from_millis(5));
        assert_eq!(timers.wait_next().await, "a");
        assert_eq!(timers.wait_next().await, "b");
    }

    #[tokio::test]
    async fn rescheduling_replaces_the_deadline() {
        let mut timers = Timers::new();
        let now = Instant::now();
        timers.reschedule("a", now + Duration::from_secs(60));
        timers.reschedule("a", now + Duration::from_millis(1));
        let fired = tokio::time::timeout(Duration::from_secs(1), timers.wait_next())
            .await
            .expect("deadline was moved forward");
        assert_eq!(fired, "a");
    }

    #[tokio::test]
    async fn empty_timers_stay_pending() {
        let mut timers: Timers<&str> = Timers::new();
        let res =
            tokio::time::timeout(Duration::from_millis(10), timers.wait_next()).await;
        assert!(res.is_err());
    }
}
