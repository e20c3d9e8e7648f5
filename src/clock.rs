//! Clock abstraction so wall-clock expiry can be faked in tests.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Mutex;

/// Wall clock used by expiry-driven components.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by `Utc::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { current: Mutex::new(start) }
    }

    /// Start at the real current time.
    pub fn start_now() -> Self {
        Self::new(Utc::now())
    }

    /// Advance the clock by `duration`.
    pub fn advance(&self, duration: std::time::Duration) {
        let mut guard = self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard += ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::zero());
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn manual_clock_advances_on_demand() {
        let clock = ManualClock::start_now();
        let before = clock.now();
        clock.advance(Duration::from_secs(120));
        assert_eq!(clock.now() - before, ChronoDuration::seconds(120));
    }

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
