//! Backoff schedules for retries and reconnection

use std::time::Duration;

/// Delay schedule between attempts.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Same delay every attempt
    Fixed { delay: Duration, max: Option<Duration> },
    /// Linearly increasing delay
    Linear { base: Duration, max: Option<Duration> },
    /// Exponentially increasing delay
    Exponential { base: Duration, max: Option<Duration> },
}

impl Backoff {
    /// Create a fixed backoff schedule
    pub fn fixed(delay: Duration) -> Self {
        Backoff::Fixed { delay, max: None }
    }

    /// Create a linear backoff schedule
    pub fn linear(base: Duration) -> Self {
        Backoff::Linear { base, max: None }
    }

    /// Create an exponential backoff schedule
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, max: None }
    }

    /// Cap every computed delay at `max`
    pub fn with_max(mut self, cap: Duration) -> Self {
        match self {
            Backoff::Fixed { ref mut max, .. }
            | Backoff::Linear { ref mut max, .. }
            | Backoff::Exponential { ref mut max, .. } => *max = Some(cap),
        }
        self
    }

    /// Calculate the delay for a given attempt number (1-indexed)
    pub fn delay(&self, attempt: usize) -> Duration {
        let (raw, max) = match self {
            Backoff::Fixed { delay, max } => (*delay, *max),
            Backoff::Linear { base, max } => (
                base.checked_mul(attempt as u32).unwrap_or(Duration::from_secs(u64::MAX)),
                *max,
            ),
            Backoff::Exponential { base, max } => {
                let exponent = (attempt.saturating_sub(1)).min(u32::MAX as usize) as u32;
                let multiplier = 2u32.saturating_pow(exponent);
                (base.checked_mul(multiplier).unwrap_or(Duration::from_secs(u64::MAX)), *max)
            }
        };

        match max {
            Some(cap) => raw.min(cap),
            None => raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_returns_same_delay() {
        let backoff = Backoff::fixed(Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(100), Duration::from_secs(1));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let backoff = Backoff::linear(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(10), Duration::from_millis(1000));
    }

    #[test]
    fn exponential_backoff_doubles_each_time() {
        let backoff = Backoff::exponential(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100)); // 100 * 2^0
        assert_eq!(backoff.delay(2), Duration::from_millis(200)); // 100 * 2^1
        assert_eq!(backoff.delay(4), Duration::from_millis(800)); // 100 * 2^3
    }

    #[test]
    fn cap_applies_to_all_strategies() {
        let exp =
            Backoff::exponential(Duration::from_millis(100)).with_max(Duration::from_secs(1));
        assert_eq!(exp.delay(5), Duration::from_secs(1));
        assert_eq!(exp.delay(10), Duration::from_secs(1));

        let lin = Backoff::linear(Duration::from_millis(400)).with_max(Duration::from_secs(1));
        assert_eq!(lin.delay(2), Duration::from_millis(800));
        assert_eq!(lin.delay(5), Duration::from_secs(1));

        let fixed = Backoff::fixed(Duration::from_secs(5)).with_max(Duration::from_secs(1));
        assert_eq!(fixed.delay(1), Duration::from_secs(1));
    }

    #[test]
    fn exponential_backoff_handles_overflow() {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        // Attempt 64 would overflow u32, should saturate
        let delay = backoff.delay(64);
        assert!(delay > Duration::from_secs(1_000_000));
    }

    #[test]
    fn linear_backoff_handles_overflow() {
        let backoff = Backoff::linear(Duration::from_secs(u64::MAX / 2));
        let delay = backoff.delay(10);
        assert!(delay >= Duration::from_secs(u64::MAX / 2));
    }
}
