//! Jitter strategies to prevent thundering herd

use rand::Rng;
use std::time::Duration;

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone)]
pub enum Jitter {
    /// No jitter - use exact backoff delay
    None,
    /// Multiply the delay by a uniform factor in `[low, high]`
    Proportional { low: f64, high: f64 },
}

impl Jitter {
    /// No jitter
    pub fn none() -> Self {
        Jitter::None
    }

    /// Proportional jitter with an arbitrary band
    pub fn proportional(low: f64, high: f64) -> Self {
        Jitter::Proportional { low: low.max(0.0), high: high.max(low.max(0.0)) }
    }

    /// Standard anti-herd band: uniform factor in [0.8, 1.2]
    pub fn standard() -> Self {
        Jitter::Proportional { low: 0.8, high: 1.2 }
    }

    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::thread_rng())
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Proportional { low, high } => {
                if delay.is_zero() || (high - low).abs() < f64::EPSILON {
                    return delay.mul_f64(*low);
                }
                let factor = rng.gen_range(*low..=*high);
                delay.mul_f64(factor)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_jitter_returns_exact_delay() {
        let delay = Duration::from_secs(1);
        assert_eq!(Jitter::none().apply(delay), delay);
    }

    #[test]
    fn standard_jitter_stays_in_band() {
        let jitter = Jitter::standard();
        let delay = Duration::from_secs(1);

        for _ in 0..100 {
            let jittered = jitter.apply(delay);
            assert!(jittered >= Duration::from_millis(800));
            assert!(jittered <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn proportional_with_deterministic_rng() {
        let jitter = Jitter::proportional(0.5, 1.5);
        let mut rng = StdRng::seed_from_u64(42);
        let jittered = jitter.apply_with_rng(Duration::from_millis(1000), &mut rng);
        assert!(jittered >= Duration::from_millis(500));
        assert!(jittered <= Duration::from_millis(1500));
    }

    #[test]
    fn jitter_handles_zero_delay() {
        assert_eq!(Jitter::standard().apply(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn degenerate_band_is_deterministic() {
        let jitter = Jitter::proportional(1.0, 1.0);
        assert_eq!(jitter.apply(Duration::from_millis(300)), Duration::from_millis(300));
    }
}
