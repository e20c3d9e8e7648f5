//! Sliding-window rate limiting.
//!
//! Each key keeps a deque of admission timestamps trimmed to
//! `[now - period, now]`. A call is admitted while fewer than `calls`
//! timestamps remain in the window; otherwise the limiter either rejects
//! with `retry_after = oldest + period - now` or sleeps that long and tries
//! again. No more than `calls` operations are ever admitted inside any
//! window of length `period`.

use crate::error::FabricError;
use crate::{Sleeper, TokioSleeper};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

/// What to do when the window is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnLimit {
    /// Fail with `FabricError::RateLimitExceeded`.
    Reject,
    /// Sleep until the window frees up, then retry.
    Wait,
}

/// Errors returned when configuring the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitConfigError {
    ZeroCalls,
    ZeroPeriod,
}

impl std::fmt::Display for RateLimitConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimitConfigError::ZeroCalls => write!(f, "calls must be > 0"),
            RateLimitConfigError::ZeroPeriod => write!(f, "period must be > 0"),
        }
    }
}

impl std::error::Error for RateLimitConfigError {}

/// Per-key sliding-window rate limiter.
#[derive(Clone)]
pub struct RateLimitPolicy {
    calls: usize,
    period: Duration,
    on_limit: OnLimit,
    windows: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
    sleeper: Arc<dyn Sleeper>,
}

impl RateLimitPolicy {
    pub fn new(
        calls: usize,
        period: Duration,
        on_limit: OnLimit,
    ) -> Result<Self, RateLimitConfigError> {
        if calls == 0 {
            return Err(RateLimitConfigError::ZeroCalls);
        }
        if period.is_zero() {
            return Err(RateLimitConfigError::ZeroPeriod);
        }
        Ok(Self {
            calls,
            period,
            on_limit,
            windows: Arc::new(Mutex::new(HashMap::new())),
            sleeper: Arc::new(TokioSleeper),
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Admit one call under `key`, or report how long until the window frees.
    async fn try_admit(&self, key: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let window = windows.entry(key.to_string()).or_default();

        while let Some(front) = window.front() {
            if now.duration_since(*front) > self.period {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= self.calls {
            let oldest = *window.front().unwrap_or(&now);
            let retry_after = (oldest + self.period).saturating_duration_since(now);
            return Err(retry_after);
        }

        window.push_back(now);
        Ok(())
    }

    /// Acquire one slot under `key` without running an operation.
    pub async fn acquire(&self, key: &str) -> Result<(), FabricError> {
        loop {
            match self.try_admit(key).await {
                Ok(()) => return Ok(()),
                Err(retry_after) => match self.on_limit {
                    OnLimit::Reject => {
                        return Err(FabricError::RateLimitExceeded { retry_after });
                    }
                    OnLimit::Wait => {
                        warn!(
                            %key,
                            wait_ms = retry_after.as_millis() as u64,
                            "rate limit reached, waiting"
                        );
                        self.sleeper.sleep(retry_after).await;
                    }
                },
            }
        }
    }

    /// Run `operation` once a slot under `key` is admitted.
    pub async fn execute<T, Fut, Op>(
        &self,
        key: &str,
        operation: Op,
    ) -> Result<T, FabricError>
    where
        T: Send,
        Fut: Future<Output = Result<T, FabricError>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        self.acquire(key).await?;
        operation().await
    }
}

impl std::fmt::Debug for RateLimitPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitPolicy")
            .field("calls", &self.calls)
            .field("period", &self.period)
            .field("on_limit", &self.on_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_limit_then_rejects() {
        let limiter = RateLimitPolicy::new(3, Duration::from_secs(60), OnLimit::Reject).unwrap();

        for _ in 0..3 {
            limiter.acquire("k").await.unwrap();
        }

        let err = limiter.acquire("k").await.unwrap_err();
        let retry_after = err.retry_after().expect("rate limit error carries retry_after");
        assert!(retry_after <= Duration::from_secs(60));
        assert!(retry_after > Duration::from_secs(55));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = RateLimitPolicy::new(1, Duration::from_secs(60), OnLimit::Reject).unwrap();
        limiter.acquire("a").await.unwrap();
        limiter.acquire("b").await.unwrap();
        assert!(limiter.acquire("a").await.is_err());
    }

    #[tokio::test]
    async fn window_frees_up_after_period() {
        let limiter = RateLimitPolicy::new(1, Duration::from_millis(30), OnLimit::Reject).unwrap();
        limiter.acquire("k").await.unwrap();
        assert!(limiter.acquire("k").await.is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;
        limiter.acquire("k").await.unwrap();
    }

    #[tokio::test]
    async fn wait_mode_sleeps_then_admits() {
        let limiter = RateLimitPolicy::new(1, Duration::from_millis(40), OnLimit::Wait).unwrap();
        limiter.acquire("k").await.unwrap();
        let start = Instant::now();
        limiter.acquire("k").await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn execute_runs_operation_when_admitted() {
        let limiter = RateLimitPolicy::new(1, Duration::from_secs(60), OnLimit::Reject).unwrap();
        let out = limiter.execute("k", || async { Ok::<_, FabricError>(5) }).await.unwrap();
        assert_eq!(out, 5);
        assert!(limiter.execute("k", || async { Ok::<_, FabricError>(5) }).await.is_err());
    }

    #[test]
    fn invalid_config_rejected() {
        assert!(RateLimitPolicy::new(0, Duration::from_secs(1), OnLimit::Reject).is_err());
        assert!(RateLimitPolicy::new(1, Duration::ZERO, OnLimit::Reject).is_err());
    }
}
