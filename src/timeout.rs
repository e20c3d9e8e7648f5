//! Timeout policy for bounding async operation duration.
//!
//! Wraps an async operation and returns `FabricError::Timeout` when the
//! deadline elapses. Uses `tokio::time::timeout`; on expiry the inner future
//! is dropped, so any resources it holds are released through cancellation.
//! Elapsed is measured from just before invoking the closure and can exceed
//! the configured duration slightly due to scheduling overhead.

use crate::error::FabricError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Maximum allowed timeout (30 days) to guard accidental `u64::MAX` deadlines.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Errors returned when configuring timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutConfigError {
    /// Duration must be greater than zero.
    ZeroDuration,
    /// Duration exceeded the allowed maximum.
    ExceedsMaximum { requested: Duration, limit: Duration },
}

impl std::fmt::Display for TimeoutConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutConfigError::ZeroDuration => write!(f, "timeout duration must be > 0"),
            TimeoutConfigError::ExceedsMaximum { requested, limit } => {
                write!(f, "timeout duration {:?} exceeds maximum allowed {:?}", requested, limit)
            }
        }
    }
}

impl std::error::Error for TimeoutConfigError {}

/// Policy that enforces a maximum duration on async operations.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    /// Creates a timeout policy with the specified duration.
    #[must_use = "the result must be checked for validation errors"]
    pub fn new(duration: Duration) -> Result<Self, TimeoutConfigError> {
        if duration.is_zero() {
            return Err(TimeoutConfigError::ZeroDuration);
        }
        if duration > MAX_TIMEOUT {
            return Err(TimeoutConfigError::ExceedsMaximum {
                requested: duration,
                limit: MAX_TIMEOUT,
            });
        }
        Ok(Self { duration })
    }

    /// Returns the configured timeout duration.
    #[must_use]
    #[inline]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Execute an operation with a timeout.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, FabricError>
    where
        T: Send,
        Fut: Future<Output = Result<T, FabricError>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let start = Instant::now();

        match tokio::time::timeout(self.duration, operation()).await {
            Ok(result) => result,
            Err(_) => {
                Err(FabricError::Timeout { elapsed: start.elapsed(), timeout: self.duration })
            }
        }
    }
}
