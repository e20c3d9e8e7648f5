//! Error types shared across the fabric

use std::time::Duration;

/// Unified error type for transports, protocols, routing, and policies.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum FabricError {
    /// Credentials missing or invalid.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Authenticated but permission denied.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Transport unreachable, framing broken, or non-2xx reply.
    #[error("connection error: {0}")]
    Connection(String),
    /// The operation exceeded its deadline.
    #[error("operation timed out after {elapsed:?} (limit: {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },
    /// Sliding-window limit exhausted; `retry_after` is when the window frees up.
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimitExceeded { retry_after: Duration },
    /// Service or resource lookup failed.
    #[error("not found: {0}")]
    NotFound(String),
    /// Uniqueness violation on registration.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Underlying worker failed.
    #[error("worker error: {0}")]
    Worker(String),
    /// Malformed envelope, unknown method, or remote error payload.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Bad argument: unknown protocol id, invalid strategy, and the like.
    #[error("validation error: {0}")]
    Validation(String),
}

/// Coarse error classification used by retry predicates and fallback filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    Auth,
    Unauthorized,
    Connection,
    Timeout,
    RateLimit,
    NotFound,
    AlreadyExists,
    Worker,
    Protocol,
    Validation,
}

impl FabricError {
    /// Classify this error for pattern-matched retry/fallback sets.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(_) => ErrorKind::Auth,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Connection(_) => ErrorKind::Connection,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimit,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::Worker(_) => ErrorKind::Worker,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Validation(_) => ErrorKind::Validation,
        }
    }

    /// Check if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error came from the transport layer.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Check if this error is a rate-limit rejection.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimitExceeded { .. })
    }

    /// Elapsed/limit pair for timeout errors.
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Timeout { elapsed, timeout } => Some((*elapsed, *timeout)),
            _ => None,
        }
    }

    /// Wait hint carried by rate-limit errors.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Result alias used throughout the crate.
pub type FabricResult<T> = Result<T, FabricError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display_includes_both_durations() {
        let err = FabricError::Timeout {
            elapsed: Duration::from_millis(5100),
            timeout: Duration::from_secs(5),
        };
        let msg = err.to_string();
        assert!(msg.contains("timed out"));
        assert!(msg.contains("5.1"));
    }

    #[test]
    fn kind_matches_variant() {
        assert_eq!(FabricError::Connection("down".into()).kind(), ErrorKind::Connection);
        assert_eq!(
            FabricError::RateLimitExceeded { retry_after: Duration::from_secs(1) }.kind(),
            ErrorKind::RateLimit
        );
        assert_eq!(FabricError::Validation("bad".into()).kind(), ErrorKind::Validation);
    }

    #[test]
    fn predicates_and_accessors() {
        let timeout = FabricError::Timeout {
            elapsed: Duration::from_secs(2),
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_timeout());
        assert_eq!(
            timeout.timeout_details(),
            Some((Duration::from_secs(2), Duration::from_secs(1)))
        );

        let limited = FabricError::RateLimitExceeded { retry_after: Duration::from_millis(250) };
        assert!(limited.is_rate_limited());
        assert_eq!(limited.retry_after(), Some(Duration::from_millis(250)));
        assert_eq!(timeout.retry_after(), None);
    }
}
