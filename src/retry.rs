//! Retry policy
//!
//! Configurable retry with backoff and jitter, a retry predicate over error
//! kinds, an optional per-retry hook, and a pluggable sleeper.

use crate::error::{ErrorKind, FabricError};
use crate::{Backoff, Jitter, Sleeper, TokioSleeper};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, warn};

type RetryPredicate = Arc<dyn Fn(&FabricError) -> bool + Send + Sync>;
type OnRetry = Arc<dyn Fn(&FabricError, usize) + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    retry_on: RetryPredicate,
    on_retry: Option<OnRetry>,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("sleeper", &"<sleeper>")
            .finish()
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Run `operation` up to `max_attempts` times.
    ///
    /// Between failed attempts waits `jitter(backoff.delay(attempt))`. Only
    /// errors matched by the retry predicate are retried; others propagate
    /// immediately. On exhaustion the last error is returned unchanged, and
    /// the `on_retry` hook is never invoked after the final failed attempt.
    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, FabricError>
    where
        T: Send,
        Fut: Future<Output = Result<T, FabricError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut last_error = None;

        for attempt in 0..self.max_attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !(self.retry_on)(&e) {
                        return Err(e);
                    }

                    if attempt + 1 >= self.max_attempts {
                        error!(attempts = self.max_attempts, %e, "retry attempts exhausted");
                        return Err(e);
                    }

                    let delay = self.jitter.apply(self.backoff.delay(attempt + 1));
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        %e,
                        "attempt failed, retrying"
                    );

                    if let Some(hook) = &self.on_retry {
                        hook(&e, attempt + 1);
                    }
                    last_error = Some(e);

                    self.sleeper.sleep(delay).await;
                }
            }
        }

        // The loop always returns on the final attempt; max_attempts is
        // validated to be > 0 at build time.
        Err(last_error.unwrap_or_else(|| FabricError::Validation("retry ran zero attempts".into())))
    }
}

pub struct RetryPolicyBuilder {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    retry_on: RetryPredicate,
    on_retry: Option<OnRetry>,
    sleeper: Arc<dyn Sleeper>,
}

/// Errors returned when building a retry policy.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryBuildError {
    InvalidMaxAttempts(usize),
}

impl std::fmt::Display for RetryBuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryBuildError::InvalidMaxAttempts(n) => {
                write!(f, "max_attempts must be > 0 (got {})", n)
            }
        }
    }
}

impl std::error::Error for RetryBuildError {}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(std::time::Duration::from_secs(1)),
            jitter: Jitter::standard(),
            retry_on: Arc::new(|_| true),
            on_retry: None,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Retry only errors matched by `predicate`.
    pub fn retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&FabricError) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Arc::new(predicate);
        self
    }

    /// Retry only errors whose kind appears in `kinds`.
    pub fn retry_on_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        let set: HashSet<ErrorKind> = kinds.into_iter().collect();
        self.retry_on = Arc::new(move |e| set.contains(&e.kind()));
        self
    }

    /// Hook invoked with the error and the 1-indexed attempt that just failed.
    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(&FabricError, usize) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn build(self) -> Result<RetryPolicy, RetryBuildError> {
        if self.max_attempts == 0 {
            return Err(RetryBuildError::InvalidMaxAttempts(0));
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            retry_on: self.retry_on,
            on_retry: self.on_retry,
            sleeper: self.sleeper,
        })
    }
}
