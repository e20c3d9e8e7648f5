//! Composable resilience stack.
//!
//! Composition order is cache → fallback → retry → timeout (outermost to
//! innermost): the timeout bounds each attempt, retry re-runs timed-out or
//! failed attempts, fallback absorbs exhaustion, and the cache sits in front
//! of the whole thing.

use crate::error::FabricError;
use crate::{
    Backoff, CachePolicy, FallbackPolicy, Jitter, RetryPolicy, TimeoutPolicy,
};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
pub struct ResilientStack<T> {
    cache: Option<CachePolicy<T>>,
    fallback: Option<FallbackPolicy<T>>,
    retry: RetryPolicy,
    timeout: TimeoutPolicy,
}

impl<T> ResilientStack<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn builder() -> ResilientStackBuilder<T> {
        ResilientStackBuilder::new()
    }

    /// Execute `operation` through the configured layers. `key` identifies
    /// the call for the cache layer and is ignored when caching is off.
    pub async fn execute<Fut, Op>(
        &self,
        key: impl Into<String>,
        operation: Op,
    ) -> Result<T, FabricError>
    where
        Fut: Future<Output = Result<T, FabricError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let op_cell = Arc::new(Mutex::new(operation));

        let retry = self.retry.clone();
        let timeout = self.timeout;
        let core = move || {
            let retry = retry.clone();
            let op_cell = op_cell.clone();
            async move {
                retry
                    .execute(move || {
                        let op_cell = op_cell.clone();
                        async move {
                            timeout
                                .execute(|| {
                                    let mut op = op_cell
                                        .lock()
                                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                                    op()
                                })
                                .await
                        }
                    })
                    .await
            }
        };

        let fallback = self.fallback.clone();
        let guarded = move || {
            let core = core.clone();
            async move {
                match &fallback {
                    Some(policy) => policy.execute(core).await,
                    None => core().await,
                }
            }
        };

        match &self.cache {
            Some(cache) => cache.execute(key, guarded).await,
            None => guarded().await,
        }
    }
}

impl<T> std::fmt::Debug for ResilientStack<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientStack")
            .field("cache", &self.cache.is_some())
            .field("fallback", &self.fallback.is_some())
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish()
    }
}

pub struct ResilientStackBuilder<T> {
    cache: Option<CachePolicy<T>>,
    fallback: Option<FallbackPolicy<T>>,
    retry: Option<RetryPolicy>,
    timeout: Option<TimeoutPolicy>,
}

impl<T> Default for ResilientStackBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResilientStackBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self { cache: None, fallback: None, retry: None, timeout: None }
    }

    pub fn cache(mut self, cache: CachePolicy<T>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn fallback(mut self, fallback: FallbackPolicy<T>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn timeout(mut self, timeout: TimeoutPolicy) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> ResilientStack<T> {
        ResilientStack {
            cache: self.cache,
            fallback: self.fallback,
            retry: self.retry.unwrap_or_else(|| {
                RetryPolicy::builder()
                    .max_attempts(3)
                    .backoff(Backoff::exponential(Duration::from_secs(1)))
                    .jitter(Jitter::standard())
                    .build()
                    .unwrap_or_else(|_| unreachable!("defaults are valid"))
            }),
            timeout: self
                .timeout
                .unwrap_or_else(|| {
                    TimeoutPolicy::new(Duration::from_secs(30))
                        .unwrap_or_else(|_| unreachable!("default timeout is valid"))
                }),
        }
    }
}

/// Composite with the documented parameter bundle: retry attempts, a
/// per-attempt timeout, a fallback value, and an optional cache TTL.
pub fn resilient<T>(
    retry_attempts: usize,
    timeout: Duration,
    fallback_value: Option<T>,
    cache_ttl: Option<Duration>,
) -> Result<ResilientStack<T>, FabricError>
where
    T: Clone + Send + Sync + 'static,
{
    let retry = RetryPolicy::builder()
        .max_attempts(retry_attempts)
        .backoff(Backoff::exponential(Duration::from_secs(1)))
        .build()
        .map_err(|e| FabricError::Validation(e.to_string()))?;
    let timeout =
        TimeoutPolicy::new(timeout).map_err(|e| FabricError::Validation(e.to_string()))?;

    let mut builder = ResilientStack::builder().retry(retry).timeout(timeout);
    if let Some(value) = fallback_value {
        builder = builder.fallback(FallbackPolicy::new(value));
    }
    if let Some(ttl) = cache_ttl {
        let cache =
            CachePolicy::new(ttl, 128).map_err(|e| FabricError::Validation(e.to_string()))?;
        builder = builder.cache(cache);
    }
    Ok(builder.build())
}
