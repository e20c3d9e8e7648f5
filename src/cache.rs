//! TTL cache policy.
//!
//! Keys are caller-supplied strings. Expired entries are reaped lazily on
//! access; at capacity the entry with the oldest insertion timestamp is
//! evicted. A cached value is never returned after its TTL has passed.

use crate::error::FabricError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// Errors returned when configuring the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheConfigError {
    ZeroTtl,
    ZeroCapacity,
}

impl std::fmt::Display for CacheConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheConfigError::ZeroTtl => write!(f, "cache ttl must be > 0"),
            CacheConfigError::ZeroCapacity => write!(f, "cache capacity must be > 0"),
        }
    }
}

impl std::error::Error for CacheConfigError {}

struct Entry<T> {
    value: T,
    inserted_at: Instant,
}

/// Snapshot of cache occupancy and configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheInfo {
    pub size: usize,
    pub ttl: Duration,
    pub capacity: usize,
}

/// Read-through TTL cache for async operations.
#[derive(Clone)]
pub struct CachePolicy<T> {
    ttl: Duration,
    capacity: usize,
    entries: Arc<Mutex<HashMap<String, Entry<T>>>>,
}

impl<T> CachePolicy<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(ttl: Duration, capacity: usize) -> Result<Self, CacheConfigError> {
        if ttl.is_zero() {
            return Err(CacheConfigError::ZeroTtl);
        }
        if capacity == 0 {
            return Err(CacheConfigError::ZeroCapacity);
        }
        Ok(Self { ttl, capacity, entries: Arc::new(Mutex::new(HashMap::new())) })
    }

    /// Return the cached value for `key` if fresh; otherwise run `operation`
    /// and store its result.
    pub async fn execute<Fut, Op>(
        &self,
        key: impl Into<String>,
        operation: Op,
    ) -> Result<T, FabricError>
    where
        Fut: Future<Output = Result<T, FabricError>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let key = key.into();
        {
            let mut entries = self.entries.lock().await;
            match entries.get(&key) {
                Some(entry) if entry.inserted_at.elapsed() <= self.ttl => {
                    debug!(%key, "cache hit");
                    return Ok(entry.value.clone());
                }
                Some(_) => {
                    entries.remove(&key);
                }
                None => {}
            }
        }

        debug!(%key, "cache miss");
        let value = operation().await?;

        let mut entries = self.entries.lock().await;
        // Reap anything that expired while the operation ran.
        let ttl = self.ttl;
        entries.retain(|_, e| e.inserted_at.elapsed() <= ttl);

        while entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    entries.remove(&k);
                }
                None => break,
            }
        }

        entries.insert(key, Entry { value: value.clone(), inserted_at: Instant::now() });
        Ok(value)
    }

    /// Drop all cached entries.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// Current occupancy and configuration.
    pub async fn cache_info(&self) -> CacheInfo {
        let entries = self.entries.lock().await;
        CacheInfo { size: entries.len(), ttl: self.ttl, capacity: self.capacity }
    }
}

impl<T> std::fmt::Debug for CachePolicy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePolicy")
            .field("ttl", &self.ttl)
            .field("capacity", &self.capacity)
            .finish()
    }
}
