//! Serialise callers through a shared mutual-exclusion primitive.

use crate::error::FabricError;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Policy that runs operations one at a time under a shared lock.
///
/// Clones share the same lock, so wrapping several call sites with clones of
/// one `Synchronized` serialises them against each other.
#[derive(Debug, Clone, Default)]
pub struct Synchronized {
    lock: Arc<Mutex<()>>,
}

impl Synchronized {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an existing shared lock.
    pub fn with_lock(lock: Arc<Mutex<()>>) -> Self {
        Self { lock }
    }

    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, FabricError>
    where
        T: Send,
        Fut: Future<Output = Result<T, FabricError>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let _guard = self.lock.lock().await;
        operation().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_never_overlap() {
        let sync = Synchronized::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sync = sync.clone();
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                sync.execute(|| async {
                    let n = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(n, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, FabricError>(())
                })
                .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
