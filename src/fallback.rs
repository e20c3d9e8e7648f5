//! Fallback policy: substitute a value when an operation fails.

use crate::error::{ErrorKind, FabricError};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

type FallbackPredicate = Arc<dyn Fn(&FabricError) -> bool + Send + Sync>;
type FallbackFn<T> = Arc<dyn Fn(&FabricError) -> T + Send + Sync>;

/// Returns a default value (or a callback-derived one) when the wrapped
/// operation fails with a matched error. Unmatched errors propagate.
#[derive(Clone)]
pub struct FallbackPolicy<T> {
    default: T,
    matches: FallbackPredicate,
    callback: Option<FallbackFn<T>>,
}

impl<T> FallbackPolicy<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Fall back to `default` on any error.
    pub fn new(default: T) -> Self {
        Self { default, matches: Arc::new(|_| true), callback: None }
    }

    /// Only consume errors matched by `predicate`.
    pub fn on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&FabricError) -> bool + Send + Sync + 'static,
    {
        self.matches = Arc::new(predicate);
        self
    }

    /// Only consume errors whose kind appears in `kinds`.
    pub fn on_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        let set: HashSet<ErrorKind> = kinds.into_iter().collect();
        self.matches = Arc::new(move |e| set.contains(&e.kind()));
        self
    }

    /// Derive the fallback value from the error instead of the fixed default.
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&FabricError) -> T + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub async fn execute<Fut, Op>(&self, operation: Op) -> Result<T, FabricError>
    where
        Fut: Future<Output = Result<T, FabricError>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        match operation().await {
            Ok(value) => Ok(value),
            Err(e) if (self.matches)(&e) => {
                warn!(%e, "operation failed, using fallback");
                match &self.callback {
                    Some(cb) => Ok(cb(&e)),
                    None => Ok(self.default.clone()),
                }
            }
            Err(e) => Err(e),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for FallbackPolicy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackPolicy").field("default", &self.default).finish()
    }
}
