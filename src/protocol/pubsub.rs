//! Topic-based publish/subscribe.
//!
//! `publish` fans out to every subscriber concurrently; one subscriber's
//! failure never affects its siblings.

use crate::error::FabricError;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

/// Message delivered to subscribers.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub id: String,
    pub topic: String,
    pub payload: Value,
}

/// Async subscriber callback.
pub type SubscriberHandler =
    Arc<dyn Fn(PubSubMessage) -> BoxFuture<'static, Result<(), FabricError>> + Send + Sync>;

#[derive(Default)]
struct Topics {
    // topic -> subscription id -> handler
    subscriptions: HashMap<String, HashMap<String, SubscriberHandler>>,
}

/// In-process pub/sub hub.
#[derive(Default)]
pub struct PubSub {
    topics: RwLock<Topics>,
}

impl PubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a topic. Idempotent.
    pub async fn create_topic(&self, name: impl Into<String>) {
        let mut topics = self.topics.write().await;
        topics.subscriptions.entry(name.into()).or_default();
    }

    /// Subscribe to a topic, returning the subscription id.
    pub async fn subscribe(
        &self,
        topic: &str,
        handler: SubscriberHandler,
    ) -> Result<String, FabricError> {
        let mut topics = self.topics.write().await;
        let subscribers = topics
            .subscriptions
            .get_mut(topic)
            .ok_or_else(|| FabricError::NotFound(format!("topic {topic}")))?;
        let id = Uuid::new_v4().to_string();
        subscribers.insert(id.clone(), handler);
        Ok(id)
    }

    /// Drop a subscription wherever it lives.
    pub async fn unsubscribe(&self, subscription_id: &str) {
        let mut topics = self.topics.write().await;
        for subscribers in topics.subscriptions.values_mut() {
            subscribers.remove(subscription_id);
        }
    }

    /// Publish a payload to every subscriber of `topic`, concurrently.
    pub async fn publish(&self, topic: &str, payload: Value) -> Result<(), FabricError> {
        let handlers: Vec<SubscriberHandler> = {
            let topics = self.topics.read().await;
            let subscribers = topics
                .subscriptions
                .get(topic)
                .ok_or_else(|| FabricError::NotFound(format!("topic {topic}")))?;
            subscribers.values().cloned().collect()
        };

        let message =
            PubSubMessage { id: Uuid::new_v4().to_string(), topic: topic.to_string(), payload };

        let deliveries = handlers.into_iter().map(|handler| {
            let message = message.clone();
            async move {
                if let Err(e) = handler(message).await {
                    warn!(error = %e, "subscriber failed");
                }
            }
        });
        futures::future::join_all(deliveries).await;
        Ok(())
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.subscriptions.len()
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .subscriptions
            .get(topic)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSub").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(count: Arc<AtomicUsize>) -> SubscriberHandler {
        Arc::new(move |_| {
            let count = count.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let hub = PubSub::new();
        hub.create_topic("alerts").await;

        let count = Arc::new(AtomicUsize::new(0));
        hub.subscribe("alerts", counting_handler(count.clone())).await.unwrap();
        hub.subscribe("alerts", counting_handler(count.clone())).await.unwrap();

        hub.publish("alerts", json!({"severity": "high"})).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_affect_siblings() {
        let hub = PubSub::new();
        hub.create_topic("alerts").await;

        hub.subscribe(
            "alerts",
            Arc::new(|_| {
                Box::pin(async { Err(FabricError::Worker("subscriber exploded".into())) })
            }),
        )
        .await
        .unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        hub.subscribe("alerts", counting_handler(count.clone())).await.unwrap();

        hub.publish("alerts", json!({})).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let hub = PubSub::new();
        hub.create_topic("alerts").await;

        let count = Arc::new(AtomicUsize::new(0));
        let sub = hub.subscribe("alerts", counting_handler(count.clone())).await.unwrap();
        hub.unsubscribe(&sub).await;

        hub.publish("alerts", json!({})).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(hub.subscriber_count("alerts").await, 0);
    }

    #[tokio::test]
    async fn unknown_topic_is_not_found() {
        let hub = PubSub::new();
        let err = hub.publish("ghost", json!({})).await.unwrap_err();
        assert!(matches!(err, FabricError::NotFound(_)));

        let err = hub.subscribe("ghost", counting_handler(Default::default())).await.unwrap_err();
        assert!(matches!(err, FabricError::NotFound(_)));
    }
}
