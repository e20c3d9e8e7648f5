//! Agent-to-agent peer protocol.
//!
//! A node has an identity and a set of peers. Direct sends address one peer
//! by node id; broadcasts fan out to every peer except the sender. A bounded
//! dedup cache keyed by message id breaks replay loops. Inbound payloads
//! dispatch by their `type` field; when a targeted message's handler returns
//! a value, it is sent back to the source.

use super::{MethodHandler, Protocol, ProtocolConfig};
use crate::error::FabricError;
use crate::transport::{Transport, TransportMessage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEDUP_CAPACITY: usize = 1024;

/// Envelope exchanged between peers, carried as a transport payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PeerMessage {
    pub id: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
}

/// Bounded set of recently seen message ids.
struct DedupCache {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DedupCache {
    fn new(capacity: usize) -> Self {
        Self { seen: HashSet::new(), order: VecDeque::new(), capacity }
    }

    /// Record `id`; returns `false` if it was already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

struct PeerInner {
    config: ProtocolConfig,
    node_id: String,
    peers: Mutex<BTreeSet<String>>,
    transport: Arc<dyn Transport>,
    handlers: Mutex<HashMap<String, MethodHandler>>,
    dedup: Mutex<DedupCache>,
    running: AtomicBool,
}

/// Peer-to-peer protocol over a shared streaming transport.
#[derive(Clone)]
pub struct PeerProtocol {
    inner: Arc<PeerInner>,
}

impl PeerProtocol {
    pub fn new(
        node_id: Option<String>,
        peers: impl IntoIterator<Item = String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let node_id = node_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let config = ProtocolConfig::new("peer")
            .with_metadata("node_id", Value::String(node_id.clone()));
        let protocol = Self {
            inner: Arc::new(PeerInner {
                config,
                node_id,
                peers: Mutex::new(peers.into_iter().collect()),
                transport,
                handlers: Mutex::new(HashMap::new()),
                dedup: Mutex::new(DedupCache::new(DEDUP_CAPACITY)),
                running: AtomicBool::new(false),
            }),
        };
        protocol.install_builtin_handlers();
        protocol
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn peers(&self) -> BTreeSet<String> {
        lock(&self.inner.peers).clone()
    }

    pub fn add_peer(&self, peer: impl Into<String>) {
        lock(&self.inner.peers).insert(peer.into());
    }

    pub fn remove_peer(&self, peer: &str) {
        lock(&self.inner.peers).remove(peer);
    }

    /// Register a handler for inbound payloads of the given `type`.
    pub fn add_handler(&self, message_type: impl Into<String>, handler: MethodHandler) {
        lock(&self.inner.handlers).insert(message_type.into(), handler);
    }

    /// Send `payload` directly to one peer.
    pub async fn send_to(&self, target: &str, payload: Value) -> Result<(), FabricError> {
        let message = PeerMessage {
            id: Uuid::new_v4().to_string(),
            source: self.inner.node_id.clone(),
            target: Some(target.to_string()),
            payload,
            in_reply_to: None,
        };
        self.transmit(&message).await
    }

    /// Broadcast `payload` to every peer except self. One message id is
    /// shared across the fan-out so receivers can deduplicate.
    pub async fn broadcast(&self, payload: Value) -> Result<(), FabricError> {
        let message = PeerMessage {
            id: Uuid::new_v4().to_string(),
            source: self.inner.node_id.clone(),
            target: None,
            payload,
            in_reply_to: None,
        };
        // The sender has seen its own broadcast.
        lock(&self.inner.dedup).insert(&message.id);

        let peers = self.peers();
        for peer in peers {
            if peer == self.inner.node_id {
                continue;
            }
            if let Err(e) = self.transmit(&message).await {
                warn!(%peer, error = %e, "broadcast delivery failed");
            }
        }
        Ok(())
    }

    /// Announce this node to bootstrap peers; their `join_response` messages
    /// fill in the peer set.
    pub async fn join_network(&self, bootstrap: &[String]) -> Result<(), FabricError> {
        for node in bootstrap {
            self.add_peer(node.clone());
            self.send_to(node, json!({ "type": "join", "node_id": self.inner.node_id }))
                .await?;
        }
        Ok(())
    }

    async fn transmit(&self, message: &PeerMessage) -> Result<(), FabricError> {
        let payload = serde_json::to_value(message)
            .map_err(|e| FabricError::Protocol(format!("failed to encode peer message: {e}")))?;
        self.inner.transport.send(TransportMessage::notification(payload)).await?;
        Ok(())
    }

    fn install_builtin_handlers(&self) {
        let node_id = self.inner.node_id.clone();
        self.add_handler(
            "ping",
            Arc::new(move |_| {
                let node_id = node_id.clone();
                Box::pin(async move { Ok(json!({ "type": "pong", "node_id": node_id })) })
            }),
        );

        let inner = self.inner.clone();
        self.add_handler(
            "discover",
            Arc::new(move |_| {
                let inner = inner.clone();
                Box::pin(async move {
                    let peers: Vec<String> = lock(&inner.peers).iter().cloned().collect();
                    Ok(json!({
                        "type": "discover_response",
                        "node_id": inner.node_id,
                        "peers": peers,
                    }))
                })
            }),
        );

        let inner = self.inner.clone();
        self.add_handler(
            "join",
            Arc::new(move |payload| {
                let inner = inner.clone();
                Box::pin(async move {
                    let joined = payload.get("node_id").and_then(Value::as_str);
                    if let Some(node) = joined {
                        lock(&inner.peers).insert(node.to_string());
                        info!(%node, "peer joined network");
                    }
                    let peers: Vec<String> = lock(&inner.peers).iter().cloned().collect();
                    Ok(json!({
                        "type": "join_response",
                        "accepted": joined.is_some(),
                        "peers": peers,
                    }))
                })
            }),
        );

        let inner = self.inner.clone();
        self.add_handler(
            "join_response",
            Arc::new(move |payload| {
                let inner = inner.clone();
                Box::pin(async move {
                    if let Some(peers) = payload.get("peers").and_then(Value::as_array) {
                        let mut set = lock(&inner.peers);
                        for peer in peers.iter().filter_map(Value::as_str) {
                            if peer != inner.node_id {
                                set.insert(peer.to_string());
                            }
                        }
                    }
                    Ok(Value::Null)
                })
            }),
        );

        let inner = self.inner.clone();
        self.add_handler(
            "leave",
            Arc::new(move |payload| {
                let inner = inner.clone();
                Box::pin(async move {
                    if let Some(node) = payload.get("node_id").and_then(Value::as_str) {
                        lock(&inner.peers).remove(node);
                        info!(%node, "peer left network");
                    }
                    Ok(Value::Null)
                })
            }),
        );
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn on_peer_frame(inner: Arc<PeerInner>, protocol: PeerProtocol, frame: TransportMessage) {
    let message: PeerMessage = match serde_json::from_value(frame.payload) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "dropping malformed peer message");
            return;
        }
    };

    // Duplicate broadcast: the one sanctioned silent drop here.
    if !lock(&inner.dedup).insert(&message.id) {
        debug!(id = %message.id, "dropping duplicate peer message");
        return;
    }

    let for_us = match &message.target {
        Some(target) => target == &inner.node_id,
        None => true,
    };
    if !for_us {
        return;
    }

    let message_type = message
        .payload
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let handler = lock(&inner.handlers).get(&message_type).cloned();
    let Some(handler) = handler else {
        debug!(%message_type, "no handler for peer message");
        return;
    };

    match handler(message.payload.clone()).await {
        Ok(Value::Null) => {}
        Ok(reply) => {
            // Targeted messages get their handler's value sent back.
            if message.target.is_some() {
                let response = PeerMessage {
                    id: Uuid::new_v4().to_string(),
                    source: inner.node_id.clone(),
                    target: Some(message.source.clone()),
                    payload: reply,
                    in_reply_to: Some(message.id),
                };
                if let Err(e) = protocol.transmit(&response).await {
                    warn!(error = %e, "failed to send peer reply");
                }
            }
        }
        Err(e) => warn!(%message_type, error = %e, "peer handler failed"),
    }
}

#[async_trait]
impl Protocol for PeerProtocol {
    fn config(&self) -> &ProtocolConfig {
        &self.inner.config
    }

    async fn start(&self) -> Result<(), FabricError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let inner = self.inner.clone();
        let protocol = self.clone();
        self.inner.transport.set_message_handler(Arc::new(move |frame| {
            let inner = inner.clone();
            let protocol = protocol.clone();
            Box::pin(on_peer_frame(inner, protocol, frame))
        }));
        info!(node = %self.inner.node_id, "peer protocol started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), FabricError> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        // Best-effort goodbye; peers also expire us via their own liveness.
        let leave = json!({ "type": "leave", "node_id": self.inner.node_id });
        if self.inner.transport.is_connected() {
            let _ = self.broadcast(leave).await;
        }
        info!(node = %self.inner.node_id, "peer protocol stopped");
        Ok(())
    }

    async fn send(
        &self,
        message: Value,
        target: Option<&str>,
        _timeout: Option<Duration>,
    ) -> Result<Value, FabricError> {
        match target {
            Some(target) => self.send_to(target, message).await?,
            None => self.broadcast(message).await?,
        }
        Ok(Value::Null)
    }

    async fn receive(&self, timeout: Option<Duration>) -> Result<Value, FabricError> {
        let frame = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.inner.transport.receive())
                .await
                .map_err(|_| FabricError::Timeout { elapsed: limit, timeout: limit })??,
            None => self.inner.transport.receive().await?,
        };
        let message: PeerMessage = serde_json::from_value(frame.payload)
            .map_err(|e| FabricError::Protocol(format!("malformed peer message: {e}")))?;
        Ok(message.payload)
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    async fn health(&self) -> Value {
        json!({
            "protocol": self.inner.config.name,
            "node_id": self.inner.node_id,
            "running": self.is_running(),
            "transport_connected": self.inner.transport.is_connected(),
            "peers": lock(&self.inner.peers).len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_cache_detects_replays() {
        let mut cache = DedupCache::new(2);
        assert!(cache.insert("a"));
        assert!(!cache.insert("a"));
        assert!(cache.insert("b"));
        assert!(cache.insert("c"));
        // "a" evicted after capacity rolls over, so it reads as new again.
        assert!(cache.insert("a"));
    }

    #[test]
    fn peer_message_round_trips() {
        let message = PeerMessage {
            id: "m1".into(),
            source: "n1".into(),
            target: Some("n2".into()),
            payload: json!({ "type": "ping" }),
            in_reply_to: None,
        };
        let value = serde_json::to_value(&message).unwrap();
        let back: PeerMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back.id, "m1");
        assert_eq!(back.target.as_deref(), Some("n2"));
    }
}
