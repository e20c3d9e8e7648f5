//! Transport layer: connection lifecycle plus framed request/response and
//! notification exchange.
//!
//! Two implementations share the [`Transport`] contract: [`HttpTransport`]
//! for request/response over HTTP and [`StreamTransport`] for a persistent
//! bidirectional stream. Frames are JSON objects with `id`, `type`,
//! `payload`, and optional `metadata`; a request carries an `id`, the
//! matching response echoes it, notifications omit it.

mod http;
mod stream;

pub use http::HttpTransport;
pub use stream::StreamTransport;

use crate::error::FabricError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// Message kind on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    Notification,
    Error,
}

/// Generic wire message shared by every transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl TransportMessage {
    pub fn request(id: impl Into<String>, payload: Value) -> Self {
        Self { id: Some(id.into()), kind: MessageKind::Request, payload, metadata: None }
    }

    pub fn response(id: impl Into<String>, payload: Value) -> Self {
        Self { id: Some(id.into()), kind: MessageKind::Response, payload, metadata: None }
    }

    pub fn notification(payload: Value) -> Self {
        Self { id: None, kind: MessageKind::Notification, payload, metadata: None }
    }

    /// Encode to the JSON wire form.
    pub fn encode(&self) -> Result<String, FabricError> {
        serde_json::to_string(self)
            .map_err(|e| FabricError::Protocol(format!("failed to encode message: {e}")))
    }

    /// Decode from the JSON wire form.
    pub fn decode(raw: &str) -> Result<Self, FabricError> {
        serde_json::from_str(raw)
            .map_err(|e| FabricError::Protocol(format!("malformed frame: {e}")))
    }
}

/// Reconnection behaviour for streaming transports.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Keep-alive behaviour for streaming transports.
#[derive(Debug, Clone)]
pub struct PingConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(20), timeout: Duration::from_secs(10) }
    }
}

/// Protocol-agnostic transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    pub timeout: Duration,
    pub headers: Vec<(String, String)>,
    /// Path POSTed to by the HTTP transport.
    pub endpoint_path: String,
    pub content_type: String,
    /// Probe `/health` on connect (HTTP transport).
    pub probe_health: bool,
    pub reconnect: ReconnectConfig,
    pub ping: PingConfig,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(30),
            headers: Vec::new(),
            endpoint_path: "/".to_string(),
            content_type: "application/json".to_string(),
            probe_health: false,
            reconnect: ReconnectConfig::default(),
            ping: PingConfig::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_endpoint_path(mut self, path: impl Into<String>) -> Self {
        self.endpoint_path = path.into();
        self
    }

    pub fn with_health_probe(mut self) -> Self {
        self.probe_health = true;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_ping(mut self, ping: PingConfig) -> Self {
        self.ping = ping;
        self
    }
}

/// Async callback invoked for each inbound message not matched to a pending
/// request.
pub type MessageHandler =
    Arc<dyn Fn(TransportMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Async callback invoked when the transport hits an error it cannot surface
/// to a caller (reader-loop failures, reconnect exhaustion).
pub type ErrorHandler = Arc<dyn Fn(FabricError) -> BoxFuture<'static, ()> + Send + Sync>;

/// Transport contract shared by the HTTP and streaming implementations.
///
/// A connection is a scoped resource: acquired on `connect`, released on
/// every exit path including cancellation.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<(), FabricError>;

    async fn disconnect(&self) -> Result<(), FabricError>;

    /// Send a message. Requests resolve to `Some(response)`; notifications
    /// and responses resolve to `None`.
    async fn send(&self, message: TransportMessage)
        -> Result<Option<TransportMessage>, FabricError>;

    /// Receive the next unsolicited inbound message.
    async fn receive(&self) -> Result<TransportMessage, FabricError>;

    fn is_connected(&self) -> bool;

    fn set_message_handler(&self, handler: MessageHandler);

    fn set_error_handler(&self, handler: ErrorHandler);

    fn config(&self) -> &TransportConfig;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_decode_is_identity() {
        let mut metadata = Map::new();
        metadata.insert("trace".into(), json!("abc"));
        let original = TransportMessage {
            id: Some("req-1".into()),
            kind: MessageKind::Request,
            payload: json!({"method": "ping", "params": {"n": 1}}),
            metadata: Some(metadata),
        };

        let decoded = TransportMessage::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn notification_omits_id_on_the_wire() {
        let msg = TransportMessage::notification(json!({"event": "tick"}));
        let raw = msg.encode().unwrap();
        assert!(!raw.contains("\"id\""));
        let decoded = TransportMessage::decode(&raw).unwrap();
        assert_eq!(decoded.id, None);
        assert_eq!(decoded.kind, MessageKind::Notification);
    }

    #[test]
    fn kind_uses_lowercase_wire_names() {
        let raw = TransportMessage::request("1", json!(null)).encode().unwrap();
        assert!(raw.contains("\"type\":\"request\""));
    }

    #[test]
    fn malformed_frame_is_a_protocol_error() {
        let err = TransportMessage::decode("{not json").unwrap_err();
        assert!(matches!(err, FabricError::Protocol(_)));
    }
}
