//! Request/response protocol with a correlation table.
//!
//! Outbound requests install a pending entry keyed by message id; the
//! transport callback completes it when the matching RESPONSE arrives.
//! Inbound REQUESTs dispatch to registered method handlers and send back a
//! RESPONSE carrying either `result` or `{code, message}`. Timed-out or
//! cancelled requests remove their entry; a late RESPONSE for a removed id
//! is dropped by the transport.

use super::{MethodHandler, Protocol, ProtocolConfig, CODE_INTERNAL_ERROR, CODE_METHOD_NOT_FOUND};
use crate::auth::AuthManager;
use crate::error::FabricError;
use crate::transport::{MessageKind, Transport, TransportMessage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct RpcRequest {
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RpcResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

type Pending = Mutex<HashMap<String, oneshot::Sender<Result<Value, FabricError>>>>;

struct RpcInner {
    config: ProtocolConfig,
    transport: Arc<dyn Transport>,
    auth: Option<AuthManager>,
    handlers: Mutex<HashMap<String, MethodHandler>>,
    pending: Pending,
    running: AtomicBool,
}

/// Request/response protocol bound to one transport.
#[derive(Clone)]
pub struct RpcProtocol {
    inner: Arc<RpcInner>,
}

impl RpcProtocol {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(ProtocolConfig::new("rpc"), transport, None)
    }

    pub fn with_config(
        config: ProtocolConfig,
        transport: Arc<dyn Transport>,
        auth: Option<AuthManager>,
    ) -> Self {
        Self {
            inner: Arc::new(RpcInner {
                config,
                transport,
                auth,
                handlers: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Register a handler for inbound requests under `method`.
    pub fn add_handler(&self, method: impl Into<String>, handler: MethodHandler) {
        lock(&self.inner.handlers).insert(method.into(), handler);
    }

    pub fn remove_handler(&self, method: &str) {
        lock(&self.inner.handlers).remove(method);
    }

    /// Number of outstanding correlation entries (diagnostics/tests).
    pub fn pending_requests(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub fn auth(&self) -> Option<&AuthManager> {
        self.inner.auth.as_ref()
    }

    /// Send a request and await the correlated response.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, FabricError> {
        let id = Uuid::new_v4().to_string();
        let payload = serde_json::to_value(RpcRequest { method: method.to_string(), params })
            .map_err(|e| FabricError::Protocol(format!("failed to encode request: {e}")))?;
        let message = TransportMessage::request(id.clone(), payload);

        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id.clone(), tx);

        let sent = self.inner.transport.send(message).await;
        match sent {
            Ok(Some(response)) => {
                // Request/response transports resolve inline; the pending
                // entry is no longer needed.
                lock(&self.inner.pending).remove(&id);
                return parse_response(response.payload);
            }
            Ok(None) => {}
            Err(e) => {
                lock(&self.inner.pending).remove(&id);
                return Err(e);
            }
        }

        let timeout = timeout.unwrap_or(self.inner.transport.config().timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                lock(&self.inner.pending).remove(&id);
                Err(FabricError::Connection("request cancelled".into()))
            }
            Err(_) => {
                lock(&self.inner.pending).remove(&id);
                Err(FabricError::Timeout { elapsed: timeout, timeout })
            }
        }
    }

    /// Send a notification; no response is expected.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), FabricError> {
        let payload = serde_json::to_value(RpcRequest { method: method.to_string(), params })
            .map_err(|e| FabricError::Protocol(format!("failed to encode notification: {e}")))?;
        self.inner.transport.send(TransportMessage::notification(payload)).await?;
        Ok(())
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn parse_response(payload: Value) -> Result<Value, FabricError> {
    let response: RpcResponse = serde_json::from_value(payload)
        .map_err(|e| FabricError::Protocol(format!("malformed response payload: {e}")))?;
    match response.error {
        Some(error) => {
            Err(FabricError::Protocol(format!("remote error {}: {}", error.code, error.message)))
        }
        None => Ok(response.result.unwrap_or(Value::Null)),
    }
}

async fn on_transport_message(inner: Arc<RpcInner>, message: TransportMessage) {
    match message.kind {
        MessageKind::Response => {
            let Some(id) = message.id else {
                debug!("dropping response without id");
                return;
            };
            let sender = lock(&inner.pending).remove(&id);
            match sender {
                Some(tx) => {
                    let _ = tx.send(parse_response(message.payload));
                }
                None => debug!(%id, "dropping late response"),
            }
        }
        MessageKind::Request => {
            let reply = dispatch_request(&inner, message.payload).await;
            let response = TransportMessage {
                id: message.id,
                kind: MessageKind::Response,
                payload: reply,
                metadata: None,
            };
            if let Err(e) = inner.transport.send(response).await {
                warn!(error = %e, "failed to send response");
            }
        }
        MessageKind::Notification => {
            let _ = dispatch_request(&inner, message.payload).await;
        }
        MessageKind::Error => {
            warn!(payload = %message.payload, "received error frame");
        }
    }
}

async fn dispatch_request(inner: &Arc<RpcInner>, payload: Value) -> Value {
    let request: RpcRequest = match serde_json::from_value(payload) {
        Ok(request) => request,
        Err(e) => {
            return json!({
                "error": { "code": CODE_INTERNAL_ERROR, "message": format!("malformed request: {e}") }
            });
        }
    };

    let handler = lock(&inner.handlers).get(&request.method).cloned();
    match handler {
        Some(handler) => match handler(request.params).await {
            Ok(result) => json!({ "result": result }),
            Err(e) => json!({
                "error": { "code": CODE_INTERNAL_ERROR, "message": e.to_string() }
            }),
        },
        None => json!({
            "error": { "code": CODE_METHOD_NOT_FOUND, "message": "Method not found" }
        }),
    }
}

#[async_trait]
impl Protocol for RpcProtocol {
    fn config(&self) -> &ProtocolConfig {
        &self.inner.config
    }

    async fn start(&self) -> Result<(), FabricError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let inner = self.inner.clone();
        self.inner.transport.set_message_handler(Arc::new(move |message| {
            let inner = inner.clone();
            Box::pin(on_transport_message(inner, message))
        }));
        Ok(())
    }

    async fn stop(&self) -> Result<(), FabricError> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let senders: Vec<_> = lock(&self.inner.pending).drain().map(|(_, tx)| tx).collect();
        for tx in senders {
            let _ = tx.send(Err(FabricError::Connection("protocol stopped".into())));
        }
        Ok(())
    }

    async fn send(
        &self,
        message: Value,
        _target: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Value, FabricError> {
        match message.get("method").and_then(Value::as_str) {
            Some(method) => {
                let params = message.get("params").cloned().unwrap_or(Value::Null);
                self.request(method, params, timeout).await
            }
            None => {
                let id = Uuid::new_v4().to_string();
                let response =
                    self.inner.transport.send(TransportMessage::request(id, message)).await?;
                Ok(response.map(|r| r.payload).unwrap_or(Value::Null))
            }
        }
    }

    async fn receive(&self, timeout: Option<Duration>) -> Result<Value, FabricError> {
        let message = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.inner.transport.receive())
                .await
                .map_err(|_| FabricError::Timeout { elapsed: limit, timeout: limit })??,
            None => self.inner.transport.receive().await?,
        };
        Ok(message.payload)
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    async fn health(&self) -> Value {
        json!({
            "protocol": self.inner.config.name,
            "version": self.inner.config.version,
            "running": self.is_running(),
            "transport_connected": self.inner.transport.is_connected(),
            "handlers_registered": lock(&self.inner.handlers).len(),
            "pending_requests": self.pending_requests(),
        })
    }
}
