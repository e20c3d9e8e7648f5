//! Request/response transport over HTTP.

use super::{
    ErrorHandler, MessageHandler, MessageKind, Transport, TransportConfig, TransportMessage,
};
use crate::error::FabricError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

const NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP transport: `send` POSTs the payload to the configured endpoint and
/// synthesises a RESPONSE from the reply. `receive` is unsupported.
pub struct HttpTransport {
    config: TransportConfig,
    client: Mutex<Option<reqwest::Client>>,
    connected: AtomicBool,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config, client: Mutex::new(None), connected: AtomicBool::new(false) }
    }

    fn client(&self) -> Result<reqwest::Client, FabricError> {
        self.client
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| FabricError::Connection("not connected".into()))
    }

    fn endpoint_url(&self) -> String {
        let base = self.config.url.trim_end_matches('/');
        let path = self.config.endpoint_path.trim_start_matches('/');
        if path.is_empty() {
            base.to_string()
        } else {
            format!("{base}/{path}")
        }
    }

    fn map_request_error(&self, e: reqwest::Error) -> FabricError {
        if e.is_timeout() {
            FabricError::Timeout { elapsed: self.config.timeout, timeout: self.config.timeout }
        } else {
            FabricError::Connection(format!("http request failed: {e}"))
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self) -> Result<(), FabricError> {
        let mut builder = reqwest::Client::builder().timeout(self.config.timeout);

        let mut default_headers = reqwest::header::HeaderMap::new();
        for (name, value) in &self.config.headers {
            let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| FabricError::Validation(format!("invalid header name: {e}")))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| FabricError::Validation(format!("invalid header value: {e}")))?;
            default_headers.insert(name, value);
        }
        if !default_headers.is_empty() {
            builder = builder.default_headers(default_headers);
        }

        let client = builder
            .build()
            .map_err(|e| FabricError::Connection(format!("failed to build client: {e}")))?;

        if self.config.probe_health {
            let probe = format!("{}/health", self.config.url.trim_end_matches('/'));
            match client.get(&probe).timeout(HEALTH_PROBE_TIMEOUT).send().await {
                Ok(resp) if !resp.status().is_success() => {
                    // Tolerated: the endpoint may not expose a health route.
                    warn!(status = %resp.status(), url = %probe, "health probe returned non-200");
                }
                Ok(_) => debug!(url = %probe, "health probe ok"),
                Err(e) => warn!(url = %probe, error = %e, "health probe failed"),
            }
        }

        *self.client.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(client);
        self.connected.store(true, Ordering::SeqCst);
        info!(url = %self.config.url, "http transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), FabricError> {
        *self.client.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        self.connected.store(false, Ordering::SeqCst);
        info!(url = %self.config.url, "http transport disconnected");
        Ok(())
    }

    async fn send(
        &self,
        message: TransportMessage,
    ) -> Result<Option<TransportMessage>, FabricError> {
        if !self.is_connected() {
            return Err(FabricError::Connection("not connected".into()));
        }
        let client = self.client()?;

        let is_notification = message.kind == MessageKind::Notification;
        let body = serde_json::to_string(&message.payload)
            .map_err(|e| FabricError::Protocol(format!("failed to encode payload: {e}")))?;

        let mut request = client
            .post(self.endpoint_url())
            .header(reqwest::header::CONTENT_TYPE, self.config.content_type.clone())
            .body(body);
        if is_notification {
            request = request.timeout(NOTIFICATION_TIMEOUT);
        }

        let response = request.send().await.map_err(|e| self.map_request_error(e))?;

        if is_notification {
            return Ok(None);
        }

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| FabricError::Connection(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            return Err(FabricError::Connection(format!("http error {status}: {text}")));
        }

        let payload = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));
        Ok(Some(TransportMessage {
            id: message.id,
            kind: MessageKind::Response,
            payload,
            metadata: None,
        }))
    }

    async fn receive(&self) -> Result<TransportMessage, FabricError> {
        Err(FabricError::Protocol("http transport does not support receive".into()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_message_handler(&self, _handler: MessageHandler) {
        // Request/response transport has no unsolicited inbound traffic.
    }

    fn set_error_handler(&self, _handler: ErrorHandler) {}

    fn config(&self) -> &TransportConfig {
        &self.config
    }
}
