//! Persistent bidirectional transport over WebSocket.
//!
//! After `connect` a background reader drains inbound frames: RESPONSE
//! frames with a matching id resolve the pending request future, everything
//! else goes to the registered handler or the `receive` inbox. Connection
//! loss completes all pending requests with a connection error and, when
//! enabled, triggers exponential-backoff reconnection. Keep-alive pings run
//! on their own task; a missed pong counts as connection loss.

use super::{
    ErrorHandler, MessageHandler, MessageKind, Transport, TransportConfig, TransportMessage,
};
use crate::error::FabricError;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type PendingMap = HashMap<String, oneshot::Sender<Result<TransportMessage, FabricError>>>;

struct Shared {
    config: TransportConfig,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    pending: Mutex<PendingMap>,
    inbox_tx: mpsc::UnboundedSender<TransportMessage>,
    inbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportMessage>>,
    message_handler: Mutex<Option<MessageHandler>>,
    error_handler: Mutex<Option<ErrorHandler>>,
    connected: AtomicBool,
    auto_reconnect: AtomicBool,
    reconnect_attempts: AtomicUsize,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    ping_task: Mutex<Option<JoinHandle<()>>>,
    last_pong: Mutex<Instant>,
}

/// Streaming transport backed by a WebSocket connection.
pub struct StreamTransport {
    shared: Arc<Shared>,
}

impl StreamTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                config,
                writer: tokio::sync::Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                inbox_tx,
                inbox_rx: tokio::sync::Mutex::new(inbox_rx),
                message_handler: Mutex::new(None),
                error_handler: Mutex::new(None),
                connected: AtomicBool::new(false),
                auto_reconnect: AtomicBool::new(false),
                reconnect_attempts: AtomicUsize::new(0),
                reader_task: Mutex::new(None),
                ping_task: Mutex::new(None),
                last_pong: Mutex::new(Instant::now()),
            }),
        }
    }

    async fn write_frame(&self, frame: WsMessage) -> Result<(), FabricError> {
        let mut writer = self.shared.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => sink
                .send(frame)
                .await
                .map_err(|e| FabricError::Connection(format!("failed to send frame: {e}"))),
            None => Err(FabricError::Connection("not connected".into())),
        }
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn open_connection(
    shared: &Arc<Shared>,
) -> futures::future::BoxFuture<'_, Result<(), FabricError>> {
    Box::pin(async move {
        let (ws, _) = connect_async(shared.config.url.as_str())
            .await
            .map_err(|e| FabricError::Connection(format!("websocket connect failed: {e}")))?;
        let (sink, source) = ws.split();

        *shared.writer.lock().await = Some(sink);
        *lock(&shared.last_pong) = Instant::now();
        shared.connected.store(true, Ordering::SeqCst);
        shared.reconnect_attempts.store(0, Ordering::SeqCst);

        let reader = tokio::spawn(reader_loop(shared.clone(), source));
        if let Some(old) = lock(&shared.reader_task).replace(reader) {
            old.abort();
        }

        let pinger = tokio::spawn(ping_loop(shared.clone()));
        if let Some(old) = lock(&shared.ping_task).replace(pinger) {
            old.abort();
        }

        info!(url = %shared.config.url, "stream transport connected");
        Ok(())
    })
}

async fn reader_loop(shared: Arc<Shared>, mut source: WsSource) {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => dispatch_frame(&shared, &text).await,
            Ok(WsMessage::Pong(_)) => {
                *lock(&shared.last_pong) = Instant::now();
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                report_error(&shared, FabricError::Connection(format!("read failed: {e}")));
                break;
            }
        }
    }
    handle_connection_loss(shared).await;
}

async fn dispatch_frame(shared: &Arc<Shared>, raw: &str) {
    let message = match TransportMessage::decode(raw) {
        Ok(m) => m,
        Err(e) => {
            report_error(shared, e);
            return;
        }
    };

    if message.kind == MessageKind::Response {
        if let Some(id) = &message.id {
            let sender = lock(&shared.pending).remove(id);
            match sender {
                Some(tx) => {
                    let _ = tx.send(Ok(message));
                    return;
                }
                None => {
                    // Late response for a timed-out or cancelled request.
                    debug!(%id, "dropping response with no pending request");
                    return;
                }
            }
        }
    }

    let handler = lock(&shared.message_handler).clone();
    match handler {
        Some(h) => h(message).await,
        None => {
            let _ = shared.inbox_tx.send(message);
        }
    }
}

async fn ping_loop(shared: Arc<Shared>) {
    loop {
        tokio::time::sleep(shared.config.ping.interval).await;

        let sent_at = Instant::now();
        {
            let mut writer = shared.writer.lock().await;
            let sent = match writer.as_mut() {
                Some(sink) => sink.send(WsMessage::Ping(Vec::new())).await.is_ok(),
                None => false,
            };
            if !sent {
                return;
            }
        }

        tokio::time::sleep(shared.config.ping.timeout).await;
        if *lock(&shared.last_pong) < sent_at {
            warn!(url = %shared.config.url, "keep-alive pong missed, treating as connection loss");
            if let Some(reader) = lock(&shared.reader_task).take() {
                reader.abort();
            }
            handle_connection_loss(shared).await;
            return;
        }
    }
}

async fn handle_connection_loss(shared: Arc<Shared>) {
    // Only the first observer runs cleanup.
    if !shared.connected.swap(false, Ordering::SeqCst) {
        return;
    }

    *shared.writer.lock().await = None;

    let senders: Vec<_> = lock(&shared.pending).drain().map(|(_, tx)| tx).collect();
    for tx in senders {
        let _ = tx.send(Err(FabricError::Connection("connection closed".into())));
    }

    if shared.auto_reconnect.load(Ordering::SeqCst) {
        tokio::spawn(reconnect_loop(shared.clone()));
    }
}

async fn reconnect_loop(shared: Arc<Shared>) {
    loop {
        let attempt = shared.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > shared.config.reconnect.max_attempts {
            report_error(
                &shared,
                FabricError::Connection(format!(
                    "reconnect gave up after {} attempts",
                    shared.config.reconnect.max_attempts
                )),
            );
            return;
        }

        let exponent = (attempt - 1).min(u32::MAX as usize) as u32;
        let delay = shared
            .config
            .reconnect
            .initial_delay
            .checked_mul(2u32.saturating_pow(exponent))
            .unwrap_or(shared.config.reconnect.max_delay)
            .min(shared.config.reconnect.max_delay);
        info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::time::sleep(delay).await;

        if !shared.auto_reconnect.load(Ordering::SeqCst) {
            return;
        }
        match open_connection(&shared).await {
            Ok(()) => {
                info!(attempt, "reconnected");
                return;
            }
            Err(e) => warn!(attempt, error = %e, "reconnect attempt failed"),
        }
    }
}

fn report_error(shared: &Arc<Shared>, err: FabricError) {
    error!(url = %shared.config.url, %err, "stream transport error");
    let handler = lock(&shared.error_handler).clone();
    if let Some(h) = handler {
        tokio::spawn(h(err));
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn connect(&self) -> Result<(), FabricError> {
        if self.is_connected() {
            return Ok(());
        }
        self.shared
            .auto_reconnect
            .store(self.shared.config.reconnect.enabled, Ordering::SeqCst);
        open_connection(&self.shared).await
    }

    async fn disconnect(&self) -> Result<(), FabricError> {
        self.shared.auto_reconnect.store(false, Ordering::SeqCst);

        if let Some(task) = lock(&self.shared.ping_task).take() {
            task.abort();
        }
        if let Some(task) = lock(&self.shared.reader_task).take() {
            task.abort();
        }

        {
            let mut writer = self.shared.writer.lock().await;
            if let Some(mut sink) = writer.take() {
                let _ = sink.send(WsMessage::Close(None)).await;
            }
        }

        let senders: Vec<_> = lock(&self.shared.pending).drain().map(|(_, tx)| tx).collect();
        for tx in senders {
            let _ = tx.send(Err(FabricError::Connection("transport disconnected".into())));
        }

        self.shared.connected.store(false, Ordering::SeqCst);
        info!(url = %self.shared.config.url, "stream transport disconnected");
        Ok(())
    }

    async fn send(
        &self,
        mut message: TransportMessage,
    ) -> Result<Option<TransportMessage>, FabricError> {
        if !self.is_connected() {
            return Err(FabricError::Connection("not connected".into()));
        }

        if message.kind != MessageKind::Request {
            self.write_frame(WsMessage::Text(message.encode()?)).await?;
            return Ok(None);
        }

        let id = match &message.id {
            Some(id) => id.clone(),
            None => {
                let id = Uuid::new_v4().to_string();
                message.id = Some(id.clone());
                id
            }
        };

        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(id.clone(), tx);

        if let Err(e) = self.write_frame(WsMessage::Text(message.encode()?)).await {
            lock(&self.shared.pending).remove(&id);
            return Err(e);
        }

        let timeout = self.shared.config.timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result.map(Some),
            Ok(Err(_)) => {
                lock(&self.shared.pending).remove(&id);
                Err(FabricError::Connection("connection closed".into()))
            }
            Err(_) => {
                // A response arriving after this point is dropped by the reader.
                lock(&self.shared.pending).remove(&id);
                Err(FabricError::Timeout { elapsed: timeout, timeout })
            }
        }
    }

    async fn receive(&self) -> Result<TransportMessage, FabricError> {
        let mut inbox = self.shared.inbox_rx.lock().await;
        inbox
            .recv()
            .await
            .ok_or_else(|| FabricError::Connection("transport closed".into()))
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        *lock(&self.shared.message_handler) = Some(handler);
    }

    fn set_error_handler(&self, handler: ErrorHandler) {
        *lock(&self.shared.error_handler) = Some(handler);
    }

    fn config(&self) -> &TransportConfig {
        &self.shared.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn send_before_connect_fails() {
        let t = StreamTransport::new(TransportConfig::new("ws://localhost:1"));
        let err = t.send(TransportMessage::request("1", json!({}))).await.unwrap_err();
        assert!(err.is_connection());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let t = StreamTransport::new(TransportConfig::new("ws://localhost:1"));
        t.disconnect().await.unwrap();
        t.disconnect().await.unwrap();
        assert!(!t.is_connected());
    }

    #[tokio::test]
    async fn pending_requests_fail_on_disconnect() {
        let t = StreamTransport::new(TransportConfig::new("ws://localhost:1"));
        let (tx, rx) = oneshot::channel();
        lock(&t.shared.pending).insert("req-1".into(), tx);

        t.disconnect().await.unwrap();

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(FabricError::Connection(_))));
        assert!(lock(&t.shared.pending).is_empty());
    }

    #[tokio::test]
    async fn late_response_is_dropped() {
        let t = StreamTransport::new(TransportConfig::new("ws://localhost:1"));
        // No pending entry for this id; dispatch must not panic or enqueue.
        let frame = TransportMessage::response("ghost", json!({"ok": true})).encode().unwrap();
        dispatch_frame(&t.shared, &frame).await;
        assert!(lock(&t.shared.pending).is_empty());
    }
}
