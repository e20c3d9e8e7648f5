//! Shared test helpers.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use teamwire::transport::{
    ErrorHandler, MessageHandler, Transport, TransportConfig, TransportMessage,
};
use teamwire::FabricError;

/// In-memory transport double. Outbound messages are recorded; inbound
/// traffic is injected by the test through the registered handler, like a
/// streaming transport's reader would.
pub struct ChannelTransport {
    config: TransportConfig,
    connected: AtomicBool,
    handler: Mutex<Option<MessageHandler>>,
    sent: Mutex<Vec<TransportMessage>>,
}

impl ChannelTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            connected: AtomicBool::new(false),
            handler: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Messages sent through this transport so far.
    pub fn sent(&self) -> Vec<TransportMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Deliver an inbound message to the registered handler.
    pub async fn inject(&self, message: TransportMessage) {
        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(message).await;
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(&self) -> Result<(), FabricError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), FabricError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(
        &self,
        message: TransportMessage,
    ) -> Result<Option<TransportMessage>, FabricError> {
        if !self.is_connected() {
            return Err(FabricError::Connection("not connected".into()));
        }
        self.sent.lock().unwrap().push(message);
        // Like the streaming transport: responses arrive via the handler.
        Ok(None)
    }

    async fn receive(&self) -> Result<TransportMessage, FabricError> {
        Err(FabricError::Protocol("channel transport has no inbox".into()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn set_error_handler(&self, _handler: ErrorHandler) {}

    fn config(&self) -> &TransportConfig {
        &self.config
    }
}
