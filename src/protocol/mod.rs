//! Protocol core: request/response correlation, peer messaging, pub/sub,
//! and consensus on top of the transport layer.

mod consensus;
mod peer;
mod pubsub;
mod rpc;

pub use consensus::{ConsensusKind, ConsensusNode, Proposal, Vote};
pub use peer::PeerProtocol;
pub use pubsub::{PubSub, PubSubMessage, SubscriberHandler};
pub use rpc::RpcProtocol;

use crate::error::FabricError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// JSON-RPC style code for an unknown method.
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC style code for a handler failure.
pub const CODE_INTERNAL_ERROR: i64 = -32603;

/// Configuration shared by protocol implementations.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub name: String,
    pub version: String,
    pub metadata: Map<String, Value>,
}

impl ProtocolConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), version: "1.0".to_string(), metadata: Map::new() }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Async handler registered under a method name.
pub type MethodHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, FabricError>> + Send + Sync>;

/// Common protocol surface consumed by the unified agent.
#[async_trait]
pub trait Protocol: Send + Sync {
    fn config(&self) -> &ProtocolConfig;

    async fn start(&self) -> Result<(), FabricError>;

    /// Stop the protocol, draining any pending correlation state. Idempotent.
    async fn stop(&self) -> Result<(), FabricError>;

    /// Send a message; method-shaped payloads (`{"method", "params"}`) are
    /// dispatched as requests.
    async fn send(
        &self,
        message: Value,
        target: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Value, FabricError>;

    /// Receive the next unsolicited message payload.
    async fn receive(&self, timeout: Option<Duration>) -> Result<Value, FabricError>;

    fn is_running(&self) -> bool;

    /// Health snapshot for diagnostics.
    async fn health(&self) -> Value;
}
