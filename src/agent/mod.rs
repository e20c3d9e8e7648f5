//! Unified agent: one addressable identity composing one or more protocols,
//! each bound to its own transport and optional auth.

mod builder;

pub use builder::AgentBuilder;

use crate::auth::AuthManager;
use crate::error::FabricError;
use crate::protocol::Protocol;
use crate::registry::{Registration, ServiceRegistry};
use crate::transport::Transport;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

struct ProtocolBinding {
    protocol: Arc<dyn Protocol>,
    transport: Arc<dyn Transport>,
    #[allow(dead_code)]
    auth: Option<AuthManager>,
}

/// An identity with a primary protocol plus zero or more additional ones.
pub struct UnifiedAgent {
    name: String,
    bindings: BTreeMap<String, ProtocolBinding>,
    primary: Option<String>,
    registry: Option<Arc<ServiceRegistry>>,
    running: bool,
}

impl UnifiedAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bindings: BTreeMap::new(),
            primary: None,
            registry: None,
            running: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn with_registry(mut self, registry: Arc<ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn registry(&self) -> Option<&Arc<ServiceRegistry>> {
        self.registry.as_ref()
    }

    /// Attach a protocol under a unique id. The first protocol added becomes
    /// primary unless a later `primary` flag or `set_primary` overrides it.
    pub fn add_protocol(
        &mut self,
        id: impl Into<String>,
        protocol: Arc<dyn Protocol>,
        transport: Arc<dyn Transport>,
        auth: Option<AuthManager>,
        primary: bool,
    ) -> Result<&mut Self, FabricError> {
        let id = id.into();
        if self.bindings.contains_key(&id) {
            return Err(FabricError::Validation(format!("protocol {id} already registered")));
        }

        self.bindings.insert(id.clone(), ProtocolBinding { protocol, transport, auth });
        if primary || self.primary.is_none() {
            self.primary = Some(id.clone());
        }
        info!(agent = %self.name, protocol = %id, "added protocol");
        Ok(self)
    }

    pub fn set_primary(&mut self, id: &str) -> Result<(), FabricError> {
        if !self.bindings.contains_key(id) {
            return Err(FabricError::Validation(format!("unknown protocol: {id}")));
        }
        self.primary = Some(id.to_string());
        Ok(())
    }

    pub fn primary_protocol(&self) -> Option<&str> {
        self.primary.as_deref()
    }

    pub fn list_protocols(&self) -> Vec<String> {
        self.bindings.keys().cloned().collect()
    }

    pub fn protocol(&self, id: &str) -> Option<Arc<dyn Protocol>> {
        self.bindings.get(id).map(|b| b.protocol.clone())
    }

    pub fn transport(&self, id: &str) -> Option<Arc<dyn Transport>> {
        self.bindings.get(id).map(|b| b.transport.clone())
    }

    /// Connect every transport, start every protocol, and register each
    /// `{agent}:{protocol}` in the attached registry.
    pub async fn start(&mut self, register: bool) -> Result<(), FabricError> {
        if self.running {
            warn!(agent = %self.name, "agent already running");
            return Ok(());
        }

        info!(agent = %self.name, "starting agent");
        for (id, binding) in &self.bindings {
            binding.transport.connect().await.map_err(|e| {
                error!(agent = %self.name, protocol = %id, error = %e, "transport connect failed");
                e
            })?;
        }
        for (id, binding) in &self.bindings {
            binding.protocol.start().await.map_err(|e| {
                error!(agent = %self.name, protocol = %id, error = %e, "protocol start failed");
                e
            })?;
        }

        if register {
            if let Some(registry) = &self.registry {
                for (id, binding) in &self.bindings {
                    let primary = self.primary.as_deref() == Some(id.as_str());
                    registry
                        .register(
                            format!("{}:{}", self.name, id),
                            id.clone(),
                            Registration::new()
                                .endpoint(binding.transport.config().url.clone())
                                .metadata("agent", json!(self.name))
                                .metadata("protocol", json!(id))
                                .metadata("primary", json!(primary))
                                .tag(self.name.clone())
                                .tag(id.clone()),
                        )
                        .await?;
                }
            }
        }

        self.running = true;
        info!(agent = %self.name, "agent started");
        Ok(())
    }

    /// Unregister, stop protocols, disconnect transports. Idempotent;
    /// shutdown failures are logged and do not abort the unwind.
    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }
        info!(agent = %self.name, "stopping agent");

        if let Some(registry) = &self.registry {
            for id in self.bindings.keys() {
                registry.unregister(&format!("{}:{}", self.name, id)).await;
            }
        }

        for (id, binding) in &self.bindings {
            if let Err(e) = binding.protocol.stop().await {
                error!(agent = %self.name, protocol = %id, error = %e, "protocol stop failed");
            }
        }
        for (id, binding) in &self.bindings {
            if let Err(e) = binding.transport.disconnect().await {
                error!(agent = %self.name, protocol = %id, error = %e, "transport disconnect failed");
            }
        }

        self.running = false;
        info!(agent = %self.name, "agent stopped");
    }

    fn resolve(&self, protocol: Option<&str>) -> Result<&ProtocolBinding, FabricError> {
        let id = protocol
            .map(str::to_string)
            .or_else(|| self.primary.clone())
            .ok_or_else(|| {
                FabricError::Validation("no protocol specified and no primary set".into())
            })?;
        self.bindings
            .get(&id)
            .ok_or_else(|| FabricError::Validation(format!("unknown protocol: {id}")))
    }

    /// Send a message using the specified or primary protocol.
    pub async fn send(
        &self,
        message: Value,
        target: Option<&str>,
        protocol: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Value, FabricError> {
        self.resolve(protocol)?.protocol.send(message, target, timeout).await
    }

    /// Receive from the specified or primary protocol.
    pub async fn receive(
        &self,
        protocol: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Value, FabricError> {
        self.resolve(protocol)?.protocol.receive(timeout).await
    }

    /// RPC-style call: wraps method/params into a request payload.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        target: Option<&str>,
        protocol: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Value, FabricError> {
        self.send(json!({ "method": method, "params": params }), target, protocol, timeout).await
    }

    /// Discover services in the attached registry.
    pub async fn discover_services(
        &self,
        service_type: Option<&str>,
        tags: Option<&BTreeSet<String>>,
    ) -> Vec<crate::registry::ServiceInfo> {
        match &self.registry {
            Some(registry) => registry.discover(service_type, tags, None).await,
            None => Vec::new(),
        }
    }

    /// Health of every protocol and transport.
    pub async fn health_check(&self) -> Value {
        let mut protocols = serde_json::Map::new();
        for (id, binding) in &self.bindings {
            protocols.insert(
                id.clone(),
                json!({
                    "connected": binding.transport.is_connected(),
                    "status": binding.protocol.health().await,
                }),
            );
        }
        json!({
            "agent": self.name,
            "running": self.running,
            "protocols": protocols,
        })
    }
}

impl std::fmt::Debug for UnifiedAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedAgent")
            .field("name", &self.name)
            .field("protocols", &self.list_protocols())
            .field("primary", &self.primary)
            .field("running", &self.running)
            .finish()
    }
}
