//! Fluent construction of unified agents.
//!
//! The transport class is chosen from the URL scheme: `http(s)` gives the
//! request/response transport, `ws(s)` the streaming transport. The registry
//! is created lazily when requested.

use super::UnifiedAgent;
use crate::auth::{AuthConfig, AuthManager};
use crate::error::FabricError;
use crate::protocol::{PeerProtocol, ProtocolConfig, RpcProtocol};
use crate::registry::ServiceRegistry;
use crate::transport::{HttpTransport, StreamTransport, Transport, TransportConfig};
use serde_json::Value;
use std::sync::Arc;

enum ProtocolSpec {
    Rpc { id: String, url: String, auth: Option<AuthConfig> },
    Peer { id: String, url: String, node_id: Option<String>, peers: Vec<String> },
}

/// Builder for [`UnifiedAgent`].
///
/// ```no_run
/// # use teamwire::agent::AgentBuilder;
/// # use teamwire::auth::AuthConfig;
/// # fn demo() -> Result<(), teamwire::FabricError> {
/// let agent = AgentBuilder::new("researcher")
///     .rpc_with_auth("tools", "http://localhost:8080", AuthConfig::Bearer { token: "t".into() })
///     .peer_network("team", "ws://localhost:9000/researcher", None, vec![])
///     .with_registry()
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct AgentBuilder {
    name: String,
    specs: Vec<ProtocolSpec>,
    registry: Option<Arc<ServiceRegistry>>,
    create_registry: bool,
    primary: Option<String>,
}

impl AgentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            specs: Vec::new(),
            registry: None,
            create_registry: false,
            primary: None,
        }
    }

    /// Add a request/response protocol reachable at `url`.
    pub fn rpc(mut self, id: impl Into<String>, url: impl Into<String>) -> Self {
        self.specs.push(ProtocolSpec::Rpc { id: id.into(), url: url.into(), auth: None });
        self
    }

    /// Add a request/response protocol with credentials.
    pub fn rpc_with_auth(
        mut self,
        id: impl Into<String>,
        url: impl Into<String>,
        auth: AuthConfig,
    ) -> Self {
        self.specs.push(ProtocolSpec::Rpc { id: id.into(), url: url.into(), auth: Some(auth) });
        self
    }

    /// Add a peer-to-peer protocol over a streaming connection.
    pub fn peer_network(
        mut self,
        id: impl Into<String>,
        url: impl Into<String>,
        node_id: Option<String>,
        peers: Vec<String>,
    ) -> Self {
        self.specs.push(ProtocolSpec::Peer {
            id: id.into(),
            url: url.into(),
            node_id,
            peers,
        });
        self
    }

    /// Create an in-memory registry for this agent at build time.
    pub fn with_registry(mut self) -> Self {
        self.create_registry = true;
        self
    }

    /// Share an existing registry instead of creating one.
    pub fn with_shared_registry(mut self, registry: Arc<ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Mark one protocol id as primary.
    pub fn primary(mut self, id: impl Into<String>) -> Self {
        self.primary = Some(id.into());
        self
    }

    pub fn build(self) -> Result<UnifiedAgent, FabricError> {
        let mut agent = UnifiedAgent::new(self.name);

        if let Some(registry) = self.registry {
            agent = agent.with_registry(registry);
        } else if self.create_registry {
            agent = agent.with_registry(Arc::new(ServiceRegistry::new()));
        }

        for spec in self.specs {
            match spec {
                ProtocolSpec::Rpc { id, url, auth } => {
                    let manager = match &auth {
                        Some(config) => Some(AuthManager::from_config(config)?),
                        None => None,
                    };
                    let transport = transport_for_url(&url, manager.as_ref())?;
                    let config = ProtocolConfig::new(id.clone())
                        .with_metadata("endpoint", Value::String(url));
                    let protocol =
                        RpcProtocol::with_config(config, transport.clone(), manager.clone());
                    agent.add_protocol(id, Arc::new(protocol), transport, manager, false)?;
                }
                ProtocolSpec::Peer { id, url, node_id, peers } => {
                    let transport = transport_for_url(&url, None)?;
                    let protocol = PeerProtocol::new(node_id, peers, transport.clone());
                    agent.add_protocol(id, Arc::new(protocol), transport, None, false)?;
                }
            }
        }

        if let Some(primary) = self.primary {
            agent.set_primary(&primary)?;
        }
        Ok(agent)
    }
}

/// Pick the transport implementation from the URL scheme and attach any
/// static auth headers to its configuration.
fn transport_for_url(
    url: &str,
    auth: Option<&AuthManager>,
) -> Result<Arc<dyn Transport>, FabricError> {
    let scheme = url
        .split_once("://")
        .map(|(scheme, _)| scheme)
        .ok_or_else(|| FabricError::Validation(format!("url has no scheme: {url}")))?;

    let mut config = TransportConfig::new(url);
    if let Some(manager) = auth {
        for (name, value) in manager.headers()? {
            config = config.with_header(name, value);
        }
    }

    match scheme {
        "http" | "https" => Ok(Arc::new(HttpTransport::new(config))),
        "ws" | "wss" => Ok(Arc::new(StreamTransport::new(config))),
        other => Err(FabricError::Validation(format!("no transport for scheme: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_selects_transport() {
        assert!(transport_for_url("http://x", None).is_ok());
        assert!(transport_for_url("wss://x", None).is_ok());

        assert!(matches!(
            transport_for_url("ftp://x", None),
            Err(FabricError::Validation(_))
        ));
        assert!(matches!(
            transport_for_url("nope", None),
            Err(FabricError::Validation(_))
        ));
    }

    #[test]
    fn first_protocol_becomes_primary() {
        let agent = AgentBuilder::new("a")
            .rpc("tools", "http://localhost:8080")
            .peer_network("team", "ws://localhost:9000", None, vec![])
            .build()
            .unwrap();
        assert_eq!(agent.primary_protocol(), Some("tools"));
        assert_eq!(agent.list_protocols(), vec!["team".to_string(), "tools".to_string()]);
    }

    #[test]
    fn explicit_primary_overrides() {
        let agent = AgentBuilder::new("a")
            .rpc("tools", "http://localhost:8080")
            .peer_network("team", "ws://localhost:9000", None, vec![])
            .primary("team")
            .build()
            .unwrap();
        assert_eq!(agent.primary_protocol(), Some("team"));
    }

    #[test]
    fn duplicate_protocol_id_rejected() {
        let err = AgentBuilder::new("a")
            .rpc("tools", "http://localhost:8080")
            .rpc("tools", "http://localhost:8081")
            .build()
            .unwrap_err();
        assert!(matches!(err, FabricError::Validation(_)));
    }

    #[test]
    fn unknown_primary_rejected() {
        let err = AgentBuilder::new("a")
            .rpc("tools", "http://localhost:8080")
            .primary("ghost")
            .build()
            .unwrap_err();
        assert!(matches!(err, FabricError::Validation(_)));
    }

    #[test]
    fn registry_created_lazily() {
        let agent = AgentBuilder::new("a")
            .rpc("tools", "http://localhost:8080")
            .with_registry()
            .build()
            .unwrap();
        assert!(agent.registry().is_some());

        let bare = AgentBuilder::new("b").rpc("tools", "http://localhost:8080").build().unwrap();
        assert!(bare.registry().is_none());
    }
}
