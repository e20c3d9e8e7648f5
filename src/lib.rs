#![forbid(unsafe_code)]

//! # Teamwire
//!
//! Coordination and protocol core for distributed teams of LLM-backed
//! workers: tiered routing with escalation, a human-review queue,
//! transport-agnostic messaging with pluggable auth, and composable
//! resilience policies.
//!
//! ## Subsystems
//!
//! - **Resilience**: [`RetryPolicy`], [`TimeoutPolicy`], [`CachePolicy`],
//!   [`RateLimitPolicy`], [`FallbackPolicy`], and the [`ResilientStack`]
//!   composite.
//! - **Transport**: [`transport::HttpTransport`] (request/response) and
//!   [`transport::StreamTransport`] (persistent bidirectional), both behind
//!   the [`transport::Transport`] contract.
//! - **Auth**: [`auth::AuthManager`] over API-key, bearer, basic, HMAC,
//!   and JWT providers.
//! - **Registry**: [`registry::ServiceRegistry`] with discovery, health
//!   checks, and watchers.
//! - **Protocols**: [`protocol::RpcProtocol`] (request/response
//!   correlation), [`protocol::PeerProtocol`] (agent-to-agent),
//!   [`protocol::PubSub`], and [`protocol::ConsensusNode`].
//! - **Coordination**: [`mesh::ServiceMesh`] (tier-aware dispatch and
//!   escalation), [`escalation::EscalationManager`] (human review), and
//!   [`coordinator::Coordinator`] (worker-pool delegation).
//!
//! ## Quick start
//!
//! ```rust
//! use teamwire::mesh::{NodeRole, RoutingStrategy, ServiceMesh};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), teamwire::FabricError> {
//!     let mesh = ServiceMesh::new(RoutingStrategy::LeastLoaded);
//!     mesh.add_node("triage-bot", NodeRole::Frontline, [], 5).await?;
//!     mesh.add_node("billing-bot", NodeRole::Specialist, ["billing".into()], 3).await?;
//!
//!     let request = mesh.route_request("cust-1", "password reset", "general", 5).await?;
//!     mesh.resolve_request(request.id, "reset link sent", None).await;
//!     Ok(())
//! }
//! ```

mod backoff;
mod cache;
mod error;
mod fallback;
mod jitter;
mod rate_limit;
mod retry;
mod sleeper;
mod stack;
mod sync;
mod timeout;

pub mod agent;
pub mod auth;
pub mod clock;
pub mod coordinator;
pub mod escalation;
pub mod mesh;
pub mod protocol;
pub mod registry;
pub mod transport;

// Re-exports
pub use backoff::Backoff;
pub use cache::{CacheConfigError, CacheInfo, CachePolicy};
pub use error::{ErrorKind, FabricError, FabricResult};
pub use fallback::FallbackPolicy;
pub use jitter::Jitter;
pub use rate_limit::{OnLimit, RateLimitConfigError, RateLimitPolicy};
pub use retry::{RetryBuildError, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use stack::{resilient, ResilientStack, ResilientStackBuilder};
pub use sync::Synchronized;
pub use timeout::{TimeoutConfigError, TimeoutPolicy, MAX_TIMEOUT};

pub mod prelude;
