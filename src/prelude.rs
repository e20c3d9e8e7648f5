//! Convenient re-exports for common Teamwire types.
pub use crate::{
    agent::{AgentBuilder, UnifiedAgent},
    auth::{AuthConfig, AuthContext, AuthManager, AuthOutcome, AuthProvider, HmacAlgorithm},
    clock::{Clock, ManualClock, SystemClock},
    coordinator::{
        Coordinator, DelegationStrategy, TaskAssignment, TaskStatus, Worker, WorkerResponse,
    },
    escalation::{
        EscalationManager, EscalationParams, EscalationPriority, EscalationRequest,
        EscalationStatus, Reviewer,
    },
    mesh::{MeshNode, NodeRole, RequestStatus, RoutingStrategy, ServiceMesh, ServiceRequest},
    protocol::{
        ConsensusKind, ConsensusNode, PeerProtocol, Protocol, ProtocolConfig, PubSub, RpcProtocol,
    },
    registry::{Registration, RegistryEvent, ServiceInfo, ServiceRegistry, ServiceStatus},
    transport::{
        HttpTransport, MessageKind, StreamTransport, Transport, TransportConfig, TransportMessage,
    },
    Backoff, CachePolicy, ErrorKind, FabricError, FabricResult, FallbackPolicy, Jitter, OnLimit,
    RateLimitPolicy, ResilientStack, RetryPolicy, Sleeper, Synchronized, TimeoutPolicy,
    TokioSleeper,
};
