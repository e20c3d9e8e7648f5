//! Tier-aware service mesh: admission, load-balanced dispatch, and
//! hierarchical escalation of requests across capability tiers.
//!
//! All mesh-state mutations happen inside one exclusive critical section per
//! operation; eligibility is evaluated and the load incremented under the
//! same lock, so an admission-then-increment race cannot occur. Handler
//! fan-out runs after the lock is released.

use crate::error::FabricError;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Capability tier, ordered by escalation precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Frontline,
    Specialist,
    Expert,
}

impl NodeRole {
    /// The tier a request moves to when this tier cannot resolve it.
    pub fn next_tier(self) -> NodeRole {
        match self {
            NodeRole::Frontline => NodeRole::Specialist,
            NodeRole::Specialist => NodeRole::Expert,
            NodeRole::Expert => NodeRole::Expert,
        }
    }
}

/// One worker plus its routing state.
#[derive(Debug, Clone, Serialize)]
pub struct MeshNode {
    pub id: Uuid,
    /// Name of the externally owned worker this node fronts.
    pub worker: String,
    pub role: NodeRole,
    pub specialties: BTreeSet<String>,
    pub current_load: u32,
    pub max_capacity: u32,
    pub available: bool,
}

impl MeshNode {
    pub fn load_percentage(&self) -> f64 {
        if self.max_capacity == 0 {
            return 0.0;
        }
        (self.current_load as f64 / self.max_capacity as f64) * 100.0
    }

    /// Whether this node may take a request on `topic` right now.
    pub fn can_handle(&self, topic: &str) -> bool {
        if !self.available || self.current_load >= self.max_capacity {
            return false;
        }
        if self.role == NodeRole::Expert {
            return true;
        }
        if !self.specialties.is_empty() {
            let topic = topic.to_lowercase();
            return self.specialties.iter().any(|s| s.to_lowercase() == topic);
        }
        // A frontline node with no declared specialties takes anything.
        self.role == NodeRole::Frontline
    }
}

/// Lifecycle of a request in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Assigned,
    Escalated,
    Resolved,
    EscalationFailed,
}

/// Append-only audit record on a request.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub details: Value,
}

/// A customer request flowing through the mesh.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceRequest {
    pub id: Uuid,
    pub customer_id: String,
    pub query: String,
    pub topic: String,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub assigned_to: Option<Uuid>,
    pub escalation_count: u32,
    pub status: RequestStatus,
    pub resolution: Option<String>,
    pub history: Vec<HistoryEntry>,
}

impl ServiceRequest {
    pub fn new(
        customer_id: impl Into<String>,
        query: impl Into<String>,
        topic: impl Into<String>,
        priority: u8,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer_id: customer_id.into(),
            query: query.into(),
            topic: topic.into(),
            priority,
            created_at: Utc::now(),
            assigned_to: None,
            escalation_count: 0,
            status: RequestStatus::Pending,
            resolution: None,
            history: Vec::new(),
        }
    }

    fn record(&mut self, action: &str, details: Value) {
        self.history.push(HistoryEntry {
            timestamp: Utc::now(),
            action: action.to_string(),
            details,
        });
    }
}

/// Dispatch strategy for eligible nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingStrategy {
    #[default]
    LeastLoaded,
    RoundRobin,
}

/// Async callback fired on escalation or resolution transitions.
pub type MeshHandler =
    Arc<dyn Fn(ServiceRequest) -> BoxFuture<'static, Result<(), FabricError>> + Send + Sync>;

/// Per-role load summary.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub worker: String,
    pub load: u32,
    pub capacity: u32,
    pub load_percentage: f64,
    pub specialties: Vec<String>,
    pub available: bool,
}

/// Aggregate mesh snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MeshStatus {
    pub total_nodes: usize,
    pub total_capacity: u32,
    pub current_load: u32,
    pub utilization: f64,
    pub active_requests: usize,
    pub escalation_count: u32,
    pub resolution_count: usize,
    pub nodes_by_role: HashMap<NodeRole, Vec<NodeSummary>>,
}

#[derive(Default)]
struct MeshState {
    nodes: HashMap<Uuid, MeshNode>,
    requests: HashMap<Uuid, ServiceRequest>,
    last_assigned: Option<Uuid>,
}

/// The service mesh.
pub struct ServiceMesh {
    state: Mutex<MeshState>,
    strategy: RoutingStrategy,
    escalation_handlers: std::sync::Mutex<Vec<MeshHandler>>,
    resolution_handlers: std::sync::Mutex<Vec<MeshHandler>>,
}

impl ServiceMesh {
    pub fn new(strategy: RoutingStrategy) -> Self {
        Self {
            state: Mutex::new(MeshState::default()),
            strategy,
            escalation_handlers: std::sync::Mutex::new(Vec::new()),
            resolution_handlers: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Add a worker node to the mesh.
    pub async fn add_node(
        &self,
        worker: impl Into<String>,
        role: NodeRole,
        specialties: impl IntoIterator<Item = String>,
        max_capacity: u32,
    ) -> Result<MeshNode, FabricError> {
        if max_capacity == 0 {
            return Err(FabricError::Validation("max_capacity must be > 0".into()));
        }
        let node = MeshNode {
            id: Uuid::new_v4(),
            worker: worker.into(),
            role,
            specialties: specialties.into_iter().map(|s| s.to_lowercase()).collect(),
            current_load: 0,
            max_capacity,
            available: true,
        };
        let mut state = self.state.lock().await;
        info!(node = %node.id, worker = %node.worker, role = ?role, "added node to mesh");
        state.nodes.insert(node.id, node.clone());
        Ok(node)
    }

    /// Mark a node (un)available for new assignments.
    pub async fn set_available(&self, node_id: Uuid, available: bool) -> bool {
        let mut state = self.state.lock().await;
        match state.nodes.get_mut(&node_id) {
            Some(node) => {
                node.available = available;
                true
            }
            None => false,
        }
    }

    pub async fn node(&self, node_id: Uuid) -> Option<MeshNode> {
        self.state.lock().await.nodes.get(&node_id).cloned()
    }

    pub async fn request(&self, request_id: Uuid) -> Option<ServiceRequest> {
        self.state.lock().await.requests.get(&request_id).cloned()
    }

    pub async fn request_history(&self, request_id: Uuid) -> Vec<HistoryEntry> {
        self.state
            .lock()
            .await
            .requests
            .get(&request_id)
            .map(|r| r.history.clone())
            .unwrap_or_default()
    }

    pub fn register_escalation_handler(&self, handler: MeshHandler) {
        self.escalation_handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handler);
    }

    pub fn register_resolution_handler(&self, handler: MeshHandler) {
        self.resolution_handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handler);
    }

    /// Route a new customer request to the best eligible node.
    pub async fn route_request(
        &self,
        customer_id: impl Into<String>,
        query: impl Into<String>,
        topic: impl Into<String>,
        priority: u8,
    ) -> Result<ServiceRequest, FabricError> {
        if !(1..=10).contains(&priority) {
            return Err(FabricError::Validation(format!(
                "priority must be in 1..=10 (got {priority})"
            )));
        }
        Ok(self.submit(ServiceRequest::new(customer_id, query, topic, priority)).await)
    }

    /// Submit a request by value. Idempotent: re-submitting an id the mesh
    /// has already seen returns the stored request without re-routing.
    pub async fn submit(&self, request: ServiceRequest) -> ServiceRequest {
        let (request, escalated) = {
            let mut state = self.state.lock().await;
            if let Some(existing) = state.requests.get(&request.id) {
                return existing.clone();
            }

            let mut request = request;
            match select_node(&state, self.strategy, &request.topic) {
                Some(node_id) => {
                    assign(&mut state, &mut request, node_id);
                    state.requests.insert(request.id, request.clone());
                    (request, false)
                }
                None => {
                    request.status = RequestStatus::Escalated;
                    request.record(
                        "no_agents_available",
                        json!({ "details": "request queued for escalation" }),
                    );
                    warn!(request = %request.id, topic = %request.topic, "no eligible nodes");
                    state.requests.insert(request.id, request.clone());
                    (request, true)
                }
            }
        };

        if escalated {
            self.fire(&self.escalation_handlers, &request).await;
        }
        request
    }

    /// Move a request to the next tier. Returns `false` when the request is
    /// unknown or no higher-tier node can take it.
    pub async fn escalate_request(&self, request_id: Uuid, reason: &str) -> bool {
        let outcome = {
            let mut state = self.state.lock().await;
            let Some(mut request) = state.requests.get(&request_id).cloned() else {
                return false;
            };

            request.escalation_count += 1;

            let mut current_role = NodeRole::Frontline;
            if let Some(node_id) = request.assigned_to {
                if let Some(node) = state.nodes.get_mut(&node_id) {
                    node.current_load = node.current_load.saturating_sub(1);
                    current_role = node.role;
                }
            }

            request.record(
                "escalated",
                json!({ "reason": reason, "from_node": request.assigned_to }),
            );

            // Walk up the ladder until a tier has an eligible node.
            let mut tier = current_role.next_tier();
            let candidate = loop {
                match select_node_in_tier(&state, self.strategy, &request.topic, tier) {
                    Some(node_id) => break Some(node_id),
                    None if tier == NodeRole::Expert => break None,
                    None => tier = tier.next_tier(),
                }
            };

            match candidate {
                Some(node_id) => {
                    assign(&mut state, &mut request, node_id);
                    state.requests.insert(request_id, request.clone());
                    Some(request)
                }
                None => {
                    request.status = RequestStatus::EscalationFailed;
                    request.assigned_to = None;
                    warn!(request = %request_id, "escalation failed, no higher tier available");
                    state.requests.insert(request_id, request);
                    None
                }
            }
        };

        match outcome {
            Some(request) => {
                self.fire(&self.escalation_handlers, &request).await;
                true
            }
            None => false,
        }
    }

    /// Mark a request resolved and release its node's capacity. Returns
    /// `false` when the request is unknown.
    pub async fn resolve_request(
        &self,
        request_id: Uuid,
        resolution: &str,
        node_id: Option<Uuid>,
    ) -> bool {
        let resolved = {
            let mut state = self.state.lock().await;
            let Some(mut request) = state.requests.get(&request_id).cloned() else {
                return false;
            };

            request.resolution = Some(resolution.to_string());
            request.status = RequestStatus::Resolved;

            if let Some(assigned) = request.assigned_to {
                if let Some(node) = state.nodes.get_mut(&assigned) {
                    node.current_load = node.current_load.saturating_sub(1);
                }
            }

            let by_node = node_id.or(request.assigned_to);
            let truncated: String = resolution.chars().take(100).collect();
            request.record("resolved", json!({ "by_node": by_node, "resolution": truncated }));
            info!(request = %request_id, "request resolved");

            state.requests.insert(request_id, request.clone());
            request
        };

        self.fire(&self.resolution_handlers, &resolved).await;
        true
    }

    /// Aggregate mesh snapshot.
    pub async fn status(&self) -> MeshStatus {
        let state = self.state.lock().await;
        let total_capacity: u32 = state.nodes.values().map(|n| n.max_capacity).sum();
        let current_load: u32 = state.nodes.values().map(|n| n.current_load).sum();

        let mut nodes_by_role: HashMap<NodeRole, Vec<NodeSummary>> = HashMap::new();
        for node in state.nodes.values() {
            nodes_by_role.entry(node.role).or_default().push(NodeSummary {
                worker: node.worker.clone(),
                load: node.current_load,
                capacity: node.max_capacity,
                load_percentage: node.load_percentage(),
                specialties: node.specialties.iter().cloned().collect(),
                available: node.available,
            });
        }

        MeshStatus {
            total_nodes: state.nodes.len(),
            total_capacity,
            current_load,
            utilization: if total_capacity > 0 {
                current_load as f64 / total_capacity as f64 * 100.0
            } else {
                0.0
            },
            active_requests: state
                .requests
                .values()
                .filter(|r| {
                    matches!(
                        r.status,
                        RequestStatus::Pending
                            | RequestStatus::Assigned
                            | RequestStatus::Escalated
                    )
                })
                .count(),
            escalation_count: state.requests.values().map(|r| r.escalation_count).sum(),
            resolution_count: state
                .requests
                .values()
                .filter(|r| r.status == RequestStatus::Resolved)
                .count(),
            nodes_by_role,
        }
    }

    // Handlers run outside the mesh lock; their errors are logged, never
    // propagated.
    async fn fire(&self, handlers: &std::sync::Mutex<Vec<MeshHandler>>, request: &ServiceRequest) {
        let handlers: Vec<MeshHandler> =
            handlers.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone();
        for handler in handlers {
            if let Err(e) = handler(request.clone()).await {
                warn!(request = %request.id, error = %e, "mesh handler failed");
            }
        }
    }
}

fn eligible_nodes<'a>(
    state: &'a MeshState,
    topic: &str,
    tier: Option<NodeRole>,
) -> Vec<&'a MeshNode> {
    state
        .nodes
        .values()
        .filter(|n| tier.map_or(true, |t| n.role == t))
        .filter(|n| n.can_handle(topic))
        .collect()
}

fn pick(state: &MeshState, strategy: RoutingStrategy, mut eligible: Vec<&MeshNode>) -> Option<Uuid> {
    if eligible.is_empty() {
        return None;
    }
    match strategy {
        RoutingStrategy::LeastLoaded => {
            // Ties prefer the lower tier: frontline before specialist before
            // expert.
            eligible.sort_by(|a, b| {
                a.load_percentage()
                    .partial_cmp(&b.load_percentage())
                    .unwrap_or(Ordering::Equal)
                    .then(a.role.cmp(&b.role))
            });
            eligible.first().map(|n| n.id)
        }
        RoutingStrategy::RoundRobin => {
            // Successor of the last assigned node within the eligible set.
            eligible.sort_by(|a, b| a.id.cmp(&b.id));
            match state.last_assigned {
                Some(last) => match eligible.iter().position(|n| n.id == last) {
                    Some(index) => Some(eligible[(index + 1) % eligible.len()].id),
                    None => eligible.first().map(|n| n.id),
                },
                None => eligible.first().map(|n| n.id),
            }
        }
    }
}

fn select_node(state: &MeshState, strategy: RoutingStrategy, topic: &str) -> Option<Uuid> {
    pick(state, strategy, eligible_nodes(state, topic, None))
}

fn select_node_in_tier(
    state: &MeshState,
    strategy: RoutingStrategy,
    topic: &str,
    tier: NodeRole,
) -> Option<Uuid> {
    pick(state, strategy, eligible_nodes(state, topic, Some(tier)))
}

fn assign(state: &mut MeshState, request: &mut ServiceRequest, node_id: Uuid) {
    let (worker, role) = match state.nodes.get_mut(&node_id) {
        Some(node) => {
            node.current_load += 1;
            (node.worker.clone(), node.role)
        }
        None => return,
    };

    request.assigned_to = Some(node_id);
    request.status = RequestStatus::Assigned;
    request.record(
        "assigned",
        json!({ "to_node": node_id, "agent": worker, "role": role }),
    );
    state.last_assigned = Some(node_id);
    info!(request = %request.id, node = %node_id, worker = %worker, "assigned request");
}

impl std::fmt::Debug for ServiceMesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceMesh").field("strategy", &self.strategy).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn can_handle_honours_availability_capacity_and_specialty() {
        let mut node = MeshNode {
            id: Uuid::new_v4(),
            worker: "w".into(),
            role: NodeRole::Specialist,
            specialties: ["billing".to_string()].into(),
            current_load: 0,
            max_capacity: 1,
            available: true,
        };
        assert!(node.can_handle("billing"));
        assert!(node.can_handle("BILLING"));
        assert!(!node.can_handle("shipping"));

        node.current_load = 1;
        assert!(!node.can_handle("billing"));

        node.current_load = 0;
        node.available = false;
        assert!(!node.can_handle("billing"));
    }

    #[tokio::test]
    async fn expert_handles_anything() {
        let node = MeshNode {
            id: Uuid::new_v4(),
            worker: "w".into(),
            role: NodeRole::Expert,
            specialties: BTreeSet::new(),
            current_load: 0,
            max_capacity: 1,
            available: true,
        };
        assert!(node.can_handle("whatever"));
    }

    #[tokio::test]
    async fn invalid_priority_rejected() {
        let mesh = ServiceMesh::new(RoutingStrategy::LeastLoaded);
        let err = mesh.route_request("c1", "q", "general", 0).await.unwrap_err();
        assert!(matches!(err, FabricError::Validation(_)));
        let err = mesh.route_request("c1", "q", "general", 11).await.unwrap_err();
        assert!(matches!(err, FabricError::Validation(_)));
    }

    #[tokio::test]
    async fn zero_capacity_node_rejected() {
        let mesh = ServiceMesh::new(RoutingStrategy::LeastLoaded);
        let err = mesh.add_node("w", NodeRole::Frontline, [], 0).await.unwrap_err();
        assert!(matches!(err, FabricError::Validation(_)));
    }

    #[tokio::test]
    async fn round_robin_cycles_through_eligible_nodes() {
        let mesh = ServiceMesh::new(RoutingStrategy::RoundRobin);
        let a = mesh.add_node("a", NodeRole::Frontline, [], 10).await.unwrap();
        let b = mesh.add_node("b", NodeRole::Frontline, [], 10).await.unwrap();

        let first = mesh.route_request("c", "q", "general", 5).await.unwrap();
        let second = mesh.route_request("c", "q", "general", 5).await.unwrap();
        let third = mesh.route_request("c", "q", "general", 5).await.unwrap();

        let assigned: Vec<Uuid> =
            [&first, &second, &third].iter().map(|r| r.assigned_to.unwrap()).collect();
        // Alternates between the two nodes, never the same twice in a row.
        assert_ne!(assigned[0], assigned[1]);
        assert_eq!(assigned[0], assigned[2]);
        assert!(assigned.iter().all(|id| *id == a.id || *id == b.id));
    }

    #[tokio::test]
    async fn duplicate_submit_is_idempotent() {
        let mesh = ServiceMesh::new(RoutingStrategy::LeastLoaded);
        let node = mesh.add_node("a", NodeRole::Frontline, [], 5).await.unwrap();

        let request = ServiceRequest::new("c1", "q", "general", 5);
        let first = mesh.submit(request.clone()).await;
        let second = mesh.submit(request).await;

        assert_eq!(first.id, second.id);
        assert_eq!(mesh.node(node.id).await.unwrap().current_load, 1);
    }

    #[tokio::test]
    async fn resolve_unknown_request_returns_false() {
        let mesh = ServiceMesh::new(RoutingStrategy::LeastLoaded);
        assert!(!mesh.resolve_request(Uuid::new_v4(), "done", None).await);
        assert!(!mesh.escalate_request(Uuid::new_v4(), "why").await);
    }

    #[tokio::test]
    async fn load_never_exceeds_capacity() {
        let mesh = ServiceMesh::new(RoutingStrategy::LeastLoaded);
        let node = mesh.add_node("a", NodeRole::Frontline, [], 2).await.unwrap();

        for _ in 0..2 {
            mesh.route_request("c", "q", "general", 5).await.unwrap();
        }
        // Third request finds no capacity and escalates.
        let third = mesh.route_request("c", "q", "general", 5).await.unwrap();
        assert_eq!(third.status, RequestStatus::Escalated);
        assert_eq!(mesh.node(node.id).await.unwrap().current_load, 2);
    }
}
