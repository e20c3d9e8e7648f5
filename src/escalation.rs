//! Human-in-the-loop escalation: a bounded-by-expiry queue of review
//! requests with reviewer assignment, decision callbacks, and a timeout
//! sweeper.
//!
//! Reviewer-load and active-map updates are serialised under one lock;
//! decision callbacks run after state commits and their errors are logged,
//! never propagated.

use crate::clock::{Clock, SystemClock};
use crate::error::FabricError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Default expiry applied when no timeout is given.
pub const DEFAULT_TIMEOUT_MINUTES: i64 = 30;

/// Review urgency, ordered LOW < MEDIUM < HIGH < URGENT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationPriority {
    Low,
    Medium,
    High,
    Urgent,
}

/// Lifecycle of a review request. Created PENDING; APPROVED, REJECTED, and
/// EXPIRED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

/// A request awaiting human review.
#[derive(Debug, Clone, Serialize)]
pub struct EscalationRequest {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub context: Map<String, Value>,
    pub requester_id: String,
    pub priority: EscalationPriority,
    pub status: EscalationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub assigned_to: Option<String>,
    pub resolution: Option<String>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl EscalationRequest {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expiry| now > expiry)
    }
}

/// A human reviewer with bounded concurrency.
#[derive(Debug, Clone, Serialize)]
pub struct Reviewer {
    pub id: String,
    pub name: String,
    pub max_concurrent: u32,
    pub current_load: u32,
    pub specialties: BTreeSet<String>,
    pub resolved_count: u32,
}

/// Async callback receiving the full request once it reaches a decision.
pub type EscalationCallback =
    Arc<dyn Fn(EscalationRequest) -> BoxFuture<'static, Result<(), FabricError>> + Send + Sync>;

/// Parameters for creating an escalation.
#[derive(Debug, Clone)]
pub struct EscalationParams {
    pub title: String,
    pub description: String,
    pub requester_id: String,
    pub priority: EscalationPriority,
    pub context: Map<String, Value>,
    pub timeout_minutes: Option<i64>,
}

impl EscalationParams {
    pub fn new(title: impl Into<String>, requester_id: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            requester_id: requester_id.into(),
            priority: EscalationPriority::Medium,
            context: Map::new(),
            timeout_minutes: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn priority(mut self, priority: EscalationPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn timeout_minutes(mut self, minutes: i64) -> Self {
        self.timeout_minutes = Some(minutes);
        self
    }
}

/// Aggregate counters for reporting.
#[derive(Debug, Clone)]
pub struct EscalationStats {
    pub total_escalations: u64,
    pub active_escalations: usize,
    pub approved: u64,
    pub rejected: u64,
    pub expired: u64,
    pub approval_rate: f64,
    pub avg_resolution: Duration,
    pub reviewers: Vec<Reviewer>,
}

#[derive(Default)]
struct EscalationState {
    active: HashMap<Uuid, EscalationRequest>,
    history: Vec<EscalationRequest>,
    reviewers: HashMap<String, Reviewer>,
    approval_callbacks: HashMap<Uuid, Vec<EscalationCallback>>,
    rejection_callbacks: HashMap<Uuid, Vec<EscalationCallback>>,
    escalation_count: u64,
    approval_count: u64,
    rejection_count: u64,
    expired_count: u64,
    avg_resolution: Duration,
}

/// Manager for pending review requests.
pub struct EscalationManager {
    state: Mutex<EscalationState>,
    created_callbacks: std::sync::Mutex<Vec<EscalationCallback>>,
    default_timeout_minutes: i64,
    auto_assign: bool,
    clock: Arc<dyn Clock>,
}

impl EscalationManager {
    pub fn new(default_timeout_minutes: i64, auto_assign: bool) -> Self {
        Self::with_clock(default_timeout_minutes, auto_assign, Arc::new(SystemClock))
    }

    pub fn with_clock(
        default_timeout_minutes: i64,
        auto_assign: bool,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state: Mutex::new(EscalationState::default()),
            created_callbacks: std::sync::Mutex::new(Vec::new()),
            default_timeout_minutes,
            auto_assign,
            clock,
        }
    }

    /// Register a human reviewer.
    pub async fn add_reviewer(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        max_concurrent: u32,
        specialties: impl IntoIterator<Item = String>,
    ) {
        let reviewer = Reviewer {
            id: id.into(),
            name: name.into(),
            max_concurrent,
            current_load: 0,
            specialties: specialties.into_iter().collect(),
            resolved_count: 0,
        };
        info!(reviewer = %reviewer.name, capacity = max_concurrent, "added reviewer");
        self.state.lock().await.reviewers.insert(reviewer.id.clone(), reviewer);
    }

    pub async fn reviewer(&self, id: &str) -> Option<Reviewer> {
        self.state.lock().await.reviewers.get(id).cloned()
    }

    /// Create a new escalation, auto-assigning the best reviewer when
    /// configured: capacity-filtered, specialty-matched against the
    /// request's `topic` context, sorted by load ascending then resolved
    /// count descending.
    pub async fn create_escalation(&self, params: EscalationParams) -> EscalationRequest {
        let now = self.clock.now();
        let timeout = params.timeout_minutes.unwrap_or(self.default_timeout_minutes);

        let mut request = EscalationRequest {
            id: Uuid::new_v4(),
            title: params.title,
            description: params.description,
            context: params.context,
            requester_id: params.requester_id,
            priority: params.priority,
            status: EscalationStatus::Pending,
            created_at: now,
            expires_at: Some(now + ChronoDuration::minutes(timeout)),
            assigned_to: None,
            resolution: None,
            resolved_by: None,
            resolved_at: None,
        };

        {
            let mut state = self.state.lock().await;
            if self.auto_assign {
                if let Some(reviewer_id) = best_reviewer(&state, &request) {
                    request.assigned_to = Some(reviewer_id.clone());
                    if let Some(reviewer) = state.reviewers.get_mut(&reviewer_id) {
                        reviewer.current_load += 1;
                        info!(reviewer = %reviewer.name, request = %request.id, "auto-assigned escalation");
                    }
                }
            }
            state.escalation_count += 1;
            state.active.insert(request.id, request.clone());
        }

        info!(
            request = %request.id,
            priority = ?request.priority,
            assigned = request.assigned_to.as_deref().unwrap_or("unassigned"),
            "created escalation"
        );

        let callbacks: Vec<EscalationCallback> = self
            .created_callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for callback in callbacks {
            if let Err(e) = callback(request.clone()).await {
                error!(request = %request.id, error = %e, "escalation callback failed");
            }
        }

        request
    }

    /// Apply a reviewer decision. Fail-silent `false` when the id is
    /// unknown, the request has expired, or it is no longer pending.
    pub async fn process_approval(
        &self,
        request_id: Uuid,
        reviewer_id: &str,
        approved: bool,
        comments: Option<&str>,
    ) -> bool {
        let now = self.clock.now();
        let (request, callbacks) = {
            let mut state = self.state.lock().await;
            let Some(request) = state.active.get(&request_id) else {
                return false;
            };
            if request.is_expired(now) || request.status != EscalationStatus::Pending {
                return false;
            }

            let mut request = state
                .active
                .remove(&request_id)
                .unwrap_or_else(|| unreachable!("request was just fetched"));
            request.status =
                if approved { EscalationStatus::Approved } else { EscalationStatus::Rejected };
            request.resolved_by = Some(reviewer_id.to_string());
            request.resolved_at = Some(now);
            request.resolution = Some(
                comments
                    .map(str::to_string)
                    .unwrap_or_else(|| if approved { "Approved".into() } else { "Rejected".into() }),
            );

            if approved {
                state.approval_count += 1;
            } else {
                state.rejection_count += 1;
            }

            if let Some(assigned) = &request.assigned_to {
                if let Some(reviewer) = state.reviewers.get_mut(assigned) {
                    reviewer.current_load = reviewer.current_load.saturating_sub(1);
                    reviewer.resolved_count += 1;
                }
            }

            // Running average over all resolved requests.
            let resolved_total = state.approval_count + state.rejection_count;
            let elapsed = (now - request.created_at).to_std().unwrap_or(Duration::ZERO);
            state.avg_resolution = if resolved_total <= 1 {
                elapsed
            } else {
                (state.avg_resolution * (resolved_total - 1) as u32 + elapsed)
                    / resolved_total as u32
            };

            let callbacks = if approved {
                state.approval_callbacks.remove(&request_id).unwrap_or_default()
            } else {
                state.rejection_callbacks.remove(&request_id).unwrap_or_default()
            };
            // Both lists are dropped once the request reaches a terminal state.
            state.approval_callbacks.remove(&request_id);
            state.rejection_callbacks.remove(&request_id);

            state.history.push(request.clone());
            (request, callbacks)
        };

        let decision = if approved { "approved" } else { "rejected" };
        info!(request = %request_id, decision, reviewer = %reviewer_id, "processed escalation decision");

        for callback in callbacks {
            if let Err(e) = callback(request.clone()).await {
                error!(request = %request_id, error = %e, "decision callback failed");
            }
        }

        true
    }

    /// Register a callback fired once if the request is approved.
    pub async fn on_approval(&self, request_id: Uuid, callback: EscalationCallback) {
        self.state
            .lock()
            .await
            .approval_callbacks
            .entry(request_id)
            .or_default()
            .push(callback);
    }

    /// Register a callback fired once if the request is rejected.
    pub async fn on_rejection(&self, request_id: Uuid, callback: EscalationCallback) {
        self.state
            .lock()
            .await
            .rejection_callbacks
            .entry(request_id)
            .or_default()
            .push(callback);
    }

    /// Register a callback fired for every newly created escalation.
    pub fn on_escalation(&self, callback: EscalationCallback) {
        self.created_callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(callback);
    }

    /// Pending requests, optionally filtered by assigned reviewer, ordered
    /// by priority (URGENT first) then creation time descending.
    pub async fn get_pending_escalations(
        &self,
        reviewer_id: Option<&str>,
    ) -> Vec<EscalationRequest> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let mut pending: Vec<EscalationRequest> = state
            .active
            .values()
            .filter(|r| !r.is_expired(now))
            .filter(|r| reviewer_id.map_or(true, |id| r.assigned_to.as_deref() == Some(id)))
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.priority.cmp(&a.priority).then(b.created_at.cmp(&a.created_at))
        });
        pending
    }

    /// Expire overdue requests: terminal EXPIRED status, reviewer load
    /// released, callbacks dropped, request moved to history. Returns how
    /// many were swept.
    pub async fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let expired_ids: Vec<Uuid> = state
            .active
            .values()
            .filter(|r| r.is_expired(now))
            .map(|r| r.id)
            .collect();

        for id in &expired_ids {
            let Some(mut request) = state.active.remove(id) else { continue };
            request.status = EscalationStatus::Expired;

            if let Some(assigned) = &request.assigned_to {
                if let Some(reviewer) = state.reviewers.get_mut(assigned) {
                    reviewer.current_load = reviewer.current_load.saturating_sub(1);
                }
            }

            state.approval_callbacks.remove(id);
            state.rejection_callbacks.remove(id);
            state.expired_count += 1;
            state.history.push(request);
            warn!(request = %id, "expired escalation swept");
        }

        expired_ids.len()
    }

    /// Spawn a periodic sweeper task. The caller owns the handle and aborts
    /// it on shutdown.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let swept = manager.cleanup_expired().await;
                if swept > 0 {
                    info!(swept, "escalation sweeper pass");
                }
            }
        })
    }

    pub async fn statistics(&self) -> EscalationStats {
        let state = self.state.lock().await;
        let resolved = state.approval_count + state.rejection_count;
        EscalationStats {
            total_escalations: state.escalation_count,
            active_escalations: state.active.len(),
            approved: state.approval_count,
            rejected: state.rejection_count,
            expired: state.expired_count,
            approval_rate: if resolved > 0 {
                state.approval_count as f64 / resolved as f64
            } else {
                0.0
            },
            avg_resolution: state.avg_resolution,
            reviewers: state.reviewers.values().cloned().collect(),
        }
    }

    pub async fn history(&self) -> Vec<EscalationRequest> {
        self.state.lock().await.history.clone()
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active.len()
    }
}

/// Capacity-filtered, specialty-matched reviewer selection. The topic match
/// is a case-insensitive substring test against each specialty.
fn best_reviewer(state: &EscalationState, request: &EscalationRequest) -> Option<String> {
    let topic = request
        .context
        .get("topic")
        .and_then(Value::as_str)
        .map(str::to_lowercase)
        .unwrap_or_default();

    let mut available: Vec<&Reviewer> = state
        .reviewers
        .values()
        .filter(|r| r.current_load < r.max_concurrent)
        .filter(|r| {
            if topic.is_empty() || r.specialties.is_empty() {
                return true;
            }
            r.specialties.iter().any(|s| s.to_lowercase().contains(&topic))
        })
        .collect();

    if available.is_empty() {
        return None;
    }

    available.sort_by(|a, b| {
        a.current_load
            .cmp(&b.current_load)
            .then(b.resolved_count.cmp(&a.resolved_count))
            .then(a.id.cmp(&b.id))
    });
    Some(available[0].id.clone())
}

impl std::fmt::Debug for EscalationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscalationManager")
            .field("default_timeout_minutes", &self.default_timeout_minutes)
            .field("auto_assign", &self.auto_assign)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> EscalationManager {
        EscalationManager::new(30, true)
    }

    #[tokio::test]
    async fn create_assigns_best_reviewer() {
        let mgr = manager();
        mgr.add_reviewer("r1", "Ada", 5, []).await;
        mgr.add_reviewer("r2", "Grace", 5, []).await;

        // Give r2 a head start in resolved_count so ties break toward it.
        {
            let mut state = mgr.state.lock().await;
            state.reviewers.get_mut("r2").unwrap().resolved_count = 3;
        }

        let request = mgr.create_escalation(EscalationParams::new("refund", "agent-1")).await;
        assert_eq!(request.assigned_to.as_deref(), Some("r2"));
        assert_eq!(mgr.reviewer("r2").await.unwrap().current_load, 1);
    }

    #[tokio::test]
    async fn specialty_filter_uses_topic_substring() {
        let mgr = manager();
        mgr.add_reviewer("r1", "Ada", 5, ["billing-disputes".to_string()]).await;
        mgr.add_reviewer("r2", "Grace", 5, ["shipping".to_string()]).await;

        let request = mgr
            .create_escalation(
                EscalationParams::new("refund", "agent-1").context("topic", json!("billing")),
            )
            .await;
        assert_eq!(request.assigned_to.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn reviewer_at_capacity_skipped() {
        let mgr = manager();
        mgr.add_reviewer("r1", "Ada", 1, []).await;

        let first = mgr.create_escalation(EscalationParams::new("a", "agent")).await;
        assert_eq!(first.assigned_to.as_deref(), Some("r1"));

        let second = mgr.create_escalation(EscalationParams::new("b", "agent")).await;
        assert_eq!(second.assigned_to, None);
    }

    #[tokio::test]
    async fn approval_moves_request_to_history_and_fires_callback() {
        let mgr = manager();
        mgr.add_reviewer("r1", "Ada", 5, []).await;

        let request = mgr.create_escalation(EscalationParams::new("refund", "agent")).await;

        let fired = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = fired.clone();
        mgr.on_approval(
            request.id,
            Arc::new(move |req| {
                let sink = sink.clone();
                Box::pin(async move {
                    sink.lock().unwrap().push(req.status);
                    Ok(())
                })
            }),
        )
        .await;

        assert!(mgr.process_approval(request.id, "r1", true, Some("looks fine")).await);
        assert_eq!(*fired.lock().unwrap(), vec![EscalationStatus::Approved]);

        assert_eq!(mgr.active_count().await, 0);
        let history = mgr.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].resolution.as_deref(), Some("looks fine"));

        let reviewer = mgr.reviewer("r1").await.unwrap();
        assert_eq!(reviewer.current_load, 0);
        assert_eq!(reviewer.resolved_count, 1);
    }

    #[tokio::test]
    async fn double_decision_is_fail_silent() {
        let mgr = manager();
        mgr.add_reviewer("r1", "Ada", 5, []).await;
        let request = mgr.create_escalation(EscalationParams::new("x", "agent")).await;

        assert!(mgr.process_approval(request.id, "r1", false, None).await);
        assert!(!mgr.process_approval(request.id, "r1", true, None).await);
        assert!(!mgr.process_approval(Uuid::new_v4(), "r1", true, None).await);
    }

    #[tokio::test]
    async fn failing_callback_does_not_abort_decision() {
        let mgr = manager();
        mgr.add_reviewer("r1", "Ada", 5, []).await;
        let request = mgr.create_escalation(EscalationParams::new("x", "agent")).await;

        mgr.on_rejection(
            request.id,
            Arc::new(|_| Box::pin(async { Err(FabricError::Worker("callback broke".into())) })),
        )
        .await;

        assert!(mgr.process_approval(request.id, "r1", false, None).await);
        assert_eq!(mgr.history().await.len(), 1);
    }

    #[tokio::test]
    async fn expiry_refuses_decisions_and_sweeper_collects() {
        let clock = Arc::new(crate::clock::ManualClock::start_now());
        let mgr = EscalationManager::with_clock(30, true, clock.clone());
        mgr.add_reviewer("r1", "Ada", 5, []).await;

        let request = mgr
            .create_escalation(EscalationParams::new("x", "agent").timeout_minutes(1))
            .await;

        clock.advance(Duration::from_secs(120));
        assert!(!mgr.process_approval(request.id, "r1", true, None).await);

        assert_eq!(mgr.cleanup_expired().await, 1);
        assert_eq!(mgr.active_count().await, 0);
        let history = mgr.history().await;
        assert_eq!(history[0].status, EscalationStatus::Expired);
        // Reviewer load released by the sweeper.
        assert_eq!(mgr.reviewer("r1").await.unwrap().current_load, 0);
    }

    #[tokio::test]
    async fn pending_ordering_is_priority_then_recency() {
        let mgr = EscalationManager::new(30, false);
        let low = mgr
            .create_escalation(
                EscalationParams::new("low", "a").priority(EscalationPriority::Low),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let urgent_old = mgr
            .create_escalation(
                EscalationParams::new("urgent-old", "a").priority(EscalationPriority::Urgent),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let urgent_new = mgr
            .create_escalation(
                EscalationParams::new("urgent-new", "a").priority(EscalationPriority::Urgent),
            )
            .await;

        let pending = mgr.get_pending_escalations(None).await;
        let ids: Vec<Uuid> = pending.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![urgent_new.id, urgent_old.id, low.id]);
    }

    #[tokio::test]
    async fn average_resolution_is_running_mean() {
        let clock = Arc::new(crate::clock::ManualClock::start_now());
        let mgr = EscalationManager::with_clock(30, false, clock.clone());

        let first = mgr.create_escalation(EscalationParams::new("a", "x")).await;
        clock.advance(Duration::from_secs(10));
        mgr.process_approval(first.id, "r", true, None).await;

        let second = mgr.create_escalation(EscalationParams::new("b", "x")).await;
        clock.advance(Duration::from_secs(30));
        mgr.process_approval(second.id, "r", false, None).await;

        let stats = mgr.statistics().await;
        // (10 + 30) / 2
        assert_eq!(stats.avg_resolution, Duration::from_secs(20));
        assert_eq!(stats.approved, 1);
        assert_eq!(stats.rejected, 1);
        assert!((stats.approval_rate - 0.5).abs() < f64::EPSILON);
    }
}
