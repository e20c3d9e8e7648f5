//! Worker-pool coordination: delegation strategies and per-worker workload
//! accounting.

use crate::error::FabricError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Response envelope every worker returns from `execute`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerResponse {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl WorkerResponse {
    pub fn new(content: impl Into<String>) -> Self {
        Self { content: content.into(), reasoning: None, metadata: None }
    }
}

/// The single external contract for an LLM-backed worker. Workers are
/// externally owned; the coordinator never creates or destroys them.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    /// Topic tags this worker is good at. Informational for reporting.
    fn specialties(&self) -> Vec<String> {
        Vec::new()
    }

    async fn execute(
        &self,
        prompt: &str,
        context: Option<&Value>,
    ) -> Result<WorkerResponse, FabricError>;
}

/// How the coordinator picks the next worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DelegationStrategy {
    RoundRobin,
    #[default]
    LoadBalanced,
}

/// Lifecycle of a delegated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A task handed to one worker.
#[derive(Debug, Clone, Serialize)]
pub struct TaskAssignment {
    pub id: Uuid,
    pub description: String,
    pub assigned_to: String,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Why a delegation landed where it did.
#[derive(Debug, Clone, Serialize)]
pub struct DelegationReasoning {
    pub task: String,
    pub selected: String,
    pub reasoning: String,
    pub workload_before: BTreeMap<String, u32>,
    pub workload_after: BTreeMap<String, u32>,
}

/// Per-subtask outcome inside a coordination run.
#[derive(Debug, Clone, Serialize)]
pub struct SubtaskOutcome {
    pub assignment_id: Uuid,
    pub subtask: String,
    pub worker: String,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Why-and-where snapshot of the coordinator's delegation state.
#[derive(Debug, Clone)]
pub struct ReasoningSummary {
    pub strategy: DelegationStrategy,
    pub current_workload: BTreeMap<String, u32>,
    pub last_delegation: Option<DelegationReasoning>,
    pub total_delegations: usize,
}

/// Structured aggregate returned by [`Coordinator::coordinate`].
#[derive(Debug, Clone, Serialize)]
pub struct CoordinationReport {
    pub task: String,
    pub subtasks: Vec<String>,
    pub outcomes: Vec<SubtaskOutcome>,
    pub completed: usize,
    pub failed: usize,
    pub workload: BTreeMap<String, u32>,
}

/// Delegates tasks across a pool of workers.
pub struct Coordinator {
    workers: BTreeMap<String, Arc<dyn Worker>>,
    strategy: DelegationStrategy,
    workload: BTreeMap<String, u32>,
    assignments: BTreeMap<Uuid, TaskAssignment>,
    last_delegated: Option<String>,
    delegation_history: Vec<DelegationReasoning>,
}

impl Coordinator {
    pub fn new(
        workers: impl IntoIterator<Item = Arc<dyn Worker>>,
        strategy: DelegationStrategy,
    ) -> Self {
        let workers: BTreeMap<String, Arc<dyn Worker>> =
            workers.into_iter().map(|w| (w.name().to_string(), w)).collect();
        let workload = workers.keys().map(|name| (name.clone(), 0)).collect();
        Self {
            workers,
            strategy,
            workload,
            assignments: BTreeMap::new(),
            last_delegated: None,
            delegation_history: Vec::new(),
        }
    }

    pub fn worker_names(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    pub fn workload(&self) -> &BTreeMap<String, u32> {
        &self.workload
    }

    pub fn assignment(&self, id: Uuid) -> Option<&TaskAssignment> {
        self.assignments.get(&id)
    }

    /// Pick a worker for `task` per the configured strategy and record the
    /// assignment. Workload is incremented at delegation time.
    pub fn delegate_task(&mut self, task: &str) -> Result<TaskAssignment, FabricError> {
        if self.workers.is_empty() {
            return Err(FabricError::Validation("coordinator has no workers".into()));
        }

        let selected = match self.strategy {
            DelegationStrategy::RoundRobin => self.select_round_robin(),
            DelegationStrategy::LoadBalanced => self.select_load_balanced(),
        };

        let workload_before = self.workload.clone();
        *self.workload.entry(selected.clone()).or_insert(0) += 1;

        let assignment = TaskAssignment {
            id: Uuid::new_v4(),
            description: task.to_string(),
            assigned_to: selected.clone(),
            status: TaskStatus::Pending,
            result: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.assignments.insert(assignment.id, assignment.clone());

        self.delegation_history.push(DelegationReasoning {
            task: task.to_string(),
            selected: selected.clone(),
            reasoning: match self.strategy {
                DelegationStrategy::RoundRobin => "next in rotation".to_string(),
                DelegationStrategy::LoadBalanced => {
                    format!("lowest workload ({})", workload_before[&selected])
                }
            },
            workload_before,
            workload_after: self.workload.clone(),
        });

        info!(task = %truncate(task, 50), worker = %selected, "delegated task");
        Ok(assignment)
    }

    /// Run a delegated task on its assigned worker. Workload is decremented
    /// on completion, success or failure.
    pub async fn execute_task(
        &mut self,
        assignment_id: Uuid,
        context: Option<&Value>,
    ) -> Result<WorkerResponse, FabricError> {
        let (worker, prompt) = {
            let assignment = self
                .assignments
                .get_mut(&assignment_id)
                .ok_or_else(|| FabricError::NotFound(format!("assignment {assignment_id}")))?;
            let worker = self
                .workers
                .get(&assignment.assigned_to)
                .cloned()
                .ok_or_else(|| {
                    FabricError::NotFound(format!("worker {}", assignment.assigned_to))
                })?;
            assignment.status = TaskStatus::Running;
            (worker, assignment.description.clone())
        };

        let outcome = worker.execute(&prompt, context).await;

        let assignment = self
            .assignments
            .get_mut(&assignment_id)
            .unwrap_or_else(|| unreachable!("assignment existed above"));
        assignment.completed_at = Some(Utc::now());
        if let Some(load) = self.workload.get_mut(&assignment.assigned_to) {
            *load = load.saturating_sub(1);
        }

        match outcome {
            Ok(response) => {
                assignment.status = TaskStatus::Completed;
                assignment.result = Some(Value::String(response.content.clone()));
                Ok(response)
            }
            Err(e) => {
                assignment.status = TaskStatus::Failed;
                assignment.result = Some(Value::String(e.to_string()));
                warn!(assignment = %assignment_id, error = %e, "worker failed");
                Err(FabricError::Worker(e.to_string()))
            }
        }
    }

    /// Delegate and execute each subtask in order, returning a structured
    /// aggregate. Worker failures are captured per subtask, not propagated.
    pub async fn coordinate(
        &mut self,
        task: &str,
        subtasks: Vec<String>,
        context: Option<&Value>,
    ) -> Result<CoordinationReport, FabricError> {
        let mut outcomes = Vec::with_capacity(subtasks.len());

        for subtask in &subtasks {
            let assignment = self.delegate_task(subtask)?;
            match self.execute_task(assignment.id, context).await {
                Ok(response) => outcomes.push(SubtaskOutcome {
                    assignment_id: assignment.id,
                    subtask: subtask.clone(),
                    worker: assignment.assigned_to,
                    result: Some(response.content),
                    error: None,
                }),
                Err(e) => outcomes.push(SubtaskOutcome {
                    assignment_id: assignment.id,
                    subtask: subtask.clone(),
                    worker: assignment.assigned_to,
                    result: None,
                    error: Some(e.to_string()),
                }),
            }
        }

        let completed = outcomes.iter().filter(|o| o.error.is_none()).count();
        let failed = outcomes.len() - completed;
        Ok(CoordinationReport {
            task: task.to_string(),
            subtasks,
            outcomes,
            completed,
            failed,
            workload: self.workload.clone(),
        })
    }

    /// Latest delegation rationale, if any.
    pub fn last_reasoning(&self) -> Option<&DelegationReasoning> {
        self.delegation_history.last()
    }

    /// Snapshot of the delegation state for transparency reporting.
    pub fn reasoning_summary(&self) -> ReasoningSummary {
        ReasoningSummary {
            strategy: self.strategy,
            current_workload: self.workload.clone(),
            last_delegation: self.delegation_history.last().cloned(),
            total_delegations: self.delegation_history.len(),
        }
    }

    pub fn delegation_history(&self) -> &[DelegationReasoning] {
        &self.delegation_history
    }

    pub fn reset_workload(&mut self) {
        for load in self.workload.values_mut() {
            *load = 0;
        }
        info!("reset workload for all workers");
    }

    fn select_round_robin(&mut self) -> String {
        let names: Vec<&String> = self.workers.keys().collect();
        let selected = match &self.last_delegated {
            Some(last) => match names.iter().position(|n| *n == last) {
                Some(index) => names[(index + 1) % names.len()].clone(),
                None => names[0].clone(),
            },
            None => names[0].clone(),
        };
        self.last_delegated = Some(selected.clone());
        selected
    }

    fn select_load_balanced(&self) -> String {
        self.workload
            .iter()
            .min_by_key(|(_, load)| **load)
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| unreachable!("checked non-empty in delegate_task"))
    }
}

fn truncate(s: &str, limit: usize) -> String {
    s.chars().take(limit).collect()
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("workers", &self.workers.len())
            .field("strategy", &self.strategy)
            .finish()
    }
}
