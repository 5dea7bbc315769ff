//! Observability snapshots.
//!
//! Serializable views over the orchestrator's state, returned by
//! `Director::status`, `Director::metrics`, and
//! `Director::session_distribution`. These are plain data -- callers layer
//! their own transport (HTTP, task queue, CLI) on top.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::session::TaskKind;
use crate::workflow::WorkflowStatus;

/// Assumed maximum concurrent tasks per session for utilization math.
pub const MAX_TASKS_PER_SESSION: u32 = 5;

/// Workload above which a session counts as overloaded.
pub const SESSION_OVERLOAD_THRESHOLD: u32 = 3;

// ---------------------------------------------------------------------------
// Execution snapshot
// ---------------------------------------------------------------------------

/// Point-in-time view of one execution, active or archived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Name of the definition, when it is still registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    pub status: WorkflowStatus,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub session_assignments: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_log: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub result: HashMap<String, Value>,
}

// ---------------------------------------------------------------------------
// System metrics
// ---------------------------------------------------------------------------

/// Aggregate orchestrator metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetrics {
    /// Executions in the active map (any non-archived state).
    pub active_workflows: usize,
    /// Executions currently Running.
    pub running_workflows: usize,
    /// Entries waiting in the admission queue.
    pub queued_workflows: usize,
    /// Sessions tracked by the pool.
    pub total_sessions: usize,
    /// Sessions with a non-zero workload.
    pub busy_sessions: usize,
    /// busy / total, 0.0 when no sessions exist.
    pub session_utilization: f64,
    /// Archived executions that completed.
    pub completed_workflows: usize,
    /// Archived executions that failed.
    pub failed_workflows: usize,
    /// completed / (completed + failed), 0.0 when neither exists.
    pub success_rate: f64,
    /// Registered workflow definitions.
    pub workflow_definitions: usize,
    pub is_running: bool,
}

// ---------------------------------------------------------------------------
// Session distribution
// ---------------------------------------------------------------------------

/// Load view for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLoad {
    /// Best-effort count of tasks currently assigned to the session.
    pub workload: u32,
    /// Affinity tag, when the broker has assigned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TaskKind>,
    /// workload / MAX_TASKS_PER_SESSION, capped at 1.0.
    pub utilization: f64,
}

/// Load-balancing view across all sessions the broker knows about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDistribution {
    pub sessions: HashMap<String, SessionLoad>,
    pub total_sessions: usize,
    pub average_workload: f64,
    /// Sessions whose workload exceeds `SESSION_OVERLOAD_THRESHOLD`.
    pub overloaded_sessions: usize,
}
