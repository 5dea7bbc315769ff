//! Workflow domain types.
//!
//! `WorkflowDefinition` is the immutable, reusable description of a step DAG
//! plus execution policy. `WorkflowExecution` is one run instance carrying
//! mutable progress, session assignments, and an in-memory checkpoint ring.
//! The runner works on its own copy of the steps, so runtime step state never
//! leaks into the registered definition.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::session::TaskKind;

/// Checkpoints retained per execution; the oldest is evicted past this.
pub const MAX_CHECKPOINTS_PER_EXECUTION: usize = 10;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Status of a workflow execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal states never transition again except through `recover`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

/// Status of an individual workflow step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Retrying,
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Scheduling priority for workflow executions.
///
/// Higher values dispatch first; equal priorities dispatch FIFO.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Numeric rank used for queue ordering (higher dispatches first).
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 3,
            Priority::Critical => 4,
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow step
// ---------------------------------------------------------------------------

/// One schedulable unit of work within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique within the workflow.
    pub id: String,
    /// Human-readable step name.
    pub name: String,
    /// Symbolic operation name resolved through the action registry.
    pub action: String,
    /// Action-specific parameters.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, Value>,
    /// Step ids that must complete before this step runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Declared step timeout in seconds.
    #[serde(default = "default_step_timeout")]
    pub timeout_secs: u64,
    /// Attempts consumed so far (runtime field).
    #[serde(default)]
    pub retry_count: u32,
    /// Retries allowed after the first failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Session assigned to this step, if its action needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

fn default_step_timeout() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

impl WorkflowStep {
    /// Create a step with default policy (300s timeout, 3 retries).
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            action: action.into(),
            parameters: HashMap::new(),
            dependencies: Vec::new(),
            timeout_secs: default_step_timeout(),
            retry_count: 0,
            max_retries: default_max_retries(),
            status: StepStatus::Pending,
            result: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            session_id: None,
        }
    }

    /// Add a dependency on another step.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.push(step_id.into());
        self
    }

    /// Set an action parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Override the retry limit.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

// ---------------------------------------------------------------------------
// Workflow definition
// ---------------------------------------------------------------------------

/// Session demands a workflow places on the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequirements {
    /// Minimum sessions the workflow expects to be obtainable.
    #[serde(default = "default_min_sessions")]
    pub min_sessions: usize,
    /// Affinity tag requested for every acquired session.
    #[serde(default)]
    pub kind: TaskKind,
}

fn default_min_sessions() -> usize {
    1
}

impl Default for SessionRequirements {
    fn default() -> Self {
        Self {
            min_sessions: default_min_sessions(),
            kind: TaskKind::General,
        }
    }
}

/// A named, reusable DAG of steps plus execution policy.
///
/// Created once by the registry and immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    /// Declaration order is the sequential-mode execution order and the
    /// ready-set tie-break in parallel mode.
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub session_requirements: SessionRequirements,
    /// Run independent steps concurrently when true.
    #[serde(default)]
    pub parallel_execution: bool,
    /// Concurrency bound for parallel mode.
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,
    /// Declared workflow timeout in seconds.
    #[serde(default = "default_workflow_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

fn default_max_concurrent_steps() -> usize {
    3
}

fn default_workflow_timeout() -> u64 {
    1800
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// A point-in-time snapshot of an execution, sufficient to re-schedule it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub status: WorkflowStatus,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub session_assignments: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Workflow execution
// ---------------------------------------------------------------------------

/// Runtime state of one workflow run.
///
/// Single-writer invariant: only the runner that owns the execution, plus
/// the pause/resume/cancel/recover control operations, mutate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Completed steps over total steps, in [0, 1].
    #[serde(default)]
    pub progress: f64,
    /// step_id -> session_id for steps that were assigned a session.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub session_assignments: HashMap<String, String>,
    /// Bounded ring of recovery snapshots, newest last.
    #[serde(default, skip_serializing_if = "VecDeque::is_empty")]
    pub checkpoints: VecDeque<Checkpoint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_log: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// step_id -> step result for completed steps.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub result: HashMap<String, Value>,
    /// Runtime copies of the definition's steps, maintained by the runner.
    /// The registered definition itself is never mutated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub step_states: Vec<WorkflowStep>,
}

impl WorkflowExecution {
    /// Create a pending execution for the given workflow.
    pub fn new(workflow_id: Uuid) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            status: WorkflowStatus::Pending,
            current_step: None,
            progress: 0.0,
            session_assignments: HashMap::new(),
            checkpoints: VecDeque::new(),
            error_log: Vec::new(),
            started_at: None,
            completed_at: None,
            result: HashMap::new(),
            step_states: Vec::new(),
        }
    }

    /// Append a checkpoint, evicting the oldest past the cap.
    pub fn push_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.checkpoints.push_back(checkpoint);
        while self.checkpoints.len() > MAX_CHECKPOINTS_PER_EXECUTION {
            self.checkpoints.pop_front();
        }
    }

    /// The most recent checkpoint, if any exists.
    pub fn latest_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.back()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
