//! In-memory checkpointing and the execution control operations.
//!
//! A periodic task snapshots every Running execution into its bounded
//! checkpoint ring (newest last, capped at ten). The control operations --
//! pause, resume, cancel, recover -- return `bool` rather than raising, so
//! callers must check the result.
//!
//! Checkpoints live inside the execution and die with the process; callers
//! needing durability externalize them from `status` snapshots.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gigflow_types::workflow::{Checkpoint, WorkflowExecution, WorkflowStatus};
use uuid::Uuid;

use crate::director::DirectorState;

/// Periodic snapshotter plus checkpoint-based control operations.
pub struct CheckpointManager {
    state: Arc<DirectorState>,
}

impl CheckpointManager {
    pub(crate) fn new(state: Arc<DirectorState>) -> Self {
        Self { state }
    }

    fn snapshot(execution: &WorkflowExecution) -> Checkpoint {
        Checkpoint {
            execution_id: execution.id,
            workflow_id: execution.workflow_id,
            status: execution.status,
            progress: execution.progress,
            current_step: execution.current_step.clone(),
            session_assignments: execution.session_assignments.clone(),
            timestamp: Utc::now(),
        }
    }

    // -----------------------------------------------------------------------
    // Periodic checkpointing
    // -----------------------------------------------------------------------

    /// Snapshot every Running execution once. Returns how many were
    /// checkpointed.
    pub fn checkpoint_running(&self) -> usize {
        let mut count = 0;
        for mut entry in self.state.executions.iter_mut() {
            if entry.status == WorkflowStatus::Running {
                let checkpoint = Self::snapshot(entry.value());
                entry.value_mut().push_checkpoint(checkpoint);
                count += 1;
            }
        }
        if count > 0 {
            tracing::debug!(count, "checkpointed running executions");
        }
        count
    }

    /// The periodic checkpoint loop; exits when the shutdown flag is set.
    pub(crate) async fn run(&self) {
        let interval = Duration::from_secs(self.state.config.checkpoint_interval_secs);
        loop {
            tokio::select! {
                _ = self.state.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    self.checkpoint_running();
                }
            }
        }
        tracing::info!("checkpoint loop stopped");
    }

    // -----------------------------------------------------------------------
    // Control operations
    // -----------------------------------------------------------------------

    /// Pause a Running execution: force a checkpoint, then flip to Paused.
    /// The runner stops acting at its next step boundary.
    pub fn pause(&self, execution_id: Uuid) -> bool {
        let paused = self
            .state
            .with_execution(execution_id, |exec| {
                if exec.status != WorkflowStatus::Running {
                    return false;
                }
                let checkpoint = Self::snapshot(exec);
                exec.push_checkpoint(checkpoint);
                exec.status = WorkflowStatus::Paused;
                true
            })
            .unwrap_or(false);
        if paused {
            tracing::info!(execution_id = %execution_id, "paused workflow execution");
        }
        paused
    }

    /// Resume a Paused execution: flip to Running and re-enqueue at the
    /// workflow's definition priority. Scheduling restarts the whole
    /// execution rather than resuming mid-DAG.
    pub fn resume(&self, execution_id: Uuid) -> bool {
        let workflow_id = self.state.with_execution(execution_id, |exec| {
            if exec.status != WorkflowStatus::Paused {
                return None;
            }
            exec.status = WorkflowStatus::Running;
            Some(exec.workflow_id)
        });
        let Some(Some(workflow_id)) = workflow_id else {
            return false;
        };

        let priority = self
            .state
            .registry
            .get(workflow_id)
            .map(|def| def.priority)
            .unwrap_or_default();
        self.state.queue.push(execution_id, priority, None);
        tracing::info!(execution_id = %execution_id, "resumed workflow execution");
        true
    }

    /// Cancel from any non-terminal state: flip to Cancelled, stamp the
    /// completion time, and run the same guaranteed session-release path as
    /// normal completion. Does not interrupt an in-flight action call.
    pub async fn cancel(&self, execution_id: Uuid) -> bool {
        let cancelled = self
            .state
            .with_execution(execution_id, |exec| {
                if exec.status.is_terminal() {
                    return false;
                }
                exec.status = WorkflowStatus::Cancelled;
                exec.completed_at = Some(Utc::now());
                true
            })
            .unwrap_or(false);
        if cancelled {
            self.state.release_execution_sessions(execution_id).await;
            tracing::info!(execution_id = %execution_id, "cancelled workflow execution");
        }
        cancelled
    }

    /// Recover an execution from its most recent checkpoint: restore
    /// progress, current step, and session assignments, force Running,
    /// re-insert into the active map if it was archived, and re-enqueue.
    /// Returns false when no checkpoint exists.
    pub fn recover(&self, execution_id: Uuid) -> bool {
        // Pull archived executions back into the active map first.
        let mut resurrected = false;
        if !self.state.executions.contains_key(&execution_id) {
            let mut history = self.state.history.lock().unwrap();
            let Some(pos) = history.iter().position(|e| e.id == execution_id) else {
                tracing::error!(execution_id = %execution_id, "cannot recover unknown execution");
                return false;
            };
            if let Some(execution) = history.remove(pos) {
                self.state.executions.insert(execution_id, execution);
                resurrected = true;
            }
        }

        let workflow_id = self
            .state
            .with_execution(execution_id, |exec| {
                let checkpoint = exec.latest_checkpoint().cloned()?;
                exec.current_step = checkpoint.current_step.clone();
                exec.progress = checkpoint.progress;
                exec.session_assignments = checkpoint.session_assignments.clone();
                exec.status = WorkflowStatus::Running;
                exec.completed_at = None;
                Some(exec.workflow_id)
            })
            .flatten();

        let Some(workflow_id) = workflow_id else {
            tracing::error!(execution_id = %execution_id, "no checkpoints available for recovery");
            if resurrected {
                // Put it back where we found it.
                self.state.archive_execution(execution_id);
            }
            return false;
        };

        let priority = self
            .state
            .registry
            .get(workflow_id)
            .map(|def| def.priority)
            .unwrap_or_default();
        self.state.queue.push(execution_id, priority, None);
        tracing::info!(execution_id = %execution_id, "recovered workflow execution from checkpoint");
        true
    }
}
