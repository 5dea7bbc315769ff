//! Per-execution workflow engine.
//!
//! Walks a workflow's step DAG sequentially or with bounded parallelism,
//! assigns sessions to steps that need them, dispatches actions through the
//! registry, applies per-step retry policy, and mutates the execution's
//! state as the single writer.
//!
//! Failure policy differs by mode and is deliberate: a step that exhausts
//! its retries aborts the whole execution in sequential mode, while in
//! parallel mode it is marked Failed but counted as satisfied so dependent
//! steps still run (execution-level liveness over step-level correctness).
//!
//! Sessions are acquired up front for every session-requiring step and held
//! for the execution's whole lifetime; release happens exactly once through
//! the shared cleanup path, whether the execution completes, fails, or is
//! cancelled.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use gigflow_types::error::DirectorError;
use gigflow_types::workflow::{StepStatus, WorkflowDefinition, WorkflowStep, WorkflowStatus};
use serde_json::Value;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::director::DirectorState;

use super::dag;

/// Entry point for one execution; spawned by the dispatch loop.
///
/// Handles every failure itself -- the dispatch loop never sees an error
/// from a runner.
pub(crate) async fn run_execution(
    state: Arc<DirectorState>,
    execution_id: Uuid,
    input: Option<Value>,
) {
    let Some(workflow_id) = state.with_execution(execution_id, |exec| exec.workflow_id) else {
        tracing::warn!(execution_id = %execution_id, "queue entry for unknown execution, dropping");
        state.runner_tasks.remove(&execution_id);
        return;
    };

    // Cancelled while still queued: archive and stop.
    if state
        .execution_status(execution_id)
        .is_some_and(|s| s.is_terminal())
    {
        state.release_execution_sessions(execution_id).await;
        state.archive_execution(execution_id);
        return;
    }

    let definition = match state.registry.get(workflow_id) {
        Ok(definition) => definition,
        Err(e) => {
            state.with_execution(execution_id, |exec| {
                exec.status = WorkflowStatus::Failed;
                exec.error_log.push(e.to_string());
                exec.completed_at = Some(Utc::now());
            });
            state.archive_execution(execution_id);
            return;
        }
    };

    state.with_execution(execution_id, |exec| {
        exec.status = WorkflowStatus::Running;
        if exec.started_at.is_none() {
            exec.started_at = Some(Utc::now());
        }
        exec.step_states = definition.steps.clone();
    });
    tracing::info!(
        execution_id = %execution_id,
        workflow = definition.name.as_str(),
        parallel = definition.parallel_execution,
        "starting workflow execution"
    );

    let outcome = execute_instance(&state, &definition, execution_id, input).await;
    finalize(&state, &definition, execution_id, outcome).await;
}

async fn execute_instance(
    state: &Arc<DirectorState>,
    definition: &WorkflowDefinition,
    execution_id: Uuid,
    input: Option<Value>,
) -> Result<(), DirectorError> {
    acquire_workflow_sessions(state, definition, execution_id).await?;

    if definition.parallel_execution {
        run_parallel(state, definition, execution_id, input).await
    } else {
        run_sequential(state, definition, execution_id, input).await
    }
}

/// Settle the execution's final state and run the guaranteed cleanup path.
async fn finalize(
    state: &Arc<DirectorState>,
    definition: &WorkflowDefinition,
    execution_id: Uuid,
    outcome: Result<(), DirectorError>,
) {
    let status_now = state
        .execution_status(execution_id)
        .unwrap_or(WorkflowStatus::Failed);

    match (&outcome, status_now) {
        (Ok(()), WorkflowStatus::Paused) => {
            // Paused mid-run: sessions go back, the execution stays in the
            // active map waiting for resume to re-enqueue it.
            state.release_execution_sessions(execution_id).await;
            state.runner_tasks.remove(&execution_id);
            tracing::info!(execution_id = %execution_id, "runner stopped for paused execution");
            return;
        }
        (Ok(()), WorkflowStatus::Running) => {
            state.with_execution(execution_id, |exec| {
                exec.status = WorkflowStatus::Completed;
                exec.progress = 1.0;
                exec.completed_at = Some(Utc::now());
            });
            tracing::info!(
                execution_id = %execution_id,
                workflow = definition.name.as_str(),
                "workflow completed"
            );
        }
        (Ok(()), _) => {
            // Cancelled (or otherwise already settled) while running: the
            // control operation set the status; nothing to overwrite.
        }
        (Err(e), _) => {
            state.with_execution(execution_id, |exec| {
                if !exec.status.is_terminal() {
                    exec.status = WorkflowStatus::Failed;
                }
                exec.error_log.push(format!("workflow execution failed: {e}"));
                if exec.completed_at.is_none() {
                    exec.completed_at = Some(Utc::now());
                }
            });
            tracing::error!(execution_id = %execution_id, error = %e, "workflow execution failed");
        }
    }

    state.release_execution_sessions(execution_id).await;
    state.archive_execution(execution_id);
}

/// Acquire a session for every step whose action was registered as
/// session-requiring, tagged with the workflow's requested kind. Held for
/// the whole execution.
async fn acquire_workflow_sessions(
    state: &Arc<DirectorState>,
    definition: &WorkflowDefinition,
    execution_id: Uuid,
) -> Result<(), DirectorError> {
    let kind = definition.session_requirements.kind;
    for step in &definition.steps {
        if !state.actions.requires_session(&step.action) {
            continue;
        }
        let lease = state.broker.acquire(kind).await.inspect_err(|e| {
            tracing::error!(
                execution_id = %execution_id,
                step = step.id.as_str(),
                error = %e,
                "failed to acquire session for step"
            );
        })?;
        let session_id = lease.session_id().to_string();

        *state.workload.entry(session_id.clone()).or_insert(0) += 1;
        state.leases.entry(execution_id).or_default().push(lease);
        state.with_execution(execution_id, |exec| {
            exec.session_assignments
                .insert(step.id.clone(), session_id.clone());
        });
        tracing::debug!(
            execution_id = %execution_id,
            step = step.id.as_str(),
            session_id = session_id.as_str(),
            "assigned session to step"
        );
    }
    Ok(())
}

/// Copy a step's runtime state onto the execution for observers.
fn sync_step_state(state: &DirectorState, execution_id: Uuid, step: &WorkflowStep) {
    state.with_execution(execution_id, |exec| {
        if let Some(slot) = exec.step_states.iter_mut().find(|s| s.id == step.id) {
            *slot = step.clone();
        }
    });
}

/// Whether the runner should keep acting for this execution.
fn still_running(state: &DirectorState, execution_id: Uuid) -> bool {
    matches!(
        state.execution_status(execution_id),
        Some(WorkflowStatus::Running)
    )
}

// ---------------------------------------------------------------------------
// Sequential mode
// ---------------------------------------------------------------------------

/// One pass over the steps in declaration order. A step whose dependencies
/// are not yet complete when its turn comes is passed over. A step that
/// exhausts its retries aborts the execution.
async fn run_sequential(
    state: &Arc<DirectorState>,
    definition: &WorkflowDefinition,
    execution_id: Uuid,
    input: Option<Value>,
) -> Result<(), DirectorError> {
    let total = definition.steps.len();
    let mut steps: Vec<WorkflowStep> = definition.steps.clone();
    let mut completed: HashSet<String> = HashSet::new();
    let mut results: HashMap<String, Value> = HashMap::new();

    for idx in 0..steps.len() {
        if !still_running(state, execution_id) {
            return Ok(());
        }

        if !steps[idx]
            .dependencies
            .iter()
            .all(|dep| completed.contains(dep))
        {
            tracing::debug!(
                step = steps[idx].id.as_str(),
                "dependencies not satisfied at its turn, passing over"
            );
            continue;
        }

        let session_id = state
            .with_execution(execution_id, |exec| {
                exec.current_step = Some(steps[idx].id.clone());
                exec.session_assignments.get(&steps[idx].id).cloned()
            })
            .flatten();

        let step = &mut steps[idx];
        step.session_id = session_id.clone();

        loop {
            step.status = StepStatus::Running;
            step.started_at = Some(Utc::now());
            sync_step_state(state, execution_id, step);

            match state
                .actions
                .dispatch(step, session_id.as_deref(), input.as_ref(), &results)
                .await
            {
                Ok(value) => {
                    step.status = StepStatus::Completed;
                    step.completed_at = Some(Utc::now());
                    step.result = Some(value.clone());
                    completed.insert(step.id.clone());
                    results.insert(step.id.clone(), value.clone());
                    sync_step_state(state, execution_id, step);

                    let progress = completed.len() as f64 / total as f64;
                    let step_id = step.id.clone();
                    state.with_execution(execution_id, |exec| {
                        exec.progress = progress;
                        exec.result.insert(step_id.clone(), value.clone());
                    });
                    tracing::debug!(
                        execution_id = %execution_id,
                        step = step.id.as_str(),
                        "step completed"
                    );
                    break;
                }
                Err(err) => {
                    step.error_message = Some(err.to_string());
                    step.completed_at = Some(Utc::now());

                    // Unknown-action errors are not retryable.
                    let retryable = !matches!(err, DirectorError::Validation(_));
                    if retryable && step.retry_count < step.max_retries {
                        step.retry_count += 1;
                        step.status = StepStatus::Retrying;
                        sync_step_state(state, execution_id, step);
                        tracing::warn!(
                            execution_id = %execution_id,
                            step = step.id.as_str(),
                            attempt = step.retry_count,
                            "step failed, retrying"
                        );
                        continue;
                    }

                    step.status = StepStatus::Failed;
                    sync_step_state(state, execution_id, step);
                    tracing::error!(
                        execution_id = %execution_id,
                        step = step.id.as_str(),
                        error = %err,
                        "step failed permanently, aborting execution"
                    );
                    return Err(err);
                }
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Bounded-parallel mode
// ---------------------------------------------------------------------------

/// Round-based executor: start ready steps up to the concurrency bound,
/// fan in on the first finisher, repeat. A round with nothing running and
/// incomplete steps is a deadlock and fails the execution immediately.
async fn run_parallel(
    state: &Arc<DirectorState>,
    definition: &WorkflowDefinition,
    execution_id: Uuid,
    input: Option<Value>,
) -> Result<(), DirectorError> {
    let total = definition.steps.len();
    let mut steps: Vec<WorkflowStep> = definition.steps.clone();
    let mut completed: HashSet<String> = HashSet::new();
    let mut running: HashSet<String> = HashSet::new();
    let mut results: HashMap<String, Value> = HashMap::new();
    let input = Arc::new(input);
    let mut tasks: JoinSet<(String, Result<Value, DirectorError>)> = JoinSet::new();

    loop {
        if !still_running(state, execution_id) {
            // Stop acting on results; in-flight actions run to completion
            // detached (cancellation is cooperative).
            tasks.detach_all();
            return Ok(());
        }

        // Start ready steps up to the bound, in declaration order.
        for idx in dag::ready_steps(&steps, &completed, &running) {
            if running.len() >= definition.max_concurrent_steps {
                break;
            }
            let step = &mut steps[idx];
            let step_id = step.id.clone();

            let session_id = state
                .with_execution(execution_id, |exec| {
                    exec.current_step = Some(step_id.clone());
                    exec.session_assignments.get(&step_id).cloned()
                })
                .flatten();
            step.status = StepStatus::Running;
            step.started_at = Some(Utc::now());
            step.session_id = session_id;
            sync_step_state(state, execution_id, step);
            running.insert(step_id.clone());
            tracing::debug!(
                execution_id = %execution_id,
                step = step_id.as_str(),
                "started parallel step"
            );

            let task_state = Arc::clone(state);
            let step_clone = step.clone();
            let input_clone = Arc::clone(&input);
            let results_snapshot = results.clone();
            tasks.spawn(async move {
                let result = task_state
                    .actions
                    .dispatch(
                        &step_clone,
                        step_clone.session_id.as_deref(),
                        input_clone.as_ref().as_ref(),
                        &results_snapshot,
                    )
                    .await;
                (step_clone.id, result)
            });
        }

        if running.is_empty() {
            if completed.len() < total {
                let remaining = total - completed.len();
                tracing::error!(
                    execution_id = %execution_id,
                    remaining,
                    "no ready steps and nothing running, dependency deadlock"
                );
                return Err(DirectorError::DeadlockDetected {
                    execution_id,
                    remaining,
                });
            }
            break;
        }

        // Fan in on whichever step finishes first.
        let Some(joined) = tasks.join_next().await else {
            continue;
        };
        let (step_id, result) = joined.map_err(|e| DirectorError::ActionFailure {
            step_id: String::new(),
            action: String::new(),
            message: format!("step task join error: {e}"),
        })?;
        running.remove(&step_id);
        let Some(step) = steps.iter_mut().find(|s| s.id == step_id) else {
            continue;
        };

        match result {
            Ok(value) => {
                step.status = StepStatus::Completed;
                step.completed_at = Some(Utc::now());
                step.result = Some(value.clone());
                completed.insert(step_id.clone());
                results.insert(step_id.clone(), value.clone());
                sync_step_state(state, execution_id, step);

                let progress = completed.len() as f64 / total as f64;
                state.with_execution(execution_id, |exec| {
                    exec.progress = progress;
                    exec.result.insert(step_id.clone(), value.clone());
                });
                tracing::debug!(
                    execution_id = %execution_id,
                    step = step_id.as_str(),
                    "parallel step completed"
                );
            }
            Err(err) => {
                step.error_message = Some(err.to_string());
                step.completed_at = Some(Utc::now());

                let retryable = !matches!(err, DirectorError::Validation(_));
                if retryable && step.retry_count < step.max_retries {
                    step.retry_count += 1;
                    step.status = StepStatus::Retrying;
                    sync_step_state(state, execution_id, step);
                    tracing::warn!(
                        execution_id = %execution_id,
                        step = step_id.as_str(),
                        attempt = step.retry_count,
                        "parallel step failed, will retry"
                    );
                    // Neither completed nor running: ready again next round.
                } else {
                    // Retries exhausted: mark Failed but count the step as
                    // satisfied so dependents are not blocked forever.
                    step.status = StepStatus::Failed;
                    completed.insert(step_id.clone());
                    sync_step_state(state, execution_id, step);

                    let progress = completed.len() as f64 / total as f64;
                    state.with_execution(execution_id, |exec| {
                        exec.progress = progress;
                        exec.error_log
                            .push(format!("step '{step_id}' failed permanently: {err}"));
                    });
                    tracing::error!(
                        execution_id = %execution_id,
                        step = step_id.as_str(),
                        error = %err,
                        "parallel step failed permanently, continuing with remaining steps"
                    );
                }
            }
        }
    }

    Ok(())
}
