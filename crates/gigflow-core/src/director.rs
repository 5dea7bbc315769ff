//! The Director: one explicit orchestrator object owning all mutable state.
//!
//! Everything the background tasks share -- the definition registry, the
//! admission queue, active executions, bounded history, session leases,
//! workload counters -- hangs off one [`DirectorState`] behind an `Arc`.
//! There are no ambient globals; drop the Director and the whole
//! orchestrator is gone.
//!
//! `start` spawns the dispatch loop, the checkpoint loop, and the session
//! sweeps. `shutdown` flips the stop flag, cancels every non-terminal
//! execution, then cancels and awaits every background task, swallowing
//! cancellation errors.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use gigflow_types::config::DirectorConfig;
use gigflow_types::error::DirectorError;
use gigflow_types::metrics::{
    ExecutionSnapshot, MAX_TASKS_PER_SESSION, SESSION_OVERLOAD_THRESHOLD, SessionDistribution,
    SessionLoad, SystemMetrics,
};
use gigflow_types::workflow::{Priority, WorkflowExecution, WorkflowStatus, WorkflowStep};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::action::ActionRegistry;
use crate::session::broker::{SessionBroker, SessionLease};
use crate::session::pool::SessionPool;
use crate::session::provider::SessionProvider;
use crate::workflow::checkpoint::CheckpointManager;
use crate::workflow::registry::{CreateWorkflowOptions, WorkflowRegistry};
use crate::workflow::scheduler::{AdmissionQueue, run_dispatch_loop};

// ---------------------------------------------------------------------------
// DirectorState
// ---------------------------------------------------------------------------

/// Shared mutable state of the orchestrator.
///
/// Held by the Director and by every background task through an `Arc`.
pub(crate) struct DirectorState {
    pub(crate) config: DirectorConfig,
    pub(crate) registry: WorkflowRegistry,
    pub(crate) actions: ActionRegistry,
    pub(crate) queue: AdmissionQueue,
    /// Live executions, keyed by execution id.
    pub(crate) executions: DashMap<Uuid, WorkflowExecution>,
    /// Terminal executions, oldest first, bounded by config.history_capacity.
    pub(crate) history: StdMutex<VecDeque<WorkflowExecution>>,
    pub(crate) broker: Arc<SessionBroker>,
    /// Sessions held per execution; taken exactly once by the release path.
    pub(crate) leases: DashMap<Uuid, Vec<SessionLease>>,
    /// Best-effort per-session task counters.
    pub(crate) workload: DashMap<String, u32>,
    /// Live runner task handles, keyed by execution id.
    pub(crate) runner_tasks: DashMap<Uuid, JoinHandle<()>>,
    pub(crate) shutdown: CancellationToken,
}

impl DirectorState {
    /// Executions currently in the Running state; this count enforces the
    /// global concurrency bound.
    pub(crate) fn running_count(&self) -> usize {
        self.executions
            .iter()
            .filter(|entry| entry.status == WorkflowStatus::Running)
            .count()
    }

    /// Run `f` against one execution under its map shard lock. Keep `f`
    /// short and never await inside it.
    pub(crate) fn with_execution<T>(
        &self,
        execution_id: Uuid,
        f: impl FnOnce(&mut WorkflowExecution) -> T,
    ) -> Option<T> {
        self.executions
            .get_mut(&execution_id)
            .map(|mut entry| f(entry.value_mut()))
    }

    pub(crate) fn execution_status(&self, execution_id: Uuid) -> Option<WorkflowStatus> {
        self.executions.get(&execution_id).map(|entry| entry.status)
    }

    /// The guaranteed session-release path, shared by completion, failure,
    /// cancellation, and shutdown. The lease vector is removed from the map
    /// first, so concurrent callers cannot double-release.
    pub(crate) async fn release_execution_sessions(&self, execution_id: Uuid) {
        let Some((_, leases)) = self.leases.remove(&execution_id) else {
            return;
        };
        for lease in leases {
            let session_id = lease.session_id().to_string();
            if let Some(mut count) = self.workload.get_mut(&session_id) {
                *count = count.saturating_sub(1);
            }
            self.broker.release(lease).await;
        }
        tracing::debug!(execution_id = %execution_id, "released execution sessions");
    }

    /// Move an execution out of the active map into bounded history.
    pub(crate) fn archive_execution(&self, execution_id: Uuid) {
        self.runner_tasks.remove(&execution_id);
        let Some((_, execution)) = self.executions.remove(&execution_id) else {
            return;
        };
        let mut history = self.history.lock().unwrap();
        history.push_back(execution);
        while history.len() > self.config.history_capacity {
            history.pop_front();
        }
    }
}

// ---------------------------------------------------------------------------
// Director
// ---------------------------------------------------------------------------

/// The workflow orchestrator.
pub struct Director {
    state: Arc<DirectorState>,
    checkpoints: CheckpointManager,
    background: StdMutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Director {
    /// Build a Director over the given session provider. Call
    /// [`Director::start`] to spawn the background tasks.
    pub fn new(config: DirectorConfig, provider: Arc<dyn SessionProvider>) -> Self {
        let pool = Arc::new(SessionPool::new(
            provider,
            config.session_pool_size,
            config.session_max_age_secs,
            config.session_idle_timeout_secs,
        ));
        let broker = Arc::new(SessionBroker::new(
            pool,
            Duration::from_secs(config.session_acquire_timeout_secs),
        ));

        let state = Arc::new(DirectorState {
            config,
            registry: WorkflowRegistry::new(),
            actions: ActionRegistry::new(),
            queue: AdmissionQueue::new(),
            executions: DashMap::new(),
            history: StdMutex::new(VecDeque::new()),
            broker,
            leases: DashMap::new(),
            workload: DashMap::new(),
            runner_tasks: DashMap::new(),
            shutdown: CancellationToken::new(),
        });

        Self {
            checkpoints: CheckpointManager::new(Arc::clone(&state)),
            state,
            background: StdMutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// The action registry; register handlers before executing workflows.
    pub fn actions(&self) -> &ActionRegistry {
        &self.state.actions
    }

    /// Spawn the dispatch loop, checkpoint loop, and session sweeps.
    /// Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut background = self.background.lock().unwrap();
        background.push(tokio::spawn(run_dispatch_loop(Arc::clone(&self.state))));

        let checkpoint_state = Arc::clone(&self.state);
        background.push(tokio::spawn(async move {
            CheckpointManager::new(checkpoint_state).run().await;
        }));

        background.extend(self.state.broker.spawn_sweeps(
            Duration::from_secs(self.state.config.health_sweep_interval_secs),
            Duration::from_secs(self.state.config.cleanup_sweep_interval_secs),
            self.state.shutdown.clone(),
        ));
        tracing::info!("director started");
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.state.shutdown.is_cancelled()
    }

    // -----------------------------------------------------------------------
    // Workflow API
    // -----------------------------------------------------------------------

    /// Register a new workflow definition.
    pub fn create_workflow(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        steps: Vec<WorkflowStep>,
        options: CreateWorkflowOptions,
    ) -> Result<Uuid, DirectorError> {
        self.state.registry.create(name, description, steps, options)
    }

    /// Queue a workflow for execution; returns the new execution id.
    ///
    /// `priority` overrides the definition's priority for this run.
    pub fn execute_workflow(
        &self,
        workflow_id: Uuid,
        input: Option<Value>,
        priority: Option<Priority>,
    ) -> Result<Uuid, DirectorError> {
        if self.state.shutdown.is_cancelled() {
            return Err(DirectorError::ShuttingDown);
        }
        let definition = self.state.registry.get(workflow_id)?;

        let execution = WorkflowExecution::new(workflow_id);
        let execution_id = execution.id;
        self.state.executions.insert(execution_id, execution);
        self.state
            .queue
            .push(execution_id, priority.unwrap_or(definition.priority), input);

        tracing::info!(
            workflow = definition.name.as_str(),
            execution_id = %execution_id,
            "queued workflow execution"
        );
        Ok(execution_id)
    }

    /// Pause a running execution. Returns false when not Running.
    pub fn pause_workflow(&self, execution_id: Uuid) -> bool {
        self.checkpoints.pause(execution_id)
    }

    /// Resume a paused execution. Returns false when not Paused.
    pub fn resume_workflow(&self, execution_id: Uuid) -> bool {
        self.checkpoints.resume(execution_id)
    }

    /// Cancel a non-terminal execution. Returns false when already terminal
    /// or unknown.
    pub async fn cancel_workflow(&self, execution_id: Uuid) -> bool {
        self.checkpoints.cancel(execution_id).await
    }

    /// Recover an execution from its latest checkpoint. Returns false when
    /// no checkpoint exists.
    pub fn recover_workflow(&self, execution_id: Uuid) -> bool {
        self.checkpoints.recover(execution_id)
    }

    // -----------------------------------------------------------------------
    // Observability
    // -----------------------------------------------------------------------

    /// Snapshot one execution, searching active executions then history.
    pub fn status(&self, execution_id: Uuid) -> Result<ExecutionSnapshot, DirectorError> {
        if let Some(entry) = self.state.executions.get(&execution_id) {
            return Ok(self.snapshot_of(entry.value()));
        }
        let history = self.state.history.lock().unwrap();
        history
            .iter()
            .find(|e| e.id == execution_id)
            .map(|e| self.snapshot_of(e))
            .ok_or(DirectorError::ExecutionNotFound(execution_id))
    }

    fn snapshot_of(&self, execution: &WorkflowExecution) -> ExecutionSnapshot {
        let workflow_name = self
            .state
            .registry
            .get(execution.workflow_id)
            .ok()
            .map(|def| def.name.clone());
        ExecutionSnapshot {
            id: execution.id,
            workflow_id: execution.workflow_id,
            workflow_name,
            status: execution.status,
            progress: execution.progress,
            current_step: execution.current_step.clone(),
            started_at: execution.started_at,
            completed_at: execution.completed_at,
            session_assignments: execution.session_assignments.clone(),
            error_log: execution.error_log.clone(),
            result: execution.result.clone(),
        }
    }

    /// Aggregate orchestrator metrics.
    pub async fn metrics(&self) -> SystemMetrics {
        let active_workflows = self.state.executions.len();
        let running_workflows = self.state.running_count();
        let queued_workflows = self.state.queue.len();

        let (completed_workflows, failed_workflows) = {
            let history = self.state.history.lock().unwrap();
            let completed = history
                .iter()
                .filter(|e| e.status == WorkflowStatus::Completed)
                .count();
            let failed = history
                .iter()
                .filter(|e| e.status == WorkflowStatus::Failed)
                .count();
            (completed, failed)
        };
        let finished = completed_workflows + failed_workflows;
        let success_rate = if finished > 0 {
            completed_workflows as f64 / finished as f64
        } else {
            0.0
        };

        let pool_stats = self.state.broker.pool().stats().await;
        let busy_sessions = self
            .state
            .workload
            .iter()
            .filter(|entry| *entry.value() > 0)
            .count();

        SystemMetrics {
            active_workflows,
            running_workflows,
            queued_workflows,
            total_sessions: pool_stats.total_sessions,
            busy_sessions,
            session_utilization: busy_sessions as f64 / pool_stats.total_sessions.max(1) as f64,
            completed_workflows,
            failed_workflows,
            success_rate,
            workflow_definitions: self.state.registry.len(),
            is_running: self.is_running(),
        }
    }

    /// Per-session workload and load-balancing view.
    pub fn session_distribution(&self) -> SessionDistribution {
        let mut sessions = HashMap::new();
        let mut workload_sum: u64 = 0;
        let mut overloaded_sessions = 0;

        for entry in self.state.workload.iter() {
            let workload = *entry.value();
            workload_sum += u64::from(workload);
            if workload > SESSION_OVERLOAD_THRESHOLD {
                overloaded_sessions += 1;
            }
            sessions.insert(
                entry.key().clone(),
                SessionLoad {
                    workload,
                    kind: self.state.broker.assignment_of(entry.key()),
                    utilization: (f64::from(workload) / f64::from(MAX_TASKS_PER_SESSION)).min(1.0),
                },
            );
        }

        let total_sessions = sessions.len();
        SessionDistribution {
            total_sessions,
            average_workload: workload_sum as f64 / total_sessions.max(1) as f64,
            overloaded_sessions,
            sessions,
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stop the orchestrator: set the stop flag, cancel every non-terminal
    /// execution, then cancel and await all background and runner tasks,
    /// swallowing cancellation errors. Finally closes all sessions.
    pub async fn shutdown(&self) {
        if self.state.shutdown.is_cancelled() {
            return;
        }
        tracing::info!("shutting down director");
        self.state.shutdown.cancel();

        let active_ids: Vec<Uuid> = self.state.executions.iter().map(|e| *e.key()).collect();
        for execution_id in active_ids {
            self.checkpoints.cancel(execution_id).await;
        }

        let background: Vec<JoinHandle<()>> = self.background.lock().unwrap().drain(..).collect();
        for handle in background {
            handle.abort();
            let _ = handle.await;
        }

        let runner_ids: Vec<Uuid> = self.state.runner_tasks.iter().map(|e| *e.key()).collect();
        for execution_id in runner_ids {
            if let Some((_, handle)) = self.state.runner_tasks.remove(&execution_id) {
                handle.abort();
                let _ = handle.await;
            }
        }

        self.state.broker.shutdown().await;
        tracing::info!("director shutdown complete");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionError, ActionFuture, ActionHandler};
    use crate::session::provider::fake::FakeProvider;
    use chrono::Utc;
    use gigflow_types::workflow::{Checkpoint, StepStatus};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Semaphore;

    // -----------------------------------------------------------------------
    // Harness
    // -----------------------------------------------------------------------

    fn test_config() -> DirectorConfig {
        DirectorConfig {
            max_concurrent_workflows: 5,
            dispatch_poll_interval_ms: 20,
            dispatch_backoff_secs: 1,
            checkpoint_interval_secs: 3600, // keep periodic checkpoints out of the way
            session_pool_size: 4,
            session_acquire_timeout_secs: 2,
            health_sweep_interval_secs: 3600,
            cleanup_sweep_interval_secs: 3600,
            session_max_age_secs: 1800,
            session_idle_timeout_secs: 1800,
            history_capacity: 100,
        }
    }

    fn director_with(config: DirectorConfig) -> (Director, Arc<FakeProvider>) {
        let provider = Arc::new(FakeProvider::new());
        (Director::new(config, provider.clone()), provider)
    }

    /// Test handler: records invocations, optionally fails the first N
    /// calls, optionally waits on a semaphore gate before returning.
    struct ScriptedHandler {
        record: Arc<StdMutex<Vec<String>>>,
        failures: AtomicU32,
        gate: Option<Arc<Semaphore>>,
    }

    impl ScriptedHandler {
        fn recording(record: Arc<StdMutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                record,
                failures: AtomicU32::new(0),
                gate: None,
            })
        }

        fn failing_times(record: Arc<StdMutex<Vec<String>>>, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                record,
                failures: AtomicU32::new(failures),
                gate: None,
            })
        }

        fn gated(record: Arc<StdMutex<Vec<String>>>, gate: Arc<Semaphore>) -> Arc<Self> {
            Arc::new(Self {
                record,
                failures: AtomicU32::new(0),
                gate: Some(gate),
            })
        }
    }

    impl ActionHandler for ScriptedHandler {
        fn execute<'a>(
            &'a self,
            step: &'a WorkflowStep,
            _session_id: Option<&'a str>,
            _input: Option<&'a Value>,
            _prior_results: &'a HashMap<String, Value>,
        ) -> ActionFuture<'a> {
            Box::pin(async move {
                self.record.lock().unwrap().push(step.id.clone());
                if let Some(gate) = &self.gate {
                    let permit = gate.acquire().await.map_err(|_| {
                        ActionError::Failed("gate closed".to_string())
                    })?;
                    permit.forget();
                }
                let remaining = self.failures.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.failures.store(remaining - 1, Ordering::SeqCst);
                    return Err(ActionError::Failed("scripted failure".to_string()));
                }
                Ok(json!({ "step": step.id }))
            })
        }
    }

    async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    fn archived_status(director: &Director, execution_id: Uuid) -> Option<WorkflowStatus> {
        let history = director.state.history.lock().unwrap();
        history.iter().find(|e| e.id == execution_id).map(|e| e.status)
    }

    fn archived_execution(director: &Director, execution_id: Uuid) -> Option<WorkflowExecution> {
        let history = director.state.history.lock().unwrap();
        history.iter().find(|e| e.id == execution_id).cloned()
    }

    // -----------------------------------------------------------------------
    // Sequential execution
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn sequential_chain_runs_in_dependency_order() {
        let (director, _provider) = director_with(test_config());
        let record = Arc::new(StdMutex::new(Vec::new()));
        director
            .actions()
            .register("search_jobs", ScriptedHandler::recording(record.clone()));

        let workflow_id = director
            .create_workflow(
                "chain",
                "three dependent steps",
                vec![
                    WorkflowStep::new("a", "A", "search_jobs"),
                    WorkflowStep::new("b", "B", "search_jobs").depends_on("a"),
                    WorkflowStep::new("c", "C", "search_jobs").depends_on("b"),
                ],
                CreateWorkflowOptions::default(),
            )
            .unwrap();

        director.start();
        let execution_id = director.execute_workflow(workflow_id, None, None).unwrap();

        assert!(
            wait_until(Duration::from_secs(5), || {
                archived_status(&director, execution_id) == Some(WorkflowStatus::Completed)
            })
            .await
        );

        assert_eq!(*record.lock().unwrap(), vec!["a", "b", "c"]);
        let execution = archived_execution(&director, execution_id).unwrap();
        assert_eq!(execution.progress, 1.0);
        assert_eq!(execution.result.len(), 3);
        director.shutdown().await;
    }

    #[tokio::test]
    async fn sequential_step_exhaustion_aborts_the_execution() {
        let (director, _provider) = director_with(test_config());
        let record = Arc::new(StdMutex::new(Vec::new()));
        director.actions().register(
            "submit_proposals",
            ScriptedHandler::failing_times(record.clone(), u32::MAX),
        );
        director
            .actions()
            .register("verify_submissions", ScriptedHandler::recording(record.clone()));

        let workflow_id = director
            .create_workflow(
                "doomed",
                "",
                vec![
                    WorkflowStep::new("submit", "Submit", "submit_proposals").with_max_retries(1),
                    WorkflowStep::new("verify", "Verify", "verify_submissions")
                        .depends_on("submit"),
                ],
                CreateWorkflowOptions::default(),
            )
            .unwrap();

        director.start();
        let execution_id = director.execute_workflow(workflow_id, None, None).unwrap();

        assert!(
            wait_until(Duration::from_secs(5), || {
                archived_status(&director, execution_id) == Some(WorkflowStatus::Failed)
            })
            .await
        );

        // First attempt plus one retry, and the dependent step never ran.
        assert_eq!(*record.lock().unwrap(), vec!["submit", "submit"]);
        let execution = archived_execution(&director, execution_id).unwrap();
        assert!(!execution.error_log.is_empty());
        let submit = execution
            .step_states
            .iter()
            .find(|s| s.id == "submit")
            .unwrap();
        assert_eq!(submit.status, StepStatus::Failed);
        assert_eq!(submit.retry_count, 1);
        director.shutdown().await;
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let (director, _provider) = director_with(test_config());
        let record = Arc::new(StdMutex::new(Vec::new()));
        director
            .actions()
            .register("search_jobs", ScriptedHandler::failing_times(record.clone(), 2));

        let workflow_id = director
            .create_workflow(
                "flaky",
                "",
                vec![WorkflowStep::new("search", "Search", "search_jobs").with_max_retries(2)],
                CreateWorkflowOptions::default(),
            )
            .unwrap();

        director.start();
        let execution_id = director.execute_workflow(workflow_id, None, None).unwrap();

        assert!(
            wait_until(Duration::from_secs(5), || {
                archived_status(&director, execution_id) == Some(WorkflowStatus::Completed)
            })
            .await
        );

        let execution = archived_execution(&director, execution_id).unwrap();
        let step = execution.step_states.iter().find(|s| s.id == "search").unwrap();
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.retry_count, 2);
        assert_eq!(record.lock().unwrap().len(), 3);
        director.shutdown().await;
    }

    // -----------------------------------------------------------------------
    // Parallel execution
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn parallel_fan_in_waits_for_all_dependencies() {
        let (director, _provider) = director_with(test_config());
        let record = Arc::new(StdMutex::new(Vec::new()));
        director
            .actions()
            .register("search_jobs", ScriptedHandler::recording(record.clone()));
        director
            .actions()
            .register("merge_job_results", ScriptedHandler::recording(record.clone()));

        let workflow_id = director
            .create_workflow(
                "fan-in",
                "A and B feed C",
                vec![
                    WorkflowStep::new("A", "Search one", "search_jobs"),
                    WorkflowStep::new("B", "Search two", "search_jobs"),
                    WorkflowStep::new("C", "Merge", "merge_job_results")
                        .depends_on("A")
                        .depends_on("B"),
                ],
                CreateWorkflowOptions {
                    parallel_execution: true,
                    max_concurrent_steps: 2,
                    ..CreateWorkflowOptions::default()
                },
            )
            .unwrap();

        director.start();
        let execution_id = director.execute_workflow(workflow_id, None, None).unwrap();

        assert!(
            wait_until(Duration::from_secs(5), || {
                archived_status(&director, execution_id) == Some(WorkflowStatus::Completed)
            })
            .await
        );

        let execution = archived_execution(&director, execution_id).unwrap();
        assert_eq!(execution.result.len(), 3);
        for key in ["A", "B", "C"] {
            assert!(execution.result.contains_key(key), "missing result for {key}");
        }

        let order = record.lock().unwrap().clone();
        let pos = |id: &str| order.iter().position(|s| s == id).unwrap();
        assert!(pos("C") > pos("A"));
        assert!(pos("C") > pos("B"));
        director.shutdown().await;
    }

    #[tokio::test]
    async fn parallel_absorbs_exhausted_step_and_continues() {
        let (director, _provider) = director_with(test_config());
        let record = Arc::new(StdMutex::new(Vec::new()));
        director.actions().register(
            "search_jobs",
            ScriptedHandler::failing_times(record.clone(), u32::MAX),
        );
        director
            .actions()
            .register("merge_job_results", ScriptedHandler::recording(record.clone()));

        let workflow_id = director
            .create_workflow(
                "absorbing",
                "",
                vec![
                    WorkflowStep::new("search", "Search", "search_jobs").with_max_retries(1),
                    WorkflowStep::new("merge", "Merge", "merge_job_results").depends_on("search"),
                ],
                CreateWorkflowOptions {
                    parallel_execution: true,
                    ..CreateWorkflowOptions::default()
                },
            )
            .unwrap();

        director.start();
        let execution_id = director.execute_workflow(workflow_id, None, None).unwrap();

        // The failed step is absorbed, so the dependent still runs and the
        // execution completes.
        assert!(
            wait_until(Duration::from_secs(5), || {
                archived_status(&director, execution_id) == Some(WorkflowStatus::Completed)
            })
            .await
        );

        let execution = archived_execution(&director, execution_id).unwrap();
        let search = execution.step_states.iter().find(|s| s.id == "search").unwrap();
        assert_eq!(search.status, StepStatus::Failed);
        assert!(execution.result.contains_key("merge"));
        assert!(!execution.result.contains_key("search"));
        assert!(
            execution
                .error_log
                .iter()
                .any(|line| line.contains("failed permanently"))
        );
        director.shutdown().await;
    }

    #[tokio::test]
    async fn parallel_deadlock_terminates_as_failed() {
        let (director, _provider) = director_with(test_config());
        let record = Arc::new(StdMutex::new(Vec::new()));
        director
            .actions()
            .register("search_jobs", ScriptedHandler::recording(record.clone()));

        // Bypass create-time validation to exercise the runtime guard.
        let definition = gigflow_types::workflow::WorkflowDefinition {
            id: Uuid::now_v7(),
            name: "broken".to_string(),
            description: String::new(),
            steps: vec![
                WorkflowStep::new("a", "A", "search_jobs"),
                WorkflowStep::new("b", "B", "search_jobs").depends_on("ghost"),
            ],
            session_requirements: Default::default(),
            parallel_execution: true,
            max_concurrent_steps: 2,
            timeout_secs: 1800,
            priority: Priority::Normal,
            metadata: HashMap::new(),
        };
        let workflow_id = director.state.registry.insert_unchecked(definition);

        director.start();
        let execution_id = director.execute_workflow(workflow_id, None, None).unwrap();

        assert!(
            wait_until(Duration::from_secs(5), || {
                archived_status(&director, execution_id) == Some(WorkflowStatus::Failed)
            })
            .await,
            "deadlocked execution must terminate rather than hang"
        );

        let execution = archived_execution(&director, execution_id).unwrap();
        assert!(
            execution
                .error_log
                .iter()
                .any(|line| line.contains("deadlock"))
        );
        director.shutdown().await;
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn priority_dispatches_first_under_capacity_for_one() {
        let mut config = test_config();
        config.max_concurrent_workflows = 1;
        let (director, _provider) = director_with(config);

        let record = Arc::new(StdMutex::new(Vec::new()));
        let gate = Arc::new(Semaphore::new(0));
        director
            .actions()
            .register("blocker", ScriptedHandler::gated(record.clone(), gate.clone()));
        director
            .actions()
            .register("search_jobs", ScriptedHandler::recording(record.clone()));

        let blocker_id = director
            .create_workflow(
                "blocker",
                "",
                vec![WorkflowStep::new("hold", "Hold", "blocker")],
                CreateWorkflowOptions::default(),
            )
            .unwrap();
        let quick = |name: &str| {
            director
                .create_workflow(
                    name,
                    "",
                    vec![WorkflowStep::new(name, name, "search_jobs")],
                    CreateWorkflowOptions::default(),
                )
                .unwrap()
        };
        let low_wf = quick("low-step");
        let high_wf = quick("high-step");

        director.start();
        let blocker_exec = director.execute_workflow(blocker_id, None, None).unwrap();
        assert!(
            wait_until(Duration::from_secs(5), || {
                record.lock().unwrap().contains(&"hold".to_string())
            })
            .await
        );

        // The single slot is busy; queue low first, then high.
        let low_exec = director
            .execute_workflow(low_wf, None, Some(Priority::Low))
            .unwrap();
        let high_exec = director
            .execute_workflow(high_wf, None, Some(Priority::High))
            .unwrap();

        gate.add_permits(1);

        assert!(
            wait_until(Duration::from_secs(5), || {
                archived_status(&director, low_exec) == Some(WorkflowStatus::Completed)
                    && archived_status(&director, high_exec) == Some(WorkflowStatus::Completed)
                    && archived_status(&director, blocker_exec)
                        == Some(WorkflowStatus::Completed)
            })
            .await
        );

        let order = record.lock().unwrap().clone();
        let pos = |id: &str| order.iter().position(|s| s == id).unwrap();
        assert!(
            pos("high-step") < pos("low-step"),
            "higher priority must dispatch first, got {order:?}"
        );
        director.shutdown().await;
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn session_steps_get_distinct_sessions_held_until_completion() {
        let (director, provider) = director_with(test_config());
        let record = Arc::new(StdMutex::new(Vec::new()));
        let gate = Arc::new(Semaphore::new(0));
        director
            .actions()
            .register_with_session("navigate", ScriptedHandler::gated(record.clone(), gate.clone()));

        let workflow_id = director
            .create_workflow(
                "browsing",
                "",
                vec![
                    WorkflowStep::new("p1", "Page one", "navigate"),
                    WorkflowStep::new("p2", "Page two", "navigate"),
                ],
                CreateWorkflowOptions {
                    parallel_execution: true,
                    max_concurrent_steps: 2,
                    ..CreateWorkflowOptions::default()
                },
            )
            .unwrap();

        director.start();
        let execution_id = director.execute_workflow(workflow_id, None, None).unwrap();

        assert!(
            wait_until(Duration::from_secs(5), || {
                record.lock().unwrap().len() == 2
            })
            .await
        );

        // Both steps hold sessions concurrently; ids must differ.
        let snapshot = director.status(execution_id).unwrap();
        assert_eq!(snapshot.session_assignments.len(), 2);
        let ids: std::collections::HashSet<&String> =
            snapshot.session_assignments.values().collect();
        assert_eq!(ids.len(), 2, "no two steps may share a session");
        assert_eq!(provider.created_count(), 2);

        let distribution = director.session_distribution();
        assert_eq!(distribution.total_sessions, 2);
        assert!(distribution.sessions.values().all(|s| s.workload == 1));

        gate.add_permits(2);
        assert!(
            wait_until(Duration::from_secs(5), || {
                archived_status(&director, execution_id) == Some(WorkflowStatus::Completed)
            })
            .await
        );

        // Held for the whole execution, released exactly once at the end.
        let stats = director.state.broker.pool().stats().await;
        assert_eq!(stats.in_use_sessions, 0);
        assert!(
            director
                .state
                .workload
                .iter()
                .all(|entry| *entry.value() == 0)
        );
        director.shutdown().await;
    }

    // -----------------------------------------------------------------------
    // Control operations
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn pause_then_resume_restarts_the_execution() {
        let (director, _provider) = director_with(test_config());
        let record = Arc::new(StdMutex::new(Vec::new()));
        let gate = Arc::new(Semaphore::new(0));
        director
            .actions()
            .register("blocker", ScriptedHandler::gated(record.clone(), gate.clone()));
        director
            .actions()
            .register("search_jobs", ScriptedHandler::recording(record.clone()));

        let workflow_id = director
            .create_workflow(
                "pausable",
                "",
                vec![
                    WorkflowStep::new("first", "First", "blocker"),
                    WorkflowStep::new("second", "Second", "search_jobs").depends_on("first"),
                ],
                CreateWorkflowOptions::default(),
            )
            .unwrap();

        director.start();
        let execution_id = director.execute_workflow(workflow_id, None, None).unwrap();
        assert!(
            wait_until(Duration::from_secs(5), || {
                record.lock().unwrap().contains(&"first".to_string())
            })
            .await
        );

        assert!(director.pause_workflow(execution_id));
        assert!(!director.pause_workflow(execution_id), "already paused");
        let snapshot = director.status(execution_id).unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Paused);

        // Let the in-flight step finish; the runner stops at the boundary
        // and the execution stays active, waiting for resume.
        gate.add_permits(1);
        assert!(
            wait_until(Duration::from_secs(5), || {
                !director.state.runner_tasks.contains_key(&execution_id)
            })
            .await
        );
        assert!(director.state.executions.contains_key(&execution_id));

        // Resume restarts scheduling of the whole execution.
        gate.add_permits(1);
        assert!(director.resume_workflow(execution_id));
        assert!(
            wait_until(Duration::from_secs(5), || {
                archived_status(&director, execution_id) == Some(WorkflowStatus::Completed)
            })
            .await
        );

        let order = record.lock().unwrap().clone();
        assert_eq!(order, vec!["first", "first", "second"]);
        director.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_releases_sessions_and_archives() {
        let (director, _provider) = director_with(test_config());
        let record = Arc::new(StdMutex::new(Vec::new()));
        let gate = Arc::new(Semaphore::new(0));
        director
            .actions()
            .register_with_session("navigate", ScriptedHandler::gated(record.clone(), gate.clone()));

        let workflow_id = director
            .create_workflow(
                "cancellable",
                "",
                vec![WorkflowStep::new("nav", "Navigate", "navigate")],
                CreateWorkflowOptions::default(),
            )
            .unwrap();

        director.start();
        let execution_id = director.execute_workflow(workflow_id, None, None).unwrap();
        assert!(
            wait_until(Duration::from_secs(5), || {
                record.lock().unwrap().len() == 1
            })
            .await
        );

        assert!(director.cancel_workflow(execution_id).await);

        // Sessions are released immediately, without interrupting the
        // in-flight action.
        let stats = director.state.broker.pool().stats().await;
        assert_eq!(stats.in_use_sessions, 0);

        gate.add_permits(1);
        assert!(
            wait_until(Duration::from_secs(5), || {
                archived_status(&director, execution_id) == Some(WorkflowStatus::Cancelled)
            })
            .await
        );
        assert!(!director.cancel_workflow(execution_id).await, "already terminal");
        director.shutdown().await;
    }

    #[tokio::test]
    async fn recover_restores_the_latest_checkpoint_exactly() {
        let (director, _provider) = director_with(test_config());

        // Archived failed execution with a checkpoint at progress 0.4.
        let workflow_id = Uuid::now_v7();
        let mut execution = WorkflowExecution::new(workflow_id);
        let execution_id = execution.id;
        execution.status = WorkflowStatus::Failed;
        execution.completed_at = Some(Utc::now());
        execution.push_checkpoint(Checkpoint {
            execution_id,
            workflow_id,
            status: WorkflowStatus::Running,
            progress: 0.4,
            current_step: Some("X".to_string()),
            session_assignments: HashMap::from([("X".to_string(), "session-7".to_string())]),
            timestamp: Utc::now(),
        });
        director.state.history.lock().unwrap().push_back(execution);

        assert!(director.recover_workflow(execution_id));

        let snapshot = director.status(execution_id).unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Running);
        assert_eq!(snapshot.progress, 0.4);
        assert_eq!(snapshot.current_step.as_deref(), Some("X"));
        assert_eq!(
            snapshot.session_assignments.get("X").map(String::as_str),
            Some("session-7")
        );
        assert!(director.state.executions.contains_key(&execution_id));
        assert_eq!(director.state.queue.len(), 1);
    }

    #[tokio::test]
    async fn recover_without_checkpoint_returns_false() {
        let (director, _provider) = director_with(test_config());

        let mut execution = WorkflowExecution::new(Uuid::now_v7());
        execution.status = WorkflowStatus::Failed;
        let execution_id = execution.id;
        director.state.history.lock().unwrap().push_back(execution);

        assert!(!director.recover_workflow(execution_id));
        // Still archived, not resurrected.
        assert!(!director.state.executions.contains_key(&execution_id));
        assert!(archived_status(&director, execution_id).is_some());
        assert!(!director.recover_workflow(Uuid::now_v7()), "unknown id");
    }

    #[tokio::test]
    async fn periodic_checkpointing_is_bounded_per_execution() {
        let (director, _provider) = director_with(test_config());

        let mut execution = WorkflowExecution::new(Uuid::now_v7());
        execution.status = WorkflowStatus::Running;
        let execution_id = execution.id;
        director.state.executions.insert(execution_id, execution);

        let manager = CheckpointManager::new(Arc::clone(&director.state));
        for _ in 0..14 {
            assert_eq!(manager.checkpoint_running(), 1);
        }

        let count = director
            .state
            .with_execution(execution_id, |exec| exec.checkpoints.len())
            .unwrap();
        assert_eq!(count, 10, "only the ten most recent checkpoints remain");
    }

    // -----------------------------------------------------------------------
    // History, status, metrics
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn history_is_bounded_fifo() {
        let mut config = test_config();
        config.history_capacity = 5;
        let (director, _provider) = director_with(config);

        let mut ids = Vec::new();
        for _ in 0..7 {
            let mut execution = WorkflowExecution::new(Uuid::now_v7());
            execution.status = WorkflowStatus::Completed;
            let id = execution.id;
            ids.push(id);
            director.state.executions.insert(id, execution);
            director.state.archive_execution(id);
        }

        let history = director.state.history.lock().unwrap();
        assert_eq!(history.len(), 5);
        let kept: Vec<Uuid> = history.iter().map(|e| e.id).collect();
        assert_eq!(kept, ids[2..].to_vec(), "oldest two evicted");
    }

    #[tokio::test]
    async fn status_finds_active_then_history_then_errors() {
        let (director, _provider) = director_with(test_config());
        let record = Arc::new(StdMutex::new(Vec::new()));
        director
            .actions()
            .register("search_jobs", ScriptedHandler::recording(record));

        let workflow_id = director
            .create_workflow(
                "lookup",
                "",
                vec![WorkflowStep::new("s", "S", "search_jobs")],
                CreateWorkflowOptions::default(),
            )
            .unwrap();

        director.start();
        let execution_id = director.execute_workflow(workflow_id, None, None).unwrap();

        assert!(
            wait_until(Duration::from_secs(5), || {
                archived_status(&director, execution_id) == Some(WorkflowStatus::Completed)
            })
            .await
        );

        // Found in history after archival, with the definition name.
        let snapshot = director.status(execution_id).unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Completed);
        assert_eq!(snapshot.workflow_name.as_deref(), Some("lookup"));

        let err = director.status(Uuid::now_v7()).unwrap_err();
        assert!(matches!(err, DirectorError::ExecutionNotFound(_)));
        director.shutdown().await;
    }

    #[tokio::test]
    async fn metrics_track_outcomes_and_guard_success_rate() {
        let (director, _provider) = director_with(test_config());

        // Empty: success rate guarded at zero.
        let metrics = director.metrics().await;
        assert_eq!(metrics.success_rate, 0.0);
        assert_eq!(metrics.queued_workflows, 0);

        for status in [
            WorkflowStatus::Completed,
            WorkflowStatus::Completed,
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
        ] {
            let mut execution = WorkflowExecution::new(Uuid::now_v7());
            execution.status = status;
            let id = execution.id;
            director.state.executions.insert(id, execution);
            director.state.archive_execution(id);
        }

        let metrics = director.metrics().await;
        assert_eq!(metrics.completed_workflows, 3);
        assert_eq!(metrics.failed_workflows, 1);
        assert!((metrics.success_rate - 0.75).abs() < 1e-9);
        assert_eq!(metrics.active_workflows, 0);
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn shutdown_cancels_running_executions_and_refuses_new_work() {
        let (director, _provider) = director_with(test_config());
        let record = Arc::new(StdMutex::new(Vec::new()));
        let gate = Arc::new(Semaphore::new(0));
        director
            .actions()
            .register("blocker", ScriptedHandler::gated(record.clone(), gate.clone()));

        let workflow_id = director
            .create_workflow(
                "long-haul",
                "",
                vec![WorkflowStep::new("hold", "Hold", "blocker")],
                CreateWorkflowOptions::default(),
            )
            .unwrap();

        director.start();
        let execution_id = director.execute_workflow(workflow_id, None, None).unwrap();
        assert!(
            wait_until(Duration::from_secs(5), || {
                record.lock().unwrap().len() == 1
            })
            .await
        );

        director.shutdown().await;
        assert!(!director.is_running());

        // The running execution was cancelled, and new work is refused.
        let snapshot = director.status(execution_id).unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Cancelled);
        let err = director
            .execute_workflow(workflow_id, None, None)
            .unwrap_err();
        assert!(matches!(err, DirectorError::ShuttingDown));
    }
}
