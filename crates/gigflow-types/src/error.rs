//! Error taxonomy for the Gigflow orchestrator.

use thiserror::Error;
use uuid::Uuid;

use crate::session::TaskKind;

/// Errors surfaced by the orchestrator and its components.
#[derive(Debug, Error)]
pub enum DirectorError {
    /// Referenced workflow definition does not exist.
    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    /// Referenced execution is unknown to both the active map and history.
    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    /// Malformed workflow or step, or an unregistered action name.
    #[error("validation error: {0}")]
    Validation(String),

    /// No session became available within the acquire timeout.
    #[error("no {kind} session available within {waited_secs}s")]
    SessionExhausted { kind: TaskKind, waited_secs: u64 },

    /// The pool already tracks its maximum number of sessions.
    #[error("session pool is at capacity ({0} sessions)")]
    PoolAtCapacity(usize),

    /// A delegated action raised.
    #[error("action '{action}' failed at step '{step_id}': {message}")]
    ActionFailure {
        step_id: String,
        action: String,
        message: String,
    },

    /// The parallel executor made zero progress in a round with steps left.
    #[error("deadlock detected in execution {execution_id}: {remaining} steps unreachable")]
    DeadlockDetected {
        execution_id: Uuid,
        remaining: usize,
    },

    /// `recover` was called on an execution with no checkpoint.
    #[error("no checkpoint available for execution {0}")]
    RecoveryFailure(Uuid),

    /// The session provider failed to create, close, or probe a session.
    #[error("session provider error: {0}")]
    Provider(String),

    /// The orchestrator is shutting down and refuses new work.
    #[error("orchestrator is shutting down")]
    ShuttingDown,
}
