//! Action dispatch: the seam between the orchestrator and the browser
//! automation layer.
//!
//! Steps carry a symbolic action name. The registry maps each name to a
//! handler and records whether the action needs a browser session. Unknown
//! names fail with a validation error instead of silently falling through.
//!
//! The handlers themselves (navigation, extraction, form filling, job
//! search) are registered by the embedding application; the orchestrator
//! never inspects what they do.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use gigflow_types::error::DirectorError;
use gigflow_types::workflow::WorkflowStep;
use serde_json::Value;

/// Boxed future returned by action handlers, dyn-compatible.
pub type ActionFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, ActionError>> + Send + 'a>>;

// ---------------------------------------------------------------------------
// ActionError
// ---------------------------------------------------------------------------

/// Failure raised by a delegated action.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// The action ran and failed (network error, page change, rejection).
    #[error("{0}")]
    Failed(String),

    /// The action cannot run against the given step or session at all.
    #[error("invalid invocation: {0}")]
    InvalidInvocation(String),
}

// ---------------------------------------------------------------------------
// ActionHandler
// ---------------------------------------------------------------------------

/// One browser-automation capability, keyed by action name in the registry.
///
/// Boxed-future methods keep the trait dyn-compatible so handlers can be
/// stored as `Arc<dyn ActionHandler>`.
pub trait ActionHandler: Send + Sync {
    /// Perform the step's effect.
    ///
    /// `session_id` is set when the action was registered as
    /// session-requiring. `prior_results` holds the results of already
    /// completed steps in the same execution, keyed by step id.
    fn execute<'a>(
        &'a self,
        step: &'a WorkflowStep,
        session_id: Option<&'a str>,
        input: Option<&'a Value>,
        prior_results: &'a HashMap<String, Value>,
    ) -> ActionFuture<'a>;
}

// ---------------------------------------------------------------------------
// ActionRegistry
// ---------------------------------------------------------------------------

struct RegisteredAction {
    handler: Arc<dyn ActionHandler>,
    needs_session: bool,
}

/// Explicit name-to-handler registry for step actions.
#[derive(Default)]
pub struct ActionRegistry {
    actions: DashMap<String, RegisteredAction>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an action that runs without a browser session.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.actions.insert(
            name.into(),
            RegisteredAction {
                handler,
                needs_session: false,
            },
        );
    }

    /// Register a handler for an action that must be given a session.
    pub fn register_with_session(&self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.actions.insert(
            name.into(),
            RegisteredAction {
                handler,
                needs_session: true,
            },
        );
    }

    /// Whether the action name is known.
    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Whether the named action was registered as session-requiring.
    ///
    /// Unknown names answer `false`; they are rejected at dispatch.
    pub fn requires_session(&self, name: &str) -> bool {
        self.actions
            .get(name)
            .map(|entry| entry.needs_session)
            .unwrap_or(false)
    }

    /// Number of registered actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run the step's action through its registered handler.
    pub async fn dispatch(
        &self,
        step: &WorkflowStep,
        session_id: Option<&str>,
        input: Option<&Value>,
        prior_results: &HashMap<String, Value>,
    ) -> Result<Value, DirectorError> {
        // Clone the handler out before awaiting so the map shard stays free.
        let handler = self
            .actions
            .get(&step.action)
            .map(|entry| Arc::clone(&entry.handler))
            .ok_or_else(|| {
                DirectorError::Validation(format!(
                    "step '{}' names unregistered action '{}'",
                    step.id, step.action
                ))
            })?;

        handler
            .execute(step, session_id, input, prior_results)
            .await
            .map_err(|e| DirectorError::ActionFailure {
                step_id: step.id.clone(),
                action: step.action.clone(),
                message: e.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    impl ActionHandler for EchoHandler {
        fn execute<'a>(
            &'a self,
            step: &'a WorkflowStep,
            session_id: Option<&'a str>,
            _input: Option<&'a Value>,
            _prior_results: &'a HashMap<String, Value>,
        ) -> ActionFuture<'a> {
            Box::pin(async move {
                Ok(json!({
                    "step": step.id,
                    "session": session_id,
                }))
            })
        }
    }

    struct FailingHandler;

    impl ActionHandler for FailingHandler {
        fn execute<'a>(
            &'a self,
            _step: &'a WorkflowStep,
            _session_id: Option<&'a str>,
            _input: Option<&'a Value>,
            _prior_results: &'a HashMap<String, Value>,
        ) -> ActionFuture<'a> {
            Box::pin(async move { Err(ActionError::Failed("page changed".to_string())) })
        }
    }

    #[tokio::test]
    async fn dispatch_runs_registered_handler() {
        let registry = ActionRegistry::new();
        registry.register_with_session("navigate", Arc::new(EchoHandler));

        let step = WorkflowStep::new("open", "Open search page", "navigate");
        let result = registry
            .dispatch(&step, Some("sess-1"), None, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(result["step"], "open");
        assert_eq!(result["session"], "sess-1");
    }

    #[tokio::test]
    async fn dispatch_rejects_unknown_action() {
        let registry = ActionRegistry::new();
        let step = WorkflowStep::new("x", "X", "teleport");

        let err = registry
            .dispatch(&step, None, None, &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DirectorError::Validation(_)));
        assert!(err.to_string().contains("teleport"));
    }

    #[tokio::test]
    async fn dispatch_wraps_handler_failure() {
        let registry = ActionRegistry::new();
        registry.register("submit_proposals", Arc::new(FailingHandler));

        let step = WorkflowStep::new("submit", "Submit", "submit_proposals");
        let err = registry
            .dispatch(&step, None, None, &HashMap::new())
            .await
            .unwrap_err();
        match err {
            DirectorError::ActionFailure {
                step_id, message, ..
            } => {
                assert_eq!(step_id, "submit");
                assert!(message.contains("page changed"));
            }
            other => panic!("expected ActionFailure, got {other}"),
        }
    }

    #[test]
    fn requires_session_reflects_registration() {
        let registry = ActionRegistry::new();
        registry.register_with_session("extract", Arc::new(EchoHandler));
        registry.register("merge_job_results", Arc::new(EchoHandler));

        assert!(registry.requires_session("extract"));
        assert!(!registry.requires_session("merge_job_results"));
        assert!(!registry.requires_session("unknown"));
        assert_eq!(registry.len(), 2);
    }
}
