//! Immutable workflow definition store.
//!
//! `create` assigns a fresh id, fills policy defaults, validates the step
//! list, and registers the definition. Definitions are shared as
//! `Arc<WorkflowDefinition>` and never mutated afterwards; per-run step
//! state lives on the execution.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use gigflow_types::error::DirectorError;
use gigflow_types::workflow::{
    Priority, SessionRequirements, WorkflowDefinition, WorkflowStep,
};
use serde_json::Value;
use uuid::Uuid;

use super::dag;

// ---------------------------------------------------------------------------
// Creation options
// ---------------------------------------------------------------------------

/// Policy knobs for a new workflow; everything defaults.
#[derive(Debug, Clone, Default)]
pub struct CreateWorkflowOptions {
    pub session_requirements: SessionRequirements,
    pub parallel_execution: bool,
    /// Concurrency bound for parallel mode; 0 falls back to the default (3).
    pub max_concurrent_steps: usize,
    /// Workflow timeout in seconds; 0 falls back to the default (1800).
    pub timeout_secs: u64,
    pub priority: Priority,
    pub metadata: HashMap<String, Value>,
}

// ---------------------------------------------------------------------------
// WorkflowRegistry
// ---------------------------------------------------------------------------

/// Write-once / read-many store of workflow definitions.
#[derive(Default)]
pub struct WorkflowRegistry {
    definitions: DashMap<Uuid, Arc<WorkflowDefinition>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new workflow definition.
    ///
    /// Validates: at least one step, unique step ids, non-empty action
    /// names, and a well-formed dependency graph (declared ids only, no
    /// cycles).
    pub fn create(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        steps: Vec<WorkflowStep>,
        options: CreateWorkflowOptions,
    ) -> Result<Uuid, DirectorError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DirectorError::Validation(
                "workflow name must not be empty".to_string(),
            ));
        }
        if steps.is_empty() {
            return Err(DirectorError::Validation(
                "workflow must declare at least one step".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for step in &steps {
            if !seen.insert(step.id.as_str()) {
                return Err(DirectorError::Validation(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
            if step.action.trim().is_empty() {
                return Err(DirectorError::Validation(format!(
                    "step '{}' has an empty action name",
                    step.id
                )));
            }
        }

        dag::validate_dependencies(&steps)?;

        let id = Uuid::now_v7();
        let definition = WorkflowDefinition {
            id,
            name: name.clone(),
            description: description.into(),
            steps,
            session_requirements: options.session_requirements,
            parallel_execution: options.parallel_execution,
            max_concurrent_steps: if options.max_concurrent_steps == 0 {
                3
            } else {
                options.max_concurrent_steps
            },
            timeout_secs: if options.timeout_secs == 0 {
                1800
            } else {
                options.timeout_secs
            },
            priority: options.priority,
            metadata: options.metadata,
        };

        self.definitions.insert(id, Arc::new(definition));
        tracing::info!(workflow_id = %id, name = name.as_str(), "registered workflow");
        Ok(id)
    }

    /// Look up a definition.
    pub fn get(&self, id: Uuid) -> Result<Arc<WorkflowDefinition>, DirectorError> {
        self.definitions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(DirectorError::WorkflowNotFound(id))
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.definitions.contains_key(&id)
    }

    /// Number of registered definitions.
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Insert a pre-built definition, skipping validation. Test-only door
    /// for exercising runtime deadlock handling on graphs `create` rejects.
    #[cfg(test)]
    pub(crate) fn insert_unchecked(&self, definition: WorkflowDefinition) -> Uuid {
        let id = definition.id;
        self.definitions.insert(id, Arc::new(definition));
        id
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
