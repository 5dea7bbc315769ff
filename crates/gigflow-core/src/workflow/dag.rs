//! Dependency-graph validation and ready-set computation.
//!
//! Validation runs once at workflow creation: every dependency must name a
//! declared step and the graph must be acyclic (petgraph toposort). The
//! runner still detects deadlocks at runtime, since recovery can re-enter
//! odd states; validation just refuses the obviously broken definitions up
//! front.

use std::collections::{HashMap, HashSet};

use gigflow_types::error::DirectorError;
use gigflow_types::workflow::WorkflowStep;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

/// Validate that the steps form a DAG over declared ids.
pub fn validate_dependencies(steps: &[WorkflowStep]) -> Result<(), DirectorError> {
    let id_to_idx: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    // Edge direction: dependency -> dependent.
    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: Vec<_> = steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();

    for step in steps {
        let to = id_to_idx[step.id.as_str()];
        for dep in &step.dependencies {
            let from = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                DirectorError::Validation(format!(
                    "step '{}' depends on undeclared step '{}'",
                    step.id, dep
                ))
            })?;
            graph.add_edge(nodes[*from], nodes[to], ());
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        let step_id = graph[cycle.node_id()];
        DirectorError::Validation(format!(
            "dependency cycle involving step '{step_id}'"
        ))
    })?;

    Ok(())
}

/// Indices of steps that can start now, in declaration order.
///
/// A step is ready when it is neither completed nor running and every
/// dependency id is in the completed set.
pub fn ready_steps(
    steps: &[WorkflowStep],
    completed: &HashSet<String>,
    running: &HashSet<String>,
) -> Vec<usize> {
    steps
        .iter()
        .enumerate()
        .filter(|(_, step)| {
            !completed.contains(&step.id)
                && !running.contains(&step.id)
                && step.dependencies.iter().all(|dep| completed.contains(dep))
        })
        .map(|(i, _)| i)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
