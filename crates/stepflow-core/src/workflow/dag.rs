//! Graph validation, ready-set computation, and dependency closure.
//!
//! Uses `petgraph` to model step dependencies as a directed graph. Topological
//! sort (depth-first) detects cycles. Readiness is recomputed from ledger
//! statuses on every pass of the executor rather than precomputed as waves,
//! so a skipped or retried step never stalls an unrelated branch.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use stepflow_types::workflow::{StepDefinition, StepResultStatus};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Structural problems in a step graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("workflow must have at least one step")]
    Empty,

    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("circular dependency involving step '{0}'")]
    CircularDependency(String),
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate that steps form a DAG: non-empty, unique IDs, every dependency
/// resolves, and no cycles.
pub fn validate_graph(steps: &[StepDefinition]) -> Result<(), GraphError> {
    if steps.is_empty() {
        return Err(GraphError::Empty);
    }

    let mut id_to_idx: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        if id_to_idx.insert(step.id.as_str(), i).is_some() {
            return Err(GraphError::DuplicateStep(step.id.clone()));
        }
    }

    // Edge from dependency -> dependent
    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();

    for (to_idx, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            let from_idx = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                GraphError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                }
            })?;
            graph.add_edge(node_indices[*from_idx], node_indices[to_idx], ());
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        GraphError::CircularDependency(graph[cycle.node_id()].to_string())
    })?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Ready set
// ---------------------------------------------------------------------------

/// Steps that can be dispatched now, in definition order.
///
/// A step is ready when it has no terminal status yet and every dependency is
/// Completed or Skipped. `statuses` maps step ID to the status of its latest
/// ledger row. Pure: the same inputs always give the same answer.
pub fn ready_set<'a>(
    steps: &'a [StepDefinition],
    statuses: &HashMap<String, StepResultStatus>,
) -> Vec<&'a StepDefinition> {
    steps
        .iter()
        .filter(|step| {
            statuses
                .get(&step.id)
                .is_none_or(|status| !status.is_terminal())
        })
        .filter(|step| {
            step.depends_on.iter().all(|dep| {
                statuses
                    .get(dep)
                    .is_some_and(|status| status.satisfies_dependency())
            })
        })
        .collect()
}

/// True once every step has a terminal latest status.
pub fn all_terminal(
    steps: &[StepDefinition],
    statuses: &HashMap<String, StepResultStatus>,
) -> bool {
    steps.iter().all(|step| {
        statuses
            .get(&step.id)
            .is_some_and(|status| status.is_terminal())
    })
}

// ---------------------------------------------------------------------------
// Transitive dependency closure
// ---------------------------------------------------------------------------

/// Returns the transitive closure of all dependencies for a given step, sorted.
///
/// If `step_id` is not found, returns an empty vec.
pub fn transitive_dependencies<'a>(step_id: &str, steps: &'a [StepDefinition]) -> Vec<&'a str> {
    let step_map: HashMap<&str, &StepDefinition> =
        steps.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut visited: HashSet<&'a str> = HashSet::new();
    let mut stack: Vec<&'a str> = step_map
        .get(step_id)
        .copied()
        .map(|s| s.depends_on.iter().map(String::as_str).collect())
        .unwrap_or_default();

    while let Some(current) = stack.pop() {
        if !visited.insert(current) {
            continue;
        }
        if let Some(step) = step_map.get(current).copied() {
            stack.extend(step.depends_on.iter().map(String::as_str));
        }
    }

    let mut deps: Vec<&str> = visited.into_iter().collect();
    deps.sort_unstable();
    deps
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::testing::step;

    fn statuses(entries: &[(&str, StepResultStatus)]) -> HashMap<String, StepResultStatus> {
        entries
            .iter()
            .map(|(id, s)| (id.to_string(), *s))
            .collect()
    }

    fn ids<'a>(steps: &[&'a StepDefinition]) -> Vec<&'a str> {
        steps.iter().map(|s| s.id.as_str()).collect()
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    #[test]
    fn test_validate_graph_valid_diamond() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ];
        assert!(validate_graph(&steps).is_ok());
    }

    #[test]
    fn test_validate_graph_empty() {
        assert_eq!(validate_graph(&[]), Err(GraphError::Empty));
    }

    #[test]
    fn test_validate_graph_duplicate_step() {
        let steps = vec![step("a", &[]), step("a", &[])];
        assert_eq!(
            validate_graph(&steps),
            Err(GraphError::DuplicateStep("a".to_string()))
        );
    }

    #[test]
    fn test_validate_graph_unknown_dependency() {
        let steps = vec![step("a", &["missing"])];
        let err = validate_graph(&steps).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownDependency {
                step: "a".to_string(),
                dependency: "missing".to_string(),
            }
        );
        assert!(err.to_string().contains("unknown step 'missing'"));
    }

    #[test]
    fn test_validate_graph_cycle() {
        let steps = vec![step("a", &["c"]), step("b", &["a"]), step("c", &["b"])];
        let err = validate_graph(&steps).unwrap_err();
        match err {
            GraphError::CircularDependency(id) => {
                assert!(["a", "b", "c"].contains(&id.as_str()), "got: {id}");
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_graph_self_dependency_is_cycle() {
        let steps = vec![step("a", &["a"])];
        assert_eq!(
            validate_graph(&steps),
            Err(GraphError::CircularDependency("a".to_string()))
        );
    }

    // -----------------------------------------------------------------------
    // Ready set
    // -----------------------------------------------------------------------

    #[test]
    fn test_ready_set_roots_first() {
        let steps = vec![step("a", &[]), step("b", &[]), step("c", &["a", "b"])];
        let ready = ready_set(&steps, &HashMap::new());
        assert_eq!(ids(&ready), vec!["a", "b"]);
    }

    #[test]
    fn test_ready_set_waits_for_all_dependencies() {
        let steps = vec![step("a", &[]), step("b", &[]), step("c", &["a", "b"])];
        let s = statuses(&[("a", StepResultStatus::Completed)]);
        assert_eq!(ids(&ready_set(&steps, &s)), vec!["b"]);

        let s = statuses(&[
            ("a", StepResultStatus::Completed),
            ("b", StepResultStatus::Skipped),
        ]);
        assert_eq!(ids(&ready_set(&steps, &s)), vec!["c"]);
    }

    #[test]
    fn test_ready_set_failed_dependency_blocks() {
        let steps = vec![step("a", &[]), step("b", &["a"])];
        let s = statuses(&[("a", StepResultStatus::Failed)]);
        assert!(ready_set(&steps, &s).is_empty());
        assert!(!all_terminal(&steps, &s));
    }

    #[test]
    fn test_ready_set_pending_step_is_ready_again() {
        let steps = vec![step("a", &[])];
        let s = statuses(&[("a", StepResultStatus::Pending)]);
        assert_eq!(ids(&ready_set(&steps, &s)), vec!["a"]);
    }

    #[test]
    fn test_ready_set_is_idempotent() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ];
        let s = statuses(&[("a", StepResultStatus::Completed)]);
        let first = ids(&ready_set(&steps, &s));
        let second = ids(&ready_set(&steps, &s));
        assert_eq!(first, second);
        assert_eq!(first, vec!["b", "c"]);
    }

    #[test]
    fn test_all_terminal() {
        let steps = vec![step("a", &[]), step("b", &["a"])];
        let s = statuses(&[
            ("a", StepResultStatus::Completed),
            ("b", StepResultStatus::Skipped),
        ]);
        assert!(all_terminal(&steps, &s));
    }

    // -----------------------------------------------------------------------
    // Transitive dependencies
    // -----------------------------------------------------------------------

    #[test]
    fn test_transitive_dependencies_chain() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["b"]),
            step("d", &["c"]),
        ];
        assert_eq!(transitive_dependencies("d", &steps), vec!["a", "b", "c"]);
        assert!(transitive_dependencies("a", &steps).is_empty());
        assert!(transitive_dependencies("nonexistent", &steps).is_empty());
    }
}
