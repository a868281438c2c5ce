//! Workflow authoring documents: parsing, validation, and file loading.
//!
//! Converts YAML/JSON into `NewWorkflow` / `WorkflowUpdate` documents and
//! validates the structural constraints a definition must satisfy before it
//! is persisted (non-empty name, well-formed step IDs, acyclic graph).

use std::path::Path;

use serde::de::DeserializeOwned;
use stepflow_types::error::RepositoryError;
use stepflow_types::workflow::{NewWorkflow, StepDefinition, WorkflowStatus, WorkflowUpdate};
use thiserror::Error;
use uuid::Uuid;

use super::dag::{GraphError, validate_graph};
use super::executor::ExecutorError;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during workflow operations.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The step graph is structurally invalid.
    #[error("validation error: {0}")]
    Validation(#[from] GraphError),

    /// Non-graph structural problem (empty name, malformed step ID, ...).
    #[error("invalid workflow: {0}")]
    Invalid(String),

    #[error("workflow not found: {0}")]
    NotFound(Uuid),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Lifecycle transition not permitted from the current status.
    #[error("cannot move workflow from {from} to {to}")]
    InvalidTransition {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML authoring document into a validated `NewWorkflow`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<NewWorkflow, WorkflowError> {
    let wf: NewWorkflow =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    validate_new_workflow(&wf)?;
    Ok(wf)
}

/// Parse a JSON authoring document into a validated `NewWorkflow`.
pub fn parse_workflow_json(json: &str) -> Result<NewWorkflow, WorkflowError> {
    let wf: NewWorkflow =
        serde_json::from_str(json).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    validate_new_workflow(&wf)?;
    Ok(wf)
}

/// Load a `NewWorkflow` from a `.yaml`, `.yml`, or `.json` file.
pub fn load_workflow_file(path: &Path) -> Result<NewWorkflow, WorkflowError> {
    let wf: NewWorkflow = load_document(path)?;
    validate_new_workflow(&wf)?;
    Ok(wf)
}

/// Load a partial `WorkflowUpdate` from a `.yaml`, `.yml`, or `.json` file.
///
/// Graph validation happens when the update is applied, since only then is
/// the full step list known.
pub fn load_update_file(path: &Path) -> Result<WorkflowUpdate, WorkflowError> {
    load_document(path)
}

fn load_document<T: DeserializeOwned>(path: &Path) -> Result<T, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("yaml") | Some("yml") => {
            serde_yaml_ng::from_str(&content).map_err(|e| WorkflowError::Parse(e.to_string()))
        }
        Some("json") => {
            serde_json::from_str(&content).map_err(|e| WorkflowError::Parse(e.to_string()))
        }
        _ => Err(WorkflowError::Parse(format!(
            "unsupported workflow file '{}' (expected .yaml, .yml, or .json)",
            path.display()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a creation document: name and steps, then the graph.
pub fn validate_new_workflow(wf: &NewWorkflow) -> Result<(), WorkflowError> {
    validate_name(&wf.name)?;
    validate_steps(&wf.steps)
}

/// Validate a workflow name: non-empty after trimming.
pub fn validate_name(name: &str) -> Result<(), WorkflowError> {
    if name.trim().is_empty() {
        return Err(WorkflowError::Invalid(
            "workflow name must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Validate step IDs and retry policies, then the dependency graph.
pub fn validate_steps(steps: &[StepDefinition]) -> Result<(), WorkflowError> {
    for step in steps {
        if step.id.trim().is_empty() {
            return Err(WorkflowError::Invalid("step id must not be empty".to_string()));
        }
        if step.step_type.trim().is_empty() {
            return Err(WorkflowError::Invalid(format!(
                "step '{}' has an empty type",
                step.id
            )));
        }
        if let Some(retry) = &step.retry {
            if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
                return Err(WorkflowError::Invalid(format!(
                    "step '{}' backoff_multiplier must be >= 1.0",
                    step.id
                )));
            }
        }
        if step.timeout_secs == Some(0) {
            return Err(WorkflowError::Invalid(format!(
                "step '{}' timeout_secs must be greater than 0",
                step.id
            )));
        }
    }

    validate_graph(steps)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
