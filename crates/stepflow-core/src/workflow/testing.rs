//! Shared fixtures for workflow engine tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use serde_json::{Value, json};
use stepflow_types::workflow::{
    Execution, ExecutionStatus, StepDefinition, TriggerKind, Variables, WorkflowDefinition,
    WorkflowStatus,
};
use uuid::Uuid;

use super::handlers::WaitHandler;
use super::registry::{StepError, StepFuture, StepHandler, StepInput, StepRegistry, handler_fn};

/// An `echo` step with the given dependencies.
pub(crate) fn step(id: &str, deps: &[&str]) -> StepDefinition {
    typed_step(id, "echo", deps)
}

pub(crate) fn typed_step(id: &str, step_type: &str, deps: &[&str]) -> StepDefinition {
    StepDefinition {
        id: id.to_string(),
        name: String::new(),
        step_type: step_type.to_string(),
        config: Value::Null,
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        condition: None,
        retry: None,
        timeout_secs: None,
        parallel: false,
        metadata: HashMap::new(),
    }
}

/// An Active definition with no variables or run-level retry.
pub(crate) fn definition(steps: Vec<StepDefinition>) -> WorkflowDefinition {
    let now = Utc::now();
    WorkflowDefinition {
        id: Uuid::now_v7(),
        name: "test-workflow".to_string(),
        description: None,
        version: 1,
        status: WorkflowStatus::Active,
        trigger: TriggerKind::Manual,
        trigger_config: Value::Null,
        steps,
        variables: Variables::new(),
        timeout_secs: None,
        retry: None,
        created_by: None,
        created_at: now,
        updated_at: now,
    }
}

pub(crate) fn running_execution(workflow_id: Uuid) -> Execution {
    Execution {
        id: Uuid::now_v7(),
        workflow_id,
        workflow_version: 1,
        status: ExecutionStatus::Running,
        context: Variables::new(),
        result: None,
        error: None,
        started_at: Utc::now(),
        completed_at: None,
        initiated_by: "test".to_string(),
    }
}

/// Unwrap a JSON object literal into `Variables`.
pub(crate) fn vars(value: Value) -> Variables {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Registry with `echo`, `fail`, and `wait` step types.
///
/// `echo` returns `{ "step": <id>, "config": <resolved config> }`; `fail`
/// always errors.
pub(crate) fn test_registry() -> StepRegistry {
    let mut registry = StepRegistry::new();
    registry.register(
        "echo",
        handler_fn(|input: StepInput| async move {
            Ok::<_, StepError>(json!({
                "step": input.step_id,
                "config": input.resolved_config(),
            }))
        }),
    );
    registry.register(
        "fail",
        handler_fn(|input: StepInput| async move {
            Err::<Value, _>(StepError::ExecutionFailed(format!(
                "{} attempt {} failed",
                input.step_id, input.attempt
            )))
        }),
    );
    registry.register("wait", WaitHandler);
    registry
}

/// Fails its first `fail_times` calls, then succeeds.
pub(crate) struct Flaky {
    fail_times: u32,
    calls: Arc<AtomicU32>,
}

impl Flaky {
    pub(crate) fn new(fail_times: u32) -> Self {
        Self {
            fail_times,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Shared call counter, readable after the handler moves into a registry.
    pub(crate) fn calls(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.calls)
    }
}

impl StepHandler for Flaky {
    fn execute(&self, input: StepInput) -> StepFuture<'_> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_times {
                Err(StepError::ExecutionFailed(format!("transient failure {call}")))
            } else {
                Ok(json!({ "step": input.step_id, "calls": call }))
            }
        })
    }
}
