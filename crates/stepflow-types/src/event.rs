//! Event types for the workflow engine event bus.
//!
//! `WorkflowEvent` is broadcast by the executor as runs and steps progress.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted while a workflow execution progresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A run was admitted and its execution record created.
    RunStarted {
        run_id: Uuid,
        workflow_id: Uuid,
        workflow_name: String,
    },

    /// A step attempt completed successfully.
    StepCompleted {
        run_id: Uuid,
        step_id: String,
        attempt: u32,
        duration_ms: u64,
    },

    /// A step attempt failed.
    StepFailed {
        run_id: Uuid,
        step_id: String,
        attempt: u32,
        error: String,
        will_retry: bool,
    },

    /// A step was skipped because its condition did not hold.
    StepSkipped { run_id: Uuid, step_id: String },

    /// The run completed with every step completed or skipped.
    RunCompleted {
        run_id: Uuid,
        duration_ms: u64,
        steps_completed: u32,
    },

    /// The run failed.
    RunFailed { run_id: Uuid, error: String },

    /// The run was cancelled.
    RunCancelled { run_id: Uuid },
}

impl WorkflowEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            WorkflowEvent::RunStarted { run_id, .. }
            | WorkflowEvent::StepCompleted { run_id, .. }
            | WorkflowEvent::StepFailed { run_id, .. }
            | WorkflowEvent::StepSkipped { run_id, .. }
            | WorkflowEvent::RunCompleted { run_id, .. }
            | WorkflowEvent::RunFailed { run_id, .. }
            | WorkflowEvent::RunCancelled { run_id } => *run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagged_serialization() {
        let event = WorkflowEvent::StepFailed {
            run_id: Uuid::nil(),
            step_id: "notify".to_string(),
            attempt: 2,
            error: "step timeout".to_string(),
            will_retry: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step_failed");
        assert_eq!(json["will_retry"], true);
    }

    #[test]
    fn test_run_id_accessor() {
        let id = Uuid::now_v7();
        assert_eq!(WorkflowEvent::RunCancelled { run_id: id }.run_id(), id);
        let skipped = WorkflowEvent::StepSkipped {
            run_id: id,
            step_id: "a".to_string(),
        };
        assert_eq!(skipped.run_id(), id);
    }
}
