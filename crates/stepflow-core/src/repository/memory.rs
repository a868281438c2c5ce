//! In-memory `WorkflowRepository` implementation.
//!
//! Backs the engine when no database is wanted (embedding, tests). State
//! lives behind a single `tokio::sync::RwLock`; nothing survives the process.

use std::collections::HashMap;

use chrono::Utc;
use stepflow_types::error::RepositoryError;
use stepflow_types::workflow::{
    Execution, ExecutionFilter, ExecutionStatus, StepResult, Variables, WorkflowDefinition,
    WorkflowFilter,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::workflow::WorkflowRepository;

#[derive(Default)]
struct State {
    definitions: HashMap<Uuid, WorkflowDefinition>,
    executions: HashMap<Uuid, Execution>,
    step_results: Vec<StepResult>,
}

/// Process-local workflow store.
#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    state: RwLock<State>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.definitions.insert(def.id, def.clone());
        Ok(())
    }

    async fn get_definition(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.state.read().await.definitions.get(id).cloned())
    }

    async fn list_definitions(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let state = self.state.read().await;
        let mut defs: Vec<WorkflowDefinition> = state
            .definitions
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(defs)
    }

    async fn delete_definition(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let mut state = self.state.write().await;
        let existed = state.definitions.remove(id).is_some();
        if existed {
            let removed: Vec<Uuid> = state
                .executions
                .values()
                .filter(|e| e.workflow_id == *id)
                .map(|e| e.id)
                .collect();
            for exec_id in &removed {
                state.executions.remove(exec_id);
            }
            state
                .step_results
                .retain(|r| !removed.contains(&r.execution_id));
        }
        Ok(existed)
    }

    async fn create_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        if state.executions.contains_key(&execution.id) {
            return Err(RepositoryError::Conflict(format!(
                "execution {} already exists",
                execution.id
            )));
        }
        state.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update_execution_status(
        &self,
        id: &Uuid,
        status: ExecutionStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let execution = state
            .executions
            .get_mut(id)
            .ok_or(RepositoryError::NotFound)?;

        if execution.status.is_terminal() {
            return Err(RepositoryError::Conflict(format!(
                "execution {id} is already {}",
                execution.status
            )));
        }

        execution.status = status;
        if let Some(result) = result {
            execution.result = Some(result.clone());
        }
        if let Some(error) = error {
            execution.error = Some(error.to_string());
        }
        if status.is_terminal() {
            execution.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn update_execution_context(
        &self,
        id: &Uuid,
        context: &Variables,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let execution = state
            .executions
            .get_mut(id)
            .ok_or(RepositoryError::NotFound)?;
        if execution.status.is_terminal() {
            return Err(RepositoryError::Conflict(format!(
                "execution {id} is already {}",
                execution.status
            )));
        }
        execution.context = context.clone();
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        Ok(self.state.read().await.executions.get(id).cloned())
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let state = self.state.read().await;
        let mut executions: Vec<Execution> = state
            .executions
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        // UUIDv7 ids sort by creation time
        executions.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(executions)
    }

    async fn append_step_result(&self, result: &StepResult) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        if !state.executions.contains_key(&result.execution_id) {
            return Err(RepositoryError::NotFound);
        }
        state.step_results.push(result.clone());
        Ok(())
    }

    async fn list_step_results(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<StepResult>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .step_results
            .iter()
            .filter(|r| r.execution_id == *execution_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepflow_types::workflow::{StepResultStatus, TriggerKind, WorkflowStatus};

    fn sample_definition(name: &str, status: WorkflowStatus) -> WorkflowDefinition {
        let now = Utc::now();
        WorkflowDefinition {
            id: Uuid::now_v7(),
            name: name.to_string(),
            description: None,
            version: 1,
            status,
            trigger: TriggerKind::Manual,
            trigger_config: serde_json::Value::Null,
            steps: vec![],
            variables: Variables::new(),
            timeout_secs: None,
            retry: None,
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_execution(workflow_id: Uuid) -> Execution {
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

    #[tokio::test]
    async fn test_definitions_filtered_and_sorted() {
        let repo = InMemoryWorkflowRepository::new();
        repo.save_definition(&sample_definition("zeta", WorkflowStatus::Active))
            .await
            .unwrap();
        repo.save_definition(&sample_definition("alpha", WorkflowStatus::Paused))
            .await
            .unwrap();

        let all = repo.list_definitions(&WorkflowFilter::default()).await.unwrap();
        let names: Vec<&str> = all.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);

        let paused = repo
            .list_definitions(&WorkflowFilter {
                status: Some(WorkflowStatus::Paused),
                trigger: None,
            })
            .await
            .unwrap();
        assert_eq!(paused.len(), 1);
        assert_eq!(paused[0].name, "alpha");
    }

    #[tokio::test]
    async fn test_terminal_execution_rejects_status_change() {
        let repo = InMemoryWorkflowRepository::new();
        let exec = sample_execution(Uuid::now_v7());
        repo.create_execution(&exec).await.unwrap();

        repo.update_execution_status(
            &exec.id,
            ExecutionStatus::Completed,
            Some(&json!({ "completed_steps": [] })),
            None,
        )
        .await
        .unwrap();

        let stored = repo.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert!(stored.completed_at.is_some());

        let err = repo
            .update_execution_status(&exec.id, ExecutionStatus::Failed, None, Some("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_terminal_execution_rejects_context_change() {
        let repo = InMemoryWorkflowRepository::new();
        let exec = sample_execution(Uuid::now_v7());
        repo.create_execution(&exec).await.unwrap();

        let mut context = Variables::new();
        context.insert("a_result".to_string(), json!(1));
        repo.update_execution_context(&exec.id, &context).await.unwrap();

        repo.update_execution_status(&exec.id, ExecutionStatus::Cancelled, None, Some("cancelled"))
            .await
            .unwrap();

        context.insert("b_result".to_string(), json!(2));
        let err = repo
            .update_execution_context(&exec.id, &context)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        let stored = repo.get_execution(&exec.id).await.unwrap().unwrap();
        assert!(stored.context.contains_key("a_result"));
        assert!(!stored.context.contains_key("b_result"));
    }

    #[tokio::test]
    async fn test_update_missing_execution_not_found() {
        let repo = InMemoryWorkflowRepository::new();
        let err = repo
            .update_execution_status(&Uuid::now_v7(), ExecutionStatus::Failed, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_step_results_in_append_order() {
        let repo = InMemoryWorkflowRepository::new();
        let exec = sample_execution(Uuid::now_v7());
        repo.create_execution(&exec).await.unwrap();

        for (attempt, status) in [(1, StepResultStatus::Pending), (2, StepResultStatus::Completed)]
        {
            repo.append_step_result(&StepResult {
                id: Uuid::now_v7(),
                execution_id: exec.id,
                step_id: "a".to_string(),
                attempt,
                status,
                output: None,
                error: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        }

        let rows = repo.list_step_results(&exec.id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, StepResultStatus::Pending);
        assert_eq!(rows[1].status, StepResultStatus::Completed);
    }

    #[tokio::test]
    async fn test_delete_definition_cascades_executions() {
        let repo = InMemoryWorkflowRepository::new();
        let def = sample_definition("wf", WorkflowStatus::Active);
        repo.save_definition(&def).await.unwrap();
        let exec = sample_execution(def.id);
        repo.create_execution(&exec).await.unwrap();

        assert!(repo.delete_definition(&def.id).await.unwrap());
        assert!(repo.get_execution(&exec.id).await.unwrap().is_none());
        assert!(!repo.delete_definition(&def.id).await.unwrap());
    }
}
