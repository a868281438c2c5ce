//! Workflow management service.
//!
//! The boundary callers use: definition lifecycle (create, update, pause,
//! resume, cancel, delete), run dispatch through the `DagExecutor`, and
//! queries over executions, the step ledger, and aggregate statistics.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use stepflow_types::workflow::{
    Execution, ExecutionFilter, ExecutionStatus, NewWorkflow, StepResult, Variables,
    WorkflowDefinition, WorkflowFilter, WorkflowStatistics, WorkflowStatus, WorkflowUpdate,
};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

use super::definition::{WorkflowError, validate_name, validate_new_workflow, validate_steps};
use super::executor::{DagExecutor, ExecutorError};

/// Service orchestrating workflow definitions and their runs.
///
/// Generic over the repository so the same service runs over SQLite in the
/// CLI and over the in-memory repository in tests.
pub struct WorkflowService<R: WorkflowRepository> {
    repo: Arc<R>,
    executor: Arc<DagExecutor<R>>,
}

impl<R: WorkflowRepository + 'static> WorkflowService<R> {
    pub fn new(repo: Arc<R>, executor: Arc<DagExecutor<R>>) -> Self {
        Self { repo, executor }
    }

    pub fn executor(&self) -> &Arc<DagExecutor<R>> {
        &self.executor
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Validate and persist a new workflow.
    ///
    /// Nothing is written when validation fails. The definition starts at
    /// version 1 and, unless the document says otherwise, Active.
    pub async fn create_workflow(
        &self,
        new: NewWorkflow,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        validate_new_workflow(&new)?;

        let now = Utc::now();
        let definition = WorkflowDefinition {
            id: Uuid::now_v7(),
            name: new.name.trim().to_string(),
            description: new.description,
            version: 1,
            status: new.status.unwrap_or(WorkflowStatus::Active),
            trigger: new.trigger,
            trigger_config: new.trigger_config,
            steps: new.steps,
            variables: new.variables,
            timeout_secs: new.timeout_secs,
            retry: new.retry,
            created_by: new.created_by,
            created_at: now,
            updated_at: now,
        };

        self.repo.save_definition(&definition).await?;
        tracing::info!(
            workflow_id = %definition.id,
            name = definition.name.as_str(),
            steps = definition.steps.len(),
            "workflow created"
        );
        Ok(definition)
    }

    /// Apply a partial update and bump the version.
    ///
    /// A new step list is validated before anything is written. Runs already
    /// in flight keep the definition they started with.
    pub async fn update_workflow(
        &self,
        id: &Uuid,
        update: WorkflowUpdate,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        let mut definition = self.get_workflow(id).await?;

        if let Some(name) = update.name {
            validate_name(&name)?;
            definition.name = name.trim().to_string();
        }
        if let Some(steps) = update.steps {
            validate_steps(&steps)?;
            definition.steps = steps;
        }
        if let Some(description) = update.description {
            definition.description = description;
        }
        if let Some(trigger) = update.trigger {
            definition.trigger = trigger;
        }
        if let Some(trigger_config) = update.trigger_config {
            definition.trigger_config = trigger_config;
        }
        if let Some(variables) = update.variables {
            definition.variables = variables;
        }
        if let Some(timeout_secs) = update.timeout_secs {
            definition.timeout_secs = timeout_secs;
        }
        if let Some(retry) = update.retry {
            definition.retry = retry;
        }

        definition.version += 1;
        definition.updated_at = Utc::now();
        self.repo.save_definition(&definition).await?;

        tracing::info!(
            workflow_id = %definition.id,
            version = definition.version,
            "workflow updated"
        );
        Ok(definition)
    }

    pub async fn get_workflow(&self, id: &Uuid) -> Result<WorkflowDefinition, WorkflowError> {
        self.repo
            .get_definition(id)
            .await?
            .ok_or(WorkflowError::NotFound(*id))
    }

    pub async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowDefinition>, WorkflowError> {
        Ok(self.repo.list_definitions(filter).await?)
    }

    /// Delete a workflow with its executions and ledger rows.
    ///
    /// Refused while one of its runs is in flight in this engine.
    pub async fn delete_workflow(&self, id: &Uuid) -> Result<(), WorkflowError> {
        let in_flight = self.executor.in_flight();
        if !in_flight.is_empty() {
            let runs = self
                .repo
                .list_executions(&ExecutionFilter {
                    workflow_id: Some(*id),
                    status: Some(ExecutionStatus::Running),
                })
                .await?;
            if runs.iter().any(|run| in_flight.contains(&run.id)) {
                return Err(WorkflowError::Invalid(format!(
                    "workflow {id} has runs in flight"
                )));
            }
        }

        if !self.repo.delete_definition(id).await? {
            return Err(WorkflowError::NotFound(*id));
        }
        tracing::info!(workflow_id = %id, "workflow deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lifecycle transitions
    // -----------------------------------------------------------------------

    /// Active -> Paused. Paused workflows refuse new runs.
    pub async fn pause_workflow(&self, id: &Uuid) -> Result<WorkflowDefinition, WorkflowError> {
        self.transition(id, &[WorkflowStatus::Active], WorkflowStatus::Paused)
            .await
    }

    /// Paused (or Draft) -> Active.
    pub async fn resume_workflow(&self, id: &Uuid) -> Result<WorkflowDefinition, WorkflowError> {
        self.transition(
            id,
            &[WorkflowStatus::Paused, WorkflowStatus::Draft],
            WorkflowStatus::Active,
        )
        .await
    }

    /// Any non-cancelled status -> Cancelled. Runs already in flight continue;
    /// use `cancel_execution` to stop one.
    pub async fn cancel_workflow(&self, id: &Uuid) -> Result<WorkflowDefinition, WorkflowError> {
        self.transition(
            id,
            &[
                WorkflowStatus::Draft,
                WorkflowStatus::Active,
                WorkflowStatus::Paused,
            ],
            WorkflowStatus::Cancelled,
        )
        .await
    }

    async fn transition(
        &self,
        id: &Uuid,
        allowed_from: &[WorkflowStatus],
        to: WorkflowStatus,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        let mut definition = self.get_workflow(id).await?;
        if !allowed_from.contains(&definition.status) {
            return Err(WorkflowError::InvalidTransition {
                from: definition.status,
                to,
            });
        }

        let from = definition.status;
        definition.status = to;
        definition.updated_at = Utc::now();
        self.repo.save_definition(&definition).await?;

        tracing::info!(workflow_id = %id, %from, %to, "workflow status changed");
        Ok(definition)
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Run a workflow and wait for it to finish.
    pub async fn execute_workflow(
        &self,
        id: &Uuid,
        context: Variables,
        initiator: &str,
    ) -> Result<Execution, WorkflowError> {
        let definition = self.get_workflow(id).await?;
        Ok(self.executor.execute(&definition, context, initiator).await?)
    }

    /// Start a workflow run in the background.
    ///
    /// Returns the Running execution and the handle of the task driving it.
    pub async fn start_workflow(
        &self,
        id: &Uuid,
        context: Variables,
        initiator: &str,
    ) -> Result<(Execution, JoinHandle<Result<Execution, ExecutorError>>), WorkflowError> {
        let definition = self.get_workflow(id).await?;
        Ok(self.executor.start(definition, context, initiator).await?)
    }

    /// Cancel an in-flight run and return its updated record.
    pub async fn cancel_execution(&self, run_id: &Uuid) -> Result<Execution, WorkflowError> {
        self.get_execution(run_id).await?;
        self.executor.cancel(*run_id).await?;
        self.get_execution(run_id).await
    }

    pub async fn get_execution(&self, run_id: &Uuid) -> Result<Execution, WorkflowError> {
        self.repo
            .get_execution(run_id)
            .await?
            .ok_or(WorkflowError::ExecutionNotFound(*run_id))
    }

    pub async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<Execution>, WorkflowError> {
        Ok(self.repo.list_executions(filter).await?)
    }

    /// Full ledger of a run, in the order rows were written.
    pub async fn step_results(&self, run_id: &Uuid) -> Result<Vec<StepResult>, WorkflowError> {
        self.get_execution(run_id).await?;
        Ok(self.repo.list_step_results(run_id).await?)
    }

    /// Counts by status and trigger, plus the success rate of finished runs.
    pub async fn get_statistics(&self) -> Result<WorkflowStatistics, WorkflowError> {
        let definitions = self.repo.list_definitions(&WorkflowFilter::default()).await?;
        let executions = self.repo.list_executions(&ExecutionFilter::default()).await?;

        let mut workflows_by_status = BTreeMap::new();
        let mut workflows_by_trigger = BTreeMap::new();
        for def in &definitions {
            *workflows_by_status.entry(def.status.to_string()).or_insert(0) += 1;
            *workflows_by_trigger.entry(def.trigger.to_string()).or_insert(0) += 1;
        }

        let mut executions_by_status = BTreeMap::new();
        for exec in &executions {
            *executions_by_status.entry(exec.status.to_string()).or_insert(0) += 1;
        }

        let count = |status: ExecutionStatus| {
            executions.iter().filter(|e| e.status == status).count()
        };
        let completed = count(ExecutionStatus::Completed);
        let finished =
            completed + count(ExecutionStatus::Failed) + count(ExecutionStatus::Cancelled);
        let success_rate = if finished == 0 {
            0.0
        } else {
            completed as f64 / finished as f64
        };

        Ok(WorkflowStatistics {
            total_workflows: definitions.len(),
            workflows_by_status,
            workflows_by_trigger,
            total_executions: executions.len(),
            executions_by_status,
            success_rate,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
