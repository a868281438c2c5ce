//! Workflow executor: ready-set DAG execution over the step ledger.
//!
//! The `DagExecutor` repeatedly reads the latest ledger status of every step,
//! computes which steps are ready, and dispatches them. Parallel-eligible
//! ready steps run concurrently via `tokio::task::JoinSet`; the batch is
//! awaited in full before sequential ready steps run one at a time. Readiness
//! is only recomputed after every dispatched step has a terminal ledger entry,
//! so a dependent never starts before its dependencies are recorded.
//!
//! # Execution flow
//!
//! 1. Check the definition is Active and admit the run through the governor.
//! 2. Create the `Execution` row (Running, merged context).
//! 3. Loop: cancellation check -> ledger statuses -> ready set -> dispatch.
//! 4. Merge each completed step's output into the context and persist it.
//! 5. Persist the final status, release the admission, publish run events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Value, json};
use stepflow_types::config::EngineConfig;
use stepflow_types::error::RepositoryError;
use stepflow_types::event::WorkflowEvent;
use stepflow_types::workflow::{
    Execution, ExecutionStatus, StepResult, StepResultStatus, Variables, WorkflowDefinition,
    WorkflowStatus,
};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::workflow::WorkflowRepository;

use super::context::{ContextError, ExecutionContext};
use super::dag;
use super::governor::{Admission, RunGovernor};
use super::ledger::{LedgerError, StepLedger};
use super::registry::StepRegistry;
use super::step_runner::StepRunner;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default workflow-level timeout (30 minutes).
pub const DEFAULT_WORKFLOW_TIMEOUT_SECS: u64 = 1800;

/// Run error when at least one step ended Failed.
pub const STEPS_FAILED_ERROR: &str = "one or more steps failed";

/// Run error when the overall run timeout elapses.
pub const WORKFLOW_TIMEOUT_ERROR: &str = "workflow timed out";

/// Run error recorded by `cancel`.
pub const CANCELLED_ERROR: &str = "cancelled by user";

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

/// Errors surfaced by the executor. Step failures are not among them; they
/// live in the ledger and in the run's Failed status.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("workflow {workflow_id} is {status}, only active workflows can be executed")]
    InactiveWorkflow {
        workflow_id: Uuid,
        status: WorkflowStatus,
    },

    #[error("concurrency limit exceeded: {limit} runs already in flight")]
    ConcurrencyLimitExceeded { limit: usize },

    #[error("run {run_id} made no progress: no step is ready and none has failed")]
    NoProgress { run_id: Uuid },

    #[error("run {0} is not in flight")]
    NotInFlight(Uuid),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("context error: {0}")]
    Context(#[from] ContextError),

    #[error("step task failed to join: {0}")]
    Join(String),
}

// ---------------------------------------------------------------------------
// RunOutcome
// ---------------------------------------------------------------------------

/// How the ready-set loop ended.
#[derive(Debug, Clone, PartialEq)]
enum RunOutcome {
    Completed {
        completed_steps: Vec<String>,
        skipped_steps: Vec<String>,
    },
    Failed(String),
    Cancelled,
}

/// A run that has been admitted and persisted but not yet driven.
struct PreparedRun {
    execution: Execution,
    token: CancellationToken,
    started: Instant,
    _admission: Admission,
}

// ---------------------------------------------------------------------------
// DagExecutor
// ---------------------------------------------------------------------------

/// Ready-set DAG executor backed by the step ledger.
///
/// Generic over `R: WorkflowRepository` for storage flexibility. Owns its own
/// governor, so independent executors never share admission state.
pub struct DagExecutor<R: WorkflowRepository> {
    repo: Arc<R>,
    ledger: Arc<StepLedger<R>>,
    runner: Arc<StepRunner<R>>,
    governor: Arc<RunGovernor>,
    event_bus: EventBus,
    /// Cancellation tokens keyed by run_id.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
    default_workflow_timeout: Duration,
}

impl<R: WorkflowRepository + 'static> DagExecutor<R> {
    pub fn new(
        repo: Arc<R>,
        registry: Arc<StepRegistry>,
        event_bus: EventBus,
        config: &EngineConfig,
    ) -> Self {
        let ledger = Arc::new(StepLedger::new(Arc::clone(&repo)));
        let runner = Arc::new(StepRunner::new(
            Arc::clone(&ledger),
            registry,
            event_bus.clone(),
            Duration::from_secs(config.default_step_timeout_secs),
        ));
        Self {
            repo,
            ledger,
            runner,
            governor: Arc::new(RunGovernor::new(config.max_concurrent_runs)),
            event_bus,
            cancellation_tokens: DashMap::new(),
            default_workflow_timeout: Duration::from_secs(config.default_workflow_timeout_secs),
        }
    }

    /// Execute a workflow run to completion.
    ///
    /// Returns the run in its terminal state. A run whose steps failed is an
    /// `Ok` with status Failed; `Err` is reserved for admission refusals,
    /// `NoProgress`, and storage failures.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        context: Variables,
        initiator: &str,
    ) -> Result<Execution, ExecutorError> {
        let prepared = self.prepare(definition, context, initiator).await?;
        self.drive(definition, prepared).await
    }

    /// Admit and create a run, then drive it on a spawned task.
    ///
    /// Admission refusals are reported here, before anything is spawned. The
    /// returned execution is the freshly created Running row.
    pub async fn start(
        self: &Arc<Self>,
        definition: WorkflowDefinition,
        context: Variables,
        initiator: &str,
    ) -> Result<(Execution, JoinHandle<Result<Execution, ExecutorError>>), ExecutorError> {
        let prepared = self.prepare(&definition, context, initiator).await?;
        let execution = prepared.execution.clone();
        let executor = Arc::clone(self);
        let handle = tokio::spawn(async move { executor.drive(&definition, prepared).await });
        Ok((execution, handle))
    }

    /// Cancel an in-flight run.
    ///
    /// The run is marked Cancelled immediately. No new steps are dispatched
    /// after the executor's next readiness check; attempts already running
    /// finish and are recorded, and pending retries are abandoned.
    pub async fn cancel(&self, run_id: Uuid) -> Result<(), ExecutorError> {
        let token = self
            .cancellation_tokens
            .get(&run_id)
            .map(|entry| entry.value().clone())
            .ok_or(ExecutorError::NotInFlight(run_id))?;

        match self
            .repo
            .update_execution_status(
                &run_id,
                ExecutionStatus::Cancelled,
                None,
                Some(CANCELLED_ERROR),
            )
            .await
        {
            Ok(()) => {}
            // Finished between the token lookup and the update
            Err(RepositoryError::Conflict(_)) => return Err(ExecutorError::NotInFlight(run_id)),
            Err(e) => return Err(e.into()),
        }

        token.cancel();
        self.event_bus
            .publish(WorkflowEvent::RunCancelled { run_id });
        tracing::info!(run_id = %run_id, "workflow run cancelled");
        Ok(())
    }

    /// IDs of runs currently admitted by the governor.
    pub fn in_flight(&self) -> Vec<Uuid> {
        self.governor.in_flight()
    }

    pub fn max_concurrent_runs(&self) -> usize {
        self.governor.limit()
    }

    // -----------------------------------------------------------------------
    // Run lifecycle
    // -----------------------------------------------------------------------

    async fn prepare(
        &self,
        definition: &WorkflowDefinition,
        context: Variables,
        initiator: &str,
    ) -> Result<PreparedRun, ExecutorError> {
        if definition.status != WorkflowStatus::Active {
            return Err(ExecutorError::InactiveWorkflow {
                workflow_id: definition.id,
                status: definition.status,
            });
        }

        let run_id = Uuid::now_v7();
        let admission =
            self.governor
                .admit(run_id)
                .ok_or(ExecutorError::ConcurrencyLimitExceeded {
                    limit: self.governor.limit(),
                })?;

        let context = ExecutionContext::new(&definition.variables, context);
        let execution = Execution {
            id: run_id,
            workflow_id: definition.id,
            workflow_version: definition.version,
            status: ExecutionStatus::Running,
            context: context.into_variables(),
            result: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            initiated_by: initiator.to_string(),
        };

        // The admission guard releases the slot if this fails
        self.repo.create_execution(&execution).await?;

        let token = CancellationToken::new();
        self.cancellation_tokens.insert(run_id, token.clone());

        self.event_bus.publish(WorkflowEvent::RunStarted {
            run_id,
            workflow_id: definition.id,
            workflow_name: definition.name.clone(),
        });

        tracing::info!(
            run_id = %run_id,
            workflow_id = %definition.id,
            workflow = definition.name.as_str(),
            initiated_by = initiator,
            "starting workflow execution"
        );

        Ok(PreparedRun {
            execution,
            token,
            started: Instant::now(),
            _admission: admission,
        })
    }

    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        prepared: PreparedRun,
    ) -> Result<Execution, ExecutorError> {
        let run_id = prepared.execution.id;
        let mut context = ExecutionContext::from_variables(prepared.execution.context.clone());
        let workflow_timeout = definition
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_workflow_timeout);

        let looped = tokio::time::timeout(
            workflow_timeout,
            self.run_loop(definition, run_id, &mut context, &prepared.token),
        )
        .await;

        let result = match looped {
            Ok(Ok(outcome)) => self.finalize(run_id, outcome, prepared.started).await,
            Err(_elapsed) => {
                tracing::warn!(
                    run_id = %run_id,
                    timeout_secs = workflow_timeout.as_secs(),
                    "workflow run timed out"
                );
                self.finalize(
                    run_id,
                    RunOutcome::Failed(WORKFLOW_TIMEOUT_ERROR.to_string()),
                    prepared.started,
                )
                .await
            }
            Ok(Err(e)) => {
                tracing::error!(run_id = %run_id, error = %e, "workflow run aborted");
                // Best effort: the original error is the one worth reporting
                let _ = self
                    .finalize(run_id, RunOutcome::Failed(e.to_string()), prepared.started)
                    .await;
                Err(e)
            }
        };

        self.cancellation_tokens.remove(&run_id);
        result
    }

    async fn run_loop(
        &self,
        definition: &WorkflowDefinition,
        run_id: Uuid,
        context: &mut ExecutionContext,
        token: &CancellationToken,
    ) -> Result<RunOutcome, ExecutorError> {
        let policy = definition.retry.as_ref();

        loop {
            if token.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }

            let statuses = self.ledger.current_statuses(run_id).await?;
            if dag::all_terminal(&definition.steps, &statuses) {
                return Ok(summarize(definition, &statuses));
            }

            let ready = dag::ready_set(&definition.steps, &statuses);
            if ready.is_empty() {
                if statuses.values().any(|s| *s == StepResultStatus::Failed) {
                    return Ok(RunOutcome::Failed(STEPS_FAILED_ERROR.to_string()));
                }
                return Err(ExecutorError::NoProgress { run_id });
            }

            let (parallel, sequential): (Vec<_>, Vec<_>) =
                ready.into_iter().partition(|step| step.parallel);

            tracing::debug!(
                run_id = %run_id,
                parallel = parallel.len(),
                sequential = sequential.len(),
                "dispatching ready steps"
            );

            if !parallel.is_empty() {
                let mut join_set = JoinSet::new();
                for step in parallel {
                    let runner = Arc::clone(&self.runner);
                    let step = step.clone();
                    let policy = policy.cloned();
                    let step_ctx = context.clone();
                    let token = token.clone();
                    join_set.spawn(async move {
                        runner
                            .run(&step, run_id, policy.as_ref(), &step_ctx, &token)
                            .await
                    });
                }

                while let Some(joined) = join_set.join_next().await {
                    let row = joined.map_err(|e| ExecutorError::Join(e.to_string()))??;
                    self.absorb(run_id, &row, context, token).await?;
                }
            }

            for step in sequential {
                if token.is_cancelled() {
                    return Ok(RunOutcome::Cancelled);
                }
                let row = self
                    .runner
                    .run(step, run_id, policy, context, token)
                    .await?;
                self.absorb(run_id, &row, context, token).await?;
            }
        }
    }

    /// Fold a step's terminal row into the run context.
    ///
    /// Rows that land after the run was cancelled stay in the ledger but no
    /// longer touch the context.
    async fn absorb(
        &self,
        run_id: Uuid,
        row: &StepResult,
        context: &mut ExecutionContext,
        token: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        if row.status != StepResultStatus::Completed {
            return Ok(());
        }
        if token.is_cancelled() {
            tracing::debug!(run_id = %run_id, step_id = row.step_id.as_str(), "run cancelled, output not merged");
            return Ok(());
        }
        let mut merged = context.clone();
        let output = row.output.clone().unwrap_or(Value::Null);
        merged.merge_step_result(&row.step_id, output)?;
        match self
            .repo
            .update_execution_context(&run_id, merged.values())
            .await
        {
            Ok(()) => {
                *context = merged;
                Ok(())
            }
            // Cancelled between the token check and the write
            Err(RepositoryError::Conflict(_)) => {
                tracing::debug!(run_id = %run_id, step_id = row.step_id.as_str(), "execution terminal, output not merged");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the terminal status and return the stored execution.
    async fn finalize(
        &self,
        run_id: Uuid,
        outcome: RunOutcome,
        started: Instant,
    ) -> Result<Execution, ExecutorError> {
        let (status, result, error) = match &outcome {
            RunOutcome::Completed {
                completed_steps,
                skipped_steps,
            } => (
                ExecutionStatus::Completed,
                Some(json!({
                    "completed_steps": completed_steps,
                    "skipped_steps": skipped_steps,
                })),
                None,
            ),
            RunOutcome::Failed(message) => (ExecutionStatus::Failed, None, Some(message.as_str())),
            RunOutcome::Cancelled => (ExecutionStatus::Cancelled, None, Some(CANCELLED_ERROR)),
        };

        match self
            .repo
            .update_execution_status(&run_id, status, result.as_ref(), error)
            .await
        {
            Ok(()) => self.publish_outcome(run_id, &outcome, started),
            Err(RepositoryError::Conflict(_)) => {
                // Cancelled concurrently; the cancel already published its event
                tracing::debug!(run_id = %run_id, "execution already terminal");
            }
            Err(e) => return Err(e.into()),
        }

        self.repo
            .get_execution(&run_id)
            .await?
            .ok_or(ExecutorError::Repository(RepositoryError::NotFound))
    }

    fn publish_outcome(&self, run_id: Uuid, outcome: &RunOutcome, started: Instant) {
        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            RunOutcome::Completed {
                completed_steps, ..
            } => {
                tracing::info!(
                    run_id = %run_id,
                    duration_ms,
                    steps_completed = completed_steps.len(),
                    "workflow run completed"
                );
                self.event_bus.publish(WorkflowEvent::RunCompleted {
                    run_id,
                    duration_ms,
                    steps_completed: completed_steps.len() as u32,
                });
            }
            RunOutcome::Failed(error) => {
                tracing::warn!(run_id = %run_id, duration_ms, error = error.as_str(), "workflow run failed");
                self.event_bus.publish(WorkflowEvent::RunFailed {
                    run_id,
                    error: error.clone(),
                });
            }
            RunOutcome::Cancelled => {
                self.event_bus
                    .publish(WorkflowEvent::RunCancelled { run_id });
            }
        }
    }
}

/// Outcome of a run whose steps are all terminal.
fn summarize(
    definition: &WorkflowDefinition,
    statuses: &HashMap<String, StepResultStatus>,
) -> RunOutcome {
    let with_status = |wanted: StepResultStatus| -> Vec<String> {
        definition
            .steps
            .iter()
            .filter(|step| statuses.get(&step.id) == Some(&wanted))
            .map(|step| step.id.clone())
            .collect()
    };

    if !with_status(StepResultStatus::Failed).is_empty() {
        return RunOutcome::Failed(STEPS_FAILED_ERROR.to_string());
    }
    RunOutcome::Completed {
        completed_steps: with_status(StepResultStatus::Completed),
        skipped_steps: with_status(StepResultStatus::Skipped),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
