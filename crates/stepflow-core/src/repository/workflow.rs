//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow definitions, executions,
//! and the append-only step result ledger. The infrastructure layer
//! (stepflow-infra) implements this trait with SQLite persistence.

use stepflow_types::error::RepositoryError;
use stepflow_types::workflow::{
    Execution, ExecutionFilter, ExecutionStatus, StepResult, Variables, WorkflowDefinition,
    WorkflowFilter,
};
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// Covers three entity families:
/// - **Definitions:** CRUD for workflow definitions.
/// - **Executions:** Create/update/query workflow runs.
/// - **Step results:** Append/query ledger rows. Rows are never updated.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a workflow definition (insert or replace by ID).
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow definition by its UUID.
    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// List workflow definitions matching the filter, ordered by name.
    fn list_definitions(
        &self,
        filter: &WorkflowFilter,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// Delete a workflow definition (and its executions). Returns `true` if it existed.
    fn delete_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Create a new execution record.
    fn create_execution(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Move an execution to a new status, recording result/error.
    ///
    /// Terminal statuses also stamp `completed_at`. Fails with
    /// `RepositoryError::Conflict` when the execution is already terminal and
    /// `RepositoryError::NotFound` when it does not exist.
    fn update_execution_status(
        &self,
        id: &Uuid,
        status: ExecutionStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace the persisted context snapshot of a running execution.
    /// Fails with `Conflict` once the execution is terminal.
    fn update_execution_context(
        &self,
        id: &Uuid,
        context: &Variables,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an execution by its UUID.
    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// List executions matching the filter, newest first.
    fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step results
    // -----------------------------------------------------------------------

    /// Append one ledger row.
    fn append_step_result(
        &self,
        result: &StepResult,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All ledger rows for an execution in creation order.
    fn list_step_results(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepResult>, RepositoryError>> + Send;
}
