//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `stepflow-core` using sqlx with split
//! read/write pools. Definitions are stored as JSON blobs next to the columns
//! used for filtering. The step result table is insert-only; its `seq`
//! column preserves write order.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use sqlx::Row;
use stepflow_core::repository::workflow::WorkflowRepository;
use stepflow_types::error::RepositoryError;
use stepflow_types::workflow::{
    Execution, ExecutionFilter, ExecutionStatus, StepResult, StepResultStatus, Variables,
    WorkflowDefinition, WorkflowFilter,
};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Why a `status = 'running'` guarded update touched no row.
    async fn not_running(&self, id: &Uuid) -> RepositoryError {
        let current: Result<Option<(String,)>, _> =
            sqlx::query_as("SELECT status FROM workflow_executions WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool.writer)
                .await;

        match current {
            Ok(None) => RepositoryError::NotFound,
            Ok(Some((current,))) => {
                RepositoryError::Conflict(format!("execution {id} is already {current}"))
            }
            Err(e) => query_error(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct WorkflowDefRow {
    definition: String,
}

impl WorkflowDefRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            definition: row.try_get("definition")?,
        })
    }

    fn into_definition(self) -> Result<WorkflowDefinition, RepositoryError> {
        serde_json::from_str(&self.definition)
            .map_err(|e| RepositoryError::Query(format!("invalid workflow definition JSON: {e}")))
    }
}

struct ExecutionRow {
    id: String,
    workflow_id: String,
    workflow_version: i64,
    status: String,
    context: String,
    result: Option<String>,
    error: Option<String>,
    started_at: String,
    completed_at: Option<String>,
    initiated_by: String,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_version: row.try_get("workflow_version")?,
            status: row.try_get("status")?,
            context: row.try_get("context")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            initiated_by: row.try_get("initiated_by")?,
        })
    }

    fn into_execution(self) -> Result<Execution, RepositoryError> {
        let context: Variables = parse_json(&self.context, "context")?;
        let result = self
            .result
            .as_deref()
            .map(|s| parse_json(s, "result"))
            .transpose()?;

        Ok(Execution {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            workflow_version: self.workflow_version as u32,
            status: parse_status(&self.status, "execution status")?,
            context,
            result,
            error: self.error,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            initiated_by: self.initiated_by,
        })
    }
}

struct StepResultRow {
    id: String,
    execution_id: String,
    step_id: String,
    attempt: i64,
    status: String,
    output: Option<String>,
    error: Option<String>,
    created_at: String,
}

impl StepResultRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            step_id: row.try_get("step_id")?,
            attempt: row.try_get("attempt")?,
            status: row.try_get("status")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_step_result(self) -> Result<StepResult, RepositoryError> {
        let status: StepResultStatus = parse_status(&self.status, "step status")?;
        let output = self
            .output
            .as_deref()
            .map(|s| parse_json(s, "step output"))
            .transpose()?;

        Ok(StepResult {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            step_id: self.step_id,
            attempt: self.attempt as u32,
            status,
            output,
            error: self.error,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_json<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

/// Status enums are stored as their snake_case serde names.
fn parse_status<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what}: {s}")))
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            tracing::warn!(error = %e, "database connection unavailable");
            RepositoryError::Connection
        }
        e => RepositoryError::Query(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = to_json(def)?;

        sqlx::query(
            r#"INSERT INTO workflows (id, name, status, trigger_kind, version, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 status = excluded.status,
                 trigger_kind = excluded.trigger_kind,
                 version = excluded.version,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(def.id.to_string())
        .bind(&def.name)
        .bind(def.status.to_string())
        .bind(def.trigger.to_string())
        .bind(def.version as i64)
        .bind(&definition_json)
        .bind(format_datetime(&def.created_at))
        .bind(format_datetime(&def.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_definition(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = WorkflowDefRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_definition()?))
            }
            None => Ok(None),
        }
    }

    async fn list_definitions(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT definition FROM workflows
               WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR trigger_kind = ?2)
               ORDER BY name ASC, id ASC"#,
        )
        .bind(filter.status.map(|s| s.to_string()))
        .bind(filter.trigger.map(|t| t.to_string()))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut defs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = WorkflowDefRow::from_row(row).map_err(query_error)?;
            defs.push(r.into_definition()?);
        }
        Ok(defs)
    }

    async fn delete_definition(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn create_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let context = to_json(&execution.context)?;
        let result = execution.result.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO workflow_executions
               (id, workflow_id, workflow_version, status, context, result, error,
                started_at, completed_at, initiated_by)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.id.to_string())
        .bind(execution.workflow_id.to_string())
        .bind(execution.workflow_version as i64)
        .bind(execution.status.to_string())
        .bind(&context)
        .bind(&result)
        .bind(&execution.error)
        .bind(format_datetime(&execution.started_at))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(&execution.initiated_by)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("execution {} already exists", execution.id))
            }
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => RepositoryError::NotFound,
            _ => query_error(e),
        })?;

        Ok(())
    }

    async fn update_execution_status(
        &self,
        id: &Uuid,
        status: ExecutionStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let result = result.map(to_json).transpose()?;
        let completed_at = status
            .is_terminal()
            .then(|| format_datetime(&Utc::now()));

        // Only a running execution may change status
        let updated = sqlx::query(
            r#"UPDATE workflow_executions
               SET status = ?, result = COALESCE(?, result), error = ?, completed_at = COALESCE(?, completed_at)
               WHERE id = ? AND status = 'running'"#,
        )
        .bind(status.to_string())
        .bind(&result)
        .bind(error)
        .bind(&completed_at)
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if updated.rows_affected() > 0 {
            return Ok(());
        }
        Err(self.not_running(id).await)
    }

    async fn update_execution_context(
        &self,
        id: &Uuid,
        context: &Variables,
    ) -> Result<(), RepositoryError> {
        let context = to_json(context)?;
        let updated = sqlx::query(
            "UPDATE workflow_executions SET context = ? WHERE id = ? AND status = 'running'",
        )
        .bind(&context)
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if updated.rows_affected() > 0 {
            return Ok(());
        }
        Err(self.not_running(id).await)
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM workflow_executions
               WHERE (?1 IS NULL OR workflow_id = ?1) AND (?2 IS NULL OR status = ?2)
               ORDER BY started_at DESC, id DESC"#,
        )
        .bind(filter.workflow_id.map(|id| id.to_string()))
        .bind(filter.status.map(|s| s.to_string()))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ExecutionRow::from_row(row).map_err(query_error)?;
            executions.push(r.into_execution()?);
        }
        Ok(executions)
    }

    async fn append_step_result(&self, result: &StepResult) -> Result<(), RepositoryError> {
        let output = result.output.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO workflow_step_results
               (id, execution_id, step_id, attempt, status, output, error, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(result.id.to_string())
        .bind(result.execution_id.to_string())
        .bind(&result.step_id)
        .bind(result.attempt as i64)
        .bind(result.status.to_string())
        .bind(&output)
        .bind(&result.error)
        .bind(format_datetime(&result.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => RepositoryError::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("step result {} already exists", result.id))
            }
            _ => query_error(e),
        })?;

        Ok(())
    }

    async fn list_step_results(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<StepResult>, RepositoryError> {
        // Read from the writer so a row appended a moment ago is always visible
        let rows = sqlx::query(
            "SELECT * FROM workflow_step_results WHERE execution_id = ? ORDER BY seq ASC",
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.writer)
        .await
        .map_err(query_error)?;

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = StepResultRow::from_row(row).map_err(query_error)?;
            results.push(r.into_step_result()?);
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
