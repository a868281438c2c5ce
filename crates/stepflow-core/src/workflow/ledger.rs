//! Append-only step result ledger.
//!
//! Wraps `WorkflowRepository` to provide a higher-level API for recording
//! step attempts. Every attempt writes exactly one row and rows are never
//! updated, so the latest row per step is that step's current status and the
//! number of non-skip rows is the number of attempts made.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use stepflow_types::workflow::{StepResult, StepResultStatus};
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

// ---------------------------------------------------------------------------
// StepLedger
// ---------------------------------------------------------------------------

/// Records and reads step attempts for workflow runs.
///
/// Generic over `R: WorkflowRepository` so it works with any storage backend
/// (SQLite, in-memory, etc.). Each row is persisted before the executor moves
/// forward.
pub struct StepLedger<R: WorkflowRepository> {
    repo: Arc<R>,
}

impl<R: WorkflowRepository> StepLedger<R> {
    /// Create a ledger backed by the given repository.
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Record a failed attempt that will be retried after `delay_ms`.
    pub async fn record_pending(
        &self,
        run_id: Uuid,
        step_id: &str,
        attempt: u32,
        error: &str,
        retry_count: u32,
        delay_ms: u64,
    ) -> Result<StepResult, LedgerError> {
        let output = json!({ "retry_count": retry_count, "delay_ms": delay_ms });
        let row = self
            .append(run_id, step_id, attempt, StepResultStatus::Pending, Some(output), Some(error))
            .await?;

        tracing::debug!(
            run_id = %run_id,
            step_id,
            attempt,
            retry_count,
            delay_ms,
            "recorded pending retry"
        );
        Ok(row)
    }

    /// Record a successful attempt.
    pub async fn record_completed(
        &self,
        run_id: Uuid,
        step_id: &str,
        attempt: u32,
        output: Value,
    ) -> Result<StepResult, LedgerError> {
        let row = self
            .append(run_id, step_id, attempt, StepResultStatus::Completed, Some(output), None)
            .await?;
        tracing::debug!(run_id = %run_id, step_id, attempt, "recorded step completed");
        Ok(row)
    }

    /// Record a final failed attempt.
    pub async fn record_failed(
        &self,
        run_id: Uuid,
        step_id: &str,
        attempt: u32,
        error: &str,
    ) -> Result<StepResult, LedgerError> {
        let row = self
            .append(run_id, step_id, attempt, StepResultStatus::Failed, None, Some(error))
            .await?;
        tracing::debug!(run_id = %run_id, step_id, attempt, error, "recorded step failed");
        Ok(row)
    }

    /// Record a step skipped by its condition. Skips carry attempt 0.
    pub async fn record_skipped(
        &self,
        run_id: Uuid,
        step_id: &str,
        output: Value,
    ) -> Result<StepResult, LedgerError> {
        let row = self
            .append(run_id, step_id, 0, StepResultStatus::Skipped, Some(output), None)
            .await?;
        tracing::debug!(run_id = %run_id, step_id, "recorded step skipped");
        Ok(row)
    }

    async fn append(
        &self,
        run_id: Uuid,
        step_id: &str,
        attempt: u32,
        status: StepResultStatus,
        output: Option<Value>,
        error: Option<&str>,
    ) -> Result<StepResult, LedgerError> {
        let row = StepResult {
            id: Uuid::now_v7(),
            execution_id: run_id,
            step_id: step_id.to_string(),
            attempt,
            status,
            output,
            error: error.map(str::to_string),
            created_at: Utc::now(),
        };

        self.repo
            .append_step_result(&row)
            .await
            .map_err(|e| LedgerError::Repository(e.to_string()))?;
        Ok(row)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Every row for a run, in creation order.
    pub async fn history(&self, run_id: Uuid) -> Result<Vec<StepResult>, LedgerError> {
        self.repo
            .list_step_results(&run_id)
            .await
            .map_err(|e| LedgerError::Repository(e.to_string()))
    }

    /// Status of the latest row for every step that has one.
    pub async fn current_statuses(
        &self,
        run_id: Uuid,
    ) -> Result<HashMap<String, StepResultStatus>, LedgerError> {
        Ok(latest_statuses(&self.history(run_id).await?))
    }

    /// Attempts made so far for one step (rows that are not skips).
    pub async fn attempt_count(&self, run_id: Uuid, step_id: &str) -> Result<u32, LedgerError> {
        let rows = self.history(run_id).await?;
        Ok(count_attempts(&rows, step_id))
    }
}

/// Fold rows (in creation order) into the latest status per step.
pub fn latest_statuses(rows: &[StepResult]) -> HashMap<String, StepResultStatus> {
    let mut statuses = HashMap::new();
    for row in rows {
        statuses.insert(row.step_id.clone(), row.status);
    }
    statuses
}

/// Count attempt rows for a step, ignoring skip rows.
pub fn count_attempts(rows: &[StepResult], step_id: &str) -> u32 {
    rows.iter()
        .filter(|r| r.step_id == step_id && r.status != StepResultStatus::Skipped)
        .count() as u32
}

// ---------------------------------------------------------------------------
// LedgerError
// ---------------------------------------------------------------------------

/// Errors from ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("repository error: {0}")]
    Repository(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryWorkflowRepository;
    use crate::workflow::testing::running_execution;

    async fn ledger_with_run() -> (StepLedger<InMemoryWorkflowRepository>, Uuid) {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let exec = running_execution(Uuid::now_v7());
        repo.create_execution(&exec).await.unwrap();
        (StepLedger::new(repo), exec.id)
    }

    #[tokio::test]
    async fn test_latest_row_defines_status() {
        let (ledger, run_id) = ledger_with_run().await;
        ledger
            .record_pending(run_id, "a", 1, "boom", 1, 100)
            .await
            .unwrap();
        ledger
            .record_completed(run_id, "a", 2, json!({ "ok": true }))
            .await
            .unwrap();
        ledger.record_failed(run_id, "b", 1, "nope").await.unwrap();

        let statuses = ledger.current_statuses(run_id).await.unwrap();
        assert_eq!(statuses["a"], StepResultStatus::Completed);
        assert_eq!(statuses["b"], StepResultStatus::Failed);
        assert!(!statuses.contains_key("c"));
    }

    #[tokio::test]
    async fn test_attempt_count_ignores_skips() {
        let (ledger, run_id) = ledger_with_run().await;
        ledger
            .record_skipped(run_id, "s", json!({ "branch": null }))
            .await
            .unwrap();
        assert_eq!(ledger.attempt_count(run_id, "s").await.unwrap(), 0);

        ledger
            .record_pending(run_id, "r", 1, "e1", 1, 10)
            .await
            .unwrap();
        ledger
            .record_pending(run_id, "r", 2, "e2", 2, 20)
            .await
            .unwrap();
        ledger.record_failed(run_id, "r", 3, "e3").await.unwrap();
        assert_eq!(ledger.attempt_count(run_id, "r").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_pending_row_carries_retry_details() {
        let (ledger, run_id) = ledger_with_run().await;
        let row = ledger
            .record_pending(run_id, "a", 1, "connection reset", 1, 250)
            .await
            .unwrap();
        assert_eq!(row.status, StepResultStatus::Pending);
        assert_eq!(row.error.as_deref(), Some("connection reset"));
        assert_eq!(row.output.unwrap()["delay_ms"], json!(250));

        let history = ledger.history(run_id).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_append_to_unknown_run_fails() {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let ledger = StepLedger::new(repo);
        let err = ledger
            .record_failed(Uuid::now_v7(), "a", 1, "x")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("repository error"));
    }
}
