//! Drives a single step to a terminal ledger entry.
//!
//! `StepRunner::run` evaluates the step's condition, resolves its handler,
//! and executes attempts under the step timeout, scheduling retries with
//! exponential backoff until the step completes or its policy is exhausted.
//! Handler failures, timeouts, condition errors, and unknown step types all
//! become ledger rows; only storage failures surface as errors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use stepflow_types::event::WorkflowEvent;
use stepflow_types::workflow::{RetryPolicy, StepDefinition, StepResult};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::workflow::WorkflowRepository;

use super::context::ExecutionContext;
use super::expression::ExpressionEvaluator;
use super::ledger::{LedgerError, StepLedger};
use super::registry::{StepInput, StepRegistry};
use super::retry::RetryHandler;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default step-level timeout (5 minutes).
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// Error recorded when an attempt outlives its timeout.
pub const STEP_TIMEOUT_ERROR: &str = "step timeout";

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Executes individual steps and records every attempt in the ledger.
pub struct StepRunner<R: WorkflowRepository> {
    ledger: Arc<StepLedger<R>>,
    registry: Arc<StepRegistry>,
    evaluator: ExpressionEvaluator,
    event_bus: EventBus,
    default_timeout: Duration,
}

impl<R: WorkflowRepository> StepRunner<R> {
    pub fn new(
        ledger: Arc<StepLedger<R>>,
        registry: Arc<StepRegistry>,
        event_bus: EventBus,
        default_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            registry,
            evaluator: ExpressionEvaluator::new(),
            event_bus,
            default_timeout,
        }
    }

    /// Run `step` to a terminal ledger entry and return the last row written.
    ///
    /// The returned row is Completed, Failed, or Skipped, except when
    /// `cancel` fires once a retry is pending (during the backoff wait or a
    /// retry attempt): then the Pending row stays the step's latest entry and
    /// the retry's outcome is discarded.
    pub async fn run(
        &self,
        step: &StepDefinition,
        run_id: Uuid,
        run_policy: Option<&RetryPolicy>,
        context: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<StepResult, LedgerError> {
        let mut attempts = self.ledger.attempt_count(run_id, &step.id).await?;

        // Condition gate
        if let Some(condition) = &step.condition {
            match self
                .evaluator
                .evaluate_bool(&condition.expression, &context.to_expression_context())
            {
                Ok(true) => {}
                Ok(false) => {
                    let row = self
                        .ledger
                        .record_skipped(
                            run_id,
                            &step.id,
                            json!({
                                "condition": condition.expression,
                                "branch": condition.on_false,
                            }),
                        )
                        .await?;
                    tracing::info!(run_id = %run_id, step_id = step.id.as_str(), "condition false, step skipped");
                    self.event_bus.publish(WorkflowEvent::StepSkipped {
                        run_id,
                        step_id: step.id.clone(),
                    });
                    return Ok(row);
                }
                Err(e) => {
                    return self
                        .fail(run_id, step, attempts + 1, &format!("condition error: {e}"))
                        .await;
                }
            }
        }

        let Some(handler) = self.registry.resolve(&step.step_type) else {
            return self
                .fail(
                    run_id,
                    step,
                    attempts + 1,
                    &format!("unknown step type: {}", step.step_type),
                )
                .await;
        };

        let policy = RetryHandler::effective_policy(step.retry.as_ref(), run_policy);
        let timeout = step
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let mut pending: Option<StepResult> = None;

        loop {
            if let Some(row) = pending.take_if(|_| cancel.is_cancelled()) {
                return Ok(self.cancelled_while_pending(run_id, step, row));
            }

            let attempt = attempts + 1;
            let input = StepInput {
                run_id,
                step_id: step.id.clone(),
                attempt,
                config: step.config.clone(),
                context: context.clone(),
            };

            tracing::debug!(
                run_id = %run_id,
                step_id = step.id.as_str(),
                step_type = step.step_type.as_str(),
                attempt,
                "executing step"
            );

            let started = Instant::now();
            let attempt_fut = tokio::time::timeout(timeout, handler.execute(input));
            let outcome = match pending.take() {
                // A step with a Pending row must not complete after a cancel
                Some(row) => {
                    let raced = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        outcome = attempt_fut => Some(outcome),
                    };
                    match raced {
                        Some(outcome) if !cancel.is_cancelled() => outcome,
                        _ => return Ok(self.cancelled_while_pending(run_id, step, row)),
                    }
                }
                None => attempt_fut.await,
            };
            attempts = attempt;

            let error = match outcome {
                Ok(Ok(output)) => {
                    let row = self
                        .ledger
                        .record_completed(run_id, &step.id, attempt, output)
                        .await?;
                    self.event_bus.publish(WorkflowEvent::StepCompleted {
                        run_id,
                        step_id: step.id.clone(),
                        attempt,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                    return Ok(row);
                }
                Ok(Err(e)) => e.to_string(),
                Err(_elapsed) => STEP_TIMEOUT_ERROR.to_string(),
            };

            let Some(policy) = policy.filter(|p| RetryHandler::should_retry(Some(*p), attempts))
            else {
                return self.fail(run_id, step, attempt, &error).await;
            };

            let retry_count = attempts;
            let delay = RetryHandler::backoff_delay(policy, retry_count);
            let row = self
                .ledger
                .record_pending(
                    run_id,
                    &step.id,
                    attempt,
                    &error,
                    retry_count,
                    delay.as_millis() as u64,
                )
                .await?;

            tracing::warn!(
                run_id = %run_id,
                step_id = step.id.as_str(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = error.as_str(),
                "step attempt failed, retrying"
            );
            self.event_bus.publish(WorkflowEvent::StepFailed {
                run_id,
                step_id: step.id.clone(),
                attempt,
                error,
                will_retry: true,
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Ok(self.cancelled_while_pending(run_id, step, row));
                }
                _ = tokio::time::sleep(delay) => {}
            }
            pending = Some(row);
        }
    }

    fn cancelled_while_pending(
        &self,
        run_id: Uuid,
        step: &StepDefinition,
        row: StepResult,
    ) -> StepResult {
        tracing::info!(
            run_id = %run_id,
            step_id = step.id.as_str(),
            attempt = row.attempt,
            "run cancelled while retry pending"
        );
        row
    }

    async fn fail(
        &self,
        run_id: Uuid,
        step: &StepDefinition,
        attempt: u32,
        error: &str,
    ) -> Result<StepResult, LedgerError> {
        let row = self
            .ledger
            .record_failed(run_id, &step.id, attempt, error)
            .await?;
        tracing::warn!(
            run_id = %run_id,
            step_id = step.id.as_str(),
            attempt,
            error,
            "step failed"
        );
        self.event_bus.publish(WorkflowEvent::StepFailed {
            run_id,
            step_id: step.id.clone(),
            attempt,
            error: error.to_string(),
            will_retry: false,
        });
        Ok(row)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use stepflow_types::workflow::{StepCondition, StepResultStatus};

    use crate::event::bus::EventSubscription;
    use crate::repository::memory::InMemoryWorkflowRepository;
    use crate::workflow::testing::{self, Flaky, running_execution, step, test_registry, vars};

    struct Harness {
        runner: StepRunner<InMemoryWorkflowRepository>,
        ledger: Arc<StepLedger<InMemoryWorkflowRepository>>,
        run_id: Uuid,
        events: EventSubscription,
    }

    async fn harness(registry: StepRegistry) -> Harness {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let exec = running_execution(Uuid::now_v7());
        repo.create_execution(&exec).await.unwrap();
        let ledger = Arc::new(StepLedger::new(repo));
        let bus = EventBus::new(64);
        let events = bus.subscribe();
        Harness {
            runner: StepRunner::new(
                Arc::clone(&ledger),
                Arc::new(registry),
                bus,
                Duration::from_secs(5),
            ),
            ledger,
            run_id: exec.id,
            events,
        }
    }

    fn retry(max_retries: u32, base_delay_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms,
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_success_records_completed() {
        let h = harness(test_registry()).await;
        let s = step("a", &[]);
        let row = h
            .runner
            .run(&s, h.run_id, None, &ExecutionContext::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(row.status, StepResultStatus::Completed);
        assert_eq!(row.attempt, 1);
        assert_eq!(row.output.unwrap()["step"], json!("a"));
    }

    #[tokio::test]
    async fn test_cancelled_run_never_retries_even_without_delay() {
        let flaky = Flaky::new(1);
        let calls = flaky.calls();
        let mut registry = test_registry();
        registry.register("flaky", flaky);
        let h = harness(registry).await;
        let mut s = testing::typed_step("x", "flaky", &[]);
        s.retry = Some(retry(3, 0));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let row = h
            .runner
            .run(&s, h.run_id, None, &ExecutionContext::default(), &cancel)
            .await
            .unwrap();

        assert_eq!(row.status, StepResultStatus::Pending);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let history = h.ledger.history(h.run_id).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_always_failing_exhausts_retries() {
        let mut h = harness(test_registry()).await;
        let mut s = testing::typed_step("flaky", "fail", &[]);
        s.retry = Some(retry(2, 10));

        let row = h
            .runner
            .run(&s, h.run_id, None, &ExecutionContext::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(row.status, StepResultStatus::Failed);
        assert_eq!(row.attempt, 3);

        let history = h.ledger.history(h.run_id).await.unwrap();
        let statuses: Vec<StepResultStatus> = history.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                StepResultStatus::Pending,
                StepResultStatus::Pending,
                StepResultStatus::Failed
            ]
        );
        // base * mult^(n-1)
        assert_eq!(history[0].output.as_ref().unwrap()["delay_ms"], json!(10));
        assert_eq!(history[1].output.as_ref().unwrap()["delay_ms"], json!(20));
        assert_eq!(history[1].output.as_ref().unwrap()["retry_count"], json!(2));

        let mut will_retry = Vec::new();
        for event in h.events.drain() {
            if let WorkflowEvent::StepFailed { will_retry: r, .. } = event {
                will_retry.push(r);
            }
        }
        assert_eq!(will_retry, vec![true, true, false]);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let flaky = Flaky::new(1);
        let calls = flaky.calls();
        let mut registry = test_registry();
        registry.register("flaky", flaky);
        let h = harness(registry).await;

        let mut s = testing::typed_step("x", "flaky", &[]);
        s.retry = Some(retry(3, 5));
        let row = h
            .runner
            .run(&s, h.run_id, None, &ExecutionContext::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(row.status, StepResultStatus::Completed);
        assert_eq!(row.attempt, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_level_policy_applies_when_step_has_none() {
        let h = harness(test_registry()).await;
        let s = testing::typed_step("f", "fail", &[]);
        let run_policy = retry(1, 5);
        let row = h
            .runner
            .run(
                &s,
                h.run_id,
                Some(&run_policy),
                &ExecutionContext::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(row.status, StepResultStatus::Failed);
        assert_eq!(row.attempt, 2);
    }

    #[tokio::test]
    async fn test_condition_false_skips() {
        let h = harness(test_registry()).await;
        let mut s = step("a", &[]);
        s.condition = Some(StepCondition {
            expression: "amount > 100".to_string(),
            on_true: None,
            on_false: Some("small".to_string()),
        });
        let ctx = ExecutionContext::from_variables(vars(json!({ "amount": 50 })));
        let row = h
            .runner
            .run(&s, h.run_id, None, &ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(row.status, StepResultStatus::Skipped);
        assert_eq!(row.attempt, 0);
        assert_eq!(row.output.unwrap()["branch"], json!("small"));
    }

    #[tokio::test]
    async fn test_condition_true_runs() {
        let h = harness(test_registry()).await;
        let mut s = step("a", &[]);
        s.condition = Some(StepCondition {
            expression: "amount > 100".to_string(),
            on_true: None,
            on_false: None,
        });
        let ctx = ExecutionContext::from_variables(vars(json!({ "amount": 150 })));
        let row = h
            .runner
            .run(&s, h.run_id, None, &ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(row.status, StepResultStatus::Completed);
    }

    #[tokio::test]
    async fn test_condition_error_fails_without_retry() {
        let h = harness(test_registry()).await;
        let mut s = step("a", &[]);
        s.retry = Some(retry(3, 5));
        s.condition = Some(StepCondition {
            expression: "amount >".to_string(),
            on_true: None,
            on_false: None,
        });
        let row = h
            .runner
            .run(&s, h.run_id, None, &ExecutionContext::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(row.status, StepResultStatus::Failed);
        assert!(row.error.unwrap().starts_with("condition error:"));
        assert_eq!(h.ledger.history(h.run_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_step_type() {
        let h = harness(test_registry()).await;
        let s = testing::typed_step("a", "teleport", &[]);
        let row = h
            .runner
            .run(&s, h.run_id, None, &ExecutionContext::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(row.status, StepResultStatus::Failed);
        assert_eq!(row.error.as_deref(), Some("unknown step type: teleport"));
    }

    #[tokio::test]
    async fn test_timeout_records_step_timeout() {
        let h = harness(test_registry()).await;
        let mut s = testing::typed_step("slow", "wait", &[]);
        s.config = json!({ "duration_ms": 5_000 });
        s.timeout_secs = Some(1);
        let row = h
            .runner
            .run(&s, h.run_id, None, &ExecutionContext::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(row.status, StepResultStatus::Failed);
        assert_eq!(row.error.as_deref(), Some(STEP_TIMEOUT_ERROR));
    }

    #[tokio::test]
    async fn test_cancel_during_retry_wait_leaves_pending() {
        let h = harness(test_registry()).await;
        let mut s = testing::typed_step("f", "fail", &[]);
        s.retry = Some(retry(5, 60_000));
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let row = h
            .runner
            .run(&s, h.run_id, None, &ExecutionContext::default(), &token)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!(row.status, StepResultStatus::Pending);

        let statuses = h.ledger.current_statuses(h.run_id).await.unwrap();
        assert_eq!(statuses["f"], StepResultStatus::Pending);
    }
}
