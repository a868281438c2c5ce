//! Retry policy resolution and exponential backoff.
//!
//! A step's own policy wins; otherwise the workflow's run-level policy
//! applies; otherwise the step gets exactly one attempt.

use std::time::Duration;

use stepflow_types::workflow::RetryPolicy;

/// Upper bound on a single backoff delay (one hour).
pub const MAX_BACKOFF_MS: u64 = 3_600_000;

/// Stateless retry decisions for step failures.
pub struct RetryHandler;

impl RetryHandler {
    /// Pick the policy governing a step: step policy, else run policy.
    pub fn effective_policy<'a>(
        step: Option<&'a RetryPolicy>,
        run: Option<&'a RetryPolicy>,
    ) -> Option<&'a RetryPolicy> {
        step.or(run)
    }

    /// Total attempts allowed (initial attempt plus retries).
    pub fn max_attempts(policy: Option<&RetryPolicy>) -> u32 {
        policy.map_or(1, |p| p.max_retries.saturating_add(1))
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    ///
    /// `attempts` counts attempts already executed, including the one that
    /// just failed.
    pub fn should_retry(policy: Option<&RetryPolicy>, attempts: u32) -> bool {
        attempts < Self::max_attempts(policy)
    }

    /// Delay before retry number `retry_count` (1-based):
    /// `base_delay_ms * backoff_multiplier^(retry_count - 1)`, capped at
    /// `MAX_BACKOFF_MS`.
    pub fn backoff_delay(policy: &RetryPolicy, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = policy.base_delay_ms as f64 * policy.backoff_multiplier.powi(exponent);
        let millis = if millis.is_finite() {
            millis.clamp(0.0, MAX_BACKOFF_MS as f64)
        } else {
            MAX_BACKOFF_MS as f64
        };
        Duration::from_millis(millis.round() as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
