//! Workflow domain types for stepflow.
//!
//! Defines the persisted workflow definition (a named, versioned step graph),
//! the execution record for a single run, and the append-only step result
//! rows that make up the step ledger. Authoring documents (`NewWorkflow`,
//! `WorkflowUpdate`) and query filters live here as well so that the CLI,
//! the file loader, and the service share one shape.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A JSON object of named values (workflow defaults, run context).
pub type Variables = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A named, versioned workflow: its step graph plus trigger metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned on creation.
    pub id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Monotonic version, starting at 1 and bumped on every update.
    pub version: u32,
    /// Lifecycle status. Only `Active` workflows can be executed.
    pub status: WorkflowStatus,
    /// How the workflow is meant to be triggered.
    pub trigger: TriggerKind,
    /// Trigger-specific configuration (cron expression, event name, ...).
    #[serde(default)]
    pub trigger_config: serde_json::Value,
    /// Ordered list of step definitions forming the workflow DAG.
    pub steps: Vec<StepDefinition>,
    /// Default variables, overlaid by caller context at invocation.
    #[serde(default)]
    pub variables: Variables,
    /// Overall run timeout in seconds (engine default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Run-level retry policy, used by steps that carry none of their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Identity of the author.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Look up a step by its ID.
    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == step_id)
    }
}

/// Lifecycle status of a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Paused,
    Cancelled,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStatus::Draft => "draft",
            WorkflowStatus::Active => "active",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The kind of trigger a workflow is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Scheduled,
    Event,
    Api,
    Webhook,
    Condition,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerKind::Manual => "manual",
            TriggerKind::Scheduled => "scheduled",
            TriggerKind::Event => "event",
            TriggerKind::Api => "api",
            TriggerKind::Webhook => "webhook",
            TriggerKind::Condition => "condition",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// User-defined step ID (e.g. "notify-owner"). Unique within a workflow.
    pub id: String,
    /// Human-readable step name. Falls back to the ID when empty.
    #[serde(default)]
    pub name: String,
    /// Step type name, resolved against the step registry.
    #[serde(rename = "type")]
    pub step_type: String,
    /// Handler configuration payload.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Step IDs this step depends on (DAG edges).
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Optional condition gating execution of this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<StepCondition>,
    /// Retry policy for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Step-level timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Whether this step may run concurrently with other ready parallel steps.
    #[serde(default)]
    pub parallel: bool,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl StepDefinition {
    /// Display name for logs and tables.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// A boolean expression plus the successor labels taken on each outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCondition {
    /// Expression evaluated against the run context (e.g. `amount > 100`).
    pub expression: String,
    /// Label of the successor taken when the expression holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_true: Option<String>,
    /// Label of the successor taken when the expression does not hold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_false: Option<String>,
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Exponential backoff retry policy.
///
/// The delay before retry `n` (1-based) is
/// `base_delay_ms * backoff_multiplier^(n - 1)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of retries after the initial attempt (default 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds (default 1000).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth factor applied per retry (default 2.0).
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Overall status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Completed, Failed, and Cancelled executions never change again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A single run of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// UUIDv7 run ID.
    pub id: Uuid,
    /// ID of the workflow definition being executed.
    pub workflow_id: Uuid,
    /// Definition version this run was started from.
    pub workflow_version: u32,
    /// Current run status.
    pub status: ExecutionStatus,
    /// Run context: defaults overlaid by caller values, plus `<step>_result` entries.
    pub context: Variables,
    /// Aggregate result once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error message if the run failed or was cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Who requested the run.
    pub initiated_by: String,
}

// ---------------------------------------------------------------------------
// Step Results (ledger rows)
// ---------------------------------------------------------------------------

/// Status recorded for one step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepResultStatus {
    /// The attempt failed and a retry is scheduled.
    Pending,
    Completed,
    Failed,
    Skipped,
}

impl StepResultStatus {
    /// Completed, Failed, and Skipped steps are done for readiness purposes.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepResultStatus::Pending)
    }

    /// Completed and Skipped steps unblock their dependents.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, StepResultStatus::Completed | StepResultStatus::Skipped)
    }
}

impl fmt::Display for StepResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepResultStatus::Pending => "pending",
            StepResultStatus::Completed => "completed",
            StepResultStatus::Failed => "failed",
            StepResultStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// One append-only ledger row for a step attempt within an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// UUIDv7 row ID; creation-ordered.
    pub id: Uuid,
    /// Parent execution ID.
    pub execution_id: Uuid,
    /// Step ID matching `StepDefinition.id`.
    pub step_id: String,
    /// Attempt ordinal (1-based). Skip entries use 0.
    pub attempt: u32,
    /// Outcome of this attempt.
    pub status: StepResultStatus,
    /// Output payload produced by the handler (or skip/retry details).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Error message for failed or retried attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the row was written.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Authoring documents
// ---------------------------------------------------------------------------

/// Input for creating a workflow (also the YAML/JSON file format).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkflow {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_trigger")]
    pub trigger: TriggerKind,
    #[serde(default)]
    pub trigger_config: serde_json::Value,
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Initial status (defaults to `Active`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkflowStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

fn default_trigger() -> TriggerKind {
    TriggerKind::Manual
}

/// Partial update of a workflow definition. `None` fields are left unchanged.
///
/// The optional attributes (`description`, `timeout_secs`, `retry`) take an
/// extra layer: `Some(None)`, written as an explicit `null` in a document,
/// clears the value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_config: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<StepDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Variables>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<Option<u64>>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub retry: Option<Option<RetryPolicy>>,
}

/// A present field (even `null`) becomes `Some`; `default` covers absence.
fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Filter for listing workflow definitions.
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub status: Option<WorkflowStatus>,
    pub trigger: Option<TriggerKind>,
}

impl WorkflowFilter {
    pub fn matches(&self, def: &WorkflowDefinition) -> bool {
        self.status.is_none_or(|s| s == def.status)
            && self.trigger.is_none_or(|t| t == def.trigger)
    }
}

/// Filter for listing executions.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub workflow_id: Option<Uuid>,
    pub status: Option<ExecutionStatus>,
}

impl ExecutionFilter {
    pub fn matches(&self, execution: &Execution) -> bool {
        self.workflow_id.is_none_or(|id| id == execution.workflow_id)
            && self.status.is_none_or(|s| s == execution.status)
    }
}

/// Aggregate counts across workflows and executions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowStatistics {
    pub total_workflows: usize,
    pub workflows_by_status: BTreeMap<String, usize>,
    pub workflows_by_trigger: BTreeMap<String, usize>,
    pub total_executions: usize,
    pub executions_by_status: BTreeMap<String, usize>,
    /// Completed runs over all finished runs (0.0 when none finished).
    pub success_rate: f64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
