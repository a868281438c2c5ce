//! Step handler trait and the registry that maps step type names to handlers.
//!
//! `StepHandler` is object-safe (boxed futures) so handlers of different
//! concrete types can live behind `Arc<dyn StepHandler>` in one map. New step
//! types are added by registering a handler; the executor never matches on
//! type names itself.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use super::context::ExecutionContext;

/// Boxed future returned by step handlers.
pub type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + 'a>>;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Errors a step handler can report. They become ledger entries, never run errors.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("step execution failed: {0}")]
    ExecutionFailed(String),

    #[error("invalid step config: {0}")]
    InvalidConfig(String),
}

// ---------------------------------------------------------------------------
// StepInput
// ---------------------------------------------------------------------------

/// Everything a handler gets for one attempt.
#[derive(Debug, Clone)]
pub struct StepInput {
    pub run_id: Uuid,
    pub step_id: String,
    /// 1-based attempt ordinal.
    pub attempt: u32,
    /// Raw handler config from the step definition (templates unresolved).
    pub config: Value,
    /// Snapshot of the run context when the attempt started.
    pub context: ExecutionContext,
}

impl StepInput {
    /// Config with `{{ name }}` placeholders resolved against the context.
    pub fn resolved_config(&self) -> Value {
        self.context.resolve_value(&self.config)
    }
}

// ---------------------------------------------------------------------------
// StepHandler
// ---------------------------------------------------------------------------

/// Executes one step type.
pub trait StepHandler: Send + Sync {
    fn execute(&self, input: StepInput) -> StepFuture<'_>;
}

/// Adapter turning an async closure into a `StepHandler`.
pub struct FnHandler<F>(F);

/// Build a handler from `Fn(StepInput) -> impl Future<Output = Result<Value, StepError>>`.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(StepInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
{
    FnHandler(f)
}

impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(StepInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
{
    fn execute(&self, input: StepInput) -> StepFuture<'_> {
        Box::pin((self.0)(input))
    }
}

// ---------------------------------------------------------------------------
// StepRegistry
// ---------------------------------------------------------------------------

/// Type name -> handler map.
#[derive(Default, Clone)]
pub struct StepRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl StepRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `step_type`.
    pub fn register(&mut self, step_type: impl Into<String>, handler: impl StepHandler + 'static) {
        self.handlers.insert(step_type.into(), Arc::new(handler));
    }

    pub fn resolve(&self, step_type: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(step_type).cloned()
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.handlers.contains_key(step_type)
    }

    /// Registered type names, sorted.
    pub fn step_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("step_types", &self.step_types())
            .finish()
    }
}
