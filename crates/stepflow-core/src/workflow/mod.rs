//! Workflow engine core: graph validation, step dispatch, and durable run state.
//!
//! - `dag` -- graph validation (cycles, dangling edges) and ready-set computation
//! - `definition` -- authoring documents (YAML/JSON) and the workflow error type
//! - `context` -- run context with `<step>_result` merging and template resolution
//! - `expression` -- restricted JEXL evaluator for step conditions
//! - `retry` -- retry policy resolution and exponential backoff
//! - `ledger` -- append-only step result ledger over the repository
//! - `governor` -- ceiling on simultaneously running executions
//! - `registry` -- `StepHandler` trait and the type-name registry
//! - `handlers` -- built-in step handlers and the `ExternalServices` port
//! - `step_runner` -- one step to a terminal ledger entry (condition, timeout, retry)
//! - `executor` -- ready-set DAG executor
//! - `service` -- workflow lifecycle operations exposed to callers

pub mod context;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod expression;
pub mod governor;
pub mod handlers;
pub mod ledger;
pub mod registry;
pub mod retry;
pub mod service;
pub mod step_runner;

#[cfg(test)]
pub(crate) mod testing;
