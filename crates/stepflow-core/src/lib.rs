//! Workflow engine and repository trait definitions for stepflow.
//!
//! This crate holds the engine itself (graph validation, step registry,
//! retry scheduling, the step ledger, the run governor, and the executor)
//! plus the "ports" (repository and external service traits) that the
//! infrastructure layer implements. It depends only on `stepflow-types` --
//! never on `stepflow-infra` or any database/IO crate.

pub mod event;
pub mod repository;
pub mod workflow;
