//! Shared domain types for stepflow.
//!
//! This crate contains the core domain types used across the workflow engine:
//! workflow definitions, executions, step results, engine events, configuration,
//! and the repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
