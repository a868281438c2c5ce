//! Infrastructure layer for stepflow.
//!
//! Contains implementations of the ports defined in `stepflow-core`: SQLite
//! storage for workflows, executions, and the step ledger; the `config.toml`
//! loader; and the live `ExternalServices` used by built-in step handlers.

pub mod config;
pub mod services;
pub mod sqlite;
