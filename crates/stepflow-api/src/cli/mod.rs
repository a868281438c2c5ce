//! CLI command definitions and dispatch for the `stepflow` binary.
//!
//! Uses clap derive macros for argument parsing. Commands are grouped by
//! noun (`stepflow workflow run`, `stepflow execution steps`).

pub mod execution;
pub mod stats;
pub mod workflow;

use std::path::Path;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use comfy_table::{Cell, Color};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use stepflow_types::workflow::{ExecutionStatus, StepResultStatus, Variables};

/// Define, run, and inspect step workflows.
#[derive(Parser)]
#[command(name = "stepflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans with the OpenTelemetry stdout exporter.
    #[arg(long, global = true, env = "STEPFLOW_OTEL")]
    pub otel: bool,

    /// Log notifications, API calls, and record updates instead of performing them.
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage workflow definitions and start runs.
    #[command(alias = "wf")]
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Inspect and cancel workflow runs.
    #[command(alias = "exec")]
    Execution {
        #[command(subcommand)]
        action: execution::ExecutionCommand,
    },

    /// Show workflow and execution statistics.
    Stats,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Log filter for the given verbosity flags.
pub fn log_filter(verbose: u8, quiet: bool) -> &'static str {
    match verbose {
        0 if quiet => "error",
        0 => "warn",
        1 => "info,stepflow=debug",
        _ => "trace",
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Parse a lowercase status or trigger name (`active`, `webhook`, ...).
pub fn parse_enum<T: DeserializeOwned>(value: &str, what: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(value.to_ascii_lowercase()))
        .map_err(|_| anyhow::anyhow!("Unknown {what}: '{value}'"))
}

pub fn parse_uuid(value: &str, what: &str) -> Result<Uuid> {
    value
        .parse()
        .with_context(|| format!("Invalid {what}: '{value}'"))
}

/// Build the run context from an inline JSON object and/or a JSON file.
///
/// Inline values override file values.
pub async fn load_context(inline: Option<&str>, file: Option<&Path>) -> Result<Variables> {
    let mut context = Variables::new();

    if let Some(path) = file {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read context file {}", path.display()))?;
        context.extend(parse_object(&raw).with_context(|| {
            format!("Context file {} is not a JSON object", path.display())
        })?);
    }

    if let Some(raw) = inline {
        context.extend(parse_object(raw).context("--context is not a JSON object")?);
    }

    Ok(context)
}

fn parse_object(raw: &str) -> Result<Variables> {
    match serde_json::from_str::<serde_json::Value>(raw)? {
        serde_json::Value::Object(map) => Ok(map),
        other => bail!("expected a JSON object, got {}", json_kind(&other)),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

/// Truncate `s` to `max` characters, marking the cut with an ellipsis.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
        out.push('…');
        out
    }
}

pub fn execution_status_cell(status: ExecutionStatus) -> Cell {
    let color = match status {
        ExecutionStatus::Running => Color::Blue,
        ExecutionStatus::Completed => Color::Green,
        ExecutionStatus::Failed => Color::Red,
        ExecutionStatus::Cancelled => Color::DarkYellow,
    };
    Cell::new(status.to_string()).fg(color)
}

pub fn step_status_cell(status: StepResultStatus) -> Cell {
    let color = match status {
        StepResultStatus::Pending => Color::Yellow,
        StepResultStatus::Completed => Color::Green,
        StepResultStatus::Failed => Color::Red,
        StepResultStatus::Skipped => Color::DarkGrey,
    };
    Cell::new(status.to_string()).fg(color)
}
