//! CLI execution subcommands: list, show, steps, and cancel workflow runs.

use anyhow::{Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use stepflow_core::repository::workflow::WorkflowRepository;
use stepflow_core::workflow::definition::WorkflowError;
use stepflow_core::workflow::executor::{CANCELLED_ERROR, ExecutorError};
use stepflow_types::workflow::{Execution, ExecutionFilter, ExecutionStatus};

use super::{
    execution_status_cell, parse_enum, parse_uuid, print_json, short_id, step_status_cell,
    truncate,
};
use crate::state::AppState;

/// Execution subcommands.
#[derive(Subcommand)]
pub enum ExecutionCommand {
    /// List runs, newest first.
    #[command(alias = "ls")]
    List {
        /// Only runs of this workflow (name or UUID).
        #[arg(long)]
        workflow: Option<String>,

        /// Filter by status (running, completed, failed, cancelled).
        #[arg(long)]
        status: Option<String>,

        /// Maximum number of runs to display.
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show a run.
    Show {
        /// Run UUID.
        run_id: String,
    },

    /// Show the step ledger of a run (every attempt, in order).
    Steps {
        /// Run UUID.
        run_id: String,
    },

    /// Cancel a running run.
    Cancel {
        /// Run UUID.
        run_id: String,

        /// Mark the run cancelled even if no live process is executing it.
        #[arg(long)]
        force: bool,
    },
}

/// Handle an execution subcommand.
pub async fn handle_execution_command(
    cmd: ExecutionCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        ExecutionCommand::List {
            workflow,
            status,
            limit,
        } => handle_list(workflow.as_deref(), status.as_deref(), limit, state, json).await,
        ExecutionCommand::Show { run_id } => handle_show(&run_id, state, json).await,
        ExecutionCommand::Steps { run_id } => handle_steps(&run_id, state, json).await,
        ExecutionCommand::Cancel { run_id, force } => {
            handle_cancel(&run_id, force, state, json).await
        }
    }
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(
    workflow: Option<&str>,
    status: Option<&str>,
    limit: usize,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let workflow_id = match workflow {
        Some(target) => Some(super::workflow::resolve_workflow(state, target).await?.id),
        None => None,
    };
    let filter = ExecutionFilter {
        workflow_id,
        status: status
            .map(|s| parse_enum::<ExecutionStatus>(s, "execution status"))
            .transpose()?,
    };

    let mut executions = state.workflow_service.list_executions(&filter).await?;
    executions.truncate(limit);

    if json {
        let out: Vec<_> = executions
            .iter()
            .map(|e| {
                serde_json::json!({
                    "run_id": e.id.to_string(),
                    "workflow_id": e.workflow_id.to_string(),
                    "workflow_version": e.workflow_version,
                    "status": e.status,
                    "initiated_by": e.initiated_by,
                    "started_at": e.started_at.to_rfc3339(),
                    "completed_at": e.completed_at.map(|t| t.to_rfc3339()),
                    "error": e.error,
                })
            })
            .collect();
        return print_json(&out);
    }

    if executions.is_empty() {
        println!();
        println!("  No runs found.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Started"),
            Cell::new("Duration"),
            Cell::new("Error"),
        ]);

    for e in &executions {
        table.add_row(vec![
            Cell::new(short_id(&e.id)),
            Cell::new(format!("{} v{}", short_id(&e.workflow_id), e.workflow_version)),
            execution_status_cell(e.status),
            Cell::new(e.started_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(format_duration(e)),
            Cell::new(
                e.error
                    .as_deref()
                    .map(|err| truncate(err, 40))
                    .unwrap_or_else(|| "-".to_string()),
            ),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

async fn handle_show(run_id: &str, state: &AppState, json: bool) -> Result<()> {
    let run_id = parse_uuid(run_id, "run ID")?;
    let execution = state.workflow_service.get_execution(&run_id).await?;

    if json {
        return print_json(&execution);
    }

    println!();
    print_execution_summary(&execution);
    if !execution.context.is_empty() {
        println!("  {}", style("Context:").bold());
        let pretty = serde_json::to_string_pretty(&execution.context)?;
        for line in pretty.lines() {
            println!("    {line}");
        }
        println!();
    }

    Ok(())
}

/// Status block shared by `execution show` and `workflow run`.
pub fn print_execution_summary(execution: &Execution) {
    let status = match execution.status {
        ExecutionStatus::Completed => style(execution.status.to_string()).green(),
        ExecutionStatus::Failed => style(execution.status.to_string()).red(),
        ExecutionStatus::Cancelled => style(execution.status.to_string()).yellow(),
        ExecutionStatus::Running => style(execution.status.to_string()).blue(),
    };

    println!(
        "  {} {}",
        style("Run:").bold(),
        style(execution.id.to_string()).cyan()
    );
    println!(
        "  Workflow: {} (v{})",
        execution.workflow_id, execution.workflow_version
    );
    println!("  Status: {status}");
    println!("  Initiated by: {}", execution.initiated_by);
    println!(
        "  Started: {}",
        execution.started_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(completed) = execution.completed_at {
        println!("  Completed: {}", completed.format("%Y-%m-%d %H:%M:%S"));
        println!("  Duration: {}", format_duration(execution));
    }
    if let Some(ref result) = execution.result {
        for (label, key) in [("Completed steps", "completed_steps"), ("Skipped steps", "skipped_steps")] {
            if let Some(steps) = result.get(key).and_then(|v| v.as_array()) {
                if !steps.is_empty() {
                    let names: Vec<String> = steps
                        .iter()
                        .map(|s| s.as_str().unwrap_or_default().to_string())
                        .collect();
                    println!("  {label}: {}", names.join(", "));
                }
            }
        }
    }
    if let Some(ref err) = execution.error {
        println!("  Error: {}", style(err).red());
    }
    println!();
}

fn format_duration(execution: &Execution) -> String {
    match execution.completed_at {
        Some(completed) => {
            let ms = (completed - execution.started_at).num_milliseconds().max(0);
            if ms < 1000 {
                format!("{ms}ms")
            } else {
                format!("{:.1}s", ms as f64 / 1000.0)
            }
        }
        None => "-".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

async fn handle_steps(run_id: &str, state: &AppState, json: bool) -> Result<()> {
    let run_id = parse_uuid(run_id, "run ID")?;
    let results = state.workflow_service.step_results(&run_id).await?;

    if json {
        return print_json(&results);
    }

    if results.is_empty() {
        println!();
        println!("  No step results for run '{}'.", short_id(&run_id));
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Attempt"),
            Cell::new("Status"),
            Cell::new("At"),
            Cell::new("Output / Error"),
        ]);

    for r in &results {
        let detail = match (&r.error, &r.output) {
            (Some(err), _) => truncate(err, 60),
            (None, Some(output)) => truncate(&output.to_string(), 60),
            (None, None) => "-".to_string(),
        };
        table.add_row(vec![
            Cell::new(&r.step_id),
            Cell::new(r.attempt),
            step_status_cell(r.status),
            Cell::new(r.created_at.format("%H:%M:%S%.3f").to_string()),
            Cell::new(detail),
        ]);
    }

    println!();
    println!("  Step ledger for run '{}'", style(short_id(&run_id)).cyan());
    println!();
    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

async fn handle_cancel(run_id: &str, force: bool, state: &AppState, json: bool) -> Result<()> {
    let run_id = parse_uuid(run_id, "run ID")?;

    let execution = match state.workflow_service.cancel_execution(&run_id).await {
        Ok(execution) => execution,
        // Runs are driven by the process that started them; a Running row
        // with no live executor here is only reachable with --force.
        Err(WorkflowError::Executor(ExecutorError::NotInFlight(_))) => {
            let execution = state.workflow_service.get_execution(&run_id).await?;
            if execution.status.is_terminal() {
                bail!("Run {run_id} is already {}", execution.status);
            }
            if !force {
                bail!(
                    "Run {run_id} is not executing in this process; \
                     use --force to mark it cancelled"
                );
            }
            state
                .repo
                .update_execution_status(
                    &run_id,
                    ExecutionStatus::Cancelled,
                    None,
                    Some(CANCELLED_ERROR),
                )
                .await?;
            tracing::warn!(run_id = %run_id, "orphaned run marked cancelled");
            state.workflow_service.get_execution(&run_id).await?
        }
        Err(e) => return Err(e.into()),
    };

    if json {
        return print_json(&serde_json::json!({
            "run_id": execution.id.to_string(),
            "status": execution.status,
        }));
    }

    println!();
    println!(
        "  {} Run '{}' is now {}",
        style("*").green().bold(),
        style(short_id(&execution.id)).cyan(),
        execution.status
    );
    println!();

    Ok(())
}
