//! CLI workflow management subcommands.
//!
//! Create, update, list, show, run, pause, resume, cancel, and delete
//! workflow definitions. Workflows are addressed by UUID or by name.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use stepflow_core::workflow::definition::{load_update_file, load_workflow_file};
use stepflow_types::event::WorkflowEvent;
use stepflow_types::workflow::{
    ExecutionStatus, TriggerKind, WorkflowDefinition, WorkflowFilter, WorkflowStatus,
};

use super::{execution, load_context, parse_enum, print_json, short_id, truncate};
use crate::state::AppState;

/// Workflow management subcommands.
#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Create a workflow from a YAML or JSON file.
    Create {
        /// Path to the workflow definition (.yaml, .yml, or .json).
        file: PathBuf,
    },

    /// Update a workflow from a partial YAML or JSON document.
    Update {
        /// Workflow name or UUID.
        workflow: String,

        /// Path to the update document.
        file: PathBuf,
    },

    /// List workflows.
    #[command(alias = "ls")]
    List {
        /// Filter by status (draft, active, paused, cancelled).
        #[arg(long)]
        status: Option<String>,

        /// Filter by trigger kind (manual, scheduled, event, api, webhook, condition).
        #[arg(long)]
        trigger: Option<String>,
    },

    /// Show a workflow definition.
    Show {
        /// Workflow name or UUID.
        workflow: String,
    },

    /// Run a workflow and wait for it to finish. Ctrl+C cancels the run.
    Run {
        /// Workflow name or UUID.
        workflow: String,

        /// Run context as an inline JSON object.
        #[arg(long)]
        context: Option<String>,

        /// Run context read from a JSON file (inline values win).
        #[arg(long)]
        context_file: Option<PathBuf>,

        /// Who is starting the run.
        #[arg(long, default_value = "cli")]
        initiated_by: String,
    },

    /// Pause an active workflow.
    Pause {
        /// Workflow name or UUID.
        workflow: String,
    },

    /// Resume a paused or draft workflow.
    Resume {
        /// Workflow name or UUID.
        workflow: String,
    },

    /// Cancel a workflow definition (it can no longer run).
    Cancel {
        /// Workflow name or UUID.
        workflow: String,
    },

    /// Delete a workflow with all of its runs.
    #[command(alias = "rm")]
    Delete {
        /// Workflow name or UUID.
        workflow: String,
    },
}

/// Handle a workflow subcommand.
pub async fn handle_workflow_command(
    cmd: WorkflowCommand,
    state: &AppState,
    json: bool,
    quiet: bool,
) -> Result<()> {
    match cmd {
        WorkflowCommand::Create { file } => handle_create(&file, state, json).await,
        WorkflowCommand::Update { workflow, file } => {
            handle_update(&workflow, &file, state, json).await
        }
        WorkflowCommand::List { status, trigger } => {
            handle_list(status.as_deref(), trigger.as_deref(), state, json).await
        }
        WorkflowCommand::Show { workflow } => handle_show(&workflow, state, json).await,
        WorkflowCommand::Run {
            workflow,
            context,
            context_file,
            initiated_by,
        } => {
            handle_run(
                &workflow,
                context.as_deref(),
                context_file.as_deref(),
                &initiated_by,
                state,
                json,
                quiet,
            )
            .await
        }
        WorkflowCommand::Pause { workflow } => {
            handle_transition(&workflow, Transition::Pause, state, json).await
        }
        WorkflowCommand::Resume { workflow } => {
            handle_transition(&workflow, Transition::Resume, state, json).await
        }
        WorkflowCommand::Cancel { workflow } => {
            handle_transition(&workflow, Transition::Cancel, state, json).await
        }
        WorkflowCommand::Delete { workflow } => handle_delete(&workflow, state, json).await,
    }
}

/// Find a workflow by UUID, falling back to an exact name match.
pub async fn resolve_workflow(state: &AppState, target: &str) -> Result<WorkflowDefinition> {
    if let Ok(id) = target.parse::<uuid::Uuid>() {
        return Ok(state.workflow_service.get_workflow(&id).await?);
    }

    let mut matches: Vec<WorkflowDefinition> = state
        .workflow_service
        .list_workflows(&WorkflowFilter::default())
        .await?
        .into_iter()
        .filter(|d| d.name == target)
        .collect();

    match matches.len() {
        0 => bail!("Workflow '{target}' not found"),
        1 => Ok(matches.remove(0)),
        n => bail!("{n} workflows are named '{target}'; use the UUID instead"),
    }
}

// ---------------------------------------------------------------------------
// Create / Update
// ---------------------------------------------------------------------------

async fn handle_create(file: &PathBuf, state: &AppState, json: bool) -> Result<()> {
    let new = load_workflow_file(file)
        .map_err(|e| anyhow::anyhow!("Failed to load {}: {e}", file.display()))?;
    let def = state.workflow_service.create_workflow(new).await?;

    if json {
        return print_json(&def);
    }

    println!();
    println!(
        "  {} Created workflow '{}'",
        style("*").green().bold(),
        style(&def.name).cyan()
    );
    println!("  ID: {}", def.id);
    println!("  Status: {}", def.status);
    println!("  Steps: {}", def.steps.len());
    println!();
    println!(
        "  Run it with: {}",
        style(format!("stepflow workflow run {}", def.name)).dim()
    );
    println!();

    Ok(())
}

async fn handle_update(target: &str, file: &PathBuf, state: &AppState, json: bool) -> Result<()> {
    let existing = resolve_workflow(state, target).await?;
    let update = load_update_file(file)
        .map_err(|e| anyhow::anyhow!("Failed to load {}: {e}", file.display()))?;
    let def = state
        .workflow_service
        .update_workflow(&existing.id, update)
        .await?;

    if json {
        return print_json(&def);
    }

    println!();
    println!(
        "  {} Updated workflow '{}' to version {}",
        style("*").green().bold(),
        style(&def.name).cyan(),
        def.version
    );
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// List / Show
// ---------------------------------------------------------------------------

async fn handle_list(
    status: Option<&str>,
    trigger: Option<&str>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let filter = WorkflowFilter {
        status: status
            .map(|s| parse_enum::<WorkflowStatus>(s, "workflow status"))
            .transpose()?,
        trigger: trigger
            .map(|t| parse_enum::<TriggerKind>(t, "trigger kind"))
            .transpose()?,
    };
    let defs = state.workflow_service.list_workflows(&filter).await?;

    if json {
        let out: Vec<_> = defs
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id.to_string(),
                    "name": d.name,
                    "version": d.version,
                    "status": d.status,
                    "trigger": d.trigger,
                    "steps": d.steps.len(),
                    "updated_at": d.updated_at.to_rfc3339(),
                })
            })
            .collect();
        return print_json(&out);
    }

    if defs.is_empty() {
        println!();
        println!("  No workflows found.");
        println!(
            "  Create one with: {}",
            style("stepflow workflow create <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("ID"),
            Cell::new("Version"),
            Cell::new("Status"),
            Cell::new("Trigger"),
            Cell::new("Steps"),
        ]);

    for d in &defs {
        table.add_row(vec![
            Cell::new(&d.name),
            Cell::new(short_id(&d.id)),
            Cell::new(d.version),
            workflow_status_cell(d.status),
            Cell::new(d.trigger.to_string()),
            Cell::new(d.steps.len()),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

async fn handle_show(target: &str, state: &AppState, json: bool) -> Result<()> {
    let def = resolve_workflow(state, target).await?;

    if json {
        return print_json(&def);
    }

    println!();
    println!(
        "  {} {} (v{})",
        style("Workflow:").bold(),
        style(&def.name).cyan(),
        def.version
    );
    println!("  ID: {}", def.id);
    if let Some(ref description) = def.description {
        println!("  Description: {description}");
    }
    println!("  Status: {}", def.status);
    println!("  Trigger: {}", def.trigger);
    if let Some(timeout) = def.timeout_secs {
        println!("  Timeout: {timeout}s");
    }
    if let Some(ref retry) = def.retry {
        println!(
            "  Retry: {} retries, {}ms base delay, x{}",
            retry.max_retries, retry.base_delay_ms, retry.backoff_multiplier
        );
    }
    if !def.variables.is_empty() {
        println!(
            "  Variables: {}",
            serde_json::Value::Object(def.variables.clone())
        );
    }
    println!("  Updated: {}", def.updated_at.format("%Y-%m-%d %H:%M:%S"));
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Depends on"),
            Cell::new("Condition"),
            Cell::new("Retries"),
            Cell::new("Parallel"),
        ]);

    for step in &def.steps {
        let depends = if step.depends_on.is_empty() {
            "-".to_string()
        } else {
            step.depends_on.join(", ")
        };
        let condition = step
            .condition
            .as_ref()
            .map(|c| truncate(&c.expression, 30))
            .unwrap_or_else(|| "-".to_string());
        let retries = step
            .retry
            .as_ref()
            .or(def.retry.as_ref())
            .map(|r| r.max_retries.to_string())
            .unwrap_or_else(|| "0".to_string());

        table.add_row(vec![
            Cell::new(step.display_name()),
            Cell::new(&step.step_type),
            Cell::new(depends),
            Cell::new(condition),
            Cell::new(retries),
            Cell::new(if step.parallel { "yes" } else { "no" }),
        ]);
    }

    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

async fn handle_run(
    target: &str,
    inline_context: Option<&str>,
    context_file: Option<&std::path::Path>,
    initiated_by: &str,
    state: &AppState,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let def = resolve_workflow(state, target).await?;
    let context = load_context(inline_context, context_file).await?;
    let show_progress = !json && !quiet;

    // Subscribe before starting so no event of this run is missed
    let events = state.event_bus.subscribe();
    let (started, mut handle) = state
        .workflow_service
        .start_workflow(&def.id, context, initiated_by)
        .await?;
    let run_id = started.id;
    let mut events = events.for_run(run_id);

    if show_progress {
        println!();
        println!(
            "  {} Running '{}' (run {})",
            style("*").cyan().bold(),
            style(&def.name).cyan(),
            short_id(&run_id)
        );
    }

    let mut events_open = true;
    let mut cancel_requested = false;
    let outcome = loop {
        tokio::select! {
            joined = &mut handle => break joined?,
            event = events.recv(), if events_open => match event {
                Some(event) if show_progress => print_event(&event),
                Some(_) => {}
                None => events_open = false,
            },
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                cancel_requested = true;
                if show_progress {
                    println!("  {} Cancelling run...", style("!").yellow().bold());
                }
                if let Err(e) = state.workflow_service.cancel_execution(&run_id).await {
                    tracing::warn!(run_id = %run_id, error = %e, "cancel request failed");
                }
            }
        }
    };
    let execution = outcome?;

    if json {
        print_json(&execution)?;
    } else if !quiet {
        println!();
        execution::print_execution_summary(&execution);
    }

    match execution.status {
        ExecutionStatus::Completed => Ok(()),
        status => bail!(
            "Run {} {}: {}",
            execution.id,
            status,
            execution.error.as_deref().unwrap_or("no error recorded")
        ),
    }
}

fn print_event(event: &WorkflowEvent) {
    match event {
        WorkflowEvent::StepCompleted {
            step_id,
            attempt,
            duration_ms,
            ..
        } => println!(
            "    {} {step_id} (attempt {attempt}, {duration_ms}ms)",
            style("✓").green()
        ),
        WorkflowEvent::StepFailed {
            step_id,
            attempt,
            error,
            will_retry,
            ..
        } => {
            let suffix = if *will_retry { ", retrying" } else { "" };
            println!(
                "    {} {step_id} (attempt {attempt}{suffix}): {}",
                style("✗").red(),
                style(truncate(error, 80)).dim()
            );
        }
        WorkflowEvent::StepSkipped { step_id, .. } => {
            println!("    {} {step_id} (skipped)", style("-").dim())
        }
        WorkflowEvent::RunStarted { .. }
        | WorkflowEvent::RunCompleted { .. }
        | WorkflowEvent::RunFailed { .. }
        | WorkflowEvent::RunCancelled { .. } => {}
    }
}

// ---------------------------------------------------------------------------
// Lifecycle transitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Transition {
    Pause,
    Resume,
    Cancel,
}

async fn handle_transition(
    target: &str,
    transition: Transition,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let existing = resolve_workflow(state, target).await?;
    let service = &state.workflow_service;
    let def = match transition {
        Transition::Pause => service.pause_workflow(&existing.id).await?,
        Transition::Resume => service.resume_workflow(&existing.id).await?,
        Transition::Cancel => service.cancel_workflow(&existing.id).await?,
    };

    if json {
        return print_json(&serde_json::json!({
            "id": def.id.to_string(),
            "name": def.name,
            "status": def.status,
        }));
    }

    println!();
    println!(
        "  {} Workflow '{}' is now {}",
        style("*").green().bold(),
        style(&def.name).cyan(),
        def.status
    );
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

async fn handle_delete(target: &str, state: &AppState, json: bool) -> Result<()> {
    let def = resolve_workflow(state, target).await?;
    state.workflow_service.delete_workflow(&def.id).await?;

    if json {
        return print_json(&serde_json::json!({
            "deleted": def.name,
            "id": def.id.to_string(),
        }));
    }

    println!();
    println!(
        "  {} Deleted workflow '{}'",
        style("*").green().bold(),
        style(&def.name).cyan()
    );
    println!();

    Ok(())
}

fn workflow_status_cell(status: WorkflowStatus) -> Cell {
    let color = match status {
        WorkflowStatus::Draft => Color::Yellow,
        WorkflowStatus::Active => Color::Green,
        WorkflowStatus::Paused => Color::Magenta,
        WorkflowStatus::Cancelled => Color::DarkGrey,
    };
    Cell::new(status.to_string()).fg(color)
}
