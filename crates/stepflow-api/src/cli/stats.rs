//! Workflow and execution statistics.

use anyhow::Result;
use console::style;

use crate::state::AppState;

/// Display counts by status and trigger plus the run success rate.
pub async fn stats(state: &AppState, json: bool) -> Result<()> {
    let stats = state.workflow_service.get_statistics().await?;

    if json {
        let out = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "data_dir": state.data_dir.display().to_string(),
            "max_concurrent_runs": state.config.engine.max_concurrent_runs,
            "statistics": stats,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} stepflow v{}",
        style("*").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("  Data: {}", style(state.data_dir.display()).dim());
    println!();

    println!("  {}", style("── Workflows ──").dim());
    println!("  Total:      {}", style(stats.total_workflows).bold());
    for (status, count) in &stats.workflows_by_status {
        println!("  {:<11} {count}", format!("{status}:"));
    }
    if !stats.workflows_by_trigger.is_empty() {
        let triggers: Vec<String> = stats
            .workflows_by_trigger
            .iter()
            .map(|(trigger, count)| format!("{trigger} {count}"))
            .collect();
        println!("  Triggers:   {}", triggers.join(", "));
    }
    println!();

    println!("  {}", style("── Executions ──").dim());
    println!("  Total:      {}", style(stats.total_executions).bold());
    for (status, count) in &stats.executions_by_status {
        let label = format!("{status}:");
        match status.as_str() {
            "completed" => println!("  {label:<11} {}", style(count).green()),
            "failed" => println!("  {label:<11} {}", style(count).red()),
            _ => println!("  {label:<11} {count}"),
        }
    }
    println!(
        "  Success:    {}",
        style(format!("{:.1}%", stats.success_rate * 100.0)).bold()
    );
    println!(
        "  Limit:      {} concurrent runs",
        state.config.engine.max_concurrent_runs
    );
    println!();

    Ok(())
}
