//! stepflow CLI entry point.
//!
//! Binary name: `stepflow`
//!
//! Parses CLI arguments, sets up tracing, initializes the database and
//! engine, then dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use stepflow_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = TracingOptions {
        enable_otel: cli.otel,
        json: cli.json,
        default_filter: cli::log_filter(cli.verbose, cli.quiet).to_string(),
    };
    if let Err(e) = init_tracing(&options) {
        eprintln!("Warning: tracing setup failed: {e}");
    }

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "stepflow", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init(cli.dry_run).await?;

    match cli.command {
        Commands::Workflow { action } => {
            cli::workflow::handle_workflow_command(action, &state, cli.json, cli.quiet).await
        }
        Commands::Execution { action } => {
            cli::execution::handle_execution_command(action, &state, cli.json).await
        }
        Commands::Stats => cli::stats::stats(&state, cli.json).await,
        Commands::Completions { .. } => Ok(()),
    }
}
