//! Application state wiring the engine to its infrastructure.
//!
//! `WorkflowService` is generic over the repository; AppState pins it to
//! SQLite and chooses the external services (live or dry run).

use std::path::PathBuf;
use std::sync::Arc;

use stepflow_core::event::bus::EventBus;
use stepflow_core::workflow::executor::DagExecutor;
use stepflow_core::workflow::handlers::{ExternalServices, NoopServices};
use stepflow_core::workflow::registry::StepRegistry;
use stepflow_core::workflow::service::WorkflowService;
use stepflow_infra::config::{load_global_config, resolve_data_dir};
use stepflow_infra::services::LiveServices;
use stepflow_infra::sqlite::pool::{DatabasePool, database_url};
use stepflow_infra::sqlite::workflow::SqliteWorkflowRepository;
use stepflow_types::config::GlobalConfig;

pub type ConcreteWorkflowService = WorkflowService<SqliteWorkflowRepository>;

/// Shared state for CLI commands.
#[derive(Clone)]
pub struct AppState {
    pub workflow_service: Arc<ConcreteWorkflowService>,
    pub repo: Arc<SqliteWorkflowRepository>,
    pub event_bus: EventBus,
    pub config: GlobalConfig,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Connect to the database and wire the engine.
    ///
    /// With `dry_run`, built-in steps log their requests instead of sending
    /// notifications, calling APIs, or writing records.
    pub async fn init(dry_run: bool) -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_global_config(&data_dir).await;
        let db_pool = DatabasePool::new(&database_url(&data_dir)).await?;
        let repo = Arc::new(SqliteWorkflowRepository::new(db_pool.clone()));

        let services: Arc<dyn ExternalServices> = if dry_run {
            Arc::new(NoopServices)
        } else {
            Arc::new(LiveServices::new(db_pool)?)
        };
        let registry = Arc::new(StepRegistry::with_builtins(services));

        let event_bus = EventBus::new(config.engine.event_capacity);
        let executor = Arc::new(DagExecutor::new(
            Arc::clone(&repo),
            registry,
            event_bus.clone(),
            &config.engine,
        ));
        let workflow_service = Arc::new(WorkflowService::new(Arc::clone(&repo), executor));

        tracing::debug!(
            data_dir = %data_dir.display(),
            max_concurrent_runs = config.engine.max_concurrent_runs,
            dry_run,
            "application state initialized"
        );

        Ok(Self {
            workflow_service,
            repo,
            event_bus,
            config,
            data_dir,
        })
    }
}
