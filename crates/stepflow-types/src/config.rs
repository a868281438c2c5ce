//! Global configuration types for stepflow.
//!
//! `GlobalConfig` represents the top-level `config.toml`. The `[engine]` table
//! controls run admission, default timeouts, and event bus sizing.

use serde::{Deserialize, Serialize};

/// Top-level configuration for stepflow.
///
/// Loaded from `~/.stepflow/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Workflow engine settings.
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Settings for the workflow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Ceiling on simultaneously running workflow executions.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// Step timeout applied when a step does not set its own.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// Run timeout applied when a workflow does not set its own.
    #[serde(default = "default_workflow_timeout_secs")]
    pub default_workflow_timeout_secs: u64,

    /// Capacity of the engine event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_concurrent_runs() -> usize {
    10
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_workflow_timeout_secs() -> u64 {
    1800
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
            default_step_timeout_secs: default_step_timeout_secs(),
            default_workflow_timeout_secs: default_workflow_timeout_secs(),
            event_capacity: default_event_capacity(),
        }
    }
}
