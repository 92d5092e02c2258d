// src/lib.rs

pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod resources;
pub mod task;
pub mod types;
pub mod workflow;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::config::loader::load_engine_config;

pub use crate::dag::WorkflowDag;
pub use crate::engine::{OrchestrationEngine, SessionOptions};
pub use crate::errors::OrchestratorError;
pub use crate::exec::{ActionContext, ActionError, ActionHandler, ActionRegistry};
pub use crate::resources::ResourceManager;
pub use crate::task::{ResourceClaim, Task, TaskResult};
pub use crate::types::{
    AccessMode, ExecutionMode, HealthStatus, ResourceType, TaskPriority, TaskStatus,
    WorkflowStatus,
};
pub use crate::workflow::{Workflow, WorkflowStep};

/// High-level entry point for embedding applications.
///
/// This wires together:
/// - config loading (relative paths resolved against the config's directory)
/// - logging, unless a subscriber is already installed
/// - engine construction with the caller's actions
/// - starting the dispatcher and background loops
///
/// Must be called inside a Tokio runtime.
pub async fn start(config_path: impl AsRef<Path>, actions: ActionRegistry) -> Result<OrchestrationEngine> {
    let config_path = config_path.as_ref();
    let mut cfg = load_engine_config(config_path)
        .with_context(|| format!("loading engine config {}", config_path.display()))?;
    resolve_relative_paths(&mut cfg, &config_root_dir(config_path));

    if let Err(e) = logging::init_logging(cfg.logging.level) {
        debug!(error = %e, "logging already initialised; keeping existing subscriber");
    }

    let engine = OrchestrationEngine::new(cfg, actions)?;
    engine.start();
    info!(
        workflows = ?engine.workflows().workflows(),
        actions = engine.orchestrator().actions().len(),
        "codomyrmex engine ready"
    );
    Ok(engine)
}

/// Directory that relative paths in a config file are resolved against.
///
/// - A config path with a non-empty parent (e.g. "conf/engine.toml") uses
///   that directory.
/// - A bare filename like "engine.toml" (parent = "") falls back to the
///   current working directory.
fn config_root_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

fn resolve_relative_paths(cfg: &mut EngineConfig, root: &Path) {
    let resolve = |path: &mut PathBuf| {
        if path.is_relative() {
            *path = root.join(&*path);
        }
    };
    if let Some(path) = cfg.resources.config_file.as_mut() {
        resolve(path);
    }
    if let Some(path) = cfg.workflows.directory.as_mut() {
        resolve(path);
    }
}
