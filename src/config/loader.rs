// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::model::{EngineConfig, ResourceFile, WorkflowFile};
use crate::config::validate::validate_engine_config;
use crate::errors::Result;
use crate::workflow::Workflow;

/// Load the engine configuration from path and run basic validation.
///
/// - Reads TOML.
/// - Applies defaults (handled by `serde` + `Default` impls).
/// - Checks worker count, intervals and the utilization threshold.
pub fn load_engine_config(path: impl AsRef<Path>) -> Result<EngineConfig> {
    let contents = fs::read_to_string(path.as_ref())?;
    let config: EngineConfig = toml::from_str(&contents)?;
    validate_engine_config(&config)?;
    Ok(config)
}

/// Load and validate a single workflow definition file.
pub fn load_workflow_file(path: impl AsRef<Path>) -> Result<Workflow> {
    let contents = fs::read_to_string(path.as_ref())?;
    let file: WorkflowFile = toml::from_str(&contents)?;
    Workflow::try_from(file)
}

/// Load every `*.toml` workflow file in `dir`.
///
/// Malformed or invalid files are logged and skipped; a missing directory
/// yields no workflows. Files are read in name order.
pub fn load_workflow_dir(dir: impl AsRef<Path>) -> Vec<Workflow> {
    let dir = dir.as_ref();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "cannot read workflow directory; no workflows loaded");
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    paths.sort();

    let mut workflows = Vec::new();
    for path in paths {
        match load_workflow_file(&path) {
            Ok(workflow) => {
                debug!(path = %path.display(), workflow = %workflow.name, "loaded workflow definition");
                workflows.push(workflow);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping malformed workflow file");
            }
        }
    }

    info!(dir = %dir.display(), count = workflows.len(), "workflow definitions loaded");
    workflows
}

/// Read persisted resource definitions.
pub fn load_resource_file(path: impl AsRef<Path>) -> Result<ResourceFile> {
    let contents = fs::read_to_string(path.as_ref())?;
    let file: ResourceFile = toml::from_str(&contents)?;
    Ok(file)
}

/// Write resource definitions, creating parent directories as needed.
pub fn save_resource_file(path: impl AsRef<Path>, file: &ResourceFile) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = toml::to_string_pretty(file)?;
    fs::write(path, contents)?;
    debug!(path = %path.display(), count = file.resources.len(), "resource definitions saved");
    Ok(())
}
