// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logging::LogLevel;
use crate::resources::{Resource, ResourceLimits};
use crate::types::{AccessMode, ResourceStatus, ResourceType, TaskPriority};

/// Engine configuration as read from a TOML file.
///
/// ```toml
/// [orchestrator]
/// max_workers = 8
/// poll_interval_ms = 50
///
/// [resources]
/// config_file = "resources.toml"
/// sweep_interval_secs = 60
/// high_utilization_threshold = 90.0
///
/// [workflows]
/// directory = "workflows"
///
/// [logging]
/// level = "debug"
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,

    #[serde(default)]
    pub resources: ResourceSection,

    #[serde(default)]
    pub workflows: WorkflowSection,

    #[serde(default)]
    pub logging: LoggingSection,
}

/// `[orchestrator]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    /// Size of the worker pool.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// How long the dispatcher idles when nothing is ready.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Retries applied to workflow steps that don't set `max_retries`.
    #[serde(default)]
    pub default_max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub default_retry_delay_ms: u64,
}

fn default_max_workers() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            default_max_retries: 0,
            default_retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl OrchestratorSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_retry_delay(&self) -> Duration {
        Duration::from_millis(self.default_retry_delay_ms)
    }
}

/// `[resources]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceSection {
    /// Resource definitions file. Missing file means host defaults.
    #[serde(default)]
    pub config_file: Option<PathBuf>,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Utilization (percent) above which a resource is reported as an issue.
    #[serde(default = "default_high_utilization_threshold")]
    pub high_utilization_threshold: f64,
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_high_utilization_threshold() -> f64 {
    90.0
}

impl Default for ResourceSection {
    fn default() -> Self {
        Self {
            config_file: None,
            sweep_interval_secs: default_sweep_interval_secs(),
            high_utilization_threshold: default_high_utilization_threshold(),
        }
    }
}

impl ResourceSection {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// `[workflows]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowSection {
    /// Directory holding one `*.toml` file per workflow.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// `[logging]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub level: Option<LogLevel>,
}

/// A workflow definition file.
///
/// ```toml
/// name = "build"
///
/// [[steps]]
/// name = "fetch"
/// module = "git"
/// action = "clone"
///
/// [[steps]]
/// name = "compile"
/// module = "cargo"
/// action = "build"
/// depends_on = ["fetch"]
/// max_retries = 2
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowFile {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

/// `[[steps]]` entry of a workflow file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StepDefinition {
    pub name: String,
    pub module: String,
    pub action: String,

    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub timeout_secs: Option<f64>,

    #[serde(default)]
    pub max_retries: Option<u32>,

    #[serde(default)]
    pub retry_delay_secs: Option<f64>,

    #[serde(default)]
    pub priority: Option<TaskPriority>,

    #[serde(default)]
    pub resources: Vec<ClaimDefinition>,
}

/// `[[steps.resources]]` entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaimDefinition {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,

    #[serde(default)]
    pub identifier: Option<String>,

    #[serde(default)]
    pub mode: AccessMode,

    #[serde(default)]
    pub amounts: BTreeMap<String, f64>,
}

/// Persisted resource definitions.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ResourceFile {
    #[serde(default)]
    pub resources: Vec<ResourceDefinition>,
}

/// `[[resources]]` entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourceDefinition {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(rename = "type")]
    pub resource_type: ResourceType,

    #[serde(default)]
    pub capacity: BTreeMap<String, f64>,

    #[serde(default)]
    pub status: ResourceStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_users: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_lease_secs: Option<f64>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl From<ResourceDefinition> for Resource {
    fn from(def: ResourceDefinition) -> Self {
        let name = def.name.unwrap_or_else(|| def.id.clone());
        let mut resource = Resource::new(def.id, name, def.resource_type, def.capacity)
            .with_limits(ResourceLimits {
                max_concurrent_users: def.max_concurrent_users,
                default_lease_secs: def.default_lease_secs,
            });
        resource.status = def.status;
        resource.metadata = def.metadata;
        resource
    }
}

impl From<&Resource> for ResourceDefinition {
    fn from(resource: &Resource) -> Self {
        // Persist the operator status only; usage-derived status is transient.
        let status = match resource.status {
            ResourceStatus::InUse => ResourceStatus::Available,
            other => other,
        };
        Self {
            id: resource.id.clone(),
            name: Some(resource.name.clone()),
            resource_type: resource.resource_type,
            capacity: resource.capacity.clone(),
            status,
            max_concurrent_users: resource.limits.max_concurrent_users,
            default_lease_secs: resource.limits.default_lease_secs,
            metadata: resource.metadata.clone(),
        }
    }
}
