// src/task/mod.rs

//! Tasks and the dependency-aware priority queue that holds them.
//!
//! - [`Task`] is a unit of work: an opaque `module` + `action` + `parameters`
//!   invocation plus scheduling and retry settings.
//! - [`queue`] holds [`TaskQueue`], the registry of all known tasks and the
//!   single source of truth for task state.

pub mod queue;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use crate::resources::{Amounts, Requirements, ResourceRequirement};
use crate::types::{AccessMode, ResourceType, TaskPriority, TaskStatus};

pub use queue::TaskQueue;

/// Canonical task identifier type.
pub type TaskId = String;

/// Key/value payload handed to an action.
pub type Parameters = serde_json::Map<String, Value>;

/// A task's declared need for a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceClaim {
    pub resource_type: ResourceType,
    /// Resource id or name; `"*"` (or empty) accepts any resource of the type.
    pub identifier: String,
    pub mode: AccessMode,
    /// Amount per sub-dimension; empty claims only take an access slot.
    #[serde(default)]
    pub amounts: Amounts,
}

impl ResourceClaim {
    pub fn new(resource_type: ResourceType) -> Self {
        Self {
            resource_type,
            identifier: "*".to_string(),
            mode: AccessMode::Read,
            amounts: Amounts::new(),
        }
    }

    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    pub fn mode(mut self, mode: AccessMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn amount(mut self, key: impl Into<String>, value: f64) -> Self {
        self.amounts.insert(key.into(), value);
        self
    }

    pub fn requirement(&self) -> ResourceRequirement {
        let pinned = match self.identifier.as_str() {
            "" | "*" => None,
            other => Some(other.to_string()),
        };
        ResourceRequirement {
            resource_type: self.resource_type,
            amounts: self.amounts.clone(),
            mode: self.mode,
            resource: pinned,
        }
    }
}

/// Turn a claim list into allocation requirements keyed `"{index}:{type}"`.
pub fn claims_to_requirements(claims: &[ResourceClaim]) -> Requirements {
    claims
        .iter()
        .enumerate()
        .map(|(i, claim)| (format!("{i}:{}", claim.resource_type), claim.requirement()))
        .collect()
}

fn as_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Outcome of one task execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    /// Short machine-readable error category (`"timeout"`, `"failed"`, ...).
    pub error_kind: Option<String>,
    #[serde(rename = "execution_time_secs", serialize_with = "as_secs")]
    pub execution_time: Duration,
    pub metadata: Parameters,
}

impl TaskResult {
    pub fn success(data: Value, execution_time: Duration) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_kind: None,
            execution_time,
            metadata: Parameters::new(),
        }
    }

    pub fn failure(
        error: impl Into<String>,
        kind: impl Into<String>,
        execution_time: Duration,
    ) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            error_kind: Some(kind.into()),
            execution_time,
            metadata: Parameters::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub module: String,
    pub action: String,
    pub parameters: Parameters,

    /// Tasks that must be `Completed` before this one is eligible.
    pub dependencies: BTreeSet<TaskId>,
    pub priority: TaskPriority,
    pub resources: Vec<ResourceClaim>,

    pub timeout: Option<Duration>,
    pub max_retries: u32,
    pub retry_delay: Duration,

    pub status: TaskStatus,
    /// Retries consumed so far (attempts minus one once running).
    pub retry_count: u32,
    pub attempts: u32,
    /// Earliest time a retried task may be dispatched again.
    pub retry_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<TaskResult>,

    /// Owning session; used for per-session concurrency caps.
    pub session_id: Option<String>,
    pub tags: BTreeMap<String, String>,
}

impl Task {
    /// New pending task with a generated id, named `module.action`.
    pub fn new(module: impl Into<String>, action: impl Into<String>) -> Self {
        let module = module.into();
        let action = action.into();
        Self {
            id: Uuid::new_v4().to_string(),
            name: format!("{module}.{action}"),
            module,
            action,
            parameters: Parameters::new(),
            dependencies: BTreeSet::new(),
            priority: TaskPriority::Normal,
            resources: Vec::new(),
            timeout: None,
            max_retries: 0,
            retry_delay: Duration::ZERO,
            status: TaskStatus::Pending,
            retry_count: 0,
            attempts: 0,
            retry_at: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            session_id: None,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.dependencies.insert(task_id.into());
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn claim(mut self, claim: ResourceClaim) -> Self {
        self.resources.push(claim);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn execution_time(&self) -> Option<Duration> {
        self.result.as_ref().map(|r| r.execution_time)
    }
}
