// src/types.rs

//! Small shared enums used across the scheduler, resource manager and engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Scheduling priority of a task. Ordered `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "normal" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            other => Err(format!(
                "invalid priority: {other} (expected \"low\", \"normal\", \"high\" or \"critical\")"
            )),
        }
    }
}

/// Lifecycle state of a task.
///
/// `Pending` is initial. `Ready` means the dependencies are satisfied and the
/// dispatcher has picked the task up. `Running` means a worker is executing
/// it. The remaining four states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// An upstream dependency ended Failed/Cancelled/Skipped.
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Skipped
        )
    }

    /// Terminal and not successful: dependents of such a task can never run.
    pub fn blocks_dependents(self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a task accesses a resource.
///
/// - `Read`: shares the resource with other readers and a writer.
/// - `Write`: at most one writer at a time; readers may coexist.
/// - `Exclusive`: sole holder; nobody else may hold the resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    #[default]
    Read,
    Write,
    Exclusive,
}

impl AccessMode {
    /// Whether a new holder in `self` mode may join a resource on which
    /// `existing` is already held by a different user.
    pub fn compatible_with(self, existing: AccessMode) -> bool {
        match (self, existing) {
            (AccessMode::Exclusive, _) | (_, AccessMode::Exclusive) => false,
            (AccessMode::Write, AccessMode::Write) => false,
            _ => true,
        }
    }
}

impl FromStr for AccessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "read" => Ok(AccessMode::Read),
            "write" => Ok(AccessMode::Write),
            "exclusive" => Ok(AccessMode::Exclusive),
            other => Err(format!(
                "invalid access mode: {other} (expected \"read\", \"write\" or \"exclusive\")"
            )),
        }
    }
}

/// Kind of a capacity-bounded resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Cpu,
    Memory,
    Disk,
    Network,
    ApiQuota,
    /// Generic lock / semaphore style resource.
    Lock,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Cpu => "cpu",
            ResourceType::Memory => "memory",
            ResourceType::Disk => "disk",
            ResourceType::Network => "network",
            ResourceType::ApiQuota => "api_quota",
            ResourceType::Lock => "lock",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cpu" => Ok(ResourceType::Cpu),
            "memory" => Ok(ResourceType::Memory),
            "disk" | "storage" => Ok(ResourceType::Disk),
            "network" => Ok(ResourceType::Network),
            "api_quota" | "api" => Ok(ResourceType::ApiQuota),
            "lock" | "semaphore" => Ok(ResourceType::Lock),
            other => Err(format!("invalid resource type: {other}")),
        }
    }
}

/// Operational status of a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    #[default]
    Available,
    InUse,
    Reserved,
    Maintenance,
    Unavailable,
}

impl ResourceStatus {
    /// Whether new allocations may be granted against a resource in this status.
    pub fn accepts_allocations(self) -> bool {
        matches!(self, ResourceStatus::Available | ResourceStatus::InUse)
    }
}

/// Aggregate status of one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

/// Status of an orchestration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
    Failed,
}

/// How work submitted under a session is scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Steps run one after another in DAG level order.
    Sequential,
    /// Steps run as soon as their dependencies allow (default).
    #[default]
    Parallel,
    /// Tasks inherit the session priority.
    Priority,
    /// The session's resource requirements must be granted before anything runs.
    ResourceAware,
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "sequential" => Ok(ExecutionMode::Sequential),
            "parallel" => Ok(ExecutionMode::Parallel),
            "priority" => Ok(ExecutionMode::Priority),
            "resource_aware" => Ok(ExecutionMode::ResourceAware),
            other => Err(format!("invalid execution mode: {other}")),
        }
    }
}

/// Health of a component or of the whole system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health of one component plus the issues that made it non-healthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub issues: Vec<String>,
}

impl ComponentHealth {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            issues: Vec::new(),
        }
    }

    /// `Healthy` when `issues` is empty, otherwise `Degraded`.
    pub fn from_issues(issues: Vec<String>) -> Self {
        let status = if issues.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        Self { status, issues }
    }
}
