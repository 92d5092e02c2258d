// src/engine/status.rs

//! Serializable status, health and outcome structures returned by the
//! engine.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::exec::ExecutionStats;
use crate::resources::SystemResourceUsage;
use crate::task::{TaskId, TaskResult};
use crate::types::{ComponentHealth, HealthStatus, TaskStatus};
use crate::workflow::WorkflowExecution;

fn as_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Result of `execute_workflow` / `execute_complex_workflow`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowOutcome {
    pub success: bool,
    pub workflow_name: String,
    pub session_id: String,
    pub execution: Option<WorkflowExecution>,
    pub error: Option<String>,
    #[serde(rename = "duration_secs", serialize_with = "as_secs")]
    pub duration: Duration,
}

/// Result of `execute_task`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskOutcome {
    pub success: bool,
    pub task_id: Option<TaskId>,
    pub session_id: String,
    pub status: Option<TaskStatus>,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowSummary {
    pub registered: usize,
    pub executions: usize,
    pub running: usize,
}

/// Snapshot of the whole system.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: f64,
    pub running: bool,
    pub sessions: SessionSummary,
    pub workflows: WorkflowSummary,
    pub tasks: ExecutionStats,
    pub resources: SystemResourceUsage,
}

/// Aggregated health of the engine's components.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub components: BTreeMap<String, ComponentHealth>,
    pub issues: Vec<String>,
}

impl HealthReport {
    /// Overall status is the worst component status; issues are prefixed
    /// with their component name.
    pub fn from_components(components: BTreeMap<String, ComponentHealth>) -> Self {
        let status = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        let issues = components
            .iter()
            .flat_map(|(name, c)| c.issues.iter().map(move |i| format!("{name}: {i}")))
            .collect();

        Self {
            status,
            timestamp: Utc::now(),
            components,
            issues,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}
