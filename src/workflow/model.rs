// src/workflow/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::task::{Parameters, ResourceClaim, TaskId, TaskResult};
use crate::types::{TaskPriority, TaskStatus, WorkflowStatus};

/// One named step of a workflow. Becomes one task per execution.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowStep {
    pub name: String,
    pub module: String,
    pub action: String,
    pub parameters: Parameters,
    /// Names of other steps in the same workflow.
    pub depends_on: Vec<String>,
    pub timeout: Option<Duration>,
    /// `None` falls back to the engine default.
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub priority: Option<TaskPriority>,
    pub resources: Vec<ResourceClaim>,
}

impl WorkflowStep {
    pub fn new(
        name: impl Into<String>,
        module: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            action: action.into(),
            parameters: Parameters::new(),
            depends_on: Vec::new(),
            timeout: None,
            max_retries: None,
            retry_delay: None,
            priority: None,
            resources: Vec::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depends_on.push(step.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn claim(mut self, claim: ResourceClaim) -> Self {
        self.resources.push(claim);
        self
    }
}

/// A named, validated list of steps.
#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<WorkflowStep>,
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps,
            created_at: Utc::now(),
        }
    }

    pub fn step(&self, name: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// Per-step view of a workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub result: Option<TaskResult>,
}

fn opt_secs<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&d.as_secs_f64()),
        None => s.serialize_none(),
    }
}

/// One run of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowExecution {
    pub execution_id: String,
    pub workflow_name: String,
    pub session_id: Option<String>,
    pub status: WorkflowStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(rename = "duration_secs", serialize_with = "opt_secs")]
    pub duration: Option<Duration>,
    pub steps: BTreeMap<String, StepOutcome>,
    pub parameters: Parameters,
    /// First failing step's error, if any.
    pub error: Option<String>,
}

impl WorkflowExecution {
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.steps.values().map(|s| s.task_id.clone()).collect()
    }

    pub fn step_status(&self, step: &str) -> Option<TaskStatus> {
        self.steps.get(step).map(|s| s.status)
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Recompute the aggregate status from the step statuses.
    ///
    /// - every step `Completed`: `Completed`
    /// - every step terminal, one `Failed`: `Failed`
    /// - every step terminal, one `Cancelled`: `Cancelled`
    /// - every step terminal otherwise: `Failed`
    /// - otherwise `Running`
    pub(crate) fn refresh_status(&mut self) {
        let statuses: Vec<TaskStatus> = self.steps.values().map(|s| s.status).collect();

        let status = if statuses.iter().all(|s| *s == TaskStatus::Completed) {
            WorkflowStatus::Completed
        } else if statuses.iter().all(|s| s.is_terminal()) {
            // Skips follow from an upstream failure or cancellation.
            if statuses.contains(&TaskStatus::Failed) {
                WorkflowStatus::Failed
            } else if statuses.contains(&TaskStatus::Cancelled) {
                WorkflowStatus::Cancelled
            } else {
                WorkflowStatus::Failed
            }
        } else {
            // Submitted counts as running even before a worker picks it up.
            WorkflowStatus::Running
        };

        if status.is_terminal() && !self.status.is_terminal() {
            let now = Utc::now();
            self.finished_at = Some(now);
            self.duration = (now - self.started_at).to_std().ok();
            self.error = self
                .steps
                .iter()
                .find(|(_, s)| s.status == TaskStatus::Failed)
                .or_else(|| {
                    self.steps
                        .iter()
                        .find(|(_, s)| s.status.blocks_dependents())
                })
                .and_then(|(name, s)| {
                    let reason = s.result.as_ref().and_then(|r| r.error.clone())?;
                    Some(format!("step '{name}': {reason}"))
                });
        }
        self.status = status;
    }
}

/// Knobs for one workflow execution.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Session the tasks are submitted under.
    pub session_id: Option<String>,
    /// Minimum priority of every submitted task.
    pub priority: Option<TaskPriority>,
    /// Chain steps strictly one after another in DAG level order.
    pub sequential: bool,
}
