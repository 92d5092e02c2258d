// src/workflow/manager.rs

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::loader::load_workflow_dir;
use crate::config::validate::{step_dag, validate_steps};
use crate::config::OrchestratorSection;
use crate::errors::{OrchestratorError, Result};
use crate::exec::TaskOrchestrator;
use crate::task::{Parameters, Task, TaskId};
use crate::types::{ComponentHealth, TaskStatus, WorkflowStatus};
use crate::workflow::model::{ExecuteOptions, StepOutcome, Workflow, WorkflowExecution, WorkflowStep};
use crate::workflow::parallel::{ParallelRunSummary, execute_parallel_workflow};

/// Retry settings applied to steps that don't set their own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepDefaults {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for StepDefaults {
    fn default() -> Self {
        Self::from(&OrchestratorSection::default())
    }
}

impl From<&OrchestratorSection> for StepDefaults {
    fn from(section: &OrchestratorSection) -> Self {
        Self {
            max_retries: section.default_max_retries,
            retry_delay: section.default_retry_delay(),
        }
    }
}

/// Named workflow definitions and their executions.
///
/// Executing a workflow expands its steps into tasks on the shared
/// [`TaskOrchestrator`]; execution status is derived from those tasks each
/// time it is queried.
pub struct WorkflowManager {
    orchestrator: Arc<TaskOrchestrator>,
    defaults: StepDefaults,
    workflows: RwLock<BTreeMap<String, Workflow>>,
    executions: RwLock<HashMap<String, WorkflowExecution>>,
}

impl WorkflowManager {
    pub fn new(orchestrator: Arc<TaskOrchestrator>, defaults: StepDefaults) -> Self {
        Self {
            orchestrator,
            defaults,
            workflows: RwLock::new(BTreeMap::new()),
            executions: RwLock::new(HashMap::new()),
        }
    }

    /// Validate and register a workflow under `name`, replacing any
    /// existing definition.
    pub fn create_workflow(&self, name: &str, steps: Vec<WorkflowStep>) -> Result<()> {
        self.register(Workflow::new(name, steps))
    }

    pub fn register(&self, workflow: Workflow) -> Result<()> {
        if workflow.name.trim().is_empty() {
            return Err(OrchestratorError::Config(
                "workflow name must not be empty".to_string(),
            ));
        }
        validate_steps(&workflow.name, &workflow.steps)?;

        let name = workflow.name.clone();
        let steps = workflow.steps.len();
        if self.workflows.write().insert(name.clone(), workflow).is_some() {
            warn!(workflow = %name, "workflow definition replaced");
        }
        info!(workflow = %name, steps, "workflow registered");
        Ok(())
    }

    /// Register every workflow file found in `dir`. Returns how many were
    /// registered.
    pub fn load_directory(&self, dir: impl AsRef<Path>) -> usize {
        let mut loaded = 0;
        for workflow in load_workflow_dir(dir) {
            let name = workflow.name.clone();
            match self.register(workflow) {
                Ok(()) => loaded += 1,
                Err(e) => warn!(workflow = %name, error = %e, "skipping workflow"),
            }
        }
        loaded
    }

    pub fn workflow(&self, name: &str) -> Option<Workflow> {
        self.workflows.read().get(name).cloned()
    }

    /// Registered workflow names, sorted.
    pub fn workflows(&self) -> Vec<String> {
        self.workflows.read().keys().cloned().collect()
    }

    pub fn remove_workflow(&self, name: &str) -> Option<Workflow> {
        let removed = self.workflows.write().remove(name);
        if removed.is_some() {
            info!(workflow = %name, "workflow removed");
        }
        removed
    }

    /// Start a registered workflow. Returns as soon as its tasks are queued.
    pub fn execute_workflow(
        &self,
        name: &str,
        overrides: &Parameters,
        options: ExecuteOptions,
    ) -> Result<WorkflowExecution> {
        let workflow = self
            .workflow(name)
            .ok_or_else(|| OrchestratorError::UnknownWorkflow(name.to_string()))?;
        self.submit(&workflow.name, &workflow.steps, overrides, options)
    }

    /// Validate and start an ad-hoc step list without registering it.
    pub fn execute_steps(
        &self,
        name: &str,
        steps: &[WorkflowStep],
        overrides: &Parameters,
        options: ExecuteOptions,
    ) -> Result<WorkflowExecution> {
        validate_steps(name, steps)?;
        self.submit(name, steps, overrides, options)
    }

    fn submit(
        &self,
        workflow_name: &str,
        steps: &[WorkflowStep],
        overrides: &Parameters,
        options: ExecuteOptions,
    ) -> Result<WorkflowExecution> {
        let levels = step_dag(steps).execution_order()?;
        let by_name: HashMap<&str, &WorkflowStep> =
            steps.iter().map(|s| (s.name.as_str(), s)).collect();

        let execution_id = Uuid::new_v4().to_string();
        let mut task_ids: HashMap<&str, TaskId> = HashMap::new();
        let mut outcomes = BTreeMap::new();
        let mut previous: Option<TaskId> = None;

        for step_name in levels.iter().flatten() {
            let Some(step) = by_name.get(step_name.as_str()) else {
                continue;
            };

            let mut task =
                self.task_for_step(workflow_name, &execution_id, step, overrides, &options);
            for dep in &step.depends_on {
                if let Some(id) = task_ids.get(dep.as_str()) {
                    task.dependencies.insert(id.clone());
                }
            }
            if options.sequential {
                if let Some(prev) = &previous {
                    task.dependencies.insert(prev.clone());
                }
            }

            let id = match self.orchestrator.add_task(task) {
                Ok(id) => id,
                Err(e) => {
                    for id in task_ids.values() {
                        let _ = self.orchestrator.cancel_task(id);
                    }
                    return Err(e);
                }
            };

            outcomes.insert(
                step.name.clone(),
                StepOutcome {
                    task_id: id.clone(),
                    status: TaskStatus::Pending,
                    result: None,
                },
            );
            task_ids.insert(step.name.as_str(), id.clone());
            previous = Some(id);
        }

        let execution = WorkflowExecution {
            execution_id: execution_id.clone(),
            workflow_name: workflow_name.to_string(),
            session_id: options.session_id.clone(),
            status: WorkflowStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            duration: None,
            steps: outcomes,
            parameters: overrides.clone(),
            error: None,
        };

        info!(
            workflow = %workflow_name,
            execution = %execution_id,
            steps = steps.len(),
            levels = levels.len(),
            sequential = options.sequential,
            "workflow execution started"
        );

        self.executions
            .write()
            .insert(execution_id, execution.clone());
        Ok(execution)
    }

    fn task_for_step(
        &self,
        workflow_name: &str,
        execution_id: &str,
        step: &WorkflowStep,
        overrides: &Parameters,
        options: &ExecuteOptions,
    ) -> Task {
        let mut parameters = step.parameters.clone();
        for (key, value) in overrides {
            parameters.insert(key.clone(), value.clone());
        }

        let step_priority = step.priority.unwrap_or_default();
        let priority = match options.priority {
            Some(floor) => step_priority.max(floor),
            None => step_priority,
        };

        let mut task = Task::new(step.module.clone(), step.action.clone())
            .named(format!("{workflow_name}.{}", step.name))
            .parameters(parameters)
            .priority(priority)
            .max_retries(step.max_retries.unwrap_or(self.defaults.max_retries))
            .retry_delay(step.retry_delay.unwrap_or(self.defaults.retry_delay))
            .tag("workflow", workflow_name)
            .tag("execution_id", execution_id)
            .tag("step", step.name.clone());
        task.timeout = step.timeout;
        task.resources = step.resources.clone();
        task.session_id = options.session_id.clone();
        task
    }

    /// Current view of an execution, refreshed from the task states.
    pub fn execution(&self, execution_id: &str) -> Option<WorkflowExecution> {
        let mut executions = self.executions.write();
        let execution = executions.get_mut(execution_id)?;
        self.refresh(execution);
        Some(execution.clone())
    }

    /// All executions, refreshed, most recent first.
    pub fn executions(&self) -> Vec<WorkflowExecution> {
        let mut executions = self.executions.write();
        let mut all: Vec<WorkflowExecution> = executions
            .values_mut()
            .map(|e| {
                self.refresh(e);
                e.clone()
            })
            .collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all
    }

    fn refresh(&self, execution: &mut WorkflowExecution) {
        if execution.status.is_terminal() {
            return;
        }
        for outcome in execution.steps.values_mut() {
            if let Some(task) = self.orchestrator.task(&outcome.task_id) {
                outcome.status = task.status;
                outcome.result = task.result;
            }
        }

        let was = execution.status;
        execution.refresh_status();
        if execution.status != was && execution.status.is_terminal() {
            info!(
                workflow = %execution.workflow_name,
                execution = %execution.execution_id,
                status = ?execution.status,
                duration_ms = execution.duration.map(|d| d.as_millis() as u64),
                "workflow execution finished"
            );
        }
    }

    /// Wait until every task of the execution is terminal, or `timeout`
    /// elapses. Returns the refreshed execution either way.
    pub async fn wait_for_execution(
        &self,
        execution_id: &str,
        timeout: Option<Duration>,
    ) -> Result<WorkflowExecution> {
        let ids = self
            .execution(execution_id)
            .ok_or_else(|| OrchestratorError::InvalidState(format!(
                "unknown workflow execution '{execution_id}'"
            )))?
            .task_ids();

        if !self.orchestrator.wait_for_tasks(&ids, timeout).await {
            debug!(execution = %execution_id, "wait for workflow execution timed out");
        }

        self.execution(execution_id).ok_or_else(|| {
            OrchestratorError::InvalidState(format!("unknown workflow execution '{execution_id}'"))
        })
    }

    /// Cancel every unfinished task of an execution. Returns how many were
    /// cancelled.
    pub fn cancel_execution(&self, execution_id: &str) -> Result<usize> {
        let execution = self.execution(execution_id).ok_or_else(|| {
            OrchestratorError::InvalidState(format!("unknown workflow execution '{execution_id}'"))
        })?;

        let mut cancelled = 0;
        for outcome in execution.steps.values() {
            if self.orchestrator.cancel_task(&outcome.task_id)? {
                cancelled += 1;
            }
        }
        info!(execution = %execution_id, cancelled, "workflow execution cancelled");
        Ok(cancelled)
    }

    /// Run a flat task list level by level, independent of the shared
    /// queue. See [`execute_parallel_workflow`].
    pub async fn execute_parallel(
        &self,
        tasks: Vec<Task>,
        dependencies: &BTreeMap<TaskId, Vec<TaskId>>,
        max_parallel: usize,
    ) -> Result<ParallelRunSummary> {
        execute_parallel_workflow(
            Arc::clone(self.orchestrator.actions()),
            tasks,
            dependencies,
            max_parallel,
        )
        .await
    }

    pub fn health(&self) -> ComponentHealth {
        let mut issues = Vec::new();
        let executions = self.executions();
        let failed = executions
            .iter()
            .filter(|e| e.status == WorkflowStatus::Failed)
            .count();

        if executions.len() >= 5 && failed * 2 > executions.len() {
            issues.push(format!(
                "{failed} of {} workflow execution(s) failed",
                executions.len()
            ));
        }

        ComponentHealth::from_issues(issues)
    }
}
