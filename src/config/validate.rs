// src/config/validate.rs

use std::collections::HashSet;
use std::time::Duration;

use crate::config::model::{ClaimDefinition, EngineConfig, StepDefinition, WorkflowFile};
use crate::dag::{DagValidationError, WorkflowDag};
use crate::errors::{OrchestratorError, Result};
use crate::task::ResourceClaim;
use crate::workflow::{Workflow, WorkflowStep};

impl TryFrom<WorkflowFile> for Workflow {
    type Error = OrchestratorError;

    fn try_from(file: WorkflowFile) -> std::result::Result<Self, Self::Error> {
        if file.name.trim().is_empty() {
            return Err(OrchestratorError::Config(
                "workflow file must set a non-empty `name`".to_string(),
            ));
        }

        let steps = file
            .steps
            .into_iter()
            .map(WorkflowStep::try_from)
            .collect::<Result<Vec<_>>>()?;
        validate_steps(&file.name, &steps)?;

        let mut workflow = Workflow::new(file.name, steps);
        workflow.description = file.description;
        Ok(workflow)
    }
}

impl TryFrom<StepDefinition> for WorkflowStep {
    type Error = OrchestratorError;

    fn try_from(def: StepDefinition) -> std::result::Result<Self, Self::Error> {
        let timeout = seconds(&def.name, "timeout_secs", def.timeout_secs)?;
        let retry_delay = seconds(&def.name, "retry_delay_secs", def.retry_delay_secs)?;

        Ok(WorkflowStep {
            name: def.name,
            module: def.module,
            action: def.action,
            parameters: def.parameters,
            depends_on: def.depends_on,
            timeout,
            max_retries: def.max_retries,
            retry_delay,
            priority: def.priority,
            resources: def.resources.into_iter().map(ResourceClaim::from).collect(),
        })
    }
}

impl From<ClaimDefinition> for ResourceClaim {
    fn from(def: ClaimDefinition) -> Self {
        ResourceClaim {
            resource_type: def.resource_type,
            identifier: def.identifier.unwrap_or_else(|| "*".to_string()),
            mode: def.mode,
            amounts: def.amounts,
        }
    }
}

fn seconds(step: &str, field: &str, value: Option<f64>) -> Result<Option<Duration>> {
    match value {
        None => Ok(None),
        Some(secs) => Duration::try_from_secs_f64(secs).map(Some).map_err(|_| {
            OrchestratorError::Config(format!(
                "step '{step}' has invalid `{field}` = {secs} (expected a non-negative number)"
            ))
        }),
    }
}

/// Validate a workflow's steps: at least one step, unique names, and a
/// dependency graph without cycles, dangling names or self-dependencies.
pub fn validate_steps(workflow: &str, steps: &[WorkflowStep]) -> Result<()> {
    if steps.is_empty() {
        return Err(OrchestratorError::Config(format!(
            "workflow '{workflow}' must contain at least one step"
        )));
    }

    let mut seen = HashSet::new();
    let duplicates: Vec<DagValidationError> = steps
        .iter()
        .filter(|s| !seen.insert(s.name.as_str()))
        .map(|s| DagValidationError::DuplicateTask {
            name: s.name.clone(),
        })
        .collect();
    if !duplicates.is_empty() {
        return Err(OrchestratorError::Validation(duplicates));
    }

    step_dag(steps).validate().into_result()
}

/// Dependency graph of a step list, keyed by step name.
pub fn step_dag(steps: &[WorkflowStep]) -> WorkflowDag {
    WorkflowDag::from_dependencies(
        steps
            .iter()
            .map(|s| (s.name.clone(), s.depends_on.clone())),
    )
}

/// Basic sanity checks on the engine configuration.
pub fn validate_engine_config(cfg: &EngineConfig) -> Result<()> {
    if cfg.orchestrator.max_workers == 0 {
        return Err(OrchestratorError::Config(
            "[orchestrator].max_workers must be >= 1 (got 0)".to_string(),
        ));
    }

    if cfg.orchestrator.poll_interval_ms == 0 {
        return Err(OrchestratorError::Config(
            "[orchestrator].poll_interval_ms must be >= 1 (got 0)".to_string(),
        ));
    }

    if cfg.resources.sweep_interval_secs == 0 {
        return Err(OrchestratorError::Config(
            "[resources].sweep_interval_secs must be >= 1 (got 0)".to_string(),
        ));
    }

    let threshold = cfg.resources.high_utilization_threshold;
    if !(threshold > 0.0 && threshold <= 100.0) {
        return Err(OrchestratorError::Config(format!(
            "[resources].high_utilization_threshold must be in (0, 100] (got {threshold})"
        )));
    }

    Ok(())
}
