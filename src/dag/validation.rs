// src/dag/validation.rs

//! Structured DAG validation results.

use thiserror::Error;

use crate::errors::{OrchestratorError, Result};

/// A single problem found while validating a [`WorkflowDag`](super::WorkflowDag).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DagValidationError {
    /// A dependency cycle. `path` starts and ends with the same node.
    #[error("cycle detected: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    DanglingDependency { task: String, dependency: String },

    #[error("task '{task}' cannot depend on itself")]
    SelfDependency { task: String },

    #[error("duplicate task name '{name}'")]
    DuplicateTask { name: String },

    /// Kahn's algorithm could not place every node.
    #[error("topological sort placed {processed} of {total} tasks; graph has a residual cycle")]
    ResidualCycle { processed: usize, total: usize },
}

impl DagValidationError {
    /// Nodes named by this error.
    pub fn tasks(&self) -> Vec<&str> {
        match self {
            DagValidationError::Cycle { path } => path.iter().map(|s| s.as_str()).collect(),
            DagValidationError::DanglingDependency { task, dependency } => {
                vec![task.as_str(), dependency.as_str()]
            }
            DagValidationError::SelfDependency { task } => vec![task.as_str()],
            DagValidationError::DuplicateTask { name } => vec![name.as_str()],
            DagValidationError::ResidualCycle { .. } => Vec::new(),
        }
    }
}

/// Outcome of [`WorkflowDag::validate`](super::WorkflowDag::validate).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<DagValidationError>,
}

impl ValidationReport {
    pub fn from_errors(errors: Vec<DagValidationError>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
        }
    }

    pub fn has_cycle(&self) -> bool {
        self.errors
            .iter()
            .any(|e| matches!(e, DagValidationError::Cycle { .. }))
    }

    /// Convert into `Ok(())` or a structured [`OrchestratorError::Validation`].
    pub fn into_result(self) -> Result<()> {
        if self.is_valid {
            Ok(())
        } else {
            Err(OrchestratorError::Validation(self.errors))
        }
    }
}
