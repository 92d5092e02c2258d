// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

use crate::dag::DagValidationError;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("DAG validation failed: {}", join_errors(.0))]
    Validation(Vec<DagValidationError>),

    #[error("Task not found: {0}")]
    UnknownTask(String),

    #[error("Workflow not found: {0}")]
    UnknownWorkflow(String),

    #[error("Session not found: {0}")]
    UnknownSession(String),

    #[error("Resource not found: {0}")]
    UnknownResource(String),

    #[error("Resource '{0}' still has active users")]
    ResourceBusy(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Validation errors carried by this error, if it is a DAG validation failure.
    pub fn validation_errors(&self) -> Option<&[DagValidationError]> {
        match self {
            OrchestratorError::Validation(errors) => Some(errors.as_slice()),
            _ => None,
        }
    }
}

fn join_errors(errors: &[DagValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, OrchestratorError>;
