// src/config/mod.rs

//! Configuration loading and validation.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`): engine config, workflow
//!   definition files and persisted resource definitions.
//! - Load and save those files (`loader.rs`).
//! - Validate invariants such as workflow DAG correctness (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{
    load_engine_config, load_resource_file, load_workflow_dir, load_workflow_file,
    save_resource_file,
};
pub use model::{
    ClaimDefinition, EngineConfig, LoggingSection, OrchestratorSection, ResourceDefinition,
    ResourceFile, ResourceSection, StepDefinition, WorkflowFile, WorkflowSection,
};
pub use validate::{step_dag, validate_engine_config, validate_steps};
