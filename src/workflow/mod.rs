// src/workflow/mod.rs

//! Named workflows: definitions, executions and the level-parallel runner.

pub mod manager;
pub mod model;
pub mod parallel;

pub use manager::{StepDefaults, WorkflowManager};
pub use model::{ExecuteOptions, StepOutcome, Workflow, WorkflowExecution, WorkflowStep};
pub use parallel::{
    ParallelRunStatus, ParallelRunSummary, ParallelTaskOutcome, execute_parallel_workflow,
};
