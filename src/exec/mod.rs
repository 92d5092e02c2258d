// src/exec/mod.rs

//! Task execution layer.
//!
//! - [`backend`] defines the [`ActionHandler`] trait and the
//!   [`ActionRegistry`] that maps `module.action` to handlers.
//! - [`orchestrator`] owns the [`TaskOrchestrator`] handle: submission,
//!   cancellation, waiting and statistics.
//! - [`executor_loop`] is the dispatcher that pairs ready tasks with free
//!   workers and resource grants.
//! - [`task_runner`] runs one task: timeout, panic isolation, retry and
//!   resource release.

pub mod backend;
pub(crate) mod executor_loop;
pub mod orchestrator;
pub(crate) mod task_runner;

pub use backend::{ActionContext, ActionError, ActionFuture, ActionHandler, ActionRegistry};
pub use orchestrator::{
    ExecutionStats, OrchestratorOptions, TaskEvent, TaskEventKind, TaskOrchestrator,
};
