// src/engine/mod.rs

//! Orchestration engine.
//!
//! This module ties together:
//! - the resource manager and its expiry sweep
//! - the task orchestrator (queue, dispatcher, workers)
//! - the workflow manager
//! - sessions, lifecycle events and status/health reporting
//!
//! The façade lives in [`core`]; [`session`], [`events`] and [`status`] hold
//! the supporting types.

pub mod core;
pub mod events;
pub mod session;
pub mod status;

pub use core::OrchestrationEngine;
pub use events::{EventBus, EventHandler, OrchestrationEvent};
pub use session::{OrchestrationSession, SessionId, SessionOptions, SessionStore};
pub use status::{
    HealthReport, SessionSummary, SystemStatus, TaskOutcome, WorkflowOutcome, WorkflowSummary,
};
