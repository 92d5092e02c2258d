// src/dag/mod.rs

//! Task dependency graph.
//!
//! - [`graph`] holds [`WorkflowDag`], a named-node DAG that validates itself
//!   and derives a leveled execution order (each level can run in parallel).
//! - [`validation`] contains the structured validation errors and report.

pub mod graph;
pub mod validation;

pub use graph::WorkflowDag;
pub use validation::{DagValidationError, ValidationReport};
