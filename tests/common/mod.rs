#![allow(dead_code)]

pub use codomyrmex_test_utils::builders;
pub use codomyrmex_test_utils::fake_actions;
pub use codomyrmex_test_utils::{eventually, init_tracing, with_timeout};

use std::sync::Arc;

use codomyrmex::exec::{ActionRegistry, OrchestratorOptions, TaskOrchestrator};
use codomyrmex::resources::ResourceManager;
use codomyrmex::OrchestrationEngine;

use crate::common::builders::{engine_config, test_resources};

/// Started engine over the small deterministic resource pool.
pub fn engine(max_workers: usize, actions: ActionRegistry) -> OrchestrationEngine {
    let engine = OrchestrationEngine::with_resources(engine_config(max_workers), test_resources(), actions)
        .expect("engine builds");
    engine.start();
    engine
}

/// Started orchestrator with a fast poll interval.
pub fn orchestrator(
    max_workers: usize,
    resources: ResourceManager,
    actions: ActionRegistry,
) -> TaskOrchestrator {
    let orchestrator = TaskOrchestrator::new(
        OrchestratorOptions {
            max_workers,
            poll_interval: std::time::Duration::from_millis(5),
        },
        Arc::new(resources),
        Arc::new(actions),
    );
    orchestrator.start();
    orchestrator
}
