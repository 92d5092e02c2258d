#![allow(dead_code)]

use std::collections::BTreeMap;

use codomyrmex::config::{
    ClaimDefinition, EngineConfig, ResourceDefinition, ResourceFile, StepDefinition, WorkflowFile,
};
use codomyrmex::resources::{Resource, ResourceManager};
use codomyrmex::types::{AccessMode, ResourceType, TaskPriority};
use codomyrmex::workflow::WorkflowStep;

/// Engine config tuned for tests: short poll interval and retry delay.
pub fn engine_config(max_workers: usize) -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.orchestrator.max_workers = max_workers;
    cfg.orchestrator.poll_interval_ms = 5;
    cfg.orchestrator.default_retry_delay_ms = 10;
    cfg.resources.sweep_interval_secs = 1;
    cfg
}

fn amounts(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

pub fn cpu(id: &str, cores: f64) -> Resource {
    Resource::new(id, id, ResourceType::Cpu, amounts(&[("cores", cores)]))
}

pub fn memory(id: &str, gb: f64) -> Resource {
    Resource::new(id, id, ResourceType::Memory, amounts(&[("gb", gb)]))
}

/// Capacity-less lock resource; only access modes matter.
pub fn lock(id: &str) -> Resource {
    Resource::new(id, id, ResourceType::Lock, BTreeMap::new())
}

/// Small deterministic resource pool: 4 cores, 8 GB and one lock.
pub fn test_resources() -> ResourceManager {
    ResourceManager::new(vec![cpu("cpu-0", 4.0), memory("mem-0", 8.0), lock("db")])
}

/// Steps `names[0] -> names[1] -> ...`, all running `module.action`.
pub fn chain_steps(module: &str, action: &str, names: &[&str]) -> Vec<WorkflowStep> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let step = WorkflowStep::new(*name, module, action);
            match i {
                0 => step,
                _ => step.depends_on(names[i - 1]),
            }
        })
        .collect()
}

/// Builder for `WorkflowFile` to simplify config tests.
pub struct WorkflowFileBuilder {
    file: WorkflowFile,
}

impl WorkflowFileBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            file: WorkflowFile {
                name: name.to_string(),
                description: None,
                steps: Vec::new(),
            },
        }
    }

    pub fn description(mut self, text: &str) -> Self {
        self.file.description = Some(text.to_string());
        self
    }

    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.file.steps.push(step);
        self
    }

    pub fn build(self) -> WorkflowFile {
        self.file
    }

    pub fn to_toml(&self) -> String {
        toml::to_string(&self.file).expect("workflow file serializes")
    }
}

/// Builder for `StepDefinition`.
pub struct StepBuilder {
    step: StepDefinition,
}

impl StepBuilder {
    pub fn new(name: &str, module: &str, action: &str) -> Self {
        Self {
            step: StepDefinition {
                name: name.to_string(),
                module: module.to_string(),
                action: action.to_string(),
                parameters: serde_json::Map::new(),
                depends_on: vec![],
                timeout_secs: None,
                max_retries: None,
                retry_delay_secs: None,
                priority: None,
                resources: vec![],
            },
        }
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.step.depends_on.push(dep.to_string());
        self
    }

    pub fn param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.step.parameters.insert(key.to_string(), value);
        self
    }

    pub fn timeout_secs(mut self, secs: f64) -> Self {
        self.step.timeout_secs = Some(secs);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.step.max_retries = Some(n);
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.step.priority = Some(priority);
        self
    }

    pub fn claim(mut self, resource_type: ResourceType, mode: AccessMode) -> Self {
        self.step.resources.push(ClaimDefinition {
            resource_type,
            identifier: None,
            mode,
            amounts: BTreeMap::new(),
        });
        self
    }

    pub fn build(self) -> StepDefinition {
        self.step
    }
}

/// Resource file with the given resources, ready to be saved.
pub fn resource_file(resources: &[Resource]) -> ResourceFile {
    ResourceFile {
        resources: resources.iter().map(ResourceDefinition::from).collect(),
    }
}
