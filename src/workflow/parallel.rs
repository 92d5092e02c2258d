// src/workflow/parallel.rs

//! Level-by-level execution of a flat task list.
//!
//! Unlike workflows submitted through the [`TaskOrchestrator`], this runner
//! does not touch the shared queue or the resource manager: it builds a
//! [`WorkflowDag`] from the tasks, then runs each DAG level concurrently
//! (bounded by `max_parallel`) and only starts a level once the previous one
//! has finished.
//!
//! [`TaskOrchestrator`]: crate::exec::TaskOrchestrator

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dag::{DagValidationError, WorkflowDag};
use crate::errors::{OrchestratorError, Result};
use crate::exec::ActionRegistry;
use crate::exec::task_runner::invoke_action;
use crate::task::{Task, TaskId, TaskResult};
use crate::types::TaskStatus;

/// Overall result of a parallel run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelRunStatus {
    Completed,
    /// Some tasks completed, others failed or were skipped.
    PartialFailure,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParallelTaskOutcome {
    pub level: usize,
    pub status: TaskStatus,
    pub attempts: u32,
    pub result: Option<TaskResult>,
}

fn as_secs<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParallelRunSummary {
    pub status: ParallelRunStatus,
    pub levels: Vec<Vec<TaskId>>,
    pub outcomes: BTreeMap<TaskId, ParallelTaskOutcome>,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    #[serde(rename = "duration_secs", serialize_with = "as_secs")]
    pub duration: Duration,
}

impl ParallelRunSummary {
    pub fn status_of(&self, task_id: &str) -> Option<TaskStatus> {
        self.outcomes.get(task_id).map(|o| o.status)
    }
}

/// Run `tasks` level by level.
///
/// Each task's dependencies are its own `dependencies` plus the entries of
/// `dependencies` keyed by its id. Tasks depending on a failed or skipped
/// task are skipped. Invalid graphs (duplicate ids, unknown dependency
/// names, self-dependencies, cycles) are rejected before anything runs.
pub async fn execute_parallel_workflow(
    actions: Arc<ActionRegistry>,
    tasks: Vec<Task>,
    dependencies: &BTreeMap<TaskId, Vec<TaskId>>,
    max_parallel: usize,
) -> Result<ParallelRunSummary> {
    let started = Instant::now();

    let mut seen = HashSet::new();
    let duplicates: Vec<DagValidationError> = tasks
        .iter()
        .filter(|t| !seen.insert(t.id.clone()))
        .map(|t| DagValidationError::DuplicateTask { name: t.id.clone() })
        .collect();
    if !duplicates.is_empty() {
        return Err(OrchestratorError::Validation(duplicates));
    }

    if let Some(unknown) = dependencies.keys().find(|k| !seen.contains(*k)) {
        return Err(OrchestratorError::UnknownTask(unknown.clone()));
    }

    let mut by_id: HashMap<TaskId, Task> = HashMap::new();
    for mut task in tasks {
        if let Some(extra) = dependencies.get(&task.id) {
            task.dependencies.extend(extra.iter().cloned());
        }
        by_id.insert(task.id.clone(), task);
    }

    let dag = WorkflowDag::from_dependencies(
        by_id
            .values()
            .map(|t| (t.id.clone(), t.dependencies.iter().cloned().collect::<Vec<_>>())),
    );
    dag.validate().into_result()?;
    let levels = dag.execution_order()?;

    let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
    let mut outcomes: BTreeMap<TaskId, ParallelTaskOutcome> = BTreeMap::new();
    let mut blocked: BTreeSet<TaskId> = BTreeSet::new();

    for (level, ids) in levels.iter().enumerate() {
        debug!(level, tasks = ids.len(), "running parallel level");
        let mut set = JoinSet::new();
        let mut spawned: HashMap<tokio::task::Id, TaskId> = HashMap::new();

        for id in ids {
            let Some(task) = by_id.remove(id) else {
                continue;
            };

            if let Some(upstream) = task.dependencies.iter().find(|d| blocked.contains(*d)) {
                let result = TaskResult::failure(
                    format!("skipped: dependency '{upstream}' did not complete"),
                    "dependency_failed",
                    Duration::ZERO,
                );
                outcomes.insert(
                    id.clone(),
                    ParallelTaskOutcome {
                        level,
                        status: TaskStatus::Skipped,
                        attempts: 0,
                        result: Some(result),
                    },
                );
                blocked.insert(id.clone());
                continue;
            }

            let actions = Arc::clone(&actions);
            let semaphore = Arc::clone(&semaphore);
            let handle = set.spawn(async move {
                // The semaphore is never closed.
                let _permit = semaphore.acquire_owned().await.ok();
                let (status, attempts, result) = run_with_retries(&actions, &task).await;
                (task.id, status, attempts, result)
            });
            spawned.insert(handle.id(), id.clone());
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, status, attempts, result)) => {
                    if status != TaskStatus::Completed {
                        blocked.insert(id.clone());
                    }
                    outcomes.insert(
                        id,
                        ParallelTaskOutcome {
                            level,
                            status,
                            attempts,
                            result: Some(result),
                        },
                    );
                }
                Err(e) => {
                    let Some(id) = spawned.get(&e.id()).cloned() else {
                        continue;
                    };
                    warn!(task = %id, error = %e, "parallel task worker ended abnormally");
                    blocked.insert(id.clone());
                    outcomes.insert(
                        id,
                        ParallelTaskOutcome {
                            level,
                            status: TaskStatus::Failed,
                            attempts: 0,
                            result: Some(TaskResult::failure(
                                e.to_string(),
                                "panicked",
                                Duration::ZERO,
                            )),
                        },
                    );
                }
            }
        }
    }

    let count = |s: TaskStatus| outcomes.values().filter(|o| o.status == s).count();
    let completed = count(TaskStatus::Completed);
    let failed = count(TaskStatus::Failed);
    let skipped = count(TaskStatus::Skipped);

    let status = if failed == 0 && skipped == 0 {
        ParallelRunStatus::Completed
    } else if completed > 0 {
        ParallelRunStatus::PartialFailure
    } else {
        ParallelRunStatus::Failed
    };

    let summary = ParallelRunSummary {
        status,
        levels,
        outcomes,
        completed,
        failed,
        skipped,
        duration: started.elapsed(),
    };

    info!(
        status = ?summary.status,
        completed,
        failed,
        skipped,
        duration_ms = summary.duration.as_millis() as u64,
        "parallel run finished"
    );
    Ok(summary)
}

async fn run_with_retries(actions: &ActionRegistry, task: &Task) -> (TaskStatus, u32, TaskResult) {
    let mut attempt = 1;

    loop {
        let (outcome, elapsed) =
            invoke_action(actions, task, attempt, CancellationToken::new()).await;

        match outcome {
            Ok(data) => {
                let result = TaskResult::success(data, elapsed).with_metadata("attempts", attempt);
                return (TaskStatus::Completed, attempt, result);
            }
            Err(err) if err.is_retryable() && attempt <= task.max_retries => {
                warn!(
                    task = %task.id,
                    attempt,
                    error = %err,
                    "parallel task attempt failed; will retry"
                );
                tokio::time::sleep(task.retry_delay).await;
                attempt += 1;
            }
            Err(err) => {
                let result = TaskResult::failure(err.to_string(), err.kind(), elapsed)
                    .with_metadata("attempts", attempt);
                return (TaskStatus::Failed, attempt, result);
            }
        }
    }
}
