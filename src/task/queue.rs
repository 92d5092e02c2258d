// src/task/queue.rs

//! Dependency-aware priority queue and task registry.
//!
//! The queue owns every task the orchestrator has seen. Workers never hold a
//! task by reference; they get clones and report outcomes back by id, so the
//! registry here is the only place task state changes.
//!
//! Ordering: highest priority first, FIFO (submission order) among equal
//! priorities. A task is only handed out once every dependency is
//! `Completed`. Tasks whose dependencies can never complete are marked
//! `Skipped`, transitively.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::dag::DagValidationError;
use crate::errors::{OrchestratorError, Result};
use crate::task::{Task, TaskId, TaskResult};
use crate::types::{TaskPriority, TaskStatus};

/// Heap entry. At most one entry exists per `Pending` task; entries for
/// tasks that left `Pending` some other way are dropped lazily on pop.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: TaskPriority,
    seq: u64,
    task_id: TaskId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Counts of tasks per status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub by_status: BTreeMap<TaskStatus, usize>,
}

impl QueueCounts {
    pub fn get(&self, status: TaskStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.by_status.values().sum()
    }

    /// Tasks not yet in a terminal state.
    pub fn active(&self) -> usize {
        self.by_status
            .iter()
            .filter(|(status, _)| !status.is_terminal())
            .map(|(_, n)| n)
            .sum()
    }
}

/// Result of cancelling a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancellation {
    pub previous: TaskStatus,
    /// Dependents that were skipped as a consequence.
    pub skipped: Vec<TaskId>,
}

#[derive(Debug, Default)]
struct QueueState {
    tasks: HashMap<TaskId, Task>,
    seqs: HashMap<TaskId, u64>,
    heap: BinaryHeap<QueueEntry>,
    completed: HashSet<TaskId>,
    /// Reverse dependency index: task -> tasks that depend on it.
    dependents: HashMap<TaskId, BTreeSet<TaskId>>,
    next_seq: u64,
    /// Tasks per session currently `Ready` or `Running`.
    active_by_session: HashMap<String, usize>,
    session_limits: HashMap<String, usize>,
}

fn occupies_slot(status: TaskStatus) -> bool {
    matches!(status, TaskStatus::Ready | TaskStatus::Running)
}

impl QueueState {
    fn enqueue(&mut self, task_id: &str) {
        let (Some(task), Some(seq)) = (self.tasks.get(task_id), self.seqs.get(task_id)) else {
            return;
        };
        self.heap.push(QueueEntry {
            priority: task.priority,
            seq: *seq,
            task_id: task_id.to_string(),
        });
    }

    /// Move a task to `to`, keeping the per-session slot counts in step.
    fn transition(&mut self, task_id: &str, to: TaskStatus) -> Option<TaskStatus> {
        let task = self.tasks.get_mut(task_id)?;
        let from = task.status;
        task.status = to;

        if let Some(session) = task.session_id.as_ref() {
            match (occupies_slot(from), occupies_slot(to)) {
                (false, true) => {
                    *self.active_by_session.entry(session.clone()).or_default() += 1;
                }
                (true, false) => {
                    if let Some(n) = self.active_by_session.get_mut(session) {
                        *n = n.saturating_sub(1);
                        if *n == 0 {
                            self.active_by_session.remove(session);
                        }
                    }
                }
                _ => {}
            }
        }

        Some(from)
    }

    fn finish(&mut self, task_id: &str, to: TaskStatus, result: TaskResult) {
        self.transition(task_id, to);
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.result = Some(result);
            task.completed_at = Some(Utc::now());
            task.retry_at = None;
        }
    }

    fn deps_completed(&self, task: &Task) -> bool {
        task.dependencies
            .iter()
            .all(|dep| self.completed.contains(dep))
    }

    fn session_has_room(&self, task: &Task) -> bool {
        let Some(session) = task.session_id.as_ref() else {
            return true;
        };
        match self.session_limits.get(session) {
            Some(limit) => self.active_by_session.get(session).copied().unwrap_or(0) < *limit,
            None => true,
        }
    }

    /// Skip every non-terminal transitive dependent of `root`.
    fn cascade_skip(&mut self, root: &str) -> Vec<TaskId> {
        let mut stack: Vec<TaskId> = self
            .dependents
            .get(root)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default();
        let mut skipped = Vec::new();

        while let Some(id) = stack.pop() {
            let Some(task) = self.tasks.get(&id) else {
                continue;
            };
            if task.status.is_terminal() || task.status == TaskStatus::Running {
                continue;
            }

            let result = TaskResult::failure(
                format!("skipped: dependency '{root}' did not complete"),
                "dependency_failed",
                std::time::Duration::ZERO,
            );
            self.finish(&id, TaskStatus::Skipped, result);
            debug!(task = %id, cause = %root, "task skipped due to upstream failure");

            if let Some(next) = self.dependents.get(&id) {
                stack.extend(next.iter().cloned());
            }
            skipped.push(id);
        }

        skipped
    }
}

/// Thread-safe registry plus ready queue.
#[derive(Debug, Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task and queue it as `Pending`.
    ///
    /// A task that depends on itself, or on an id this queue has never
    /// seen, is rejected; dependencies must be submitted first. A task whose
    /// dependency already failed is skipped on arrival; its id is still
    /// returned and its status reflects the skip.
    pub fn push(&self, mut task: Task) -> Result<TaskId> {
        if task.id.is_empty() {
            task.id = uuid::Uuid::new_v4().to_string();
        }
        if task.dependencies.contains(&task.id) {
            return Err(OrchestratorError::Validation(vec![
                DagValidationError::SelfDependency {
                    task: task.id.clone(),
                },
            ]));
        }

        let mut state = self.state.lock();
        if state.tasks.contains_key(&task.id) {
            return Err(OrchestratorError::InvalidState(format!(
                "task '{}' is already registered",
                task.id
            )));
        }

        let id = task.id.clone();
        let dangling: Vec<DagValidationError> = task
            .dependencies
            .iter()
            .filter(|dep| !state.tasks.contains_key(*dep))
            .map(|dep| DagValidationError::DanglingDependency {
                task: id.clone(),
                dependency: dep.clone(),
            })
            .collect();
        if !dangling.is_empty() {
            return Err(OrchestratorError::Validation(dangling));
        }

        let blocked_by = task
            .dependencies
            .iter()
            .find(|dep| {
                state
                    .tasks
                    .get(*dep)
                    .is_some_and(|t| t.status.blocks_dependents())
            })
            .cloned();

        for dep in &task.dependencies {
            state
                .dependents
                .entry(dep.clone())
                .or_default()
                .insert(id.clone());
        }

        task.status = TaskStatus::Pending;
        task.retry_count = 0;
        task.attempts = 0;
        task.retry_at = None;
        task.started_at = None;
        task.completed_at = None;
        task.result = None;

        let seq = state.next_seq;
        state.next_seq += 1;
        state.seqs.insert(id.clone(), seq);
        state.tasks.insert(id.clone(), task);

        match blocked_by {
            Some(dep) => {
                let result = TaskResult::failure(
                    format!("skipped: dependency '{dep}' did not complete"),
                    "dependency_failed",
                    std::time::Duration::ZERO,
                );
                state.finish(&id, TaskStatus::Skipped, result);
                debug!(task = %id, cause = %dep, "task skipped on arrival");
            }
            None => state.enqueue(&id),
        }

        Ok(id)
    }

    /// Take the best eligible task and mark it `Ready`.
    ///
    /// Eligible means `Pending`, every dependency completed, any retry delay
    /// elapsed, not in `skip`, and the owning session under its cap. Entries
    /// inspected but not taken are put back, so the heap is left unchanged
    /// apart from the returned task and dropped stale entries.
    pub fn next_ready(&self, now: DateTime<Utc>, skip: &HashSet<TaskId>) -> Option<Task> {
        let mut state = self.state.lock();
        let mut held_back = Vec::new();
        let mut chosen = None;

        while let Some(entry) = state.heap.pop() {
            let Some(task) = state.tasks.get(&entry.task_id) else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }

            let delayed = task.retry_at.is_some_and(|at| at > now);
            if delayed
                || skip.contains(&entry.task_id)
                || !state.deps_completed(task)
                || !state.session_has_room(task)
            {
                held_back.push(entry);
                continue;
            }

            chosen = Some(entry.task_id);
            break;
        }

        state.heap.extend(held_back);

        let id = chosen?;
        state.transition(&id, TaskStatus::Ready);
        state.tasks.get(&id).cloned()
    }

    /// Put a `Ready` task back to `Pending`, keeping its original place.
    pub fn requeue(&self, task_id: &str) -> bool {
        let mut state = self.state.lock();
        if state.tasks.get(task_id).map(|t| t.status) != Some(TaskStatus::Ready) {
            return false;
        }
        state.transition(task_id, TaskStatus::Pending);
        state.enqueue(task_id);
        true
    }

    /// `Ready` -> `Running`. Returns the updated task, or `None` if the task
    /// was cancelled or skipped after it was handed out.
    pub fn mark_running(&self, task_id: &str) -> Option<Task> {
        let mut state = self.state.lock();
        if state.tasks.get(task_id)?.status != TaskStatus::Ready {
            return None;
        }
        state.transition(task_id, TaskStatus::Running);

        let task = state.tasks.get_mut(task_id)?;
        task.attempts += 1;
        task.retry_at = None;
        if task.started_at.is_none() {
            task.started_at = Some(Utc::now());
        }
        Some(task.clone())
    }

    /// `Running` -> `Completed`. No-op (returns false) if the task is no
    /// longer running, e.g. it was cancelled mid-flight.
    pub fn complete(&self, task_id: &str, result: TaskResult) -> bool {
        let mut state = self.state.lock();
        if state.tasks.get(task_id).map(|t| t.status) != Some(TaskStatus::Running) {
            return false;
        }
        state.finish(task_id, TaskStatus::Completed, result);
        state.completed.insert(task_id.to_string());
        true
    }

    /// `Running` -> `Pending` for another attempt no earlier than `retry_at`.
    pub fn retry(&self, task_id: &str, result: TaskResult, retry_at: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        if state.tasks.get(task_id).map(|t| t.status) != Some(TaskStatus::Running) {
            return false;
        }
        state.transition(task_id, TaskStatus::Pending);
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.retry_count += 1;
            task.retry_at = Some(retry_at);
            task.result = Some(result);
        }
        state.enqueue(task_id);
        true
    }

    /// Mark a non-terminal task `Failed` and skip its dependents.
    ///
    /// Returns `None` if the task is unknown or already terminal, otherwise
    /// the ids of the dependents that were skipped.
    pub fn fail(&self, task_id: &str, result: TaskResult) -> Option<Vec<TaskId>> {
        let mut state = self.state.lock();
        if state.tasks.get(task_id)?.status.is_terminal() {
            return None;
        }
        state.finish(task_id, TaskStatus::Failed, result);
        Some(state.cascade_skip(task_id))
    }

    /// Cancel a task and skip its dependents.
    ///
    /// Unknown id is an error; cancelling a terminal task is a no-op
    /// (`Ok(None)`).
    pub fn cancel(&self, task_id: &str) -> Result<Option<Cancellation>> {
        let mut state = self.state.lock();
        let previous = state
            .tasks
            .get(task_id)
            .map(|t| t.status)
            .ok_or_else(|| OrchestratorError::UnknownTask(task_id.to_string()))?;
        if previous.is_terminal() {
            return Ok(None);
        }

        let result = TaskResult::failure("task cancelled", "cancelled", std::time::Duration::ZERO);
        state.finish(task_id, TaskStatus::Cancelled, result);
        let skipped = state.cascade_skip(task_id);
        Ok(Some(Cancellation { previous, skipped }))
    }

    /// Cap the number of `Ready`/`Running` tasks of a session; `None` lifts
    /// the cap.
    pub fn set_session_limit(&self, session_id: &str, limit: Option<usize>) {
        let mut state = self.state.lock();
        match limit {
            Some(n) => state.session_limits.insert(session_id.to_string(), n),
            None => state.session_limits.remove(session_id),
        };
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.state.lock().tasks.get(task_id).cloned()
    }

    pub fn status_of(&self, task_id: &str) -> Option<TaskStatus> {
        self.state.lock().tasks.get(task_id).map(|t| t.status)
    }

    /// All tasks in submission order.
    pub fn tasks(&self) -> Vec<Task> {
        let state = self.state.lock();
        let mut tasks: Vec<(u64, Task)> = state
            .tasks
            .values()
            .map(|t| (state.seqs.get(&t.id).copied().unwrap_or(u64::MAX), t.clone()))
            .collect();
        tasks.sort_by_key(|(seq, _)| *seq);
        tasks.into_iter().map(|(_, t)| t).collect()
    }

    pub fn tasks_in_session(&self, session_id: &str) -> Vec<TaskId> {
        self.tasks()
            .into_iter()
            .filter(|t| t.session_id.as_deref() == Some(session_id))
            .map(|t| t.id)
            .collect()
    }

    pub fn counts(&self) -> QueueCounts {
        let state = self.state.lock();
        let mut counts = QueueCounts::default();
        for task in state.tasks.values() {
            *counts.by_status.entry(task.status).or_default() += 1;
        }
        counts
    }

    /// Whether every listed task is terminal. Unknown ids count as terminal.
    pub fn all_terminal(&self, ids: &[TaskId]) -> bool {
        let state = self.state.lock();
        ids.iter().all(|id| {
            state
                .tasks
                .get(id)
                .is_none_or(|t| t.status.is_terminal())
        })
    }

    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
