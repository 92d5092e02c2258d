// src/exec/orchestrator.rs

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OrchestratorSection;
use crate::errors::Result;
use crate::exec::backend::ActionRegistry;
use crate::exec::executor_loop::spawn_dispatcher;
use crate::resources::ResourceManager;
use crate::task::queue::QueueCounts;
use crate::task::{Task, TaskId, TaskQueue, TaskResult};
use crate::types::{ComponentHealth, TaskStatus};

const EVENT_CAPACITY: usize = 1024;
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub max_workers: usize,
    pub poll_interval: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self::from(&OrchestratorSection::default())
    }
}

impl From<&OrchestratorSection> for OrchestratorOptions {
    fn from(section: &OrchestratorSection) -> Self {
        Self {
            max_workers: section.max_workers.max(1),
            poll_interval: section.poll_interval(),
        }
    }
}

/// What happened to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskEventKind {
    Started,
    Completed,
    Retrying,
    Failed,
    Cancelled,
    Skipped,
}

/// Lifecycle notification broadcast by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskEvent {
    pub kind: TaskEventKind,
    pub task_id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub session_id: Option<String>,
    pub attempts: u32,
    pub error: Option<String>,
}

impl TaskEvent {
    fn from_task(kind: TaskEventKind, task: &Task) -> Self {
        Self {
            kind,
            task_id: task.id.clone(),
            name: task.name.clone(),
            status: task.status,
            session_id: task.session_id.clone(),
            attempts: task.attempts,
            error: task.result.as_ref().and_then(|r| r.error.clone()),
        }
    }
}

/// Aggregate execution statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionStats {
    pub total_tasks: usize,
    pub by_status: BTreeMap<String, usize>,
    pub total_retries: u64,
    pub total_execution_secs: f64,
    pub average_execution_secs: f64,
    pub active_workers: usize,
    pub max_workers: usize,
    pub is_running: bool,
}

/// State shared between the orchestrator handle, the dispatcher loop and
/// the workers.
pub(crate) struct Shared {
    pub(crate) queue: TaskQueue,
    pub(crate) resources: Arc<ResourceManager>,
    pub(crate) actions: Arc<ActionRegistry>,
    pub(crate) workers: Arc<Semaphore>,
    pub(crate) options: OrchestratorOptions,
    /// Wakes the dispatcher early: new work, a finished task, a cancellation.
    pub(crate) wake: Notify,
    /// Cancellation tokens of tasks currently executing.
    pub(crate) running: Mutex<HashMap<TaskId, CancellationToken>>,
    events: broadcast::Sender<TaskEvent>,
}

impl Shared {
    pub(crate) fn emit(&self, kind: TaskEventKind, task_id: &str) {
        if let Some(task) = self.queue.get(task_id) {
            // No subscribers is fine.
            let _ = self.events.send(TaskEvent::from_task(kind, &task));
        }
    }

    pub(crate) fn emit_skipped(&self, skipped: &[TaskId]) {
        for id in skipped {
            self.emit(TaskEventKind::Skipped, id);
        }
    }
}

/// Runs tasks from a shared priority queue on a bounded worker pool.
///
/// The dispatcher loop hands the best eligible task to a free worker after
/// granting the task's resource claims. Workers execute the action, release
/// the claims, and record the outcome back into the queue.
pub struct TaskOrchestrator {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl TaskOrchestrator {
    pub fn new(
        options: OrchestratorOptions,
        resources: Arc<ResourceManager>,
        actions: Arc<ActionRegistry>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let max_workers = options.max_workers.max(1);

        Self {
            shared: Arc::new(Shared {
                queue: TaskQueue::new(),
                resources,
                actions,
                workers: Arc::new(Semaphore::new(max_workers)),
                options: OrchestratorOptions {
                    max_workers,
                    ..options
                },
                wake: Notify::new(),
                running: Mutex::new(HashMap::new()),
                events,
            }),
            dispatcher: Mutex::new(None),
        }
    }

    /// Start the dispatcher loop. Idempotent. Must be called inside a Tokio
    /// runtime.
    pub fn start(&self) {
        let mut dispatcher = self.dispatcher.lock();
        if let Some((_, handle)) = dispatcher.as_ref() {
            if !handle.is_finished() {
                debug!("orchestrator already running");
                return;
            }
        }

        let token = CancellationToken::new();
        let handle = spawn_dispatcher(Arc::clone(&self.shared), token.clone());
        *dispatcher = Some((token, handle));
        info!(
            max_workers = self.shared.options.max_workers,
            "task orchestrator started"
        );
    }

    /// Stop dispatching new work and wait briefly for the loop to exit.
    ///
    /// Tasks already executing keep running and still record their outcome.
    pub async fn stop(&self) {
        let Some((token, handle)) = self.dispatcher.lock().take() else {
            return;
        };
        token.cancel();

        match tokio::time::timeout(STOP_GRACE, handle).await {
            Ok(Ok(())) => info!("task orchestrator stopped"),
            Ok(Err(e)) => warn!(error = %e, "dispatcher loop ended abnormally"),
            Err(_) => warn!("dispatcher loop did not stop within grace period"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher
            .lock()
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Submit a task. Returns its id.
    pub fn add_task(&self, task: Task) -> Result<TaskId> {
        let name = task.name.clone();
        let id = self.shared.queue.push(task)?;
        debug!(task = %name, id = %id, "task submitted");

        if self.shared.queue.status_of(&id) == Some(TaskStatus::Skipped) {
            self.shared.emit(TaskEventKind::Skipped, &id);
        }
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Cancel a task that has not finished yet.
    ///
    /// Returns `Ok(false)` if the task was already terminal. A running
    /// task's cancellation token is fired and its worker is aborted at the
    /// next await point; work that never yields runs to completion, but its
    /// outcome is discarded.
    pub fn cancel_task(&self, task_id: &str) -> Result<bool> {
        let Some(cancellation) = self.shared.queue.cancel(task_id)? else {
            return Ok(false);
        };

        if cancellation.previous == TaskStatus::Running {
            if let Some(token) = self.shared.running.lock().get(task_id) {
                token.cancel();
            }
        }
        self.shared.resources.deallocate_resources(task_id, None);

        info!(
            task = %task_id,
            previous = %cancellation.previous,
            skipped = cancellation.skipped.len(),
            "task cancelled"
        );
        self.shared.emit(TaskEventKind::Cancelled, task_id);
        self.shared.emit_skipped(&cancellation.skipped);
        self.shared.wake.notify_one();
        Ok(true)
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.shared.queue.get(task_id)
    }

    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.shared.queue.status_of(task_id)
    }

    pub fn task_result(&self, task_id: &str) -> Option<TaskResult> {
        self.shared.queue.get(task_id).and_then(|t| t.result)
    }

    /// All tasks in submission order.
    pub fn tasks(&self) -> Vec<Task> {
        self.shared.queue.tasks()
    }

    pub fn tasks_in_session(&self, session_id: &str) -> Vec<TaskId> {
        self.shared.queue.tasks_in_session(session_id)
    }

    /// Cap concurrent tasks of a session; `None` removes the cap.
    pub fn set_session_limit(&self, session_id: &str, limit: Option<usize>) {
        self.shared.queue.set_session_limit(session_id, limit);
        self.shared.wake.notify_one();
    }

    /// Wait until no task is pending, ready or running.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_for_completion(&self, timeout: Option<Duration>) -> bool {
        self.wait_until(timeout, || self.shared.queue.counts().active() == 0)
            .await
    }

    /// Wait until every listed task is terminal.
    pub async fn wait_for_tasks(&self, ids: &[TaskId], timeout: Option<Duration>) -> bool {
        self.wait_until(timeout, || self.shared.queue.all_terminal(ids))
            .await
    }

    async fn wait_until(&self, timeout: Option<Duration>, done: impl Fn() -> bool) -> bool {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let poll = self.shared.options.poll_interval;

        loop {
            if done() {
                return true;
            }
            if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub fn execution_stats(&self) -> ExecutionStats {
        let tasks = self.shared.queue.tasks();
        let counts = self.shared.queue.counts();

        let finished: Vec<Duration> = tasks
            .iter()
            .filter(|t| t.is_terminal())
            .filter_map(Task::execution_time)
            .collect();
        let total: f64 = finished.iter().map(Duration::as_secs_f64).sum();
        let average = if finished.is_empty() {
            0.0
        } else {
            total / finished.len() as f64
        };

        ExecutionStats {
            total_tasks: counts.total(),
            by_status: by_status_names(&counts),
            total_retries: tasks.iter().map(|t| u64::from(t.retry_count)).sum(),
            total_execution_secs: total,
            average_execution_secs: average,
            active_workers: self.active_workers(),
            max_workers: self.shared.options.max_workers,
            is_running: self.is_running(),
        }
    }

    pub fn active_workers(&self) -> usize {
        self.shared.options.max_workers - self.shared.workers.available_permits()
    }

    /// Subscribe to task lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.shared.events.subscribe()
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.shared.resources
    }

    pub fn actions(&self) -> &Arc<ActionRegistry> {
        &self.shared.actions
    }

    pub fn health(&self) -> ComponentHealth {
        let mut issues = Vec::new();
        let counts = self.shared.queue.counts();

        if !self.is_running() && counts.active() > 0 {
            issues.push(format!(
                "dispatcher is not running with {} unfinished task(s)",
                counts.active()
            ));
        }

        let finished = counts.get(TaskStatus::Completed) + counts.get(TaskStatus::Failed);
        let failed = counts.get(TaskStatus::Failed);
        if finished >= 10 && failed * 2 > finished {
            issues.push(format!("{failed} of {finished} finished task(s) failed"));
        }

        ComponentHealth::from_issues(issues)
    }
}

impl Drop for TaskOrchestrator {
    fn drop(&mut self) {
        if let Some((token, _)) = self.dispatcher.get_mut().take() {
            token.cancel();
        }
    }
}

fn by_status_names(counts: &QueueCounts) -> BTreeMap<String, usize> {
    counts
        .by_status
        .iter()
        .map(|(status, n)| (status.to_string(), *n))
        .collect()
}
