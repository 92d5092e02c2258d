// src/exec/task_runner.rs

//! Single-task execution: one attempt of an action, and the worker that
//! turns attempts into task state.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::exec::backend::{ActionContext, ActionError, ActionRegistry};
use crate::exec::orchestrator::{Shared, TaskEventKind};
use crate::resources::ResourceManager;
use crate::task::{Task, TaskResult};

/// Run one attempt of `task`'s action.
///
/// The handler runs in its own Tokio task so a panic is contained and
/// reported as [`ActionError::Panicked`]. When the task has a timeout and it
/// elapses, or when `cancel` fires, the token is cancelled and the handler
/// task aborted; work that never yields keeps running in the background but
/// its result is dropped.
pub(crate) async fn invoke_action(
    actions: &ActionRegistry,
    task: &Task,
    attempt: u32,
    cancel: CancellationToken,
) -> (Result<Value, ActionError>, Duration) {
    let started = Instant::now();

    let Some(handler) = actions.resolve(&task.module, &task.action) else {
        return (
            Err(ActionError::NotFound {
                module: task.module.clone(),
                action: task.action.clone(),
            }),
            started.elapsed(),
        );
    };

    let ctx = ActionContext::for_task(task, attempt, cancel.clone());
    let mut handle = tokio::spawn(handler.invoke(ctx));

    let limit = task.timeout;
    let expired = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    let outcome = tokio::select! {
        joined = &mut handle => flatten_join(joined),
        _ = expired => {
            cancel.cancel();
            handle.abort();
            Err(ActionError::Timeout(limit.unwrap_or_default()))
        }
        _ = cancel.cancelled() => {
            handle.abort();
            Err(ActionError::Cancelled)
        }
    };

    (outcome, started.elapsed())
}

fn flatten_join(
    joined: std::result::Result<Result<Value, ActionError>, JoinError>,
) -> Result<Value, ActionError> {
    match joined {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => Err(ActionError::Panicked(panic_message(e.into_panic()))),
        Err(_) => Err(ActionError::Cancelled),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Releases a task's resource claims when dropped, whatever path the worker
/// took.
struct ClaimGuard {
    resources: Arc<ResourceManager>,
    user: String,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.resources.deallocate_resources(&self.user, None);
    }
}

/// Worker body: execute one dispatched task and record the outcome.
///
/// The permit is held for the lifetime of the worker, bounding concurrency.
pub(crate) async fn run_task(shared: Arc<Shared>, task_id: String, _permit: OwnedSemaphorePermit) {
    let claims = ClaimGuard {
        resources: Arc::clone(&shared.resources),
        user: task_id.clone(),
    };

    // The token must exist before the task turns Running: a cancel that
    // observes Running looks it up.
    let cancel = CancellationToken::new();
    shared
        .running
        .lock()
        .insert(task_id.clone(), cancel.clone());

    let Some(task) = shared.queue.mark_running(&task_id) else {
        debug!(task = %task_id, "task left Ready before it could start; dropping");
        shared.running.lock().remove(&task_id);
        drop(claims);
        shared.wake.notify_one();
        return;
    };

    shared.emit(TaskEventKind::Started, &task.id);

    info!(
        task = %task.name,
        id = %task.id,
        action = %format!("{}.{}", task.module, task.action),
        attempt = task.attempts,
        "starting task"
    );

    let (outcome, elapsed) = invoke_action(&shared.actions, &task, task.attempts, cancel).await;

    shared.running.lock().remove(&task.id);
    drop(claims);

    record_outcome(&shared, &task, outcome, elapsed);
    shared.wake.notify_one();
}

fn record_outcome(
    shared: &Shared,
    task: &Task,
    outcome: Result<Value, ActionError>,
    elapsed: Duration,
) {
    match outcome {
        Ok(data) => {
            let result =
                TaskResult::success(data, elapsed).with_metadata("attempts", task.attempts);
            if shared.queue.complete(&task.id, result) {
                info!(
                    task = %task.name,
                    id = %task.id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "task completed"
                );
                shared.emit(TaskEventKind::Completed, &task.id);
            } else {
                debug!(task = %task.name, "task no longer running; result discarded");
            }
        }

        Err(err) => {
            let result = TaskResult::failure(err.to_string(), err.kind(), elapsed)
                .with_metadata("attempts", task.attempts);

            if err.is_retryable() && task.retry_count < task.max_retries {
                let delay = chrono::Duration::from_std(task.retry_delay)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                let retry_at = Utc::now() + delay;

                if shared.queue.retry(&task.id, result, retry_at) {
                    warn!(
                        task = %task.name,
                        id = %task.id,
                        attempt = task.attempts,
                        max_retries = task.max_retries,
                        retry_in_ms = task.retry_delay.as_millis() as u64,
                        error = %err,
                        "task attempt failed; will retry"
                    );
                    shared.emit(TaskEventKind::Retrying, &task.id);
                }
                return;
            }

            match shared.queue.fail(&task.id, result) {
                Some(skipped) => {
                    error!(
                        task = %task.name,
                        id = %task.id,
                        attempts = task.attempts,
                        error = %err,
                        "task failed"
                    );
                    shared.emit(TaskEventKind::Failed, &task.id);
                    if !skipped.is_empty() {
                        warn!(
                            task = %task.name,
                            skipped = ?skipped,
                            "dependents skipped after failure"
                        );
                        shared.emit_skipped(&skipped);
                    }
                }
                None => debug!(task = %task.name, "task already terminal; failure discarded"),
            }
        }
    }
}
