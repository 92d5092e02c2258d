// src/exec/executor_loop.rs

//! Dispatcher loop: moves ready tasks from the queue onto workers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::exec::orchestrator::Shared;
use crate::exec::task_runner::run_task;
use crate::task::{TaskId, claims_to_requirements};

/// Extra lease time on top of a task's timeout before its claims may be
/// force-released by the resource sweep.
const LEASE_GRACE: Duration = Duration::from_secs(60);

/// Spawn the dispatcher loop.
///
/// Each pass hands out ready tasks until either no worker is free or no task
/// is eligible, then sleeps until woken (submission, completion,
/// cancellation) or until the poll interval elapses. The poll interval is
/// what picks up retry delays and resources freed by other users.
pub(crate) fn spawn_dispatcher(shared: Arc<Shared>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("dispatcher loop started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let dispatched = dispatch_ready(&shared);
            if dispatched > 0 {
                debug!(dispatched, "dispatch pass finished");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = shared.wake.notified() => {}
                _ = tokio::time::sleep(shared.options.poll_interval) => {}
            }
        }

        info!("dispatcher loop finished");
    })
}

/// One dispatch pass. Returns how many tasks were handed to workers.
fn dispatch_ready(shared: &Arc<Shared>) -> usize {
    // Tasks whose claims could not be granted in this pass; retried next pass.
    let mut deferred: HashSet<TaskId> = HashSet::new();
    let mut dispatched = 0;

    loop {
        let Ok(permit) = Arc::clone(&shared.workers).try_acquire_owned() else {
            break;
        };
        let Some(task) = shared.queue.next_ready(Utc::now(), &deferred) else {
            break;
        };

        if !task.resources.is_empty() {
            let requirements = claims_to_requirements(&task.resources);
            let lease = task.timeout.map(|t| t + LEASE_GRACE);

            if shared
                .resources
                .allocate_resources(&task.id, &requirements, lease)
                .is_none()
            {
                debug!(task = %task.name, "resources unavailable; deferring task");
                shared.queue.requeue(&task.id);
                deferred.insert(task.id);
                continue;
            }
        }

        debug!(task = %task.name, priority = ?task.priority, "dispatching task");
        tokio::spawn(run_task(Arc::clone(shared), task.id, permit));
        dispatched += 1;
    }

    dispatched
}
