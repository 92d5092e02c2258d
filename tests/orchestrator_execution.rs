// tests/orchestrator_execution.rs

mod common;
use crate::common::builders::{lock, test_resources};
use crate::common::fake_actions::{
    FailingAction, FlakyAction, PanicAction, RecordingAction, SlowAction,
};
use crate::common::{eventually, init_tracing, orchestrator, with_timeout};

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;

use codomyrmex::dag::DagValidationError;
use codomyrmex::errors::OrchestratorError;
use codomyrmex::exec::{
    ActionError, ActionRegistry, OrchestratorOptions, TaskEventKind, TaskOrchestrator,
};
use codomyrmex::resources::ResourceManager;
use codomyrmex::task::{ResourceClaim, Task};
use codomyrmex::types::{AccessMode, HealthStatus, ResourceType, TaskPriority, TaskStatus};

type TestResult = Result<(), Box<dyn Error>>;

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn single(module: &str, action: &str, handler: impl codomyrmex::ActionHandler + 'static) -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    registry.register(module, action, handler);
    registry
}

async fn wait_for_status(orch: &TaskOrchestrator, id: &str, status: TaskStatus) {
    with_timeout(async {
        while orch.task_status(id) != Some(status) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
}

#[tokio::test]
async fn task_runs_and_records_its_result() -> TestResult {
    init_tracing();
    let echo = RecordingAction::new();
    let orch = orchestrator(2, test_resources(), single("demo", "echo", echo.clone()));

    let id = orch.add_task(Task::new("demo", "echo").param("x", 1))?;
    assert!(orch.wait_for_tasks(&[id.clone()], WAIT).await);

    let task = orch.task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempts, 1);
    assert!(task.started_at.is_some() && task.completed_at.is_some());

    let result = orch.task_result(&id).unwrap();
    assert!(result.success);
    assert_eq!(result.data.unwrap()["parameters"]["x"], json!(1));
    assert_eq!(result.metadata["attempts"], json!(1));

    assert_eq!(echo.log.len(), 1);
    assert_eq!(echo.log.calls()[0].attempt, 1);
    orch.stop().await;
    Ok(())
}

#[tokio::test]
async fn failing_task_is_retried_exactly_max_retries_times() -> TestResult {
    init_tracing();
    let flaky = FlakyAction::new(100);
    let orch = orchestrator(1, test_resources(), single("demo", "flaky", flaky.clone()));

    let id = orch.add_task(
        Task::new("demo", "flaky")
            .max_retries(2)
            .retry_delay(Duration::from_millis(10)),
    )?;
    assert!(orch.wait_for_tasks(&[id.clone()], WAIT).await);

    let task = orch.task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 3);
    assert_eq!(task.retry_count, 2);
    assert_eq!(flaky.calls(), 3);

    let result = task.result.unwrap();
    assert!(!result.success);
    assert_eq!(result.error_kind.as_deref(), Some("failed"));
    assert!(result.error.unwrap().contains("flaky failure 3"));
    Ok(())
}

#[tokio::test]
async fn flaky_task_succeeds_within_its_retry_budget() -> TestResult {
    let flaky = FlakyAction::new(2);
    let orch = orchestrator(1, test_resources(), single("demo", "flaky", flaky.clone()));

    let id = orch.add_task(Task::new("demo", "flaky").max_retries(2))?;
    assert!(orch.wait_for_tasks(&[id.clone()], WAIT).await);

    let task = orch.task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempts, 3);
    assert_eq!(task.result.unwrap().data, Some(json!({ "attempt": 3 })));
    assert_eq!(orch.execution_stats().total_retries, 2);
    Ok(())
}

#[tokio::test]
async fn timeout_fails_the_attempt() -> TestResult {
    init_tracing();
    let slow = SlowAction::new(Duration::from_secs(30));
    let orch = orchestrator(1, test_resources(), single("demo", "slow", slow));

    let id = orch.add_task(Task::new("demo", "slow").timeout(Duration::from_millis(50)))?;
    assert!(orch.wait_for_tasks(&[id.clone()], WAIT).await);

    let result = orch.task_result(&id).unwrap();
    assert_eq!(orch.task_status(&id), Some(TaskStatus::Failed));
    assert_eq!(result.error_kind.as_deref(), Some("timeout"));
    assert!(result.execution_time < Duration::from_secs(5));
    Ok(())
}

#[tokio::test]
async fn missing_action_fails_without_retrying() -> TestResult {
    let orch = orchestrator(1, test_resources(), ActionRegistry::new());

    let id = orch.add_task(Task::new("nope", "missing").max_retries(5))?;
    assert!(orch.wait_for_tasks(&[id.clone()], WAIT).await);

    let task = orch.task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 1);
    let result = task.result.unwrap();
    assert_eq!(result.error_kind.as_deref(), Some("not_found"));
    assert!(result.error.unwrap().contains("nope.missing"));
    Ok(())
}

#[tokio::test]
async fn panicking_action_is_contained() -> TestResult {
    let mut registry = single("demo", "panic", PanicAction);
    registry.register("demo", "echo", RecordingAction::new());
    let orch = orchestrator(1, test_resources(), registry);

    let bad = orch.add_task(Task::new("demo", "panic"))?;
    let good = orch.add_task(Task::new("demo", "echo"))?;
    assert!(orch.wait_for_tasks(&[bad.clone(), good.clone()], WAIT).await);

    let result = orch.task_result(&bad).unwrap();
    assert_eq!(result.error_kind.as_deref(), Some("panicked"));
    assert!(result.error.unwrap().contains("boom"));
    assert_eq!(orch.task_status(&good), Some(TaskStatus::Completed));
    assert!(orch.is_running());
    Ok(())
}

#[tokio::test]
async fn failure_cascades_to_dependents() -> TestResult {
    init_tracing();
    let failing = FailingAction::new("disk full");
    let echo = RecordingAction::new();
    let mut registry = single("demo", "fail", failing.clone());
    registry.register("demo", "echo", echo.clone());
    let orch = orchestrator(2, test_resources(), registry);

    let a = orch.add_task(Task::new("demo", "fail"))?;
    let b = orch.add_task(Task::new("demo", "echo").depends_on(a.clone()))?;
    let c = orch.add_task(Task::new("demo", "echo").depends_on(b.clone()))?;
    let d = orch.add_task(Task::new("demo", "echo"))?;

    assert!(orch.wait_for_completion(WAIT).await);

    assert_eq!(orch.task_status(&a), Some(TaskStatus::Failed));
    assert_eq!(orch.task_status(&b), Some(TaskStatus::Skipped));
    assert_eq!(orch.task_status(&c), Some(TaskStatus::Skipped));
    assert_eq!(orch.task_status(&d), Some(TaskStatus::Completed));
    assert_eq!(failing.calls(), 1);
    assert_eq!(echo.log.len(), 1);

    let stats = orch.execution_stats();
    assert_eq!(stats.total_tasks, 4);
    assert_eq!(stats.by_status["skipped"], 2);
    assert_eq!(stats.by_status["failed"], 1);
    assert_eq!(stats.by_status["completed"], 1);
    Ok(())
}

#[tokio::test]
async fn dependency_chain_runs_in_order() -> TestResult {
    let echo = RecordingAction::new();
    let orch = orchestrator(4, test_resources(), single("demo", "echo", echo.clone()));

    let a = orch.add_task(Task::new("demo", "echo").named("a"))?;
    let b = orch.add_task(Task::new("demo", "echo").named("b").depends_on(a.clone()))?;
    orch.add_task(Task::new("demo", "echo").named("c").depends_on(b))?;

    assert!(orch.wait_for_completion(WAIT).await);
    assert_eq!(echo.log.started_order(), vec!["a", "b", "c"]);

    let calls = echo.log.calls();
    let a_done = echo.log.find("a").unwrap().finished;
    let b_started = echo.log.find("b").unwrap().started;
    assert!(a_done <= b_started);
    assert_eq!(calls.len(), 3);
    Ok(())
}

#[tokio::test]
async fn cancelling_a_running_task_stops_it() -> TestResult {
    init_tracing();
    let slow = SlowAction::new(Duration::from_secs(30));
    let echo = RecordingAction::new();
    let mut registry = single("demo", "slow", slow);
    registry.register("demo", "echo", echo.clone());
    let orch = orchestrator(2, test_resources(), registry);
    let mut events = orch.subscribe();

    let id = orch.add_task(Task::new("demo", "slow").max_retries(3))?;
    let dependent = orch.add_task(Task::new("demo", "echo").depends_on(id.clone()))?;
    wait_for_status(&orch, &id, TaskStatus::Running).await;

    assert!(orch.cancel_task(&id)?);
    assert!(!orch.cancel_task(&id)?);
    assert!(matches!(
        orch.cancel_task("missing"),
        Err(OrchestratorError::UnknownTask(_))
    ));

    assert!(orch.wait_for_tasks(&[id.clone(), dependent.clone()], WAIT).await);
    // Give the aborted worker a moment; the cancellation must stick.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let task = orch.task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.attempts, 1);
    assert_eq!(orch.task_status(&dependent), Some(TaskStatus::Skipped));
    assert!(echo.log.is_empty());
    assert_eq!(orch.active_workers(), 0);

    let mut kinds = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => kinds.push((event.task_id, event.kind)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            Err(TryRecvError::Lagged(_)) => continue,
        }
    }
    assert!(kinds.contains(&(id.clone(), TaskEventKind::Started)));
    assert!(kinds.contains(&(id, TaskEventKind::Cancelled)));
    assert!(kinds.contains(&(dependent, TaskEventKind::Skipped)));
    Ok(())
}

#[tokio::test]
async fn worker_pool_bounds_concurrency() -> TestResult {
    let echo = RecordingAction::with_delay(Duration::from_millis(40));
    let orch = orchestrator(2, test_resources(), single("demo", "echo", echo.clone()));

    for _ in 0..6 {
        orch.add_task(Task::new("demo", "echo"))?;
    }
    assert!(orch.wait_for_completion(WAIT).await);

    assert_eq!(echo.log.len(), 6);
    assert!(echo.log.peak_concurrency() <= 2);
    assert_eq!(orch.execution_stats().max_workers, 2);
    Ok(())
}

#[tokio::test]
async fn exclusive_claims_serialize_tasks_and_are_released() -> TestResult {
    init_tracing();
    let echo = RecordingAction::with_delay(Duration::from_millis(20));
    let resources = ResourceManager::new(vec![lock("db")]);
    let orch = orchestrator(4, resources, single("demo", "echo", echo.clone()));

    for _ in 0..4 {
        orch.add_task(
            Task::new("demo", "echo")
                .claim(ResourceClaim::new(ResourceType::Lock).mode(AccessMode::Exclusive)),
        )?;
    }
    assert!(orch.wait_for_completion(WAIT).await);

    assert_eq!(echo.log.len(), 4);
    assert_eq!(echo.log.peak_concurrency(), 1);
    assert_eq!(orch.resources().active_allocations(), 0);
    Ok(())
}

#[tokio::test]
async fn shared_read_claims_run_concurrently() -> TestResult {
    let echo = RecordingAction::with_delay(Duration::from_millis(80));
    let resources = ResourceManager::new(vec![lock("db")]);
    let orch = orchestrator(3, resources, single("demo", "echo", echo.clone()));

    for _ in 0..3 {
        orch.add_task(
            Task::new("demo", "echo").claim(ResourceClaim::new(ResourceType::Lock).identifier("db")),
        )?;
    }
    assert!(orch.wait_for_completion(WAIT).await);
    assert!(echo.log.peak_concurrency() >= 2);
    Ok(())
}

#[tokio::test]
async fn priority_decides_dispatch_order_for_a_single_worker() -> TestResult {
    let echo = RecordingAction::new();
    let orch = TaskOrchestrator::new(
        OrchestratorOptions {
            max_workers: 1,
            poll_interval: Duration::from_millis(5),
        },
        Arc::new(test_resources()),
        Arc::new(single("demo", "echo", echo.clone())),
    );

    // Everything is queued before the dispatcher starts.
    orch.add_task(Task::new("demo", "echo").named("low").priority(TaskPriority::Low))?;
    orch.add_task(Task::new("demo", "echo").named("normal-1"))?;
    orch.add_task(Task::new("demo", "echo").named("critical").priority(TaskPriority::Critical))?;
    orch.add_task(Task::new("demo", "echo").named("normal-2"))?;
    orch.start();

    assert!(orch.wait_for_completion(WAIT).await);
    assert_eq!(
        echo.log.started_order(),
        vec!["critical", "normal-1", "normal-2", "low"]
    );
    orch.stop().await;
    assert!(!orch.is_running());
    Ok(())
}

#[tokio::test]
async fn session_limit_is_enforced_by_the_dispatcher() -> TestResult {
    let echo = RecordingAction::with_delay(Duration::from_millis(20));
    let orch = orchestrator(4, test_resources(), single("demo", "echo", echo.clone()));
    orch.set_session_limit("s1", Some(1));

    for _ in 0..4 {
        orch.add_task(Task::new("demo", "echo").session("s1"))?;
    }
    assert!(orch.wait_for_completion(WAIT).await);
    assert_eq!(echo.log.peak_concurrency(), 1);
    assert_eq!(orch.tasks_in_session("s1").len(), 4);
    Ok(())
}

#[tokio::test]
async fn closure_handlers_can_be_registered() -> TestResult {
    let mut registry = ActionRegistry::new();
    registry.register_fn("math", "double", |ctx| async move {
        let n = ctx
            .param("n")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ActionError::failed("missing n"))?;
        Ok::<_, ActionError>(json!(n * 2))
    });
    assert!(registry.contains("math", "double"));
    assert_eq!(registry.actions(), vec!["math.double"]);

    let orch = orchestrator(1, test_resources(), registry);
    let ok = orch.add_task(Task::new("math", "double").param("n", 21))?;
    let bad = orch.add_task(Task::new("math", "double"))?;
    assert!(orch.wait_for_tasks(&[ok.clone(), bad.clone()], WAIT).await);

    assert_eq!(orch.task_result(&ok).unwrap().data, Some(json!(42)));
    assert_eq!(
        orch.task_result(&bad).unwrap().error.as_deref(),
        Some("missing n")
    );
    Ok(())
}

#[tokio::test]
async fn health_flags_a_stopped_dispatcher_with_pending_work() -> TestResult {
    let orch = TaskOrchestrator::new(
        OrchestratorOptions::default(),
        Arc::new(test_resources()),
        Arc::new(ActionRegistry::new()),
    );
    assert_eq!(orch.health().status, HealthStatus::Healthy);

    orch.add_task(Task::new("demo", "echo"))?;
    let health = orch.health();
    assert_eq!(health.status, HealthStatus::Degraded);
    assert!(health.issues[0].contains("dispatcher is not running"));

    assert!(!orch.wait_for_completion(Some(Duration::from_millis(20))).await);
    Ok(())
}

#[tokio::test]
async fn unknown_dependency_is_rejected_by_add_task() -> TestResult {
    let echo = RecordingAction::new();
    let orch = orchestrator(1, test_resources(), single("demo", "echo", echo.clone()));

    let err = orch
        .add_task(Task::new("demo", "echo").with_id("orphan").depends_on("never-submitted"))
        .unwrap_err();
    assert!(matches!(
        err.validation_errors(),
        Some([DagValidationError::DanglingDependency { dependency, .. }]) if dependency == "never-submitted"
    ));
    assert!(orch.tasks().is_empty());

    // Nothing was left behind to wait on.
    assert!(orch.wait_for_completion(Some(Duration::from_millis(200))).await);
    assert!(echo.log.is_empty());
    Ok(())
}

#[tokio::test]
async fn oversized_claim_stays_pending() -> TestResult {
    init_tracing();
    let echo = RecordingAction::new();
    let orch = orchestrator(2, test_resources(), single("demo", "echo", echo.clone()));
    let mut events = orch.subscribe();

    // cpu-0 has 4 cores; 16 can never be granted.
    let big = orch.add_task(
        Task::new("demo", "echo")
            .named("big")
            .claim(ResourceClaim::new(ResourceType::Cpu).amount("cores", 16.0)),
    )?;
    let small = orch.add_task(
        Task::new("demo", "echo")
            .named("small")
            .claim(ResourceClaim::new(ResourceType::Cpu).amount("cores", 1.0)),
    )?;

    assert!(orch.wait_for_tasks(&[small.clone()], WAIT).await);
    assert_eq!(orch.task_status(&small), Some(TaskStatus::Completed));

    // Roughly forty 5ms dispatcher passes.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(orch.task_status(&big), Some(TaskStatus::Pending));
    assert!(echo.log.find("big").is_none());
    assert_eq!(echo.log.len(), 1);

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        saw_failure |= event.task_id == big && event.kind == TaskEventKind::Failed;
    }
    assert!(!saw_failure);
    assert_eq!(orch.resources().active_allocations(), 0);

    assert!(orch.cancel_task(&big)?);
    assert!(orch.wait_for_completion(WAIT).await);
    Ok(())
}

#[tokio::test]
async fn cancel_right_after_start_always_reaches_the_action() -> TestResult {
    let orch = orchestrator(
        1,
        test_resources(),
        single("demo", "slow", SlowAction::new(Duration::from_secs(30))),
    );

    for _ in 0..20 {
        let id = orch.add_task(Task::new("demo", "slow"))?;
        wait_for_status(&orch, &id, TaskStatus::Running).await;
        assert!(orch.cancel_task(&id)?);

        // The worker slot frees long before the action's own 30s.
        assert!(eventually(|| orch.active_workers() == 0).await);
        assert_eq!(orch.task_status(&id), Some(TaskStatus::Cancelled));
    }
    Ok(())
}
