// tests/engine_sessions.rs

mod common;
use crate::common::builders::chain_steps;
use crate::common::fake_actions::{FailingAction, RecordingAction, SlowAction};
use crate::common::{engine, eventually, init_tracing, with_timeout};

use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use codomyrmex::engine::events::{
    EventBus, OrchestrationEvent, SESSION_CLOSED, SESSION_CREATED, TASK_COMPLETED, TASK_FAILED,
};
use codomyrmex::errors::OrchestratorError;
use codomyrmex::exec::ActionRegistry;
use codomyrmex::resources::{Requirements, ResourceRequirement};
use codomyrmex::task::{Parameters, Task};
use codomyrmex::types::{
    ExecutionMode, HealthStatus, ResourceType, SessionStatus, TaskPriority, TaskStatus,
};
use codomyrmex::workflow::ExecuteOptions;
use codomyrmex::SessionOptions;

type TestResult = Result<(), Box<dyn Error>>;

fn registry() -> (ActionRegistry, RecordingAction) {
    let echo = RecordingAction::new();
    let mut registry = ActionRegistry::new();
    registry.register("demo", "echo", echo.clone());
    registry.register("demo", "fail", FailingAction::new("disk full"));
    registry.register("demo", "slow", SlowAction::new(Duration::from_secs(30)));
    (registry, echo)
}

fn cores(n: f64) -> ResourceRequirement {
    ResourceRequirement::new(ResourceType::Cpu).amount("cores", n)
}

#[tokio::test]
async fn session_lifecycle_create_close_and_reuse() -> TestResult {
    init_tracing();
    let (actions, _) = registry();
    let engine = engine(2, actions);

    let id = engine.create_session(
        SessionOptions::named("ci")
            .user("alice")
            .mode(ExecutionMode::Parallel)
            .max_parallel_tasks(2)
            .priority(TaskPriority::High),
    )?;
    let session = engine.session(&id).unwrap();
    assert_eq!(session.name, "ci");
    assert_eq!(session.user_id.as_deref(), Some("alice"));
    assert_eq!(session.status, SessionStatus::Pending);
    assert_eq!(session.max_parallel_tasks, Some(2));
    // Only Priority-mode sessions raise task priorities.
    assert_eq!(session.priority_floor(), None);

    let outcome = engine
        .execute_task(Task::new("demo", "echo").param("x", 1), Some(&id))
        .await?;
    assert!(outcome.success);
    assert_eq!(outcome.session_id, id);
    assert_eq!(engine.session(&id).unwrap().status, SessionStatus::Active);

    let closed = engine.close_session(&id)?;
    assert_eq!(closed.status, SessionStatus::Completed);
    assert!(closed.is_closed());
    assert_eq!(closed.task_ids.len(), 1);

    assert!(matches!(
        engine.execute_task(Task::new("demo", "echo"), Some(&id)).await,
        Err(OrchestratorError::InvalidState(_))
    ));
    assert!(matches!(
        engine.execute_task(Task::new("demo", "echo"), Some("nope")).await,
        Err(OrchestratorError::UnknownSession(_))
    ));
    assert!(matches!(
        engine.close_session("nope"),
        Err(OrchestratorError::UnknownSession(_))
    ));
    assert!(matches!(
        engine.create_session(SessionOptions::named("zero").max_parallel_tasks(0)),
        Err(OrchestratorError::Config(_))
    ));
    Ok(())
}

#[tokio::test]
async fn cancel_session_stops_its_tasks() -> TestResult {
    init_tracing();
    let (actions, _) = registry();
    let engine = engine(2, actions);
    let id = engine.create_session(SessionOptions::named("doomed"))?;

    let execution = engine.workflows().execute_steps(
        "long",
        &chain_steps("demo", "slow", &["one", "two"]),
        &Parameters::new(),
        ExecuteOptions {
            session_id: Some(id.clone()),
            ..Default::default()
        },
    )?;

    let cancelled = engine.cancel_session(&id)?;
    assert!(cancelled >= 1);

    let session = engine.session(&id).unwrap();
    assert_eq!(session.status, SessionStatus::Cancelled);
    assert!(session.is_closed());

    let done = engine
        .workflows()
        .wait_for_execution(&execution.execution_id, Some(Duration::from_secs(5)))
        .await?;
    assert!(done.is_finished());
    assert_eq!(done.step_status("one"), Some(TaskStatus::Cancelled));
    Ok(())
}

#[tokio::test]
async fn execute_task_reports_failures_and_closes_its_own_session() -> TestResult {
    let (actions, _) = registry();
    let engine = engine(2, actions);

    let outcome = engine.execute_task(Task::new("demo", "fail"), None).await?;
    assert!(!outcome.success);
    assert_eq!(outcome.status, Some(TaskStatus::Failed));
    assert!(outcome.error.as_deref().unwrap().contains("disk full"));

    let session = engine.session(&outcome.session_id).unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert!(session.is_closed());
    assert!(session.error.is_some());

    let missing = engine
        .execute_task(Task::new("demo", "unregistered"), None)
        .await?;
    assert!(!missing.success);
    assert_eq!(
        missing.result.and_then(|r| r.error_kind).as_deref(),
        Some("not_found")
    );
    Ok(())
}

#[tokio::test]
async fn session_timeout_cancels_a_single_task() -> TestResult {
    let (actions, _) = registry();
    let engine = engine(1, actions);
    let id = engine.create_session(
        SessionOptions::named("short").timeout(Duration::from_millis(50)),
    )?;

    let outcome = with_timeout(engine.execute_task(Task::new("demo", "slow"), Some(&id))).await?;
    assert!(!outcome.success);
    assert_eq!(outcome.status, Some(TaskStatus::Cancelled));
    assert!(eventually(|| engine.orchestrator().active_workers() == 0).await);
    Ok(())
}

#[tokio::test]
async fn resource_aware_sessions_wait_and_others_fail_fast() -> TestResult {
    init_tracing();
    let (actions, echo) = registry();
    let engine = engine(2, actions);

    let mut everything = Requirements::new();
    everything.insert("cpu".into(), cores(4.0));
    let hog = engine
        .resources()
        .allocate_resources("hog", &everything, None)
        .expect("cpu pool starts empty");
    assert_eq!(hog.allocations.len(), 1);

    let impatient = engine.create_session(
        SessionOptions::named("impatient")
            .mode(ExecutionMode::Parallel)
            .require("cpu", cores(2.0)),
    )?;
    let outcome = engine
        .execute_task(Task::new("demo", "echo"), Some(&impatient))
        .await?;
    assert!(!outcome.success);
    assert!(outcome.task_id.is_none());
    assert!(outcome.error.as_deref().unwrap().contains("insufficient resources"));
    assert!(echo.log.is_empty());

    let patient = engine.create_session(
        SessionOptions::named("patient")
            .mode(ExecutionMode::ResourceAware)
            .require("cpu", cores(2.0))
            .timeout(Duration::from_secs(5)),
    )?;
    let resources = Arc::clone(engine.resources());
    let releaser = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        resources.deallocate_resources("hog", None)
    });

    let outcome = engine
        .execute_task(Task::new("demo", "echo"), Some(&patient))
        .await?;
    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(releaser.await?, 1);
    assert_eq!(echo.log.len(), 1);

    // Session-held resources are returned once the run is over.
    assert!(engine.resources().allocations_for(&patient).is_empty());
    Ok(())
}

#[tokio::test]
async fn lifecycle_events_reach_subscribers() -> TestResult {
    init_tracing();
    let (actions, _) = registry();
    let engine = engine(2, actions);

    let seen: Arc<Mutex<Vec<OrchestrationEvent>>> = Arc::new(Mutex::new(Vec::new()));
    for name in [SESSION_CREATED, SESSION_CLOSED, TASK_COMPLETED, TASK_FAILED] {
        let seen = Arc::clone(&seen);
        engine.subscribe(name, move |event| seen.lock().unwrap().push(event.clone()));
    }
    engine.subscribe(SESSION_CREATED, |_| panic!("misbehaving subscriber"));

    let outcome = engine
        .execute_task(Task::new("demo", "echo").named("greet"), None)
        .await?;
    assert!(outcome.success);

    let task_id = outcome.task_id.clone().unwrap();
    assert!(
        eventually(|| {
            seen.lock()
                .unwrap()
                .iter()
                .any(|e| e.name == TASK_COMPLETED && e.data["task_id"] == json!(task_id))
        })
        .await
    );

    let names: Vec<String> = seen.lock().unwrap().iter().map(|e| e.name.clone()).collect();
    assert!(names.contains(&SESSION_CREATED.to_string()));
    assert!(names.contains(&SESSION_CLOSED.to_string()));
    assert!(!names.contains(&TASK_FAILED.to_string()));

    let created = seen
        .lock()
        .unwrap()
        .iter()
        .find(|e| e.name == SESSION_CREATED)
        .cloned()
        .unwrap();
    assert_eq!(created.session_id.as_deref(), Some(outcome.session_id.as_str()));
    Ok(())
}

#[test]
fn event_bus_contains_panicking_handlers() {
    let bus = EventBus::new();
    let hits = Arc::new(Mutex::new(0));

    bus.subscribe("ping", |_| panic!("nope"));
    {
        let hits = Arc::clone(&hits);
        bus.subscribe("ping", move |_| *hits.lock().unwrap() += 1);
    }
    {
        let hits = Arc::clone(&hits);
        bus.subscribe_all(move |_| *hits.lock().unwrap() += 10);
    }

    assert_eq!(bus.handler_count("ping"), 3);
    assert_eq!(bus.handler_count("other"), 1);

    let delivered = bus.emit(OrchestrationEvent::new("ping", None, json!({})));
    assert_eq!(delivered, 2);
    assert_eq!(*hits.lock().unwrap(), 11);

    assert_eq!(bus.emit(OrchestrationEvent::new("other", None, json!(null))), 1);
    assert_eq!(*hits.lock().unwrap(), 21);
}

#[tokio::test]
async fn status_and_health_cover_every_component() -> TestResult {
    let (actions, _) = registry();
    let engine = engine(3, actions);
    engine
        .workflows()
        .create_workflow("noop", chain_steps("demo", "echo", &["a"]))?;
    let outcome = engine.execute_workflow("noop", None, Parameters::new()).await?;
    assert!(outcome.success);

    let status = engine.system_status();
    assert!(status.running);
    assert_eq!(status.sessions.total, 1);
    assert_eq!(status.sessions.by_status.get("completed"), Some(&1));
    assert_eq!(status.workflows.registered, 1);
    assert_eq!(status.workflows.executions, 1);
    assert_eq!(status.workflows.running, 0);
    assert_eq!(status.tasks.total_tasks, 1);
    assert_eq!(status.tasks.max_workers, 3);
    assert!(status.resources.total_resources >= 3);

    let health = engine.health_check();
    let keys: Vec<&str> = health.components.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["resource_manager", "task_orchestrator", "workflow_manager"]);
    assert_eq!(health.status, HealthStatus::Healthy);
    assert!(health.is_healthy());
    assert!(health.issues.is_empty());

    engine.shutdown().await;
    assert!(!engine.system_status().running);
    Ok(())
}
