// tests/task_queue.rs

mod common;
use crate::common::init_tracing;

use std::collections::HashSet;
use std::error::Error;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use codomyrmex::dag::DagValidationError;
use codomyrmex::errors::OrchestratorError;
use codomyrmex::task::{Task, TaskQueue, TaskResult};
use codomyrmex::types::{AccessMode, ExecutionMode, ResourceStatus, TaskPriority, TaskStatus};

type TestResult = Result<(), Box<dyn Error>>;

fn task(id: &str) -> Task {
    Task::new("demo", "noop").with_id(id)
}

fn ok() -> TaskResult {
    TaskResult::success(json!(null), Duration::from_millis(1))
}

fn boom() -> TaskResult {
    TaskResult::failure("boom", "failed", Duration::from_millis(1))
}

fn next(queue: &TaskQueue) -> Option<String> {
    queue.next_ready(Utc::now(), &HashSet::new()).map(|t| t.id)
}

/// Take `id` through Ready -> Running -> Completed.
fn run_to_completion(queue: &TaskQueue, id: &str) {
    queue.mark_running(id).expect("task is ready");
    assert!(queue.complete(id, ok()));
}

#[test]
fn higher_priority_first_then_submission_order() -> TestResult {
    init_tracing();
    let queue = TaskQueue::new();

    queue.push(task("low").priority(TaskPriority::Low))?;
    queue.push(task("high-1").priority(TaskPriority::High))?;
    queue.push(task("normal"))?;
    queue.push(task("high-2").priority(TaskPriority::High))?;
    queue.push(task("critical").priority(TaskPriority::Critical))?;

    let order: Vec<String> = std::iter::from_fn(|| next(&queue)).collect();
    assert_eq!(order, vec!["critical", "high-1", "high-2", "normal", "low"]);
    assert_eq!(queue.status_of("low"), Some(TaskStatus::Ready));
    Ok(())
}

#[test]
fn unset_enums_fall_back_to_their_default_variants() {
    assert_eq!(TaskPriority::default(), TaskPriority::Normal);
    assert_eq!(task("plain").priority, TaskPriority::Normal);
    assert_eq!(AccessMode::default(), AccessMode::Read);
    assert_eq!(ResourceStatus::default(), ResourceStatus::Available);
    assert_eq!(ExecutionMode::default(), ExecutionMode::Parallel);
}

#[test]
fn dependents_wait_for_completed_dependencies() -> TestResult {
    let queue = TaskQueue::new();
    // The dependent outranks its dependency but still has to wait.
    queue.push(task("a"))?;
    queue.push(task("b").depends_on("a").priority(TaskPriority::Critical))?;

    assert_eq!(next(&queue).as_deref(), Some("a"));
    assert_eq!(next(&queue), None);

    run_to_completion(&queue, "a");
    assert_eq!(next(&queue).as_deref(), Some("b"));
    Ok(())
}

#[test]
fn unknown_dependency_is_rejected_at_submission() -> TestResult {
    let queue = TaskQueue::new();
    queue.push(task("known"))?;

    let err = queue
        .push(task("waiting").depends_on("known").depends_on("ghost"))
        .unwrap_err();
    let errors = err.validation_errors().expect("validation error");
    assert_eq!(
        errors,
        &[DagValidationError::DanglingDependency {
            task: "waiting".to_string(),
            dependency: "ghost".to_string(),
        }]
    );
    assert!(queue.get("waiting").is_none());
    assert_eq!(queue.len(), 1);

    // Once the dependency exists the same task is accepted.
    queue.push(task("ghost"))?;
    queue.push(task("waiting").depends_on("known").depends_on("ghost"))?;
    assert_eq!(queue.status_of("waiting"), Some(TaskStatus::Pending));
    Ok(())
}

#[test]
fn self_dependency_and_duplicate_ids_are_rejected() -> TestResult {
    let queue = TaskQueue::new();

    let err = queue.push(task("loop").depends_on("loop")).unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));
    assert!(queue.is_empty());

    queue.push(task("once"))?;
    assert!(matches!(
        queue.push(task("once")),
        Err(OrchestratorError::InvalidState(_))
    ));
    assert_eq!(queue.len(), 1);
    Ok(())
}

#[test]
fn failure_skips_dependents_transitively() -> TestResult {
    init_tracing();
    let queue = TaskQueue::new();
    queue.push(task("a"))?;
    queue.push(task("b").depends_on("a"))?;
    queue.push(task("c").depends_on("b"))?;
    queue.push(task("d"))?;

    assert_eq!(next(&queue).as_deref(), Some("a"));
    queue.mark_running("a").unwrap();

    let mut skipped = queue.fail("a", boom()).expect("a was running");
    skipped.sort();
    assert_eq!(skipped, vec!["b", "c"]);

    for id in ["b", "c"] {
        let t = queue.get(id).unwrap();
        assert_eq!(t.status, TaskStatus::Skipped);
        let result = t.result.unwrap();
        assert_eq!(result.error_kind.as_deref(), Some("dependency_failed"));
        assert!(t.completed_at.is_some());
    }
    assert_eq!(queue.status_of("d"), Some(TaskStatus::Pending));

    // Failing again is a no-op.
    assert!(queue.fail("a", boom()).is_none());

    // Late arrivals depending on a failed task are skipped immediately.
    queue.push(task("late").depends_on("a"))?;
    assert_eq!(queue.status_of("late"), Some(TaskStatus::Skipped));
    Ok(())
}

#[test]
fn cancel_reports_previous_state_and_cascades() -> TestResult {
    let queue = TaskQueue::new();
    queue.push(task("a"))?;
    queue.push(task("b").depends_on("a"))?;

    let cancellation = queue.cancel("a")?.expect("a was not terminal");
    assert_eq!(cancellation.previous, TaskStatus::Pending);
    assert_eq!(cancellation.skipped, vec!["b".to_string()]);
    assert_eq!(queue.status_of("a"), Some(TaskStatus::Cancelled));

    assert_eq!(queue.cancel("a")?, None);
    assert!(matches!(
        queue.cancel("missing"),
        Err(OrchestratorError::UnknownTask(_))
    ));

    // A cancelled Ready task can no longer start.
    queue.push(task("c"))?;
    assert_eq!(next(&queue).as_deref(), Some("c"));
    queue.cancel("c")?;
    assert!(queue.mark_running("c").is_none());
    Ok(())
}

#[test]
fn retry_delays_the_next_attempt() -> TestResult {
    let queue = TaskQueue::new();
    queue.push(task("flaky").max_retries(3))?;

    assert_eq!(next(&queue).as_deref(), Some("flaky"));
    let running = queue.mark_running("flaky").unwrap();
    assert_eq!(running.attempts, 1);

    let now = Utc::now();
    assert!(queue.retry("flaky", boom(), now + chrono::Duration::seconds(60)));

    let t = queue.get("flaky").unwrap();
    assert_eq!(t.status, TaskStatus::Pending);
    assert_eq!(t.retry_count, 1);
    assert!(t.retry_at.is_some());

    let skip = HashSet::new();
    assert!(queue.next_ready(now, &skip).is_none());
    let later = now + chrono::Duration::seconds(120);
    assert_eq!(queue.next_ready(later, &skip).map(|t| t.id).as_deref(), Some("flaky"));

    let running = queue.mark_running("flaky").unwrap();
    assert_eq!(running.attempts, 2);
    assert!(running.retry_at.is_none());
    Ok(())
}

#[test]
fn requeue_and_skip_set_keep_fifo_position() -> TestResult {
    let queue = TaskQueue::new();
    queue.push(task("first"))?;
    queue.push(task("second"))?;

    assert_eq!(next(&queue).as_deref(), Some("first"));
    assert!(queue.requeue("first"));
    assert!(!queue.requeue("first"));

    let skip: HashSet<String> = ["first".to_string()].into();
    assert_eq!(
        queue.next_ready(Utc::now(), &skip).map(|t| t.id).as_deref(),
        Some("second")
    );
    assert_eq!(next(&queue).as_deref(), Some("first"));
    Ok(())
}

#[test]
fn session_limit_caps_ready_and_running_tasks() -> TestResult {
    let queue = TaskQueue::new();
    queue.set_session_limit("s1", Some(1));
    queue.push(task("s1-a").session("s1"))?;
    queue.push(task("s1-b").session("s1"))?;
    queue.push(task("free"))?;

    assert_eq!(next(&queue).as_deref(), Some("s1-a"));
    // s1 is at its cap; the unrelated task still flows.
    assert_eq!(next(&queue).as_deref(), Some("free"));
    assert_eq!(next(&queue), None);

    run_to_completion(&queue, "s1-a");
    assert_eq!(next(&queue).as_deref(), Some("s1-b"));

    assert_eq!(queue.tasks_in_session("s1"), vec!["s1-a", "s1-b"]);
    queue.set_session_limit("s1", None);
    Ok(())
}

#[test]
fn counts_and_terminal_checks_track_state() -> TestResult {
    let queue = TaskQueue::new();
    queue.push(task("a"))?;
    queue.push(task("b"))?;

    assert_eq!(queue.counts().get(TaskStatus::Pending), 2);
    assert_eq!(queue.counts().active(), 2);

    next(&queue);
    run_to_completion(&queue, "a");
    let counts = queue.counts();
    assert_eq!(counts.get(TaskStatus::Completed), 1);
    assert_eq!(counts.active(), 1);
    assert_eq!(counts.total(), 2);

    assert!(queue.all_terminal(&["a".to_string(), "unknown".to_string()]));
    assert!(!queue.all_terminal(&["a".to_string(), "b".to_string()]));

    queue.cancel("b")?;
    assert_eq!(queue.counts().active(), 0);
    // Completion only counts while the task is running.
    assert!(!queue.complete("b", ok()));
    Ok(())
}
