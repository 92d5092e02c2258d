#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use codomyrmex::exec::{ActionContext, ActionError, ActionFuture, ActionHandler};
use codomyrmex::task::Parameters;
use serde_json::{json, Value};

/// One recorded invocation.
#[derive(Debug, Clone)]
pub struct Call {
    pub task_id: String,
    pub task_name: String,
    pub attempt: u32,
    pub parameters: Parameters,
    pub started: Instant,
    pub finished: Instant,
}

/// Shared log of invocations plus an in-flight high-water mark.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<Call>>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl CallLog {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Task names in the order their invocations started.
    pub fn started_order(&self) -> Vec<String> {
        let mut calls = self.calls();
        calls.sort_by_key(|c| c.started);
        calls.into_iter().map(|c| c.task_name).collect()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most invocations observed running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn find(&self, task_name: &str) -> Option<Call> {
        self.calls().into_iter().find(|c| c.task_name == task_name)
    }

    fn enter(&self) -> Instant {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Instant::now()
    }

    fn leave(&self, ctx: &ActionContext, started: Instant) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(Call {
            task_id: ctx.task_id.clone(),
            task_name: ctx.task_name.clone(),
            attempt: ctx.attempt,
            parameters: ctx.parameters.clone(),
            started,
            finished: Instant::now(),
        });
    }
}

/// Succeeds after an optional delay, echoing the task name and parameters.
#[derive(Debug, Clone, Default)]
pub struct RecordingAction {
    pub log: CallLog,
    delay: Duration,
}

impl RecordingAction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            log: CallLog::default(),
            delay,
        }
    }
}

impl ActionHandler for RecordingAction {
    fn invoke(&self, ctx: ActionContext) -> ActionFuture {
        let log = self.log.clone();
        let delay = self.delay;
        Box::pin(async move {
            let started = log.enter();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            log.leave(&ctx, started);
            Ok::<_, ActionError>(json!({
                "task": ctx.task_name,
                "parameters": Value::Object(ctx.parameters.clone()),
            }))
        })
    }
}

/// Fails the first `failures` invocations, then succeeds.
#[derive(Debug, Clone)]
pub struct FlakyAction {
    failures: u32,
    calls: Arc<AtomicU32>,
}

impl FlakyAction {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ActionHandler for FlakyAction {
    fn invoke(&self, ctx: ActionContext) -> ActionFuture {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let failures = self.failures;
        Box::pin(async move {
            if n <= failures {
                Err(ActionError::failed(format!("flaky failure {n} of {failures}")))
            } else {
                Ok(json!({ "attempt": ctx.attempt }))
            }
        })
    }
}

/// Always fails with the given message.
#[derive(Debug, Clone)]
pub struct FailingAction {
    message: String,
    calls: Arc<AtomicU32>,
}

impl FailingAction {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ActionHandler for FailingAction {
    fn invoke(&self, _ctx: ActionContext) -> ActionFuture {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let message = self.message.clone();
        Box::pin(async move { Err::<Value, _>(ActionError::Failed(message)) })
    }
}

/// Sleeps for `duration` unless cancelled first.
#[derive(Debug, Clone)]
pub struct SlowAction {
    duration: Duration,
    cancelled: Arc<AtomicU32>,
}

impl SlowAction {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            cancelled: Arc::new(AtomicU32::new(0)),
        }
    }

    /// How many invocations observed their cancellation token firing.
    pub fn cancelled(&self) -> u32 {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl ActionHandler for SlowAction {
    fn invoke(&self, ctx: ActionContext) -> ActionFuture {
        let duration = self.duration;
        let cancelled = Arc::clone(&self.cancelled);
        Box::pin(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => Ok(json!("done")),
                _ = ctx.cancel.cancelled() => {
                    cancelled.fetch_add(1, Ordering::SeqCst);
                    Err(ActionError::Cancelled)
                }
            }
        })
    }
}

/// Panics inside the spawned future.
#[derive(Debug, Clone, Default)]
pub struct PanicAction;

impl ActionHandler for PanicAction {
    fn invoke(&self, ctx: ActionContext) -> ActionFuture {
        Box::pin(async move {
            if ctx.param("spare").is_none() {
                panic!("boom in {}", ctx.task_name);
            }
            Ok::<_, ActionError>(Value::Null)
        })
    }
}
