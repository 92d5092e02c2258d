// src/engine/core.rs

//! Top-level orchestration engine.
//!
//! The engine owns one of each component and wires them together:
//! - [`ResourceManager`] for shared capacity, plus its expiry sweep
//! - [`TaskOrchestrator`] for the queue, dispatcher and workers
//! - [`WorkflowManager`] for named workflows and their executions
//! - sessions and the [`EventBus`]
//!
//! Business outcomes (a failed step, a timeout, refused resources) come back
//! as `success = false` outcomes. Only caller mistakes such as an unknown
//! session id, an unknown workflow or an invalid step graph are `Err`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, validate_engine_config, validate_steps};
use crate::engine::events::{
    EventBus, OrchestrationEvent, SESSION_CLOSED, SESSION_CREATED, TASK_COMPLETED, TASK_FAILED,
    WORKFLOW_COMPLETED, WORKFLOW_FAILED, WORKFLOW_STARTED,
};
use crate::engine::session::{OrchestrationSession, SessionId, SessionOptions, SessionStore};
use crate::engine::status::{
    HealthReport, SessionSummary, SystemStatus, TaskOutcome, WorkflowOutcome, WorkflowSummary,
};
use crate::errors::{OrchestratorError, Result};
use crate::exec::{ActionRegistry, OrchestratorOptions, TaskEvent, TaskEventKind, TaskOrchestrator};
use crate::resources::ResourceManager;
use crate::task::{Parameters, Task};
use crate::types::{ExecutionMode, SessionStatus, TaskStatus, WorkflowStatus};
use crate::workflow::{
    ExecuteOptions, StepDefaults, WorkflowExecution, WorkflowManager, WorkflowStep,
};

/// How long a `ResourceAware` session without its own timeout waits for
/// its resource requirements.
const RESOURCE_WAIT: Duration = Duration::from_secs(30);

struct Background {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct OrchestrationEngine {
    config: EngineConfig,
    resources: Arc<ResourceManager>,
    orchestrator: Arc<TaskOrchestrator>,
    workflows: Arc<WorkflowManager>,
    sessions: SessionStore,
    events: Arc<EventBus>,
    background: Mutex<Option<Background>>,
    created_at: DateTime<Utc>,
}

impl OrchestrationEngine {
    /// Build an engine from config. Resources come from
    /// `[resources].config_file` (or host defaults); workflows are loaded
    /// from `[workflows].directory` when set.
    pub fn new(config: EngineConfig, actions: ActionRegistry) -> Result<Self> {
        validate_engine_config(&config)?;
        let resources = match &config.resources.config_file {
            Some(path) => ResourceManager::from_config_file(path)?,
            None => ResourceManager::with_defaults(),
        };
        Self::with_resources(config, resources, actions)
    }

    /// Build an engine over an explicit resource manager.
    pub fn with_resources(
        config: EngineConfig,
        resources: ResourceManager,
        actions: ActionRegistry,
    ) -> Result<Self> {
        validate_engine_config(&config)?;

        let resources = Arc::new(
            resources.with_utilization_threshold(config.resources.high_utilization_threshold),
        );
        let orchestrator = Arc::new(TaskOrchestrator::new(
            OrchestratorOptions::from(&config.orchestrator),
            Arc::clone(&resources),
            Arc::new(actions),
        ));
        let workflows = Arc::new(WorkflowManager::new(
            Arc::clone(&orchestrator),
            StepDefaults::from(&config.orchestrator),
        ));

        if let Some(dir) = &config.workflows.directory {
            let loaded = workflows.load_directory(dir);
            info!(dir = %dir.display(), loaded, "workflow directory loaded");
        }

        Ok(Self {
            config,
            resources,
            orchestrator,
            workflows,
            sessions: SessionStore::new(),
            events: Arc::new(EventBus::new()),
            background: Mutex::new(None),
            created_at: Utc::now(),
        })
    }

    /// Start the dispatcher, the resource sweep and event forwarding.
    /// Idempotent. Must be called inside a Tokio runtime.
    pub fn start(&self) {
        self.orchestrator.start();

        let mut background = self.background.lock();
        if background.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let handles = vec![
            self.resources
                .spawn_sweeper(self.config.resources.sweep_interval(), cancel.clone()),
            spawn_event_forwarder(
                self.orchestrator.subscribe(),
                Arc::clone(&self.events),
                cancel.clone(),
            ),
        ];
        *background = Some(Background { cancel, handles });
        info!("orchestration engine started");
    }

    /// Stop background loops and persist resource definitions.
    pub async fn shutdown(&self) {
        self.orchestrator.stop().await;

        let background = self.background.lock().take();
        if let Some(bg) = background {
            bg.cancel.cancel();
            for handle in bg.handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "background loop ended abnormally");
                }
            }
        }

        if let Err(e) = self.resources.save() {
            error!(error = %e, "failed to persist resource definitions");
        }
        info!("orchestration engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.orchestrator.is_running()
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn orchestrator(&self) -> &Arc<TaskOrchestrator> {
        &self.orchestrator
    }

    pub fn workflows(&self) -> &Arc<WorkflowManager> {
        &self.workflows
    }

    /// Register `handler` on the engine's event bus.
    pub fn subscribe<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(&OrchestrationEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(event, handler);
    }

    pub fn create_session(&self, options: SessionOptions) -> Result<SessionId> {
        let session = self.sessions.create(options)?;
        self.orchestrator
            .set_session_limit(&session.id, session.max_parallel_tasks);

        info!(
            session = %session.id,
            name = %session.name,
            mode = ?session.mode,
            max_parallel_tasks = ?session.max_parallel_tasks,
            "session created"
        );
        self.events.emit(OrchestrationEvent::new(
            SESSION_CREATED,
            Some(session.id.clone()),
            json!({ "name": session.name, "mode": session.mode }),
        ));
        Ok(session.id)
    }

    pub fn session(&self, id: &str) -> Option<OrchestrationSession> {
        self.sessions.get(id)
    }

    pub fn sessions(&self) -> Vec<OrchestrationSession> {
        self.sessions.list()
    }

    /// Close a session and release every resource it still holds. Tasks of
    /// the session that are in flight keep running.
    pub fn close_session(&self, id: &str) -> Result<OrchestrationSession> {
        let session = self.sessions.update(id, |s| {
            if matches!(s.status, SessionStatus::Pending | SessionStatus::Active) {
                s.status = SessionStatus::Completed;
            }
            s.closed_at.get_or_insert_with(Utc::now);
            s.clone()
        })?;

        let released = self.resources.deallocate_resources(id, None);
        self.orchestrator.set_session_limit(id, None);

        info!(session = %id, status = ?session.status, released, "session closed");
        self.events.emit(OrchestrationEvent::new(
            SESSION_CLOSED,
            Some(id.to_string()),
            json!({ "status": session.status, "released_allocations": released }),
        ));
        Ok(session)
    }

    /// Cancel every unfinished task of a session, then close it as
    /// `Cancelled`. Returns how many tasks were cancelled.
    pub fn cancel_session(&self, id: &str) -> Result<usize> {
        self.sessions.update(id, |s| s.status = SessionStatus::Cancelled)?;

        let mut cancelled = 0;
        for task_id in self.orchestrator.tasks_in_session(id) {
            if self.orchestrator.cancel_task(&task_id)? {
                cancelled += 1;
            }
        }
        self.close_session(id)?;
        Ok(cancelled)
    }

    /// Run a registered workflow to completion.
    pub async fn execute_workflow(
        &self,
        name: &str,
        session_id: Option<&str>,
        params: Parameters,
    ) -> Result<WorkflowOutcome> {
        if self.workflows.workflow(name).is_none() {
            return Err(OrchestratorError::UnknownWorkflow(name.to_string()));
        }
        self.run_workflow(name, session_id, |options| {
            self.workflows.execute_workflow(name, &params, options)
        })
        .await
    }

    /// Run an ad-hoc step graph to completion without registering it.
    pub async fn execute_complex_workflow(
        &self,
        name: &str,
        steps: Vec<WorkflowStep>,
        session_id: Option<&str>,
        params: Parameters,
    ) -> Result<WorkflowOutcome> {
        validate_steps(name, &steps)?;
        self.run_workflow(name, session_id, |options| {
            self.workflows.execute_steps(name, &steps, &params, options)
        })
        .await
    }

    async fn run_workflow<F>(
        &self,
        name: &str,
        session_id: Option<&str>,
        submit: F,
    ) -> Result<WorkflowOutcome>
    where
        F: FnOnce(ExecuteOptions) -> Result<WorkflowExecution>,
    {
        let started = Instant::now();
        let (session, auto_created) = self.resolve_session(session_id, name)?;
        let sid = session.id.clone();

        let (execution, error) = self.drive_workflow(name, &session, submit).await;
        let success = error.is_none();

        if !success {
            self.mark_session_failed(&sid, error.as_deref());
        }

        let event = if success { WORKFLOW_COMPLETED } else { WORKFLOW_FAILED };
        self.events.emit(OrchestrationEvent::new(
            event,
            Some(sid.clone()),
            json!({
                "workflow": name,
                "execution_id": execution.as_ref().map(|e| e.execution_id.clone()),
                "status": execution.as_ref().map(|e| e.status),
                "error": error,
            }),
        ));

        self.release_session(&sid, auto_created);

        Ok(WorkflowOutcome {
            success,
            workflow_name: name.to_string(),
            session_id: sid,
            execution,
            error,
            duration: started.elapsed(),
        })
    }

    /// Returns the final execution (if one was started) and the failure
    /// reason, `None` meaning success.
    async fn drive_workflow<F>(
        &self,
        name: &str,
        session: &OrchestrationSession,
        submit: F,
    ) -> (Option<WorkflowExecution>, Option<String>)
    where
        F: FnOnce(ExecuteOptions) -> Result<WorkflowExecution>,
    {
        if let Err(reason) = self.acquire_session_resources(session).await {
            return (None, Some(reason));
        }

        self.events.emit(OrchestrationEvent::new(
            WORKFLOW_STARTED,
            Some(session.id.clone()),
            json!({ "workflow": name, "mode": session.mode }),
        ));

        let options = ExecuteOptions {
            session_id: Some(session.id.clone()),
            priority: session.priority_floor(),
            sequential: session.mode == ExecutionMode::Sequential,
        };

        let execution = match submit(options) {
            Ok(execution) => execution,
            Err(e) => return (None, Some(e.to_string())),
        };
        let execution_id = execution.execution_id.clone();
        let _ = self.sessions.update(&session.id, |s| {
            s.executions.push(execution_id.clone());
            s.task_ids.extend(execution.task_ids());
        });

        let mut execution = match self
            .workflows
            .wait_for_execution(&execution_id, session.timeout)
            .await
        {
            Ok(execution) => execution,
            Err(e) => return (Some(execution), Some(e.to_string())),
        };

        let mut timed_out = false;
        if !execution.status.is_terminal() {
            timed_out = true;
            warn!(
                workflow = %name,
                execution = %execution_id,
                "workflow timed out; cancelling remaining steps"
            );
            if let Err(e) = self.workflows.cancel_execution(&execution_id) {
                warn!(execution = %execution_id, error = %e, "failed to cancel workflow");
            }
            if let Some(refreshed) = self.workflows.execution(&execution_id) {
                execution = refreshed;
            }
        }

        let error = match execution.status {
            WorkflowStatus::Completed => None,
            _ if timed_out => Some(format!(
                "workflow timed out after {:.3}s",
                session.timeout.unwrap_or_default().as_secs_f64()
            )),
            WorkflowStatus::Cancelled => Some("workflow cancelled".to_string()),
            _ => Some(
                execution
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("workflow ended {:?}", execution.status)),
            ),
        };
        (Some(execution), error)
    }

    /// Submit one task under a session and wait for it to finish.
    pub async fn execute_task(&self, task: Task, session_id: Option<&str>) -> Result<TaskOutcome> {
        let (session, auto_created) = self.resolve_session(session_id, &task.name)?;
        let sid = session.id.clone();

        let outcome = self.drive_task(task, &session).await;
        if !outcome.success {
            self.mark_session_failed(&sid, outcome.error.as_deref());
        }
        self.release_session(&sid, auto_created);
        Ok(outcome)
    }

    async fn drive_task(&self, mut task: Task, session: &OrchestrationSession) -> TaskOutcome {
        let failed = |task_id: Option<String>, error: String| TaskOutcome {
            success: false,
            task_id,
            session_id: session.id.clone(),
            status: None,
            result: None,
            error: Some(error),
        };

        if let Err(reason) = self.acquire_session_resources(session).await {
            return failed(None, reason);
        }

        task.session_id = Some(session.id.clone());
        if let Some(floor) = session.priority_floor() {
            task.priority = task.priority.max(floor);
        }

        let id = match self.orchestrator.add_task(task) {
            Ok(id) => id,
            Err(e) => return failed(None, e.to_string()),
        };
        let _ = self
            .sessions
            .update(&session.id, |s| s.task_ids.push(id.clone()));

        let ids = [id.clone()];
        if !self.orchestrator.wait_for_tasks(&ids, session.timeout).await {
            warn!(task = %id, "task timed out at session level; cancelling");
            let _ = self.orchestrator.cancel_task(&id);
        }

        let Some(task) = self.orchestrator.task(&id) else {
            return failed(Some(id), "task disappeared from the registry".to_string());
        };

        let success = task.status == TaskStatus::Completed;
        let error = if success {
            None
        } else {
            Some(
                task.result
                    .as_ref()
                    .and_then(|r| r.error.clone())
                    .unwrap_or_else(|| format!("task ended {}", task.status)),
            )
        };

        TaskOutcome {
            success,
            task_id: Some(task.id),
            session_id: session.id.clone(),
            status: Some(task.status),
            result: task.result,
            error,
        }
    }

    /// Look up `session_id` or create a throwaway session named after the
    /// work. Returns the session and whether it was created here.
    fn resolve_session(
        &self,
        session_id: Option<&str>,
        label: &str,
    ) -> Result<(OrchestrationSession, bool)> {
        let (id, auto_created) = match session_id {
            Some(id) => {
                let session = self
                    .sessions
                    .get(id)
                    .ok_or_else(|| OrchestratorError::UnknownSession(id.to_string()))?;
                if session.is_closed() {
                    return Err(OrchestratorError::InvalidState(format!(
                        "session '{id}' is closed"
                    )));
                }
                (id.to_string(), false)
            }
            None => (self.create_session(SessionOptions::named(label))?, true),
        };

        let session = self.sessions.update(&id, |s| {
            if s.status == SessionStatus::Pending {
                s.status = SessionStatus::Active;
            }
            s.clone()
        })?;
        Ok((session, auto_created))
    }

    /// Grant the session's own resource requirements. `ResourceAware`
    /// sessions wait for them; other modes fail at once.
    async fn acquire_session_resources(
        &self,
        session: &OrchestrationSession,
    ) -> std::result::Result<(), String> {
        if session.resource_requirements.is_empty() {
            return Ok(());
        }

        let requirements = &session.resource_requirements;
        if self
            .resources
            .allocate_resources(&session.id, requirements, session.timeout)
            .is_some()
        {
            return Ok(());
        }

        if session.mode != ExecutionMode::ResourceAware {
            return Err("insufficient resources for session requirements".to_string());
        }

        let wait = session.timeout.unwrap_or(RESOURCE_WAIT);
        let deadline = Instant::now() + wait;
        debug!(session = %session.id, "waiting for session resources");

        while Instant::now() < deadline {
            tokio::time::sleep(self.config.orchestrator.poll_interval()).await;
            if self
                .resources
                .allocate_resources(&session.id, requirements, session.timeout)
                .is_some()
            {
                return Ok(());
            }
        }

        Err(format!(
            "session resources not available within {:.3}s",
            wait.as_secs_f64()
        ))
    }

    fn mark_session_failed(&self, id: &str, error: Option<&str>) {
        let _ = self.sessions.update(id, |s| {
            if s.status != SessionStatus::Cancelled {
                s.status = SessionStatus::Failed;
            }
            s.error = error.map(str::to_string);
        });
    }

    /// Cleanup after one run: release session-held resources, and close
    /// sessions created for this run only.
    fn release_session(&self, id: &str, auto_created: bool) {
        if auto_created {
            if let Err(e) = self.close_session(id) {
                warn!(session = %id, error = %e, "failed to close session");
            }
        } else {
            let released = self.resources.deallocate_resources(id, None);
            debug!(session = %id, released, "session resources released");
        }
    }

    pub fn system_status(&self) -> SystemStatus {
        let by_status = self
            .sessions
            .count_by_status()
            .into_iter()
            .map(|(status, n)| (format!("{status:?}").to_lowercase(), n))
            .collect::<BTreeMap<_, _>>();

        let executions = self.workflows.executions();
        let running = executions
            .iter()
            .filter(|e| !e.status.is_terminal())
            .count();

        SystemStatus {
            timestamp: Utc::now(),
            uptime_secs: (Utc::now() - self.created_at)
                .to_std()
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
            running: self.is_running(),
            sessions: SessionSummary {
                total: self.sessions.len(),
                by_status,
            },
            workflows: WorkflowSummary {
                registered: self.workflows.workflows().len(),
                executions: executions.len(),
                running,
            },
            tasks: self.orchestrator.execution_stats(),
            resources: self.resources.system_usage(),
        }
    }

    pub fn health_check(&self) -> HealthReport {
        let mut components = BTreeMap::new();
        components.insert("workflow_manager".to_string(), self.workflows.health());
        components.insert("task_orchestrator".to_string(), self.orchestrator.health());
        components.insert("resource_manager".to_string(), self.resources.health());
        HealthReport::from_components(components)
    }
}

impl Drop for OrchestrationEngine {
    fn drop(&mut self) {
        if let Some(bg) = self.background.get_mut().take() {
            bg.cancel.cancel();
        }
    }
}

/// Forward task completions and failures from the orchestrator's broadcast
/// channel onto the event bus.
fn spawn_event_forwarder(
    mut rx: broadcast::Receiver<TaskEvent>,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => forward_task_event(&bus, event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "event forwarder lagged; task events dropped");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("event forwarder stopped");
    })
}

fn forward_task_event(bus: &EventBus, event: TaskEvent) {
    let name = match event.kind {
        TaskEventKind::Completed => TASK_COMPLETED,
        TaskEventKind::Failed => TASK_FAILED,
        _ => return,
    };
    let data = serde_json::to_value(&event).unwrap_or(Value::Null);
    bus.emit(OrchestrationEvent::new(name, event.session_id.clone(), data));
}
