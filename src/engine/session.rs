// src/engine/session.rs

//! Orchestration sessions: a grouping of workflow and task executions that
//! share a scheduling mode, a concurrency cap and up-front resource needs.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::errors::{OrchestratorError, Result};
use crate::resources::{Requirements, ResourceRequirement};
use crate::task::TaskId;
use crate::types::{ExecutionMode, SessionStatus, TaskPriority};

pub type SessionId = String;

/// Parameters for a new session.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub name: Option<String>,
    pub user_id: Option<String>,
    pub mode: ExecutionMode,
    /// Cap on concurrently ready/running tasks of this session.
    pub max_parallel_tasks: Option<usize>,
    pub priority: TaskPriority,
    /// Allocated for the session before any of its work runs.
    pub resource_requirements: Requirements,
    /// Bound on each workflow or task run in the session.
    pub timeout: Option<Duration>,
}

impl SessionOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn max_parallel_tasks(mut self, n: usize) -> Self {
        self.max_parallel_tasks = Some(n);
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn require(mut self, key: impl Into<String>, requirement: ResourceRequirement) -> Self {
        self.resource_requirements.insert(key.into(), requirement);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestrationSession {
    pub id: SessionId,
    pub name: String,
    pub user_id: Option<String>,
    pub mode: ExecutionMode,
    pub max_parallel_tasks: Option<usize>,
    pub priority: TaskPriority,
    #[serde(skip)]
    pub resource_requirements: Requirements,
    #[serde(skip)]
    pub timeout: Option<Duration>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub executions: Vec<String>,
    pub task_ids: Vec<TaskId>,
    pub error: Option<String>,
}

impl OrchestrationSession {
    fn new(options: SessionOptions) -> Self {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        Self {
            name: options.name.unwrap_or_else(|| format!("session-{}", &id[..8])),
            id,
            user_id: options.user_id,
            mode: options.mode,
            max_parallel_tasks: options.max_parallel_tasks,
            priority: options.priority,
            resource_requirements: options.resource_requirements,
            timeout: options.timeout,
            status: SessionStatus::Pending,
            created_at: now,
            updated_at: now,
            closed_at: None,
            executions: Vec::new(),
            task_ids: Vec::new(),
            error: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    /// Priority floor applied to tasks submitted under this session.
    pub fn priority_floor(&self) -> Option<TaskPriority> {
        (self.mode == ExecutionMode::Priority).then_some(self.priority)
    }
}

/// In-memory session table.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, OrchestrationSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, options: SessionOptions) -> Result<OrchestrationSession> {
        if options.max_parallel_tasks == Some(0) {
            return Err(OrchestratorError::Config(
                "session max_parallel_tasks must be >= 1 (got 0)".to_string(),
            ));
        }
        let session = OrchestrationSession::new(options);
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<OrchestrationSession> {
        self.sessions.read().get(id).cloned()
    }

    /// Sessions ordered by creation time.
    pub fn list(&self) -> Vec<OrchestrationSession> {
        let mut all: Vec<_> = self.sessions.read().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    /// Apply `f` to a session and bump `updated_at`.
    pub fn update<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut OrchestrationSession) -> T,
    ) -> Result<T> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::UnknownSession(id.to_string()))?;
        let out = f(session);
        session.updated_at = Utc::now();
        Ok(out)
    }

    pub fn count_by_status(&self) -> HashMap<SessionStatus, usize> {
        let mut counts = HashMap::new();
        for session in self.sessions.read().values() {
            *counts.entry(session.status).or_default() += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
