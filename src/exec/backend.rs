// src/exec/backend.rs

//! Pluggable action backends.
//!
//! Tasks name their work as `module` + `action`. The orchestrator never
//! interprets those strings itself; it resolves them through an
//! [`ActionRegistry`] populated by the embedding application at startup.
//!
//! - [`ActionHandler`] is the trait a backend implements.
//! - Plain async closures can be registered with
//!   [`ActionRegistry::register_fn`].
//! - Tests register fakes that record invocations, fail on demand or sleep.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::task::{Parameters, Task, TaskId};

/// Why a single action invocation did not produce a value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActionError {
    #[error("{0}")]
    Failed(String),

    #[error("action timed out after {:.3}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("no action registered for '{module}.{action}'")]
    NotFound { module: String, action: String },

    #[error("action panicked: {0}")]
    Panicked(String),

    #[error("action cancelled")]
    Cancelled,
}

impl ActionError {
    pub fn failed(message: impl fmt::Display) -> Self {
        ActionError::Failed(message.to_string())
    }

    /// Missing actions and cancellations are final; everything else may be
    /// retried if the task allows it.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ActionError::NotFound { .. } | ActionError::Cancelled)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ActionError::Failed(_) => "failed",
            ActionError::Timeout(_) => "timeout",
            ActionError::NotFound { .. } => "not_found",
            ActionError::Panicked(_) => "panicked",
            ActionError::Cancelled => "cancelled",
        }
    }
}

impl From<anyhow::Error> for ActionError {
    fn from(err: anyhow::Error) -> Self {
        ActionError::Failed(format!("{err:#}"))
    }
}

/// Everything an action sees about the invocation.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub task_id: TaskId,
    pub task_name: String,
    pub module: String,
    pub action: String,
    pub parameters: Parameters,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Fired on timeout or cancellation. Long-running actions should watch it.
    pub cancel: CancellationToken,
}

impl ActionContext {
    pub fn for_task(task: &Task, attempt: u32, cancel: CancellationToken) -> Self {
        Self {
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            module: task.module.clone(),
            action: task.action.clone(),
            parameters: task.parameters.clone(),
            attempt,
            cancel,
        }
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub type ActionFuture = Pin<Box<dyn Future<Output = Result<Value, ActionError>> + Send + 'static>>;

/// Trait abstracting how a `module.action` pair is executed.
///
/// The returned future is spawned on the runtime, so it must own what it
/// needs (`'static`).
pub trait ActionHandler: Send + Sync {
    fn invoke(&self, ctx: ActionContext) -> ActionFuture;
}

struct FnHandler<F>(F);

impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(ActionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ActionError>> + Send + 'static,
{
    fn invoke(&self, ctx: ActionContext) -> ActionFuture {
        Box::pin((self.0)(ctx))
    }
}

/// Maps `(module, action)` to a handler.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: BTreeMap<(String, String), Arc<dyn ActionHandler>>,
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.actions())
            .finish()
    }
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same pair.
    pub fn register<H>(&mut self, module: impl Into<String>, action: impl Into<String>, handler: H)
    where
        H: ActionHandler + 'static,
    {
        self.register_arc(module, action, Arc::new(handler));
    }

    pub fn register_arc(
        &mut self,
        module: impl Into<String>,
        action: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
    ) {
        self.handlers.insert((module.into(), action.into()), handler);
    }

    /// Register an async closure.
    pub fn register_fn<F, Fut>(
        &mut self,
        module: impl Into<String>,
        action: impl Into<String>,
        f: F,
    ) where
        F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActionError>> + Send + 'static,
    {
        self.register(module, action, FnHandler(f));
    }

    pub fn resolve(&self, module: &str, action: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers
            .get(&(module.to_string(), action.to_string()))
            .cloned()
    }

    pub fn contains(&self, module: &str, action: &str) -> bool {
        self.resolve(module, action).is_some()
    }

    /// Registered pairs as `module.action`, sorted.
    pub fn actions(&self) -> Vec<String> {
        self.handlers
            .keys()
            .map(|(m, a)| format!("{m}.{a}"))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
