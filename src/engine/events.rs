// src/engine/events.rs

//! In-process publish/subscribe for engine lifecycle events.
//!
//! Handlers run synchronously on the emitting thread, after the handler list
//! lock has been released. A panicking handler is logged and does not stop
//! the remaining handlers or the emitter.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};

pub const SESSION_CREATED: &str = "session_created";
pub const SESSION_CLOSED: &str = "session_closed";
pub const WORKFLOW_STARTED: &str = "workflow_started";
pub const WORKFLOW_COMPLETED: &str = "workflow_completed";
pub const WORKFLOW_FAILED: &str = "workflow_failed";
pub const TASK_COMPLETED: &str = "task_completed";
pub const TASK_FAILED: &str = "task_failed";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestrationEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<String>,
    pub data: Value,
}

impl OrchestrationEvent {
    pub fn new(name: impl Into<String>, session_id: Option<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            timestamp: Utc::now(),
            session_id,
            data,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&OrchestrationEvent) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    by_name: RwLock<HashMap<String, Vec<EventHandler>>>,
    wildcard: RwLock<Vec<EventHandler>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("events", &self.by_name.read().keys().collect::<Vec<_>>())
            .field("wildcard_handlers", &self.wildcard.read().len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `handler` for every event named `event`.
    pub fn subscribe<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(&OrchestrationEvent) + Send + Sync + 'static,
    {
        self.by_name
            .write()
            .entry(event.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Call `handler` for every event.
    pub fn subscribe_all<F>(&self, handler: F)
    where
        F: Fn(&OrchestrationEvent) + Send + Sync + 'static,
    {
        self.wildcard.write().push(Arc::new(handler));
    }

    /// Deliver `event` to its subscribers. Returns how many handlers ran
    /// without panicking.
    pub fn emit(&self, event: OrchestrationEvent) -> usize {
        let mut handlers: Vec<EventHandler> = self
            .by_name
            .read()
            .get(&event.name)
            .cloned()
            .unwrap_or_default();
        handlers.extend(self.wildcard.read().iter().cloned());

        debug!(event = %event.name, handlers = handlers.len(), "emitting event");

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(event = %event.name, "event handler panicked"),
            }
        }
        delivered
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.by_name.read().get(event).map_or(0, Vec::len) + self.wildcard.read().len()
    }
}
