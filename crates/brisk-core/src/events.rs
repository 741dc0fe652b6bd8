use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    TaskCreated,
    TaskUpdated,
    TaskDeleted,
    TaskCompleted,
    TaskReopened,
    TaskDueChanged,
    TaskMoved,
}

impl TaskEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskEventKind::TaskCreated => "task_created",
            TaskEventKind::TaskUpdated => "task_updated",
            TaskEventKind::TaskDeleted => "task_deleted",
            TaskEventKind::TaskCompleted => "task_completed",
            TaskEventKind::TaskReopened => "task_reopened",
            TaskEventKind::TaskDueChanged => "task_due_changed",
            TaskEventKind::TaskMoved => "task_moved",
        }
    }
}

/// Named domain event broadcast after a successful store mutation.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskEvent {
    pub kind: TaskEventKind,
    pub payload: BTreeMap<String, String>,
    pub emitted_at: DateTime<Utc>,
}

impl TaskEvent {
    pub fn new(kind: TaskEventKind) -> Self {
        Self {
            kind,
            payload: BTreeMap::new(),
            emitted_at: Utc::now(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }
}

/// Fire-and-forget sink for domain events (logging, toasts, analytics).
///
/// Errors are reported back only so the emitter can log them; they never
/// affect the mutation that produced the event.
pub trait TaskEventObserver: Send + Sync {
    fn observe(&self, event: &TaskEvent) -> Result<()>;
}

/// Default observer: writes every event to the tracing pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl TaskEventObserver for TracingObserver {
    fn observe(&self, event: &TaskEvent) -> Result<()> {
        info!(event = event.kind.as_str(), payload = ?event.payload, "task event");
        Ok(())
    }
}

/// Observer that keeps every event in memory, for tests and smoke runs.
#[derive(Debug, Default, Clone)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<TaskEvent>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TaskEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<TaskEventKind> {
        self.events().into_iter().map(|e| e.kind).collect()
    }
}

impl TaskEventObserver for RecordingObserver {
    fn observe(&self, event: &TaskEvent) -> Result<()> {
        let mut events = self
            .events
            .lock()
            .map_err(|err| anyhow::anyhow!("lock poisoned: {err}"))?;
        events.push(event.clone());
        Ok(())
    }
}
