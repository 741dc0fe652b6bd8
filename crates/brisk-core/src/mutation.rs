use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tasks::{Task, TaskChanges};

/// A write that has been applied locally but not yet confirmed remotely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskMutationOperation {
    Create {
        task: Box<Task>,
    },
    Update {
        id: String,
        changes: TaskChanges,
    },
    /// Carries the remote id because the local task is already gone.
    Delete {
        id: String,
        external_id: Option<String>,
    },
    Move {
        id: String,
        to_list_id: String,
        previous_id: Option<String>,
        parent_id: Option<String>,
        external_id: Option<String>,
    },
}

impl TaskMutationOperation {
    /// Id of the task this operation writes.
    pub fn task_id(&self) -> &str {
        match self {
            TaskMutationOperation::Create { task } => &task.id,
            TaskMutationOperation::Update { id, .. }
            | TaskMutationOperation::Delete { id, .. }
            | TaskMutationOperation::Move { id, .. } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TaskMutationOperation::Create { .. } => "create",
            TaskMutationOperation::Update { .. } => "update",
            TaskMutationOperation::Delete { .. } => "delete",
            TaskMutationOperation::Move { .. } => "move",
        }
    }
}

/// Lifecycle: `Queued -> InFlight -> (resolved | Failed)`, `Failed -> Queued` on requeue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    #[default]
    Queued,
    InFlight,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskMutation {
    pub id: String,
    pub operation: TaskMutationOperation,
    /// Number of times the mutation was handed to a worker. Never decreases.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub state: MutationState,
    /// When the most recent attempt failed; retry delays count from here.
    pub failed_at: Option<DateTime<Utc>>,
}

impl TaskMutation {
    pub fn new(operation: TaskMutationOperation) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            operation,
            attempts: 0,
            last_error: None,
            enqueued_at: Utc::now(),
            state: MutationState::Queued,
            failed_at: None,
        }
    }

    pub fn task_id(&self) -> &str {
        self.operation.task_id()
    }
}

/// What the remote provider reported back for a confirmed mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutationAck {
    /// Remote id assigned (create) or reassigned (cross-list move).
    pub external_id: Option<String>,
}

impl MutationAck {
    pub fn with_external_id(external_id: impl Into<String>) -> Self {
        Self {
            external_id: Some(external_id.into()),
        }
    }
}
