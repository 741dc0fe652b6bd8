use std::{collections::HashSet, fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Color assigned to labels created without one.
pub const DEFAULT_LABEL_COLOR: &str = "#64748b";

/// Suffix appended to the title of a duplicated task.
pub const COPY_SUFFIX: &str = " (Copy)";

/// Task status lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Done,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    #[default]
    None,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::None => "none",
        }
    }
}

impl FromStr for Priority {
    type Err = std::convert::Infallible;

    /// Lenient parse: anything unrecognized maps to `Priority::None`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().as_str() {
            "high" => Priority::High,
            "medium" => Priority::Medium,
            "low" => Priority::Low,
            _ => Priority::None,
        })
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-task synchronization state as seen by the UI.
///
/// `pending_sync` on a [`Task`] is true exactly when this is one of the
/// pending variants (see [`SyncState::is_pending`]).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Pending,
    PendingMove,
    Syncing,
    Error,
}

impl SyncState {
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            SyncState::Pending | SyncState::PendingMove | SyncState::Syncing
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Pending => "pending",
            SyncState::PendingMove => "pending_move",
            SyncState::Syncing => "syncing",
            SyncState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskLabel {
    pub name: String,
    pub color: String,
}

impl TaskLabel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: DEFAULT_LABEL_COLOR.to_string(),
        }
    }
}

/// Trim names, drop empty ones, de-duplicate case-insensitively (first wins)
/// and default blank colors. Order is preserved.
pub fn normalize_labels(labels: Vec<TaskLabel>) -> Vec<TaskLabel> {
    let mut seen = HashSet::new();
    labels
        .into_iter()
        .filter_map(|label| {
            let name = label.name.trim();
            if name.is_empty() || !seen.insert(name.to_lowercase()) {
                return None;
            }
            let color = match label.color.trim() {
                "" => DEFAULT_LABEL_COLOR,
                c => c,
            };
            Some(TaskLabel {
                name: name.to_string(),
                color: color.to_string(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subtask {
    pub id: String,
    pub title: String,
    pub is_completed: bool,
    pub due_date: Option<NaiveDate>,
}

impl Subtask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into().trim().to_string(),
            is_completed: false,
            due_date: None,
        }
    }
}

/// Task entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: Priority,
    pub due_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub labels: Vec<TaskLabel>,
    pub list_id: Option<String>,
    pub subtasks: Vec<Subtask>,
    pub is_completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    /// Sort key; lower sorts first.
    pub order: i64,
    /// Remote id once the provider has acknowledged the task.
    pub external_id: Option<String>,
    pub pending_sync: bool,
    pub client_mutation_id: Option<String>,
    pub sync_state: SyncState,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub sync_error: Option<String>,
    /// Set when a remote snapshot overwrote unconfirmed local edits.
    #[serde(default)]
    pub has_conflict: bool,
}

impl Task {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            description: None,
            status: TaskStatus::Todo,
            priority: Priority::None,
            due_date: None,
            created_at: now,
            updated_at: now,
            labels: Vec::new(),
            list_id: None,
            subtasks: Vec::new(),
            is_completed: false,
            completed_at: None,
            order: 0,
            external_id: None,
            pending_sync: false,
            client_mutation_id: None,
            sync_state: SyncState::Idle,
            last_synced_at: None,
            sync_error: None,
            has_conflict: false,
        }
    }

    /// Marks the task as carrying an unconfirmed local edit.
    pub fn mark_pending(&mut self, state: SyncState) {
        debug_assert!(state.is_pending());
        self.sync_state = state;
        self.pending_sync = true;
    }

    /// Clears all optimistic flags after the provider confirmed the write.
    pub fn mark_synced(&mut self, at: DateTime<Utc>) {
        self.sync_state = SyncState::Idle;
        self.pending_sync = false;
        self.sync_error = None;
        self.client_mutation_id = None;
        self.last_synced_at = Some(at);
    }
}

/// Input for creating a task. Only `title` is required.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub labels: Vec<TaskLabel>,
    pub list_id: Option<String>,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
}

impl NewTask {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

/// Partial update merged onto an existing task.
///
/// Nullable fields use `Option<Option<T>>`: `None` leaves the field alone,
/// `Some(None)` clears it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub description: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub due_date: Option<Option<NaiveDate>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<TaskLabel>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub list_id: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtasks: Option<Vec<Subtask>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_completed: Option<bool>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub completed_at: Option<Option<DateTime<Utc>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
}

impl TaskChanges {
    pub fn is_empty(&self) -> bool {
        *self == TaskChanges::default()
    }

    /// Merge the present fields onto `task`. Sync flags are left to the caller.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(title) = &self.title {
            task.title = title.trim().to_string();
        }
        if let Some(description) = &self.description {
            task.description = description.clone();
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(due_date) = self.due_date {
            task.due_date = due_date;
        }
        if let Some(labels) = &self.labels {
            task.labels = normalize_labels(labels.clone());
        }
        if let Some(list_id) = &self.list_id {
            task.list_id = list_id.clone();
        }
        if let Some(subtasks) = &self.subtasks {
            task.subtasks = subtasks.clone();
        }
        if let Some(is_completed) = self.is_completed {
            task.is_completed = is_completed;
        }
        if let Some(completed_at) = self.completed_at {
            task.completed_at = completed_at;
        }
        if let Some(order) = self.order {
            task.order = order;
        }
    }
}

// A present-but-null field deserializes to `Some(None)` instead of `None`.
fn present<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListSource {
    #[default]
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskList {
    pub id: String,
    pub name: String,
    pub color: Option<String>,
    pub is_visible: bool,
    pub external_id: Option<String>,
    pub source: ListSource,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub sync_token: Option<String>,
}

impl TaskList {
    /// A list created on this client, not yet known remotely.
    pub fn local(name: impl Into<String>, color: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into().trim().to_string(),
            color,
            is_visible: true,
            external_id: None,
            source: ListSource::Local,
            last_synced_at: None,
            sync_token: None,
        }
    }
}
