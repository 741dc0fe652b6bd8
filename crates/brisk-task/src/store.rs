use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use brisk_core::{
    events::{TaskEvent, TaskEventObserver, TracingObserver},
    mutation::TaskMutation,
    tasks::{Task, TaskList},
};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

use crate::{poller::PollerState, snapshot::StoreSnapshot, SyncStatus};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 60_000;

/// In-memory state of tasks, lists and the outgoing mutation queue.
///
/// Mutators live in sibling modules (`entities`, `queue`, `reconcile`,
/// `poller`); this module owns the fields, read accessors and the
/// invariant checker.
pub struct TaskStore {
    pub(crate) tasks_by_id: HashMap<String, Task>,
    pub(crate) task_order: Vec<String>,
    pub(crate) lists_by_id: HashMap<String, TaskList>,
    pub(crate) list_order: Vec<String>,
    pub(crate) mutation_queue: Vec<TaskMutation>,
    pub(crate) pending_by_task_id: HashMap<String, String>,
    pub(crate) last_sync_at: Option<DateTime<Utc>>,
    pub(crate) poll_interval_ms: u64,
    pub(crate) poller: PollerState,
    pub(crate) sync_status: SyncStatus,
    observer: Arc<dyn TaskEventObserver>,
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskStore")
            .field("tasks", &self.tasks_by_id.len())
            .field("lists", &self.lists_by_id.len())
            .field("queued_mutations", &self.mutation_queue.len())
            .field("last_sync_at", &self.last_sync_at)
            .finish_non_exhaustive()
    }
}

impl TaskStore {
    pub fn new() -> Self {
        Self::with_observer(Arc::new(TracingObserver))
    }

    pub fn with_observer(observer: Arc<dyn TaskEventObserver>) -> Self {
        Self {
            tasks_by_id: HashMap::new(),
            task_order: Vec::new(),
            lists_by_id: HashMap::new(),
            list_order: Vec::new(),
            mutation_queue: Vec::new(),
            pending_by_task_id: HashMap::new(),
            last_sync_at: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            poller: PollerState::default(),
            sync_status: SyncStatus::Idle,
            observer,
        }
    }

    /// Rebuild a store from a persisted snapshot. Runtime-only state
    /// (poller flags, sync status) starts fresh.
    pub fn from_snapshot(snapshot: StoreSnapshot, observer: Arc<dyn TaskEventObserver>) -> Self {
        let mut store = Self::with_observer(observer);
        store.tasks_by_id = snapshot.tasks_by_id;
        store.task_order = snapshot.task_order;
        store.lists_by_id = snapshot.lists_by_id;
        store.list_order = snapshot.list_order;
        store.mutation_queue = snapshot.mutation_queue;
        store.pending_by_task_id = snapshot.pending_by_task_id;
        store.last_sync_at = snapshot.last_sync_at;
        store.poll_interval_ms = snapshot.poll_interval_ms;
        store
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            tasks_by_id: self.tasks_by_id.clone(),
            task_order: self.task_order.clone(),
            lists_by_id: self.lists_by_id.clone(),
            list_order: self.list_order.clone(),
            mutation_queue: self.mutation_queue.clone(),
            pending_by_task_id: self.pending_by_task_id.clone(),
            last_sync_at: self.last_sync_at,
            poll_interval_ms: self.poll_interval_ms,
        }
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks_by_id.get(id)
    }

    /// Tasks in display order (most recently added first).
    pub fn tasks(&self) -> impl Iterator<Item = &Task> + '_ {
        self.task_order
            .iter()
            .filter_map(|id| self.tasks_by_id.get(id))
    }

    pub fn task_order(&self) -> &[String] {
        &self.task_order
    }

    pub fn task_count(&self) -> usize {
        self.tasks_by_id.len()
    }

    pub fn list(&self, id: &str) -> Option<&TaskList> {
        self.lists_by_id.get(id)
    }

    pub fn lists(&self) -> impl Iterator<Item = &TaskList> + '_ {
        self.list_order
            .iter()
            .filter_map(|id| self.lists_by_id.get(id))
    }

    pub fn list_order(&self) -> &[String] {
        &self.list_order
    }

    pub fn mutation_queue(&self) -> &[TaskMutation] {
        &self.mutation_queue
    }

    pub fn mutation(&self, id: &str) -> Option<&TaskMutation> {
        self.mutation_queue.iter().find(|m| m.id == id)
    }

    /// Mutation id currently tracked as the outstanding write for a task.
    pub fn pending_mutation_for(&self, task_id: &str) -> Option<&str> {
        self.pending_by_task_id.get(task_id).map(String::as_str)
    }

    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        self.last_sync_at
    }

    /// Verify the structural invariants: `task_order` is a permutation of
    /// the task ids, every pending-index entry points at a queued mutation
    /// for that task, and `pending_sync` agrees with `sync_state`.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let mut seen = HashSet::with_capacity(self.task_order.len());
        for id in &self.task_order {
            if !seen.insert(id.as_str()) {
                return Err(InvariantViolation::DuplicateOrderEntry { id: id.clone() });
            }
            if !self.tasks_by_id.contains_key(id) {
                return Err(InvariantViolation::DanglingOrderEntry { id: id.clone() });
            }
        }
        if let Some(id) = self
            .tasks_by_id
            .keys()
            .find(|id| !seen.contains(id.as_str()))
        {
            return Err(InvariantViolation::UnorderedTask { id: id.clone() });
        }

        for (task_id, mutation_id) in &self.pending_by_task_id {
            let tracked = self
                .mutation(mutation_id)
                .is_some_and(|m| m.task_id() == task_id.as_str());
            if !tracked {
                return Err(InvariantViolation::DanglingPendingEntry {
                    task_id: task_id.clone(),
                    mutation_id: mutation_id.clone(),
                });
            }
        }

        if let Some(task) = self
            .tasks_by_id
            .values()
            .find(|t| t.pending_sync != t.sync_state.is_pending())
        {
            return Err(InvariantViolation::PendingFlagMismatch {
                id: task.id.clone(),
                sync_state: task.sync_state.as_str(),
            });
        }

        Ok(())
    }

    /// Point the pending index (and the task's mirror field) at `mutation_id`.
    pub(crate) fn track_pending(&mut self, task_id: &str, mutation_id: &str) {
        self.pending_by_task_id
            .insert(task_id.to_string(), mutation_id.to_string());
        if let Some(task) = self.tasks_by_id.get_mut(task_id) {
            task.client_mutation_id = Some(mutation_id.to_string());
        }
    }

    pub(crate) fn untrack_pending(&mut self, task_id: &str) {
        self.pending_by_task_id.remove(task_id);
        if let Some(task) = self.tasks_by_id.get_mut(task_id) {
            task.client_mutation_id = None;
        }
    }

    /// Task ids whose pending index entry equals `mutation_id`.
    pub(crate) fn tasks_tracking(&self, mutation_id: &str) -> Vec<String> {
        self.pending_by_task_id
            .iter()
            .filter(|(_, tracked)| tracked.as_str() == mutation_id)
            .map(|(task_id, _)| task_id.clone())
            .collect()
    }

    pub(crate) fn emit(&self, event: TaskEvent) {
        if let Err(err) = self.observer.observe(&event) {
            warn!(event = event.kind.as_str(), "task event observer failed: {err:#}");
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("task {id} appears more than once in task_order")]
    DuplicateOrderEntry { id: String },
    #[error("task_order references missing task {id}")]
    DanglingOrderEntry { id: String },
    #[error("task {id} is missing from task_order")]
    UnorderedTask { id: String },
    #[error("pending index maps task {task_id} to unknown mutation {mutation_id}")]
    DanglingPendingEntry { task_id: String, mutation_id: String },
    #[error("task {id} has pending_sync out of step with sync_state {sync_state}")]
    PendingFlagMismatch { id: String, sync_state: &'static str },
}

#[cfg(test)]
mod tests {
    use brisk_core::{
        events::RecordingObserver,
        tasks::{NewTask, SyncState},
    };

    use super::*;

    #[test]
    fn empty_store_is_consistent() {
        let store = TaskStore::new();
        assert!(store.check_invariants().is_ok());
        assert_eq!(store.task_count(), 0);
        assert_eq!(store.snapshot().poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
    }

    #[test]
    fn detects_order_drift() {
        let mut store = TaskStore::new();
        let task = store.add_task(NewTask::titled("Water plants"));
        store.task_order.push(task.id.clone());
        assert_eq!(
            store.check_invariants(),
            Err(InvariantViolation::DuplicateOrderEntry { id: task.id.clone() })
        );

        store.task_order.clear();
        assert_eq!(
            store.check_invariants(),
            Err(InvariantViolation::UnorderedTask { id: task.id })
        );
    }

    #[test]
    fn detects_flag_mismatch() {
        let mut store = TaskStore::new();
        let task = store.add_task(NewTask::titled("File taxes"));
        if let Some(t) = store.tasks_by_id.get_mut(&task.id) {
            t.sync_state = SyncState::Idle;
        }
        assert!(matches!(
            store.check_invariants(),
            Err(InvariantViolation::PendingFlagMismatch { .. })
        ));
    }

    #[test]
    fn snapshot_restores_persisted_fields() {
        let observer = Arc::new(RecordingObserver::new());
        let mut store = TaskStore::with_observer(observer.clone());
        store.add_task(NewTask::titled("Buy milk"));
        store.schedule_next_poll(5_000);

        let restored = TaskStore::from_snapshot(store.snapshot(), observer);
        assert_eq!(restored.snapshot(), store.snapshot());
        assert!(restored.next_poll_at().is_none());
    }
}
