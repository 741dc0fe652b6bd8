//! Local-first task store: optimistic CRUD, the outgoing mutation queue,
//! reconciliation of remote snapshots and versioned persistence.
//!
//! Every mutator runs synchronously on `&mut TaskStore`; share a store
//! between the UI and the sync worker through [`SharedTaskStore`].

mod entities;
mod poller;
mod queue;
mod reconcile;
pub mod repo;
mod shared;
pub mod snapshot;
mod store;

use thiserror::Error;

pub use entities::SubtaskChanges;
pub use poller::SyncStatus;
pub use reconcile::ReconcileListsOptions;
pub use repo::SnapshotRepo;
pub use shared::SharedTaskStore;
pub use snapshot::{StoreSnapshot, SCHEMA_VERSION};
pub use store::{InvariantViolation, TaskStore, DEFAULT_POLL_INTERVAL_MS};

pub type Result<T, E = TaskStoreError> = std::result::Result<T, E>;

/// Rejected store calls. State is left untouched whenever one is returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskStoreError {
    #[error("task not found: {id}")]
    TaskNotFound { id: String },
    #[error("task list not found: {id}")]
    ListNotFound { id: String },
    #[error("subtask {subtask_id} not found on task {task_id}")]
    SubtaskNotFound { task_id: String, subtask_id: String },
    #[error("mutation not found: {id}")]
    MutationNotFound { id: String },
    #[error("cannot reassign tasks of list {id} to itself")]
    InvalidReassignment { id: String },
    #[error("list {id} still holds {count} task(s); pass a list to reassign them to")]
    ListNotEmpty { id: String, count: usize },
}
