use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};

use anyhow::Result;
use brisk_core::events::TaskEventObserver;
use tracing::{debug, info, instrument, warn};

use crate::{snapshot::StoreSnapshot, SnapshotRepo, TaskStore};

/// Cloneable handle to one [`TaskStore`] shared by the UI layer and the
/// sync worker.
///
/// Mutations run under a plain mutex that is released before any `.await`;
/// the resulting snapshot is then written through the optional
/// [`SnapshotRepo`]. Saves are ordered by a generation number so a slow
/// write can never overwrite a newer one. A failed save is logged and the
/// in-memory state stays authoritative.
#[derive(Clone)]
pub struct SharedTaskStore {
    inner: Arc<Mutex<TaskStore>>,
    repo: Option<SnapshotRepo>,
    saves: Arc<SaveGate>,
}

#[derive(Default)]
struct SaveGate {
    generation: AtomicU64,
    persisted: tokio::sync::Mutex<u64>,
}

impl SharedTaskStore {
    /// In-memory only; nothing is persisted.
    pub fn new(store: TaskStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
            repo: None,
            saves: Arc::default(),
        }
    }

    pub fn with_repo(store: TaskStore, repo: SnapshotRepo) -> Self {
        Self {
            repo: Some(repo),
            ..Self::new(store)
        }
    }

    /// Restore the last snapshot from `repo` (or start empty).
    ///
    /// Mutations left in flight by a previous run are released back to the
    /// queue before the store is handed out. An unreadable snapshot is an
    /// error; it is never silently replaced.
    #[instrument(skip(repo, observer))]
    pub async fn open(repo: SnapshotRepo, observer: Arc<dyn TaskEventObserver>) -> Result<Self> {
        let store = match repo.load().await? {
            Some(snapshot) => TaskStore::from_snapshot(snapshot, observer),
            None => {
                info!("no saved snapshot, starting with an empty store");
                TaskStore::with_observer(observer)
            }
        };
        let shared = Self::with_repo(store, repo);
        let released = shared.mutate(TaskStore::release_in_flight_mutations).await;
        if released > 0 {
            info!(released, "released mutations interrupted by the last run");
        }
        Ok(shared)
    }

    /// Run a read-only closure against the current state.
    pub fn read<R>(&self, f: impl FnOnce(&TaskStore) -> R) -> R {
        f(&self.lock())
    }

    /// Apply a mutation, then persist the resulting state.
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut TaskStore) -> R) -> R {
        let (result, pending) = {
            let mut store = self.lock();
            let result = f(&mut store);
            let generation = self.saves.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let pending = self.repo.as_ref().map(|_| (generation, store.snapshot()));
            (result, pending)
        };
        if let Some((generation, snapshot)) = pending {
            self.save(generation, snapshot).await;
        }
        result
    }

    /// Persist the current state regardless of whether anything changed.
    pub async fn persist_now(&self) {
        self.mutate(|_| ()).await
    }

    pub fn repo(&self) -> Option<&SnapshotRepo> {
        self.repo.as_ref()
    }

    async fn save(&self, generation: u64, snapshot: StoreSnapshot) {
        let Some(repo) = &self.repo else {
            return;
        };
        let mut persisted = self.saves.persisted.lock().await;
        if *persisted >= generation {
            debug!(generation, "skipping superseded snapshot");
            return;
        }
        match repo.save(&snapshot).await {
            Ok(()) => *persisted = generation,
            Err(err) => warn!(generation, "failed to persist task snapshot: {err:#}"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TaskStore> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
