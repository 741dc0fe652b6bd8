use std::{fmt, sync::Arc};

use anyhow::{Context, Result};
use brisk_core::storage::{SecureStore, SecureStoreError};
use tracing::{debug, instrument};

use crate::snapshot::{decode_snapshot, encode_snapshot, StoreSnapshot};

pub const SNAPSHOT_KEY: &str = "tasks/snapshot";

/// Persists [`StoreSnapshot`]s as one versioned blob in a `SecureStore`
/// (encrypted at rest).
#[derive(Clone)]
pub struct SnapshotRepo {
    store: Arc<dyn SecureStore>,
    key: String,
}

impl fmt::Debug for SnapshotRepo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotRepo").field("key", &self.key).finish()
    }
}

impl SnapshotRepo {
    pub fn new<S: SecureStore + 'static>(store: S) -> Self {
        Self::from_shared(Arc::new(store))
    }

    pub fn from_shared(store: Arc<dyn SecureStore>) -> Self {
        Self {
            store,
            key: SNAPSHOT_KEY.to_string(),
        }
    }

    /// Store under a different key, e.g. one snapshot per account.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Load the last saved snapshot. `None` when nothing was ever saved.
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn load(&self) -> Result<Option<StoreSnapshot>> {
        let bytes = match self.store.get(&self.key).await {
            Ok(bytes) => bytes,
            Err(SecureStoreError::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(anyhow::anyhow!(err.to_string())),
        };
        let snapshot = decode_snapshot(&bytes).context("stored task snapshot is unreadable")?;
        debug!(
            tasks = snapshot.tasks_by_id.len(),
            queued = snapshot.mutation_queue.len(),
            "snapshot loaded"
        );
        Ok(Some(snapshot))
    }

    #[instrument(skip(self, snapshot), fields(key = %self.key))]
    pub async fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let bytes = encode_snapshot(snapshot)?;
        self.store
            .put(&self.key, &bytes)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))
    }

    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn clear(&self) -> Result<()> {
        self.store
            .delete(&self.key)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))
    }
}
