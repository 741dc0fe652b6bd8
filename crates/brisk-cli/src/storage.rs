use std::{path::PathBuf, sync::Arc};

use brisk_core::events::TracingObserver;
use brisk_storage::{EncryptedFileStore, KeyringProvider};
use brisk_task::{SharedTaskStore, SnapshotRepo};
use color_eyre::{eyre::eyre, Result};
use dirs::data_dir;
use tracing::debug;

use crate::config::Config;

/// Resolve the default data directory for Brisk.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| eyre!("no data dir available"))?;
    Ok(base.join("brisk"))
}

/// Encrypted store rooted at the configured (or default) data directory,
/// keyed from the OS keychain.
pub fn store_from_config(config: &Config) -> Result<EncryptedFileStore<KeyringProvider>> {
    let root = match &config.data_dir {
        Some(root) => root.clone(),
        None => default_data_dir()?,
    };
    debug!(?root, "initializing encrypted store");
    Ok(EncryptedFileStore::new(root, KeyringProvider::default()))
}

/// Open the persisted task store and apply config overrides.
pub async fn open_task_store(config: &Config) -> Result<SharedTaskStore> {
    let repo = SnapshotRepo::new(store_from_config(config)?);
    open_with_repo(repo, config).await
}

pub async fn open_with_repo(repo: SnapshotRepo, config: &Config) -> Result<SharedTaskStore> {
    let store = SharedTaskStore::open(repo, Arc::new(TracingObserver))
        .await
        .map_err(|e| eyre!("failed to open task store: {e:#}"))?;
    if let Some(interval) = config.poll_interval_ms {
        store.mutate(|s| s.set_poll_interval(interval)).await;
    }
    Ok(store)
}

#[cfg(test)]
pub fn test_store(
    root: impl Into<PathBuf>,
) -> EncryptedFileStore<brisk_storage::InMemoryKeyProvider> {
    EncryptedFileStore::new(root, brisk_storage::InMemoryKeyProvider::default())
}
