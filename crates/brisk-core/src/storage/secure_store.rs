use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use thiserror::Error;

/// Errors produced by secure storage implementations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecureStoreError {
    /// Requested key does not exist.
    #[error("entry not found for key: {key}")]
    NotFound { key: String },
    /// Underlying storage failure (I/O, quota, crypto).
    #[error("storage failure: {reason}")]
    Storage { reason: String },
}

/// Named-blob storage, encrypted at rest. The task store persists its whole
/// snapshot as a single blob through this contract.
#[async_trait]
pub trait SecureStore: Send + Sync {
    /// Persist a value under a key, overwriting any existing entry.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), SecureStoreError>;

    /// Retrieve the value for a key.
    async fn get(&self, key: &str) -> Result<Vec<u8>, SecureStoreError>;

    /// Remove a key and its value (idempotent).
    async fn delete(&self, key: &str) -> Result<(), SecureStoreError>;
}

/// In-memory store for tests and smoke runs. Values are XOR-masked so
/// plaintext never sits in the map; this is not real encryption.
///
/// Clones share state, so a test can keep a handle while the store under
/// test owns another.
#[derive(Debug, Default, Clone)]
pub struct InMemorySecureStore {
    inner: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    writes: Arc<AtomicUsize>,
    reject_writes: Arc<AtomicBool>,
}

impl InMemorySecureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `put` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every subsequent `put` fail, simulating a full disk or quota error.
    pub fn reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl SecureStore for InMemorySecureStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), SecureStoreError> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(SecureStoreError::Storage {
                reason: "quota exceeded".to_string(),
            });
        }

        let mut map = self.inner.lock().map_err(|err| SecureStoreError::Storage {
            reason: format!("lock poisoned: {err}"),
        })?;
        map.insert(key.to_string(), mask(value));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, SecureStoreError> {
        let map = self.inner.lock().map_err(|err| SecureStoreError::Storage {
            reason: format!("lock poisoned: {err}"),
        })?;

        map.get(key)
            .map(|masked| mask(masked))
            .ok_or_else(|| SecureStoreError::NotFound {
                key: key.to_string(),
            })
    }

    async fn delete(&self, key: &str) -> Result<(), SecureStoreError> {
        let mut map = self.inner.lock().map_err(|err| SecureStoreError::Storage {
            reason: format!("lock poisoned: {err}"),
        })?;
        map.remove(key);
        Ok(())
    }
}

const MASK_BYTE: u8 = 0xA5;

// Self-inverse.
fn mask(input: &[u8]) -> Vec<u8> {
    input.iter().map(|b| b ^ MASK_BYTE).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_masks_and_unmasks() {
        let store = InMemorySecureStore::new();
        let key = "tasks/snapshot";
        let blob = br#"{"version":2}"#;

        store.put(key, blob).await.expect("put should succeed");
        let retrieved = store.get(key).await.expect("get should succeed");

        assert_eq!(retrieved, blob);
        let inner = store.inner.lock().expect("lock");
        assert_ne!(inner.get(key).unwrap(), &blob.to_vec());
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_removes_data() {
        let store = InMemorySecureStore::new();
        store.put("k", b"v").await.expect("put should succeed");
        store.delete("k").await.expect("delete should succeed");
        store
            .delete("k")
            .await
            .expect("delete again should still succeed");

        let err = store
            .get("k")
            .await
            .expect_err("get should fail after delete");
        assert!(matches!(err, SecureStoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn rejected_writes_leave_previous_value() {
        let store = InMemorySecureStore::new();
        store.put("k", b"old").await.expect("put should succeed");

        let shared = store.clone();
        shared.reject_writes(true);
        let err = store.put("k", b"new").await.expect_err("write must fail");
        assert!(matches!(err, SecureStoreError::Storage { .. }));

        assert_eq!(store.get("k").await.unwrap(), b"old");
        assert_eq!(store.write_count(), 1);
    }
}
