use std::{
    fmt,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use tracing::{info, instrument};

pub const KEYRING_SERVICE: &str = "brisk";
pub const KEYRING_ACCOUNT: &str = "snapshot-key";

/// Key id recorded for secrets stored before ids were written alongside.
const LEGACY_KEY_ID: &str = "default";

/// 256-bit key used to encrypt snapshots at rest.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    /// Short random id, written next to every blob so a rotated or lost key
    /// is reported as such instead of as a generic decrypt failure.
    pub id: String,
    pub bytes: [u8; 32],
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("id", &self.id)
            .field("bytes", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("keyring error: {0}")]
    Keyring(String),
    #[error("stored key is malformed: {0}")]
    Decode(String),
    #[error("key generation failed: {0}")]
    Generation(String),
}

/// Source of the snapshot encryption key.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn get_or_create(&self) -> Result<KeyMaterial, KeyError>;
}

/// Keeps the key in the OS keychain.
#[derive(Debug, Clone)]
pub struct KeyringProvider {
    service: String,
    account: String,
}

impl KeyringProvider {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }
}

impl Default for KeyringProvider {
    fn default() -> Self {
        Self::new(KEYRING_SERVICE, KEYRING_ACCOUNT)
    }
}

#[async_trait]
impl KeyProvider for KeyringProvider {
    #[instrument(skip(self), fields(service = %self.service))]
    async fn get_or_create(&self) -> Result<KeyMaterial, KeyError> {
        let service = self.service.clone();
        let account = self.account.clone();
        // The keyring API blocks on the platform secret service.
        tokio::task::spawn_blocking(move || load_or_create(&service, &account))
            .await
            .map_err(|e| KeyError::Keyring(e.to_string()))?
    }
}

fn load_or_create(service: &str, account: &str) -> Result<KeyMaterial, KeyError> {
    let entry =
        keyring::Entry::new(service, account).map_err(|e| KeyError::Keyring(e.to_string()))?;
    match entry.get_password() {
        Ok(secret) => decode_key(&secret),
        // Only a missing entry may mint a new key; any other failure would
        // orphan every blob written with the existing one.
        Err(keyring::Error::NoEntry) => {
            let material = generate_key();
            entry
                .set_password(&encode_key(&material))
                .map_err(|e| KeyError::Keyring(e.to_string()))?;
            info!(key_id = %material.id, "generated new snapshot key");
            Ok(material)
        }
        Err(err) => Err(KeyError::Keyring(err.to_string())),
    }
}

/// Process-local key for tests and ephemeral sessions. Clones share the key.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyProvider {
    inner: Arc<Mutex<Option<KeyMaterial>>>,
}

impl InMemoryKeyProvider {
    pub fn with_key(material: KeyMaterial) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(material))),
        }
    }
}

#[async_trait]
impl KeyProvider for InMemoryKeyProvider {
    async fn get_or_create(&self) -> Result<KeyMaterial, KeyError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|err| KeyError::Generation(format!("lock poisoned: {err}")))?;
        Ok(guard.get_or_insert_with(generate_key).clone())
    }
}

pub fn generate_key() -> KeyMaterial {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    let mut id = [0u8; 4];
    OsRng.fill_bytes(&mut id);
    KeyMaterial {
        id: id.iter().map(|b| format!("{b:02x}")).collect(),
        bytes,
    }
}

/// `<id>:<base64 key>`
fn encode_key(material: &KeyMaterial) -> String {
    format!(
        "{}:{}",
        material.id,
        general_purpose::STANDARD.encode(material.bytes)
    )
}

fn decode_key(secret: &str) -> Result<KeyMaterial, KeyError> {
    let (id, encoded) = secret
        .split_once(':')
        .unwrap_or((LEGACY_KEY_ID, secret));
    let bytes = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| KeyError::Decode(e.to_string()))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| KeyError::Decode(format!("expected 32 bytes, got {}", b.len())))?;
    Ok(KeyMaterial {
        id: id.to_string(),
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_provider_returns_same_key() {
        let provider = InMemoryKeyProvider::default();
        let first = provider.get_or_create().await.unwrap();
        let second = provider.clone().get_or_create().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.id.len(), 8);
    }

    #[test]
    fn secret_round_trips_with_id() {
        let material = generate_key();
        let decoded = decode_key(&encode_key(&material)).unwrap();
        assert_eq!(decoded, material);
    }

    #[test]
    fn accepts_bare_base64_secret() {
        let material = generate_key();
        let bare = general_purpose::STANDARD.encode(material.bytes);
        let decoded = decode_key(&bare).unwrap();
        assert_eq!(decoded.id, LEGACY_KEY_ID);
        assert_eq!(decoded.bytes, material.bytes);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let err = decode_key("abcd").expect_err("should reject wrong length");
        assert!(matches!(err, KeyError::Decode(_)));
    }

    #[test]
    fn debug_never_prints_key_bytes() {
        let mut material = generate_key();
        material.bytes = [7; 32];
        let printed = format!("{material:?}");
        assert!(printed.contains("redacted"));
        assert!(!printed.contains("7, 7"));
    }
}
