use std::{
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use brisk_core::storage::{SecureStore, SecureStoreError};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, instrument};

use crate::key_provider::{KeyMaterial, KeyProvider};

const BLOB_FORMAT: u8 = 1;
const BLOB_EXTENSION: &str = "blob";

/// One AES-256-GCM encrypted file per key under `root`.
///
/// The storage key is bound into each blob as associated data, so a file
/// copied or renamed onto another key fails to decrypt. Writes go through a
/// temp file in the same directory and an atomic rename.
pub struct EncryptedFileStore<P: KeyProvider> {
    root: PathBuf,
    key_provider: P,
}

impl<P: KeyProvider> EncryptedFileStore<P> {
    pub fn new(root: impl Into<PathBuf>, key_provider: P) -> Self {
        Self {
            root: root.into(),
            key_provider,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root
            .join(URL_SAFE_NO_PAD.encode(key))
            .with_extension(BLOB_EXTENSION)
    }

    async fn key(&self) -> Result<KeyMaterial, SecureStoreError> {
        self.key_provider
            .get_or_create()
            .await
            .map_err(|e| SecureStoreError::Storage {
                reason: format!("key provider: {e}"),
            })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredBlob {
    format: u8,
    key_id: String,
    nonce: String,
    ciphertext: String,
}

#[async_trait]
impl<P: KeyProvider> SecureStore for EncryptedFileStore<P> {
    #[instrument(skip(self, value), fields(bytes = value.len()))]
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), SecureStoreError> {
        let material = self.key().await?;
        let cipher = build_cipher(&material)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: value,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|e| storage_err(format!("encrypt failed: {e}")))?;

        let blob = StoredBlob {
            format: BLOB_FORMAT,
            key_id: material.id,
            nonce: URL_SAFE_NO_PAD.encode(nonce.as_slice()),
            ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
        };
        write_blob(&self.path_for(key), &blob)?;
        debug!("blob written");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Vec<u8>, SecureStoreError> {
        let blob = read_blob(&self.path_for(key), key)?;
        if blob.format != BLOB_FORMAT {
            return Err(storage_err(format!(
                "unsupported blob format {}",
                blob.format
            )));
        }

        let material = self.key().await?;
        if blob.key_id != material.id {
            return Err(storage_err(format!(
                "blob was encrypted with key {} but the keychain holds key {}",
                blob.key_id, material.id
            )));
        }
        let cipher = build_cipher(&material)?;

        let nonce_bytes = URL_SAFE_NO_PAD
            .decode(blob.nonce)
            .map_err(|e| storage_err(format!("nonce decode failed: {e}")))?;
        if nonce_bytes.len() != 12 {
            return Err(storage_err(format!(
                "nonce must be 12 bytes, got {}",
                nonce_bytes.len()
            )));
        }
        let ciphertext = URL_SAFE_NO_PAD
            .decode(blob.ciphertext)
            .map_err(|e| storage_err(format!("ciphertext decode failed: {e}")))?;

        cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &ciphertext,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|e| storage_err(format!("decrypt failed: {e}")))
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<(), SecureStoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(storage_err(err)),
        }
    }
}

fn write_blob(path: &Path, blob: &StoredBlob) -> Result<(), SecureStoreError> {
    let parent = path
        .parent()
        .ok_or_else(|| storage_err("invalid storage path"))?;
    fs::create_dir_all(parent).map_err(storage_err)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(storage_err)?;
    serde_json::to_writer(&mut tmp, blob).map_err(storage_err)?;
    tmp.flush().map_err(storage_err)?;
    tmp.as_file().sync_all().map_err(storage_err)?;
    tmp.persist(path).map_err(|e| storage_err(e.error))?;
    Ok(())
}

fn read_blob(path: &Path, key: &str) -> Result<StoredBlob, SecureStoreError> {
    let bytes = fs::read(path).map_err(|err| {
        if err.kind() == ErrorKind::NotFound {
            SecureStoreError::NotFound {
                key: key.to_string(),
            }
        } else {
            storage_err(err)
        }
    })?;
    serde_json::from_slice(&bytes).map_err(storage_err)
}

fn build_cipher(material: &KeyMaterial) -> Result<Aes256Gcm, SecureStoreError> {
    Aes256Gcm::new_from_slice(&material.bytes)
        .map_err(|e| storage_err(format!("cipher init failed: {e}")))
}

fn storage_err<E: ToString>(err: E) -> SecureStoreError {
    SecureStoreError::Storage {
        reason: err.to_string(),
    }
}
