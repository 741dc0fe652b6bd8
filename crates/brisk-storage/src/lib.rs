//! Encrypted-at-rest `SecureStore` backed by the filesystem. Snapshots are
//! sealed with AES-256-GCM under a key kept in the OS keyring (or a test
//! double).

pub mod key_provider;
pub mod secure_file_store;

pub use key_provider::{InMemoryKeyProvider, KeyError, KeyMaterial, KeyProvider, KeyringProvider};
pub use secure_file_store::EncryptedFileStore;
