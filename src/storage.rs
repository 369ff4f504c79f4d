//! Persistent storage for protocol state.
//!
//! Provides a `Storage` trait and a sled-backed implementation. The whole
//! protocol state travels as one [`ServiceSnapshot`] (plus, for the
//! in-process stack, the plaintext cipher engine's state) bincode-encoded
//! under fixed keys: the logs are small relative to chain data, and a single
//! atomic snapshot sidesteps cross-tree consistency questions. `flush()` runs
//! before a save reports success.

use crate::cipher::PlainEngine;
use crate::service::ServiceSnapshot;

/// Errors from storage operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

const KEY_SNAPSHOT: &str = "service_snapshot";
const KEY_CIPHER: &str = "cipher_state";

/// Trait for persistent storage backends.
pub trait Storage {
    fn put_blob(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;
    fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn flush(&self) -> Result<(), StorageError>;
}

/// Persist a service snapshot, flushing before returning.
pub fn save_snapshot(
    storage: &dyn Storage,
    snapshot: &ServiceSnapshot,
) -> Result<(), StorageError> {
    let bytes = crate::serialize(snapshot).map_err(|e| StorageError::Serialization(e.to_string()))?;
    storage.put_blob(KEY_SNAPSHOT, &bytes)?;
    storage.flush()
}

/// Load the most recently saved service snapshot, if any.
pub fn load_snapshot(storage: &dyn Storage) -> Result<Option<ServiceSnapshot>, StorageError> {
    match storage.get_blob(KEY_SNAPSHOT)? {
        Some(bytes) => {
            let snapshot =
                crate::deserialize(&bytes).map_err(|e| StorageError::Serialization(e.to_string()))?;
            Ok(Some(snapshot))
        }
        None => Ok(None),
    }
}

/// Persist the plaintext cipher engine's state alongside the snapshot.
///
/// Only the in-process stack needs this; a real homomorphic backend owns its
/// ciphertexts elsewhere and its handles stay valid across restarts.
pub fn save_cipher(storage: &dyn Storage, engine: &PlainEngine) -> Result<(), StorageError> {
    let bytes = crate::serialize(engine).map_err(|e| StorageError::Serialization(e.to_string()))?;
    storage.put_blob(KEY_CIPHER, &bytes)?;
    storage.flush()
}

/// Load the plaintext cipher engine's state, if previously saved.
pub fn load_cipher(storage: &dyn Storage) -> Result<Option<PlainEngine>, StorageError> {
    match storage.get_blob(KEY_CIPHER)? {
        Some(bytes) => {
            let engine =
                crate::deserialize(&bytes).map_err(|e| StorageError::Serialization(e.to_string()))?;
            Ok(Some(engine))
        }
        None => Ok(None),
    }
}

/// Sled-backed storage implementation.
pub struct SledStorage {
    #[allow(dead_code)]
    db: sled::Db,
    blobs: sled::Tree,
}

impl SledStorage {
    /// Open or create a sled database at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::Io(e.to_string()))?;
        let blobs = db
            .open_tree("blobs")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(SledStorage { db, blobs })
    }
}

impl Storage for SledStorage {
    fn put_blob(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.blobs
            .insert(key.as_bytes(), bytes)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let value = self
            .blobs
            .get(key.as_bytes())
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.blobs
            .flush()
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }
}
