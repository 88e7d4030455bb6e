//! StorageAdapter trait: a flat byte-keyed persistent map.
//!
//! Implementations:
//! - `MemoryStorage` - for testing and ephemeral vaults
//! - `FsStorage` (in peervault-daemon) - one file per key under a base dir
//!
//! All persistent state of a vault lives behind this trait; see the key
//! layout constants below.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

/// Key for the serialized document snapshot.
pub const KEY_SNAPSHOT: &str = "peervault-snapshot";
/// Key for the decimal ASCII schema version.
pub const KEY_SCHEMA_VERSION: &str = "peervault-schema-version";
/// Key for the JSON peer roster.
pub const KEY_PEERS: &str = "peervault-peers";
/// Key for the transport private key (32 raw bytes).
pub const KEY_TRANSPORT_KEY: &str = "peervault-transport-key";
/// Prefix for migration backups: `peervault-migration-backup-<v>/<key>`.
pub const MIGRATION_BACKUP_PREFIX: &str = "peervault-migration-backup-";
/// Prefix for blob bytes: `blob/<hex-hash>`.
pub const BLOB_PREFIX: &str = "blob/";
/// Prefix for blob metadata: `blob-meta/<hex-hash>`.
pub const BLOB_META_PREFIX: &str = "blob-meta/";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Storage full")]
    Full,

    #[error("IO error: {0}")]
    Io(String),

    #[error("Integrity failure: {0}")]
    Integrity(String),

    #[error("Cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Flat byte-keyed persistent map.
///
/// Keys are flat strings (the `/` in blob keys is part of the key, not a
/// directory separator at this layer). Values are opaque byte strings.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Read the value stored under `key`, or `None` if absent.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write `value` under `key`, replacing any previous value.
    async fn write(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Delete `key`. Deleting an absent key is a no-op.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List all keys, in unspecified order.
    async fn list_keys(&self) -> Result<Vec<String>>;

    /// Check whether `key` is present.
    async fn exists(&self, key: &str) -> Result<bool>;
}

/// List the keys starting with `prefix`.
pub async fn list_keys_with_prefix(
    storage: &dyn StorageAdapter,
    prefix: &str,
) -> Result<Vec<String>> {
    let keys = storage.list_keys().await?;
    Ok(keys.into_iter().filter(|k| k.starts_with(prefix)).collect())
}

/// In-memory storage for testing
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let storage = MemoryStorage::new();
        storage.write("k", b"value").await.unwrap();
        assert_eq!(storage.read("k").await.unwrap(), Some(b"value".to_vec()));
    }

    #[tokio::test]
    async fn test_read_missing_returns_none() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.read("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_overwrites() {
        let storage = MemoryStorage::new();
        storage.write("k", b"one").await.unwrap();
        storage.write("k", b"two").await.unwrap();
        assert_eq!(storage.read("k").await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let storage = MemoryStorage::new();
        storage.write("k", b"value").await.unwrap();
        storage.delete("k").await.unwrap();
        assert_eq!(storage.read("k").await.unwrap(), None);
        assert!(!storage.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_missing_is_noop() {
        let storage = MemoryStorage::new();
        storage.delete("missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_keys() {
        let storage = MemoryStorage::new();
        storage.write("a", b"1").await.unwrap();
        storage.write("b", b"2").await.unwrap();
        let mut keys = storage.list_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_list_keys_with_prefix() {
        let storage = MemoryStorage::new();
        storage.write("blob/aa", b"1").await.unwrap();
        storage.write("blob/bb", b"2").await.unwrap();
        storage.write("blob-meta/aa", b"3").await.unwrap();
        let mut keys = list_keys_with_prefix(&storage, BLOB_PREFIX).await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["blob/aa".to_string(), "blob/bb".to_string()]);
    }
}
