//! File-backed storage adapter: one file per key under a base directory.
//!
//! Keys live in a flat namespace but may contain `/` (blob keys), so each
//! key is escaped into a single safe file name rather than mapped onto
//! directories.

use async_trait::async_trait;
use peervault_core::storage::{Result, StorageAdapter, StorageError};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Escape a storage key into a flat file name. `%` escapes itself so the
/// mapping is reversible.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            c => out.push(c),
        }
    }
    out
}

fn decode_key(name: &str) -> String {
    name.replace("%2F", "/").replace("%25", "%")
}

fn io_err(e: std::io::Error) -> StorageError {
    StorageError::Io(e.to_string())
}

/// StorageAdapter over a plain directory.
pub struct FsStorage {
    base: PathBuf,
}

impl FsStorage {
    /// Create the adapter, making the base directory if needed.
    pub async fn new(base: &Path) -> Result<Self> {
        fs::create_dir_all(base).await.map_err(io_err)?;
        Ok(Self {
            base: base.to_path_buf(),
        })
    }

    fn path_of(&self, key: &str) -> PathBuf {
        self.base.join(encode_key(key))
    }
}

#[async_trait]
impl StorageAdapter for FsStorage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_of(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(e)),
        }
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        // Write-then-rename so a crash never leaves a torn value.
        let path = self.path_of(key);
        let tmp = self.base.join(format!(".tmp-{}", encode_key(key)));
        fs::write(&tmp, value).await.map_err(io_err)?;
        fs::rename(&tmp, &path).await.map_err(io_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_of(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(e)),
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut dir = fs::read_dir(&self.base).await.map_err(io_err)?;
        while let Some(entry) = dir.next_entry().await.map_err(io_err)? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(".tmp-") {
                continue;
            }
            if entry.file_type().await.map_err(io_err)?.is_file() {
                keys.push(decode_key(&name));
            }
        }
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(fs::try_exists(self.path_of(key)).await.map_err(io_err)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn storage() -> (TempDir, FsStorage) {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage::new(dir.path()).await.unwrap();
        (dir, storage)
    }

    #[test]
    fn test_key_encoding_roundtrip() {
        for key in [
            "peervault-snapshot",
            "blob/aabbcc",
            "blob-meta/aabbcc",
            "peervault-migration-backup-2/blob/xx",
            "weird%key/with%2Fstuff",
        ] {
            assert_eq!(decode_key(&encode_key(key)), key);
        }
    }

    #[test]
    fn test_encoded_keys_are_flat() {
        assert!(!encode_key("blob/aabbcc").contains('/'));
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let (_dir, storage) = storage().await;
        storage.write("blob/aa", b"bytes").await.unwrap();
        assert_eq!(storage.read("blob/aa").await.unwrap(), Some(b"bytes".to_vec()));
        assert!(storage.exists("blob/aa").await.unwrap());

        storage.delete("blob/aa").await.unwrap();
        assert_eq!(storage.read("blob/aa").await.unwrap(), None);
        storage.delete("blob/aa").await.unwrap(); // idempotent
    }

    #[tokio::test]
    async fn test_list_keys_decodes() {
        let (_dir, storage) = storage().await;
        storage.write("blob/aa", b"1").await.unwrap();
        storage.write("peervault-peers", b"2").await.unwrap();

        let mut keys = storage.list_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["blob/aa".to_string(), "peervault-peers".to_string()]);
    }

    #[tokio::test]
    async fn test_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        {
            let storage = FsStorage::new(dir.path()).await.unwrap();
            storage.write("k", b"v").await.unwrap();
        }
        let storage = FsStorage::new(dir.path()).await.unwrap();
        assert_eq!(storage.read("k").await.unwrap(), Some(b"v".to_vec()));
    }
}
