//! Content-addressed blob store with reference counting.
//!
//! Blob bytes live under `blob/<hex-hash>`, metadata under
//! `blob-meta/<hex-hash>`. Metadata is the ground truth: a bytes key
//! without metadata is a recoverable leftover from an interrupted
//! `release`, never a live blob.
//!
//! Write ordering: bytes first, then metadata on `add`; bytes first, then
//! metadata on `release` (removing the metadata is the commit point).

use crate::storage::{self, StorageAdapter, StorageError, BLOB_META_PREFIX, BLOB_PREFIX};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Corrupt blob metadata for {0}")]
    CorruptMeta(String),
}

pub type Result<T> = std::result::Result<T, BlobError>;

/// Metadata record for one stored blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobMeta {
    /// Lowercase hex SHA-256 of the bytes.
    pub hash: String,
    /// Byte length of the stored content.
    pub size: u64,
    /// Mime type recorded at first add.
    pub mime_type: String,
    /// Milliseconds since epoch of first add.
    pub created_at: u64,
    /// Number of live references.
    pub ref_count: u64,
}

/// Compute the lowercase hex SHA-256 of `bytes`.
pub fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Constant-time equality for two hex digests.
fn digest_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Content-addressed binary storage.
///
/// Identical content deduplicates by hash: re-adding increments the
/// reference count instead of writing a second copy. Bytes are physically
/// removed only when the count returns to zero via [`BlobStore::release`].
pub struct BlobStore {
    storage: Arc<dyn StorageAdapter>,
    /// Serializes refcount read-modify-write cycles.
    write_lock: tokio::sync::Mutex<()>,
}

impl BlobStore {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            storage,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn bytes_key(hash: &str) -> String {
        format!("{BLOB_PREFIX}{hash}")
    }

    fn meta_key(hash: &str) -> String {
        format!("{BLOB_META_PREFIX}{hash}")
    }

    async fn read_meta(&self, hash: &str) -> Result<Option<BlobMeta>> {
        match self.storage.read(&Self::meta_key(hash)).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|_| BlobError::CorruptMeta(hash.to_string())),
            None => Ok(None),
        }
    }

    async fn write_meta(&self, meta: &BlobMeta) -> Result<()> {
        let bytes = serde_json::to_vec(meta).expect("blob metadata serializes");
        self.storage.write(&Self::meta_key(&meta.hash), &bytes).await?;
        Ok(())
    }

    /// Store `bytes` and return their hash. Always increments the refcount;
    /// writes the bytes only if this content is new.
    pub async fn add(&self, bytes: Vec<u8>, mime_type: &str) -> Result<String> {
        let (bytes, hash) = tokio::task::spawn_blocking(move || {
            let hash = compute_hash(&bytes);
            (bytes, hash)
        })
        .await
        .expect("hashing task never panics");

        self.add_prehashed(bytes, hash.clone(), mime_type).await?;
        Ok(hash)
    }

    /// Hash `bytes`, compare against `expected_hash` in constant time, and
    /// add on match. Returns `false` (storing nothing) on mismatch.
    pub async fn verify_and_add(
        &self,
        bytes: Vec<u8>,
        expected_hash: &str,
        mime_type: &str,
    ) -> Result<bool> {
        let (bytes, hash) = tokio::task::spawn_blocking(move || {
            let hash = compute_hash(&bytes);
            (bytes, hash)
        })
        .await
        .expect("hashing task never panics");

        if !digest_eq(&hash, expected_hash) {
            warn!(
                expected = %expected_hash,
                actual = %hash,
                "blob integrity check failed"
            );
            return Ok(false);
        }

        self.add_prehashed(bytes, hash, mime_type).await?;
        Ok(true)
    }

    async fn add_prehashed(&self, bytes: Vec<u8>, hash: String, mime_type: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        match self.read_meta(&hash).await? {
            Some(mut meta) => {
                meta.ref_count += 1;
                self.write_meta(&meta).await?;
                debug!(hash = %hash, ref_count = meta.ref_count, "blob deduplicated");
            }
            None => {
                let meta = BlobMeta {
                    hash: hash.clone(),
                    size: bytes.len() as u64,
                    mime_type: mime_type.to_string(),
                    created_at: now_ms(),
                    ref_count: 1,
                };
                // Bytes first: a crash here leaves an orphaned bytes key,
                // which metadata-as-truth readers ignore.
                self.storage.write(&Self::bytes_key(&hash), &bytes).await?;
                self.write_meta(&meta).await?;
                debug!(hash = %hash, size = meta.size, "blob stored");
            }
        }
        Ok(())
    }

    /// Fetch blob bytes, or `None` when the blob is not present locally.
    pub async fn get(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        if self.read_meta(hash).await?.is_none() {
            return Ok(None);
        }
        Ok(self.storage.read(&Self::bytes_key(hash)).await?)
    }

    /// Whether the blob is present locally.
    pub async fn has(&self, hash: &str) -> Result<bool> {
        Ok(self.read_meta(hash).await?.is_some())
    }

    /// Metadata for a blob, if present.
    pub async fn get_meta(&self, hash: &str) -> Result<Option<BlobMeta>> {
        self.read_meta(hash).await
    }

    /// Drop one reference. When the count reaches zero the bytes are
    /// deleted, then the metadata; removing the metadata commits the
    /// release.
    pub async fn release(&self, hash: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let Some(mut meta) = self.read_meta(hash).await? else {
            warn!(hash = %hash, "release of unknown blob ignored");
            return Ok(());
        };

        if meta.ref_count > 1 {
            meta.ref_count -= 1;
            self.write_meta(&meta).await?;
            debug!(hash = %hash, ref_count = meta.ref_count, "blob reference released");
        } else {
            self.storage.delete(&Self::bytes_key(hash)).await?;
            self.storage.delete(&Self::meta_key(hash)).await?;
            debug!(hash = %hash, "blob removed");
        }
        Ok(())
    }

    /// All stored hashes.
    pub async fn list(&self) -> Result<Vec<String>> {
        let keys =
            storage::list_keys_with_prefix(self.storage.as_ref(), BLOB_META_PREFIX).await?;
        Ok(keys
            .into_iter()
            .map(|k| k[BLOB_META_PREFIX.len()..].to_string())
            .collect())
    }

    /// Sum of all stored blob sizes in bytes.
    pub async fn total_size(&self) -> Result<u64> {
        let mut total = 0;
        for hash in self.list().await? {
            if let Some(meta) = self.read_meta(&hash).await? {
                total += meta.size;
            }
            tokio::task::yield_now().await;
        }
        Ok(total)
    }

    /// The subset of `hashes` not present locally.
    pub async fn get_missing(&self, hashes: &[String]) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for hash in hashes {
            if !self.has(hash).await? {
                missing.push(hash.clone());
            }
        }
        Ok(missing)
    }
}
