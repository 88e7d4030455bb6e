//! Transparent at-rest encryption over any [`StorageAdapter`].
//!
//! Values are wrapped in an XChaCha20-Poly1305 envelope:
//! `magic(4) || nonce(24) || ciphertext || tag(16)`. The magic prefix lets
//! the wrapper read legacy plaintext values written before encryption was
//! enabled, and lets bulk re-encryption resume after an interruption by
//! skipping already-wrapped entries.

use crate::cancel::CancelToken;
use crate::storage::{Result, StorageAdapter, StorageError};
use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use std::sync::Arc;
use tracing::{debug, warn};

/// Envelope marker. Anything not starting with this is legacy plaintext.
const MAGIC: &[u8; 4] = b"PVE1";
/// XChaCha20 nonce length.
const NONCE_LEN: usize = 24;

/// Outcome of [`EncryptedStorage::reencrypt_all`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReencryptReport {
    /// Entries newly wrapped with the current key.
    pub encrypted: usize,
    /// Entries that were already wrapped.
    pub skipped: usize,
    /// `(key, error)` for entries that could not be processed.
    pub failed: Vec<(String, String)>,
}

/// Outcome of [`EncryptedStorage::decrypt_all`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DecryptReport {
    /// Entries unwrapped back to plaintext.
    pub decrypted: usize,
    /// `(key, error)` for entries that could not be processed.
    pub failed: Vec<(String, String)>,
}

/// AEAD wrapper storage adapter.
///
/// Reads transparently handle both wrapped and legacy plaintext values;
/// writes always wrap.
pub struct EncryptedStorage {
    inner: Arc<dyn StorageAdapter>,
    cipher: XChaCha20Poly1305,
}

impl EncryptedStorage {
    pub fn new(inner: Arc<dyn StorageAdapter>, key: &[u8; 32]) -> Self {
        Self {
            inner,
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// The wrapped adapter, for callers that need raw access.
    pub fn inner(&self) -> &Arc<dyn StorageAdapter> {
        &self.inner
    }

    /// Whether `value` carries the envelope magic.
    pub fn is_wrapped(value: &[u8]) -> bool {
        value.len() >= MAGIC.len() + NONCE_LEN && value.starts_with(MAGIC)
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| StorageError::Integrity("encryption failed".into()))?;

        let mut out = Vec::with_capacity(MAGIC.len() + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, value: &[u8]) -> Result<Vec<u8>> {
        if !Self::is_wrapped(value) {
            // Legacy plaintext value
            return Ok(value.to_vec());
        }
        let nonce = XNonce::from_slice(&value[MAGIC.len()..MAGIC.len() + NONCE_LEN]);
        let ciphertext = &value[MAGIC.len() + NONCE_LEN..];
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StorageError::Integrity("MAC verification failed".into()))
    }

    /// Wrap every stored value with the current key.
    ///
    /// Already-wrapped values are skipped, so an interrupted run can simply
    /// be restarted. Individual failures are collected, not fatal.
    pub async fn reencrypt_all(
        &self,
        cancel: &CancelToken,
        progress: impl Fn(u8, &str),
    ) -> Result<ReencryptReport> {
        let keys = self.inner.list_keys().await?;
        let total = keys.len().max(1);
        let mut report = ReencryptReport::default();

        for (i, key) in keys.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            progress((i * 100 / total) as u8, key);

            match self.inner.read(key).await {
                Ok(Some(value)) if Self::is_wrapped(&value) => report.skipped += 1,
                Ok(Some(value)) => {
                    let wrapped = self.seal(&value)?;
                    match self.inner.write(key, &wrapped).await {
                        Ok(()) => report.encrypted += 1,
                        Err(e) => report.failed.push((key.clone(), e.to_string())),
                    }
                }
                Ok(None) => {}
                Err(e) => report.failed.push((key.clone(), e.to_string())),
            }
            tokio::task::yield_now().await;
        }

        progress(100, "done");
        debug!(
            encrypted = report.encrypted,
            skipped = report.skipped,
            failed = report.failed.len(),
            "bulk encryption finished"
        );
        Ok(report)
    }

    /// Unwrap every stored value back to plaintext (disabling encryption).
    pub async fn decrypt_all(
        &self,
        cancel: &CancelToken,
        progress: impl Fn(u8, &str),
    ) -> Result<DecryptReport> {
        let keys = self.inner.list_keys().await?;
        let total = keys.len().max(1);
        let mut report = DecryptReport::default();

        for (i, key) in keys.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            progress((i * 100 / total) as u8, key);

            match self.inner.read(key).await {
                Ok(Some(value)) if Self::is_wrapped(&value) => match self.open(&value) {
                    Ok(plaintext) => match self.inner.write(key, &plaintext).await {
                        Ok(()) => report.decrypted += 1,
                        Err(e) => report.failed.push((key.clone(), e.to_string())),
                    },
                    Err(e) => {
                        warn!(key = %key, error = %e, "could not decrypt entry");
                        report.failed.push((key.clone(), e.to_string()));
                    }
                },
                Ok(_) => {}
                Err(e) => report.failed.push((key.clone(), e.to_string())),
            }
            tokio::task::yield_now().await;
        }

        progress(100, "done");
        Ok(report)
    }
}

#[async_trait]
impl StorageAdapter for EncryptedStorage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.inner.read(key).await? {
            Some(value) => Ok(Some(self.open(&value)?)),
            None => Ok(None),
        }
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        let wrapped = self.seal(value)?;
        self.inner.write(key, &wrapped).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        self.inner.list_keys().await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }
}
