//! Schema migrations: ordered, forward-only, with pre-migration backup.
//!
//! The chain is append-only. Removing a feature means adding a new
//! migration that deletes its data, never rewriting an old step.

use crate::cancel::CancelToken;
use crate::storage::{
    self, StorageAdapter, StorageError, KEY_SCHEMA_VERSION, MIGRATION_BACKUP_PREFIX,
};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Migration chain is not contiguous at version {0}")]
    BrokenChain(u32),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Cancelled")]
    Cancelled,

    #[error("Migration failed: {0}")]
    Step(String),
}

pub type Result<T> = std::result::Result<T, MigrationError>;

/// Progress callback: `(overall percent, message)`.
pub type Progress<'a> = &'a (dyn Fn(u8, &str) + Send + Sync);

/// Context handed to each migration step.
pub struct MigrationContext<'a> {
    pub storage: &'a dyn StorageAdapter,
    progress: &'a (dyn Fn(u8, &str) + Send + Sync),
}

impl MigrationContext<'_> {
    /// Report step-local progress in `[0, 100]`.
    pub fn on_progress(&self, percent: u8, message: &str) {
        (self.progress)(percent.min(100), message);
    }
}

/// One schema migration step. `to_version` is always `from_version + 1`.
///
/// Steps must be idempotent: rerunning from their starting version after a
/// crash must produce the same result.
#[async_trait]
pub trait Migration: Send + Sync {
    fn from_version(&self) -> u32;
    fn description(&self) -> &str;
    async fn migrate(&self, ctx: &MigrationContext<'_>) -> Result<()>;

    fn to_version(&self) -> u32 {
        self.from_version() + 1
    }
}

/// Outcome status of a migration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// Schema already at the latest version; nothing ran.
    UpToDate,
    /// All pending migrations applied.
    Ok,
    /// A migration failed (or the stored schema is newer than this build).
    Failed,
}

/// Report returned by [`MigrationRunner::run`].
#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: RunStatus,
    /// `to_version` of each migration that completed, in order.
    pub migrations_run: Vec<u32>,
    pub error: Option<String>,
}

/// Runs the migration chain against a storage adapter.
pub struct MigrationRunner {
    storage: Arc<dyn StorageAdapter>,
    migrations: Vec<Box<dyn Migration>>,
}

impl MigrationRunner {
    /// Build a runner, validating that the chain is `0->1->...->N`.
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        mut migrations: Vec<Box<dyn Migration>>,
    ) -> Result<Self> {
        migrations.sort_by_key(|m| m.from_version());
        for (i, migration) in migrations.iter().enumerate() {
            if migration.from_version() != i as u32 {
                return Err(MigrationError::BrokenChain(migration.from_version()));
            }
        }
        Ok(Self { storage, migrations })
    }

    /// Runner with the built-in application chain.
    pub fn with_builtin(storage: Arc<dyn StorageAdapter>) -> Self {
        Self::new(storage, builtin_migrations()).expect("builtin chain is contiguous")
    }

    /// Latest schema version this build knows about.
    pub fn latest_version(&self) -> u32 {
        self.migrations.last().map(|m| m.to_version()).unwrap_or(0)
    }

    async fn stored_version(&self) -> Result<u32> {
        match self.storage.read(KEY_SCHEMA_VERSION).await? {
            Some(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                text.trim()
                    .parse()
                    .map_err(|_| MigrationError::Step(format!("bad schema version: {text}")))
            }
            None => Ok(0),
        }
    }

    async fn write_version(&self, version: u32) -> Result<()> {
        self.storage
            .write(KEY_SCHEMA_VERSION, version.to_string().as_bytes())
            .await?;
        Ok(())
    }

    /// Copy every (non-backup) key under the backup prefix for `version`.
    /// Individual copy failures are logged, not fatal.
    async fn backup(&self, version: u32) -> Result<()> {
        let prefix = format!("{MIGRATION_BACKUP_PREFIX}{version}/");
        for key in self.storage.list_keys().await? {
            if key.starts_with(MIGRATION_BACKUP_PREFIX) {
                continue;
            }
            match self.storage.read(&key).await {
                Ok(Some(value)) => {
                    if let Err(e) = self.storage.write(&format!("{prefix}{key}"), &value).await {
                        warn!(key = %key, error = %e, "backup copy failed");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "backup read failed"),
            }
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    /// Restore every key from the backup prefix for `version`, then drop
    /// the backup.
    async fn restore(&self, version: u32) -> Result<()> {
        let prefix = format!("{MIGRATION_BACKUP_PREFIX}{version}/");
        let keys = storage::list_keys_with_prefix(self.storage.as_ref(), &prefix).await?;
        for backup_key in &keys {
            let original = &backup_key[prefix.len()..];
            if let Some(value) = self.storage.read(backup_key).await? {
                self.storage.write(original, &value).await?;
            }
            tokio::task::yield_now().await;
        }
        for backup_key in &keys {
            self.storage.delete(backup_key).await?;
        }
        Ok(())
    }

    async fn clear_backups(&self) -> Result<()> {
        let keys =
            storage::list_keys_with_prefix(self.storage.as_ref(), MIGRATION_BACKUP_PREFIX).await?;
        for key in keys {
            self.storage.delete(&key).await?;
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    /// Run all pending migrations.
    pub async fn run(&self, cancel: &CancelToken, progress: Progress<'_>) -> Result<RunReport> {
        let current = self.stored_version().await?;
        let latest = self.latest_version();

        if current == latest {
            progress(100, "up to date");
            return Ok(RunReport {
                status: RunStatus::UpToDate,
                migrations_run: Vec::new(),
                error: None,
            });
        }
        if current > latest {
            // The app is older than its data; never downgrade.
            warn!(stored = current, latest = latest, "data schema is newer than this build");
            return Ok(RunReport {
                status: RunStatus::Failed,
                migrations_run: Vec::new(),
                error: Some("newer-schema".into()),
            });
        }

        let pending: Vec<&dyn Migration> = self
            .migrations
            .iter()
            .filter(|m| m.from_version() >= current)
            .map(|m| m.as_ref())
            .collect();
        let total = pending.len().max(1) as u32;
        let mut migrations_run = Vec::new();

        for (i, migration) in pending.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(MigrationError::Cancelled);
            }

            let to = migration.to_version();
            let base = (i as u32 * 100) / total;
            progress(base as u8, migration.description());
            info!(
                from = migration.from_version(),
                to = to,
                description = migration.description(),
                "running migration"
            );

            self.backup(to).await?;

            let scaled = |pct: u8, msg: &str| {
                let overall = (i as u32 * 100 + pct.min(100) as u32) / total;
                progress(overall as u8, msg);
            };
            let ctx = MigrationContext {
                storage: self.storage.as_ref(),
                progress: &scaled,
            };

            match migration.migrate(&ctx).await {
                Ok(()) => {
                    self.write_version(to).await?;
                    migrations_run.push(to);
                    debug!(version = to, "migration committed");
                }
                Err(e) => {
                    warn!(version = to, error = %e, "migration failed; restoring backup");
                    self.restore(to).await?;
                    return Ok(RunReport {
                        status: RunStatus::Failed,
                        migrations_run,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        self.clear_backups().await?;
        progress(100, "done");
        Ok(RunReport {
            status: RunStatus::Ok,
            migrations_run,
            error: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Built-in chain
// ---------------------------------------------------------------------------

/// 0->1: move legacy inline blob metadata (`blobmeta-<hash>`) into the
/// `blob-meta/` namespace.
struct SplitBlobMetadata;

#[async_trait]
impl Migration for SplitBlobMetadata {
    fn from_version(&self) -> u32 {
        0
    }

    fn description(&self) -> &str {
        "split blob metadata into blob-meta/ namespace"
    }

    async fn migrate(&self, ctx: &MigrationContext<'_>) -> Result<()> {
        const LEGACY_PREFIX: &str = "blobmeta-";
        let keys = storage::list_keys_with_prefix(ctx.storage, LEGACY_PREFIX).await?;
        let total = keys.len().max(1);
        for (i, key) in keys.iter().enumerate() {
            let hash = &key[LEGACY_PREFIX.len()..];
            if let Some(value) = ctx.storage.read(key).await? {
                ctx.storage
                    .write(&format!("{}{hash}", storage::BLOB_META_PREFIX), &value)
                    .await?;
            }
            ctx.storage.delete(key).await?;
            ctx.on_progress((i * 100 / total) as u8, hash);
            tokio::task::yield_now().await;
        }
        ctx.on_progress(100, "blob metadata moved");
        Ok(())
    }
}

/// 1->2: delete legacy group records (`peervault-group-*`), a feature that
/// was removed from the product.
struct DropGroupRecords;

#[async_trait]
impl Migration for DropGroupRecords {
    fn from_version(&self) -> u32 {
        1
    }

    fn description(&self) -> &str {
        "remove legacy group records"
    }

    async fn migrate(&self, ctx: &MigrationContext<'_>) -> Result<()> {
        const GROUP_PREFIX: &str = "peervault-group-";
        let keys = storage::list_keys_with_prefix(ctx.storage, GROUP_PREFIX).await?;
        let total = keys.len().max(1);
        for (i, key) in keys.iter().enumerate() {
            ctx.storage.delete(key).await?;
            ctx.on_progress((i * 100 / total) as u8, key);
            tokio::task::yield_now().await;
        }
        ctx.on_progress(100, "group records removed");
        Ok(())
    }
}

/// The application's migration chain, in order.
pub fn builtin_migrations() -> Vec<Box<dyn Migration>> {
    vec![Box::new(SplitBlobMetadata), Box::new(DropGroupRecords)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::sync::Mutex;

    struct Noop {
        from: u32,
    }

    #[async_trait]
    impl Migration for Noop {
        fn from_version(&self) -> u32 {
            self.from
        }
        fn description(&self) -> &str {
            "noop"
        }
        async fn migrate(&self, _ctx: &MigrationContext<'_>) -> Result<()> {
            Ok(())
        }
    }

    struct Failing {
        from: u32,
    }

    #[async_trait]
    impl Migration for Failing {
        fn from_version(&self) -> u32 {
            self.from
        }
        fn description(&self) -> &str {
            "failing"
        }
        async fn migrate(&self, ctx: &MigrationContext<'_>) -> Result<()> {
            // Scribble over data before failing, to exercise restore.
            ctx.storage.write("victim", b"clobbered").await?;
            Err(MigrationError::Step("boom".into()))
        }
    }

    fn no_progress(_: u8, _: &str) {}

    #[tokio::test]
    async fn test_fresh_storage_runs_full_chain() {
        let storage = Arc::new(MemoryStorage::new());
        let runner = MigrationRunner::with_builtin(storage.clone());

        let seen = Mutex::new(Vec::new());
        let report = runner
            .run(&CancelToken::new(), &|pct, _msg| {
                seen.lock().unwrap().push(pct);
            })
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Ok);
        assert_eq!(report.migrations_run, vec![1, 2]);
        assert_eq!(
            storage.read(KEY_SCHEMA_VERSION).await.unwrap(),
            Some(b"2".to_vec())
        );

        let seen = seen.into_inner().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "monotonic: {seen:?}");
        assert!(seen.iter().all(|p| *p <= 100));
        assert_eq!(*seen.last().unwrap(), 100);
    }

    #[tokio::test]
    async fn test_second_run_is_up_to_date() {
        let storage = Arc::new(MemoryStorage::new());
        let runner = MigrationRunner::with_builtin(storage.clone());
        runner.run(&CancelToken::new(), &no_progress).await.unwrap();

        let report = runner.run(&CancelToken::new(), &no_progress).await.unwrap();
        assert_eq!(report.status, RunStatus::UpToDate);
        assert!(report.migrations_run.is_empty());
    }

    #[tokio::test]
    async fn test_newer_schema_fails_without_touching_storage() {
        let storage = Arc::new(MemoryStorage::new());
        storage.write(KEY_SCHEMA_VERSION, b"99").await.unwrap();
        let runner = MigrationRunner::with_builtin(storage.clone());

        let report = runner.run(&CancelToken::new(), &no_progress).await.unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.error.as_deref(), Some("newer-schema"));
        assert_eq!(
            storage.read(KEY_SCHEMA_VERSION).await.unwrap(),
            Some(b"99".to_vec())
        );
    }

    #[tokio::test]
    async fn test_failure_restores_backup() {
        let storage = Arc::new(MemoryStorage::new());
        storage.write("victim", b"original").await.unwrap();

        let runner = MigrationRunner::new(
            storage.clone(),
            vec![
                Box::new(Noop { from: 0 }),
                Box::new(Failing { from: 1 }),
            ],
        )
        .unwrap();

        let report = runner.run(&CancelToken::new(), &no_progress).await.unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.migrations_run, vec![1]);
        assert_eq!(report.error.as_deref(), Some("Migration failed: boom"));

        // The clobbered key was restored and schema stayed at 1.
        assert_eq!(
            storage.read("victim").await.unwrap(),
            Some(b"original".to_vec())
        );
        assert_eq!(
            storage.read(KEY_SCHEMA_VERSION).await.unwrap(),
            Some(b"1".to_vec())
        );
    }

    #[tokio::test]
    async fn test_success_clears_backups() {
        let storage = Arc::new(MemoryStorage::new());
        storage.write("data", b"x").await.unwrap();
        let runner = MigrationRunner::with_builtin(storage.clone());
        runner.run(&CancelToken::new(), &no_progress).await.unwrap();

        let backups = storage::list_keys_with_prefix(storage.as_ref(), MIGRATION_BACKUP_PREFIX)
            .await
            .unwrap();
        assert!(backups.is_empty());
    }

    #[tokio::test]
    async fn test_broken_chain_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let result = MigrationRunner::new(
            storage,
            vec![Box::new(Noop { from: 0 }), Box::new(Noop { from: 2 })],
        );
        assert!(matches!(result, Err(MigrationError::BrokenChain(2))));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let storage = Arc::new(MemoryStorage::new());
        let runner = MigrationRunner::with_builtin(storage);
        let cancel = CancelToken::new();
        cancel.cancel();

        assert!(matches!(
            runner.run(&cancel, &no_progress).await,
            Err(MigrationError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_builtin_split_blob_metadata() {
        let storage = Arc::new(MemoryStorage::new());
        storage.write("blobmeta-abc123", b"{\"size\":3}").await.unwrap();
        storage.write("blob/abc123", b"xyz").await.unwrap();

        let runner = MigrationRunner::with_builtin(storage.clone());
        runner.run(&CancelToken::new(), &no_progress).await.unwrap();

        assert_eq!(storage.read("blobmeta-abc123").await.unwrap(), None);
        assert_eq!(
            storage.read("blob-meta/abc123").await.unwrap(),
            Some(b"{\"size\":3}".to_vec())
        );
        assert_eq!(storage.read("blob/abc123").await.unwrap(), Some(b"xyz".to_vec()));
    }

    #[tokio::test]
    async fn test_builtin_drop_group_records() {
        let storage = Arc::new(MemoryStorage::new());
        storage.write("peervault-group-1", b"legacy").await.unwrap();
        storage.write("peervault-peers", b"[]").await.unwrap();

        let runner = MigrationRunner::with_builtin(storage.clone());
        runner.run(&CancelToken::new(), &no_progress).await.unwrap();

        assert_eq!(storage.read("peervault-group-1").await.unwrap(), None);
        assert_eq!(storage.read("peervault-peers").await.unwrap(), Some(b"[]".to_vec()));
    }

    #[tokio::test]
    async fn test_resume_from_partial_version() {
        let storage = Arc::new(MemoryStorage::new());
        storage.write(KEY_SCHEMA_VERSION, b"1").await.unwrap();
        let runner = MigrationRunner::with_builtin(storage.clone());

        let report = runner.run(&CancelToken::new(), &no_progress).await.unwrap();
        assert_eq!(report.status, RunStatus::Ok);
        // Only the 1->2 step ran.
        assert_eq!(report.migrations_run, vec![2]);
    }
}
