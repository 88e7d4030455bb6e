//! peervault-daemon: headless P2P vault sync node.

use anyhow::{bail, Context, Result};
use clap::Parser;
use peervault_core::{
    BlobStore, CancelToken, ConflictTracker, DocumentManager, EncryptedStorage, GarbageCollector,
    GcConfig, MigrationRunner, PeerConsensus, PeerEvent, PeerManager, ReplicaId, RunStatus,
    StorageAdapter,
};
use peervault_daemon::config::DaemonConfig;
use peervault_daemon::fs_storage::FsStorage;
use peervault_daemon::ws_transport::WsTransport;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const TRANSPORT_KEY: &str = "peervault-transport-key";

#[derive(Parser, Debug)]
#[command(name = "peervault-daemon")]
#[command(about = "P2P vault sync daemon")]
struct Args {
    /// Directory for the vault's persistent state
    #[arg(short, long)]
    data_dir: PathBuf,

    /// Address to listen on for incoming peers
    #[arg(short, long, default_value = "0.0.0.0:9473")]
    listen: String,

    /// Display name shown to peers
    #[arg(long)]
    nickname: Option<String>,

    /// Accept pairing requests without interaction
    #[arg(long)]
    auto_accept: bool,

    /// Seconds between autosync cycles (0 = push-only)
    #[arg(long, default_value_t = 300)]
    sync_interval_secs: u64,

    /// Seconds between GC runs (0 = disabled)
    #[arg(long, default_value_t = 3600)]
    gc_interval_secs: u64,

    /// Disable history compaction entirely
    #[arg(long)]
    gc_disabled: bool,

    /// Compact only once the document exceeds this many MB
    #[arg(long, default_value_t = 10)]
    gc_max_doc_mb: u64,

    /// Never compact operations younger than this many days
    #[arg(long, default_value_t = 30)]
    gc_min_history_days: u64,

    /// File holding a 32-byte at-rest encryption key
    #[arg(long)]
    encryption_key_file: Option<PathBuf>,

    /// Invite tickets to pair with on startup (repeatable)
    #[arg(long)]
    peer: Vec<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> Result<(DaemonConfig, Vec<String>, bool)> {
        let encryption_key = match &self.encryption_key_file {
            Some(path) => {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("reading key file {}", path.display()))?;
                let key: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("key file must hold exactly 32 bytes"))?;
                Some(key)
            }
            None => None,
        };
        let config = DaemonConfig {
            data_dir: self.data_dir,
            listen: self.listen,
            nickname: self.nickname,
            auto_accept: self.auto_accept,
            auto_sync_interval: Duration::from_secs(self.sync_interval_secs),
            gc_interval: Duration::from_secs(self.gc_interval_secs),
            gc: GcConfig {
                enabled: !self.gc_disabled,
                max_doc_size_mb: self.gc_max_doc_mb,
                min_history_days: self.gc_min_history_days,
                require_peer_consensus: true,
            },
            encryption_key,
        };
        Ok((config, self.peer, self.verbose))
    }
}

/// Load (or mint) the 32-byte transport key; the replica id is derived
/// from its first 8 bytes.
async fn load_replica_id(storage: &dyn StorageAdapter) -> Result<ReplicaId> {
    let key = match storage.read(TRANSPORT_KEY).await? {
        Some(bytes) if bytes.len() == 32 => bytes,
        Some(_) => bail!("corrupt transport key"),
        None => {
            use rand::RngCore;
            let mut key = vec![0u8; 32];
            rand::rng().fill_bytes(&mut key);
            // All-zero replica ids are reserved; re-roll the id bytes.
            while key[..8] == [0u8; 8] {
                rand::rng().fill_bytes(&mut key[..8]);
            }
            storage.write(TRANSPORT_KEY, &key).await?;
            key
        }
    };
    let id = u64::from_be_bytes(key[..8].try_into().expect("8 bytes"));
    Ok(ReplicaId::from(id))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let (config, pair_tickets, verbose) = args.into_config()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { Level::DEBUG } else { Level::INFO };
        EnvFilter::default().add_directive(level.into())
    });
    FmtSubscriber::builder().with_env_filter(filter).init();

    run(config, pair_tickets).await
}

async fn run(config: DaemonConfig, pair_tickets: Vec<String>) -> Result<()> {
    // Storage, optionally wrapped with at-rest encryption.
    let fs: Arc<dyn StorageAdapter> = Arc::new(FsStorage::new(&config.data_dir).await?);
    let storage: Arc<dyn StorageAdapter> = match &config.encryption_key {
        Some(key) => {
            let encrypted = EncryptedStorage::new(fs, key);
            // Wrap any values written before encryption was enabled.
            let report = encrypted
                .reencrypt_all(&CancelToken::new(), |_, _| {})
                .await?;
            if report.encrypted > 0 {
                info!(encrypted = report.encrypted, "wrapped legacy plaintext values");
            }
            Arc::new(encrypted)
        }
        None => fs,
    };

    // Schema migrations run before anything touches the data.
    let runner = MigrationRunner::with_builtin(Arc::clone(&storage));
    let report = runner
        .run(&CancelToken::new(), &|pct, msg| {
            info!(percent = pct, step = msg, "migration progress");
        })
        .await?;
    match report.status {
        RunStatus::Failed => bail!(
            "schema migration failed: {}",
            report.error.unwrap_or_default()
        ),
        RunStatus::Ok => info!(migrations = ?report.migrations_run, "schema migrated"),
        RunStatus::UpToDate => {}
    }

    let replica = load_replica_id(storage.as_ref()).await?;
    info!(replica_id = %replica, "replica identity loaded");

    let document = Arc::new(Mutex::new(
        DocumentManager::initialize(Arc::clone(&storage), replica).await?,
    ));
    let blobs = Arc::new(BlobStore::new(Arc::clone(&storage)));
    let conflicts = Arc::new(ConflictTracker::new());

    let transport = Arc::new(WsTransport::new(replica.to_string(), config.listen.clone()));
    let manager = PeerManager::initialize(
        Arc::clone(&document),
        Arc::clone(&blobs),
        Arc::clone(&conflicts),
        Arc::clone(&storage),
        transport,
        config.manager_config(),
    )
    .await?;

    let _event_log = manager.on_event(|event| match event {
        PeerEvent::Connected { node_id } => info!(peer = %node_id, "peer connected"),
        PeerEvent::Disconnected { node_id } => info!(peer = %node_id, "peer disconnected"),
        PeerEvent::Synced { node_id } => info!(peer = %node_id, "peer synced"),
        PeerEvent::Error { node_id, error } => warn!(peer = %node_id, error = %error, "peer error"),
        PeerEvent::PairingRequest { node_id } => info!(peer = %node_id, "pairing requested"),
        PeerEvent::PairingAccepted { node_id } => info!(peer = %node_id, "pairing accepted"),
        PeerEvent::PairingDenied { node_id } => info!(peer = %node_id, "pairing denied"),
        PeerEvent::StatusChange { node_id, state } => {
            info!(peer = %node_id, state = ?state, "peer state")
        }
    });
    let _conflict_log = conflicts.on_conflict(|conflict| {
        warn!(
            path = %conflict.path,
            peers = ?conflict.peer_ids,
            "concurrent edits detected"
        );
    });

    println!("invite ticket: {}", manager.generate_invite()?);

    for ticket in &pair_tickets {
        match manager.add_peer(ticket, None).await {
            Ok(node_id) => info!(peer = %node_id, "pairing initiated"),
            Err(e) => warn!(error = %e, "could not add peer"),
        }
    }

    // Background GC loop.
    let gc_cancel = CancelToken::new();
    let gc_task = if !config.gc_interval.is_zero() {
        let gc = GarbageCollector::new(Arc::clone(&document), Arc::clone(&blobs), config.gc.clone());
        let manager = Arc::clone(&manager);
        let cancel = gc_cancel.clone();
        let interval = config.gc_interval;
        Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if cancel.is_cancelled() {
                    return;
                }
                let consensus = PeerConsensus::gather(&manager).await;
                match gc.run(&consensus, &cancel).await {
                    Ok(report) => info!(
                        compacted = report.compacted,
                        blobs_removed = report.blobs_removed,
                        bytes_reclaimed = report.blob_bytes_reclaimed,
                        "gc cycle finished"
                    ),
                    Err(e) => warn!(error = %e, "gc cycle failed"),
                }
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    gc_cancel.cancel();
    if let Some(task) = gc_task {
        task.abort();
    }
    manager.shutdown().await?;
    document.lock().await.save().await?;
    Ok(())
}
