//! Garbage collection: history compaction plus orphan blob reclamation.
//!
//! Compaction discards operations that are both older than the history
//! window and causally below the consensus cut (the per-replica minimum
//! across every connected, trusted peer). Orphan reclamation releases
//! blobs no live binary node references; refcounts keep shared content
//! alive.

use crate::blobs::BlobStore;
use crate::cancel::CancelToken;
use crate::document::{DocumentManager, DocumentError};
use crate::manager::PeerManager;
use loro::VersionVector;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum GcError {
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Blob error: {0}")]
    Blob(#[from] crate::blobs::BlobError),

    #[error("Cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, GcError>;

#[derive(Debug, Clone)]
pub struct GcConfig {
    pub enabled: bool,
    /// Compaction runs only once the serialized document exceeds this.
    pub max_doc_size_mb: u64,
    /// Operations younger than this many days are always retained.
    pub min_history_days: u64,
    /// Refuse to compact unless every connected, trusted peer's version
    /// is known.
    pub require_peer_consensus: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_doc_size_mb: 10,
            min_history_days: 30,
            require_peer_consensus: true,
        }
    }
}

/// Peer version knowledge used for the consensus cut.
#[derive(Debug, Default)]
pub struct PeerConsensus {
    /// Version vectors of the peers that must agree.
    pub vectors: Vec<VersionVector>,
    /// False when some required peer's version is unknown.
    pub complete: bool,
}

impl PeerConsensus {
    /// Collect the consensus inputs from the manager: one vector per
    /// connected, trusted peer.
    pub async fn gather(manager: &PeerManager) -> Self {
        let states = manager.get_peer_sync_states();
        let connected = manager.connected_trusted_peers().await;
        let mut vectors = Vec::new();
        let mut complete = true;
        for node_id in &connected {
            match states.get(node_id) {
                Some(vv) => vectors.push(vv.clone()),
                None => complete = false,
            }
        }
        Self { vectors, complete }
    }

    /// Consensus for a vault with no peers (everything local is safe).
    pub fn local_only() -> Self {
        Self {
            vectors: Vec::new(),
            complete: true,
        }
    }
}

/// Per-replica minimum across `local` and every peer vector. Replicas
/// absent from any input are absent from the meet.
fn meet(local: &VersionVector, peers: &[VersionVector]) -> VersionVector {
    let mut result = VersionVector::default();
    for (peer, counter) in local.iter() {
        let mut low = *counter;
        let mut present = true;
        for other in peers {
            match other.get(peer) {
                Some(c) => low = low.min(*c),
                None => {
                    present = false;
                    break;
                }
            }
        }
        if present && low > 0 {
            result.set_end(loro::ID::new(*peer, low));
        }
    }
    result
}

/// Outcome of one GC run.
#[derive(Debug, Clone, Default)]
pub struct GcReport {
    pub before_size: usize,
    pub after_size: usize,
    pub compacted: bool,
    pub blobs_removed: usize,
    pub blob_bytes_reclaimed: u64,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Compaction and blob reclamation driver.
pub struct GarbageCollector {
    document: Arc<Mutex<DocumentManager>>,
    blobs: Arc<BlobStore>,
    config: GcConfig,
}

impl GarbageCollector {
    pub fn new(
        document: Arc<Mutex<DocumentManager>>,
        blobs: Arc<BlobStore>,
        config: GcConfig,
    ) -> Self {
        Self {
            document,
            blobs,
            config,
        }
    }

    /// Run one GC cycle. Safe to cancel between phases; a cancelled run
    /// reports the work completed so far in its error-free phases and
    /// never leaves partially-compacted state.
    pub async fn run(&self, consensus: &PeerConsensus, cancel: &CancelToken) -> Result<GcReport> {
        let mut report = GcReport::default();

        // Phase 1: measure.
        let (doc_size, local_vv) = {
            let doc = self.document.lock().await;
            (doc.document_size()?, doc.current_version())
        };
        report.before_size = doc_size;
        report.after_size = doc_size;
        let threshold = self.config.max_doc_size_mb * 1024 * 1024;
        let compaction_due = self.config.enabled && doc_size as u64 >= threshold;

        if cancel.is_cancelled() {
            return Err(GcError::Cancelled);
        }
        tokio::task::yield_now().await;

        if compaction_due {
            // Phase 2: history cutoff.
            let cutoff = now_ms() - (self.config.min_history_days as i64) * 86_400_000;

            // Phase 3: consensus cut.
            let common = if self.config.require_peer_consensus {
                if !consensus.complete {
                    warn!("peer versions incomplete, skipping compaction this cycle");
                    None
                } else {
                    Some(meet(&local_vv, &consensus.vectors))
                }
            } else {
                Some(local_vv.clone())
            };

            if cancel.is_cancelled() {
                return Err(GcError::Cancelled);
            }
            tokio::task::yield_now().await;

            // Phase 4: compact. The document swap is atomic inside the
            // manager, so cancellation cannot observe a half-compacted
            // document.
            if let Some(common) = common {
                let outcome = {
                    let mut doc = self.document.lock().await;
                    doc.compact(&common, cutoff)?
                };
                report.after_size = outcome.after_size;
                report.compacted = outcome.compacted;
                if outcome.compacted {
                    let doc = self.document.lock().await;
                    doc.save().await?;
                }
            }
        } else {
            debug!(
                doc_size = doc_size,
                threshold = threshold,
                enabled = self.config.enabled,
                "compaction not due"
            );
        }

        if cancel.is_cancelled() {
            return Err(GcError::Cancelled);
        }
        tokio::task::yield_now().await;

        // Phase 5: orphan blob pass.
        let live: HashSet<String> = {
            let doc = self.document.lock().await;
            doc.live_blob_hashes()
        };
        for hash in self.blobs.list().await? {
            if cancel.is_cancelled() {
                return Err(GcError::Cancelled);
            }
            if live.contains(&hash) {
                continue;
            }
            let meta = self.blobs.get_meta(&hash).await?;
            self.blobs.release(&hash).await?;
            if let Some(meta) = meta {
                // Physically removed only when the last reference went.
                if meta.ref_count <= 1 {
                    report.blobs_removed += 1;
                    report.blob_bytes_reclaimed += meta.size;
                }
            }
            tokio::task::yield_now().await;
        }

        info!(
            before = report.before_size,
            after = report.after_size,
            compacted = report.compacted,
            blobs_removed = report.blobs_removed,
            bytes_reclaimed = report.blob_bytes_reclaimed,
            "gc finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica_id::ReplicaId;
    use crate::storage::MemoryStorage;

    async fn setup(config: GcConfig) -> (GarbageCollector, Arc<Mutex<DocumentManager>>, Arc<BlobStore>) {
        let storage = Arc::new(MemoryStorage::new());
        let document = Arc::new(Mutex::new(
            DocumentManager::initialize(storage.clone(), ReplicaId::generate())
                .await
                .unwrap(),
        ));
        let blobs = Arc::new(BlobStore::new(storage));
        let gc = GarbageCollector::new(Arc::clone(&document), Arc::clone(&blobs), config);
        (gc, document, blobs)
    }

    #[tokio::test]
    async fn test_orphan_blobs_reclaimed() {
        let (gc, document, blobs) = setup(GcConfig {
            enabled: false,
            ..Default::default()
        })
        .await;

        let live_hash = blobs.add(b"live".to_vec(), "a/b").await.unwrap();
        let orphan_hash = blobs.add(vec![9u8; 500], "a/b").await.unwrap();
        document
            .lock()
            .await
            .create_binary("/keep.bin", &live_hash, "a/b")
            .unwrap();

        let report = gc
            .run(&PeerConsensus::local_only(), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(report.blobs_removed, 1);
        assert_eq!(report.blob_bytes_reclaimed, 500);
        assert!(blobs.has(&live_hash).await.unwrap());
        assert!(!blobs.has(&orphan_hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_multiply_referenced_blob_survives_release() {
        let (gc, _document, blobs) = setup(GcConfig {
            enabled: false,
            ..Default::default()
        })
        .await;

        // Two references; GC's single release must not remove it.
        let hash = blobs.add(b"shared".to_vec(), "a/b").await.unwrap();
        blobs.add(b"shared".to_vec(), "a/b").await.unwrap();

        let report = gc
            .run(&PeerConsensus::local_only(), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(report.blobs_removed, 0);
        assert!(blobs.has(&hash).await.unwrap());
        assert_eq!(blobs.get_meta(&hash).await.unwrap().unwrap().ref_count, 1);
    }

    #[tokio::test]
    async fn test_observable_state_unchanged_by_gc() {
        let (gc, document, _blobs) = setup(GcConfig {
            enabled: true,
            max_doc_size_mb: 0,
            min_history_days: 0,
            require_peer_consensus: false,
        })
        .await;

        {
            let mut doc = document.lock().await;
            for i in 0..10 {
                doc.set_text_content("/a.md", &format!("rev {i}")).unwrap();
                doc.set_text_content("/b/c.md", &format!("other {i}")).unwrap();
            }
        }
        let (paths_before, a_before, c_before) = {
            let doc = document.lock().await;
            (
                doc.list_all_paths(),
                doc.get_text_content("/a.md").unwrap(),
                doc.get_text_content("/b/c.md").unwrap(),
            )
        };

        let report = gc
            .run(&PeerConsensus::local_only(), &CancelToken::new())
            .await
            .unwrap();

        let doc = document.lock().await;
        assert_eq!(doc.list_all_paths(), paths_before);
        assert_eq!(doc.get_text_content("/a.md").unwrap(), a_before);
        assert_eq!(doc.get_text_content("/b/c.md").unwrap(), c_before);
        assert!(report.after_size <= report.before_size);
    }

    #[tokio::test]
    async fn test_incomplete_consensus_skips_compaction() {
        let (gc, document, _blobs) = setup(GcConfig {
            enabled: true,
            max_doc_size_mb: 0,
            min_history_days: 0,
            require_peer_consensus: true,
        })
        .await;
        document.lock().await.set_text_content("/a.md", "x").unwrap();

        let consensus = PeerConsensus {
            vectors: Vec::new(),
            complete: false,
        };
        let report = gc.run(&consensus, &CancelToken::new()).await.unwrap();
        assert!(!report.compacted);
    }

    #[tokio::test]
    async fn test_small_document_skips_compaction_but_reclaims_blobs() {
        let (gc, _document, blobs) = setup(GcConfig {
            enabled: true,
            max_doc_size_mb: 1024,
            min_history_days: 0,
            require_peer_consensus: false,
        })
        .await;

        blobs.add(b"orphan".to_vec(), "a/b").await.unwrap();
        let report = gc
            .run(&PeerConsensus::local_only(), &CancelToken::new())
            .await
            .unwrap();

        assert!(!report.compacted);
        assert_eq!(report.blobs_removed, 1);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let (gc, _document, _blobs) = setup(GcConfig::default()).await;
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            gc.run(&PeerConsensus::local_only(), &cancel).await,
            Err(GcError::Cancelled)
        ));
    }

    #[test]
    fn test_meet_is_per_replica_minimum() {
        let mut local = VersionVector::default();
        local.set_end(loro::ID::new(1, 10));
        local.set_end(loro::ID::new(2, 5));

        let mut peer = VersionVector::default();
        peer.set_end(loro::ID::new(1, 7));
        // Replica 2 unknown to the peer.

        let common = meet(&local, &[peer]);
        assert_eq!(common.get(&1), Some(&7));
        assert_eq!(common.get(&2), None);
    }
}
