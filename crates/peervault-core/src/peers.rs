//! Peer roster: known peers and their persisted records.
//!
//! The roster is stored as a UTF-8 JSON array under the `peervault-peers`
//! key. Connection state, session handles and byte counters are transient
//! and live in the manager, not here.

use crate::storage::{StorageAdapter, StorageError, KEY_PEERS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Peer ID cannot be empty")]
    EmptyId,

    #[error("Unknown peer: {0}")]
    Unknown(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Corrupt roster: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, PeerError>;

/// Transient connection state of a peer.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PeerState {
    Disconnected,
    Connecting,
    Syncing,
    Synced,
    Error,
}

/// Persisted record for one known peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerRecord {
    /// Opaque transport identity of the remote replica.
    pub node_id: String,
    /// Ticket used to reach the peer (None if only ever inbound).
    pub ticket: Option<String>,
    /// Advertised machine name from the last handshake.
    pub hostname: Option<String>,
    /// User-chosen display name.
    pub nickname: Option<String>,
    /// First time this peer was seen (ms since epoch).
    pub first_seen: u64,
    /// Last handshake or frame from this peer (ms since epoch).
    pub last_seen: u64,
    /// Last completed sync cycle (ms since epoch).
    pub last_synced: Option<u64>,
    /// Set when pairing was accepted locally.
    pub trusted: bool,
}

impl PeerRecord {
    pub fn new(node_id: String, ticket: Option<String>, now_ms: u64) -> Self {
        Self {
            node_id,
            ticket,
            hostname: None,
            nickname: None,
            first_seen: now_ms,
            last_seen: now_ms,
            last_synced: None,
            trusted: false,
        }
    }
}

/// In-memory collection of peer records.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PeerRoster {
    pub peers: Vec<PeerRecord>,
}

impl PeerRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update a record. Timestamps only move forward; `trusted`
    /// sticks once set.
    pub fn upsert(&mut self, record: PeerRecord) -> Result<()> {
        if record.node_id.is_empty() {
            return Err(PeerError::EmptyId);
        }
        if let Some(existing) = self.peers.iter_mut().find(|p| p.node_id == record.node_id) {
            if record.ticket.is_some() {
                existing.ticket = record.ticket;
            }
            if record.hostname.is_some() {
                existing.hostname = record.hostname;
            }
            if record.nickname.is_some() {
                existing.nickname = record.nickname;
            }
            existing.last_seen = existing.last_seen.max(record.last_seen);
            if record.last_synced.is_some() {
                existing.last_synced = record.last_synced.max(existing.last_synced);
            }
            existing.trusted |= record.trusted;
        } else {
            self.peers.push(record);
        }
        Ok(())
    }

    pub fn remove(&mut self, node_id: &str) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p.node_id != node_id);
        self.peers.len() != before
    }

    pub fn get(&self, node_id: &str) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| p.node_id == node_id)
    }

    pub fn get_mut(&mut self, node_id: &str) -> Option<&mut PeerRecord> {
        self.peers.iter_mut().find(|p| p.node_id == node_id)
    }

    /// Peers that completed pairing.
    pub fn trusted(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.iter().filter(|p| p.trusted)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Roster persistence under [`KEY_PEERS`].
pub struct RosterStore {
    storage: Arc<dyn StorageAdapter>,
}

impl RosterStore {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self { storage }
    }

    pub async fn load(&self) -> Result<PeerRoster> {
        match self.storage.read(KEY_PEERS).await? {
            Some(bytes) => {
                let peers: Vec<PeerRecord> = serde_json::from_slice(&bytes)
                    .map_err(|e| PeerError::Corrupt(e.to_string()))?;
                Ok(PeerRoster { peers })
            }
            None => Ok(PeerRoster::new()),
        }
    }

    pub async fn save(&self, roster: &PeerRoster) -> Result<()> {
        let bytes = serde_json::to_vec(&roster.peers)
            .map_err(|e| PeerError::Corrupt(e.to_string()))?;
        self.storage.write(KEY_PEERS, &bytes).await?;
        Ok(())
    }
}
