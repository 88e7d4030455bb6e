//! peervault-core: peer-to-peer synchronization of a versioned vault.
//!
//! One replicated Loro document per vault (a tree of folders, text files
//! and binary files), content-addressed blob storage for binaries, and a
//! framed peer protocol with one session per peer. This crate provides:
//! - the document model and its merge semantics
//! - the sync protocol and per-peer sessions
//! - blob storage with refcounts and integrity checks
//! - concurrent-edit detection
//! - schema migrations and garbage collection
//!
//! Transports and host storage are trait seams; the daemon supplies the
//! real ones.

pub mod blobs;
pub mod cancel;
pub mod conflicts;
pub mod document;
pub mod encryption;
pub mod events;
pub mod gc;
pub mod manager;
pub mod migration;
pub mod mime;
pub mod peers;
pub mod protocol;
pub mod replica_id;
pub mod session;
pub mod storage;
pub mod transport;

pub use blobs::{BlobMeta, BlobStore};
pub use cancel::CancelToken;
pub use conflicts::{ConflictRecord, ConflictTracker};
pub use document::{
    DocEvent, DocumentManager, FileMeta, ImportOrigin, NodeKind, NodeStatus, VaultView,
};
pub use encryption::EncryptedStorage;
pub use events::{EventBus, Subscription};
pub use gc::{GarbageCollector, GcConfig, GcReport, PeerConsensus};
pub use manager::{ManagerConfig, PeerEvent, PeerManager, PeerSnapshot};
pub use migration::{Migration, MigrationRunner, RunStatus};
pub use peers::{PeerRecord, PeerRoster, PeerState, RosterStore};
pub use protocol::{Message, PROTOCOL_VERSION};
pub use replica_id::{ReplicaId, ReplicaIdError};
pub use session::{SessionConfig, SessionState, SyncSession};
pub use storage::{MemoryStorage, StorageAdapter, StorageError};
pub use transport::{MemoryHub, MemoryTransport, StreamConn, Transport, TransportError};
