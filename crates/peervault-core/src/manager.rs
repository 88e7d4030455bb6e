//! PeerManager: roster of peers, session scheduling, pairing, event
//! fan-out.
//!
//! At most one live session per peer. Incoming and outgoing connections
//! race during simultaneous connects; the side with the lower node id
//! keeps its outgoing session so both peers settle on the same one.

use crate::blobs::BlobStore;
use crate::cancel::CancelToken;
use crate::conflicts::ConflictTracker;
use crate::document::{DocEvent, DocumentManager};
use crate::events::{EventBus, Subscription};
use crate::peers::{PeerError, PeerRecord, PeerRoster, PeerState, RosterStore};
use crate::replica_id::ReplicaId;
use crate::session::{
    backoff_delay, SessionConfig, SessionContext, SessionError, SessionEvent, SessionHandle,
    SessionState, SyncSession,
};
use crate::storage::StorageAdapter;
use crate::transport::{Transport, TransportError};
use futures::stream::{FuturesUnordered, StreamExt};
use loro::VersionVector;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Concurrent sessions driven by `sync_all`.
const SYNC_ALL_FANOUT: usize = 8;
/// Connect attempts per `sync_peer` call before giving up.
const CONNECT_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Peer has no ticket: {0}")]
    NoTicket(String),

    #[error("Shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, ManagerError>;

/// Manager configuration supplied by the embedder.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Period of the autosync loop; zero relies on unsolicited updates.
    pub auto_sync_interval: Duration,
    /// Accept pairing requests without an explicit user response.
    pub auto_accept_pairing: bool,
    pub hostname: Option<String>,
    pub nickname: Option<String>,
    pub session: SessionConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            auto_sync_interval: Duration::ZERO,
            auto_accept_pairing: false,
            hostname: None,
            nickname: None,
            session: SessionConfig::default(),
        }
    }
}

/// Events fanned out to embedder subscribers.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Connected { node_id: String },
    Disconnected { node_id: String },
    Synced { node_id: String },
    Error { node_id: String, error: String },
    StatusChange { node_id: String, state: PeerState },
    PairingRequest { node_id: String },
    PairingAccepted { node_id: String },
    PairingDenied { node_id: String },
}

/// Point-in-time view of one peer: persisted record plus transient state.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub record: PeerRecord,
    pub state: PeerState,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Incoming,
    Outgoing,
}

struct LiveSession {
    handle: Arc<SessionHandle>,
    direction: Direction,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Whether a new connection should replace the existing live session.
///
/// Same direction: replace (reconnect). Opposite directions during a
/// simultaneous connect: the lexicographically lower node id keeps its
/// outgoing session, so both sides keep the same one.
fn new_session_wins(
    existing: Direction,
    new: Direction,
    local_id: &str,
    remote_id: &str,
) -> bool {
    if existing == new {
        return true;
    }
    let keep_outgoing = local_id < remote_id;
    match new {
        Direction::Outgoing => keep_outgoing,
        Direction::Incoming => !keep_outgoing,
    }
}

struct ManagerInner {
    ctx: Arc<SessionContext>,
    transport: Arc<dyn Transport>,
    config: ManagerConfig,
    roster: RwLock<PeerRoster>,
    roster_store: RosterStore,
    sessions: Mutex<HashMap<String, LiveSession>>,
    peer_states: RwLock<HashMap<String, PeerState>>,
    peer_versions: RwLock<HashMap<String, Vec<u8>>>,
    events: Arc<EventBus<PeerEvent>>,
    session_events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: CancelToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Roster of peers and the sessions that serve them.
pub struct PeerManager {
    inner: Arc<ManagerInner>,
}

impl PeerManager {
    /// Load the roster, bring the transport up, and start the accept,
    /// event and autosync loops.
    pub async fn initialize(
        document: Arc<Mutex<DocumentManager>>,
        blobs: Arc<BlobStore>,
        conflicts: Arc<ConflictTracker>,
        storage: Arc<dyn StorageAdapter>,
        transport: Arc<dyn Transport>,
        config: ManagerConfig,
    ) -> Result<Arc<Self>> {
        let local_id = document.lock().await.replica_id();
        let ctx = Arc::new(SessionContext {
            local_id,
            hostname: config.hostname.clone(),
            nickname: config.nickname.clone(),
            document,
            blobs,
            conflicts,
            config: config.session.clone(),
        });

        transport.initialize().await?;
        let roster_store = RosterStore::new(storage);
        let roster = roster_store.load().await?;
        info!(peers = roster.len(), "peer roster loaded");

        let (session_events, session_events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            ctx,
            transport,
            config,
            roster: RwLock::new(roster),
            roster_store,
            sessions: Mutex::new(HashMap::new()),
            peer_states: RwLock::new(HashMap::new()),
            peer_versions: RwLock::new(HashMap::new()),
            events: Arc::new(EventBus::new()),
            session_events,
            shutdown: CancelToken::new(),
            tasks: Mutex::new(Vec::new()),
        });
        let manager = Arc::new(Self {
            inner: Arc::clone(&inner),
        });

        let mut tasks = inner.tasks.lock().await;
        tasks.push(tokio::spawn(Self::accept_loop(Arc::clone(&inner))));
        tasks.push(tokio::spawn(Self::session_event_loop(
            Arc::clone(&inner),
            session_events_rx,
        )));
        tasks.push(tokio::spawn(Self::local_change_loop(Arc::clone(&inner))));
        if !inner.config.auto_sync_interval.is_zero() {
            tasks.push(tokio::spawn(Self::autosync_loop(
                Arc::clone(&manager),
            )));
        }
        drop(tasks);

        Ok(manager)
    }

    /// The transport identity of this node.
    pub fn node_id(&self) -> String {
        self.inner.transport.node_id()
    }

    pub fn local_replica(&self) -> ReplicaId {
        self.inner.ctx.local_id
    }

    /// Subscribe to peer events. Handlers must not block.
    pub fn on_event(&self, cb: impl Fn(&PeerEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.events.subscribe(cb)
    }

    /// Ticket other devices use to pair with this node.
    pub fn generate_invite(&self) -> Result<String> {
        Ok(self.inner.transport.generate_invite()?)
    }

    // ---------------- roster ----------------

    pub fn get_peers(&self) -> Vec<PeerSnapshot> {
        let roster = self.inner.roster.read().unwrap_or_else(|e| e.into_inner());
        roster
            .peers
            .iter()
            .map(|record| self.snapshot_of(record))
            .collect()
    }

    pub fn get_peer(&self, node_id: &str) -> Option<PeerSnapshot> {
        let roster = self.inner.roster.read().unwrap_or_else(|e| e.into_inner());
        roster.get(node_id).map(|record| self.snapshot_of(record))
    }

    fn snapshot_of(&self, record: &PeerRecord) -> PeerSnapshot {
        let state = self
            .inner
            .peer_states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&record.node_id)
            .copied()
            .unwrap_or(PeerState::Disconnected);
        // Counters come from the live session, if any.
        let (bytes_sent, bytes_received) = self
            .inner
            .sessions
            .try_lock()
            .ok()
            .and_then(|sessions| {
                sessions.get(&record.node_id).map(|s| {
                    (
                        s.handle.stats().bytes_sent.load(Ordering::Relaxed),
                        s.handle.stats().bytes_received.load(Ordering::Relaxed),
                    )
                })
            })
            .unwrap_or((0, 0));
        PeerSnapshot {
            record: record.clone(),
            state,
            bytes_sent,
            bytes_received,
        }
    }

    /// Add a peer from an invite ticket and initiate pairing.
    pub async fn add_peer(&self, ticket: &str, nickname: Option<&str>) -> Result<String> {
        let node_id = self.inner.transport.ticket_node_id(ticket)?;
        {
            let mut roster = self.inner.roster.write().unwrap_or_else(|e| e.into_inner());
            let mut record = PeerRecord::new(node_id.clone(), Some(ticket.to_string()), now_ms());
            record.nickname = nickname.map(str::to_string);
            roster.upsert(record)?;
        }
        self.save_roster().await;
        self.set_peer_state(&node_id, PeerState::Connecting);

        self.ensure_session(&node_id).await?;
        self.inner
            .events
            .emit(&PeerEvent::PairingRequest {
                node_id: node_id.clone(),
            });
        if self.inner.config.auto_accept_pairing {
            self.respond_to_pairing(&node_id, true).await?;
        }
        Ok(node_id)
    }

    /// Complete (or deny) the pairing ceremony for a peer.
    pub async fn respond_to_pairing(&self, node_id: &str, accept: bool) -> Result<()> {
        if accept {
            {
                let mut roster =
                    self.inner.roster.write().unwrap_or_else(|e| e.into_inner());
                let record = roster
                    .get_mut(node_id)
                    .ok_or_else(|| ManagerError::UnknownPeer(node_id.to_string()))?;
                record.trusted = true;
            }
            self.save_roster().await;
            self.inner.events.emit(&PeerEvent::PairingAccepted {
                node_id: node_id.to_string(),
            });
        } else {
            self.inner.events.emit(&PeerEvent::PairingDenied {
                node_id: node_id.to_string(),
            });
            self.close_session(node_id).await;
        }
        Ok(())
    }

    /// Drop a peer: closes any live session and deletes the record.
    pub async fn remove_peer(&self, node_id: &str) -> Result<()> {
        self.close_session(node_id).await;
        let removed = {
            let mut roster = self.inner.roster.write().unwrap_or_else(|e| e.into_inner());
            roster.remove(node_id)
        };
        if !removed {
            return Err(ManagerError::UnknownPeer(node_id.to_string()));
        }
        self.inner
            .peer_states
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(node_id);
        self.inner
            .peer_versions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(node_id);
        self.save_roster().await;
        Ok(())
    }

    /// Last advertised version vector per peer, for the GC consensus cut.
    pub fn get_peer_sync_states(&self) -> HashMap<String, VersionVector> {
        self.inner
            .peer_versions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|(id, bytes)| {
                VersionVector::decode(bytes).ok().map(|vv| (id.clone(), vv))
            })
            .collect()
    }

    /// Peers with a live, trusted session right now.
    pub async fn connected_trusted_peers(&self) -> Vec<String> {
        let sessions = self.inner.sessions.lock().await;
        let roster = self.inner.roster.read().unwrap_or_else(|e| e.into_inner());
        sessions
            .iter()
            .filter(|(id, s)| {
                s.handle.is_alive() && roster.get(id).map(|r| r.trusted).unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    // ---------------- sync ----------------

    /// Ensure a session exists and run one full sync cycle.
    pub async fn sync_peer(&self, node_id: &str) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ManagerError::ShuttingDown);
        }
        let handle = self.ensure_session(node_id).await?;
        self.set_peer_state(node_id, PeerState::Syncing);
        handle.sync_now().await?;

        {
            let mut roster = self.inner.roster.write().unwrap_or_else(|e| e.into_inner());
            if let Some(record) = roster.get_mut(node_id) {
                record.last_synced = Some(now_ms());
            }
        }
        self.save_roster().await;
        self.set_peer_state(node_id, PeerState::Synced);
        Ok(())
    }

    /// Sync every trusted peer with bounded fan-out. Returns
    /// `(synced, failed)` counts.
    pub async fn sync_all(&self) -> (usize, usize) {
        let trusted: Vec<String> = {
            let roster = self.inner.roster.read().unwrap_or_else(|e| e.into_inner());
            roster.trusted().map(|p| p.node_id.clone()).collect()
        };
        let mut synced = 0;
        let mut failed = 0;
        let mut work: FuturesUnordered<_> = FuturesUnordered::new();
        let mut pending = trusted.into_iter();

        loop {
            while work.len() < SYNC_ALL_FANOUT {
                match pending.next() {
                    Some(node_id) => {
                        let this = self;
                        work.push(async move {
                            let result = this.sync_peer(&node_id).await;
                            (node_id, result)
                        });
                    }
                    None => break,
                }
            }
            match work.next().await {
                Some((node_id, Ok(()))) => {
                    debug!(peer_id = %node_id, "peer synced");
                    synced += 1;
                }
                Some((node_id, Err(e))) => {
                    debug!(peer_id = %node_id, error = %e, "peer sync failed");
                    failed += 1;
                }
                None => break,
            }
        }
        (synced, failed)
    }

    /// Close all sessions, persist the roster, release the transport.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown.cancel();
        let sessions: Vec<Arc<SessionHandle>> = {
            let mut sessions = self.inner.sessions.lock().await;
            sessions.drain().map(|(_, s)| s.handle).collect()
        };
        for session in sessions {
            session.close().await;
        }
        self.save_roster().await;
        self.inner.transport.shutdown().await?;
        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("peer manager shut down");
        Ok(())
    }

    // ---------------- internals ----------------

    async fn save_roster(&self) {
        let roster = {
            self.inner
                .roster
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        };
        if let Err(e) = self.inner.roster_store.save(&roster).await {
            warn!(error = %e, "failed to persist peer roster");
        }
    }

    fn set_peer_state(&self, node_id: &str, state: PeerState) {
        Self::set_peer_state_inner(&self.inner, node_id, state);
    }

    fn set_peer_state_inner(inner: &ManagerInner, node_id: &str, state: PeerState) {
        let changed = {
            let mut states = inner.peer_states.write().unwrap_or_else(|e| e.into_inner());
            states.insert(node_id.to_string(), state) != Some(state)
        };
        if changed {
            inner.events.emit(&PeerEvent::StatusChange {
                node_id: node_id.to_string(),
                state,
            });
        }
    }

    /// Get the live session for a peer, dialing with backoff if needed.
    async fn ensure_session(&self, node_id: &str) -> Result<Arc<SessionHandle>> {
        if let Some(existing) = self.inner.sessions.lock().await.get(node_id) {
            if existing.handle.is_alive() {
                return Ok(Arc::clone(&existing.handle));
            }
        }

        let ticket = {
            let roster = self.inner.roster.read().unwrap_or_else(|e| e.into_inner());
            roster
                .get(node_id)
                .ok_or_else(|| ManagerError::UnknownPeer(node_id.to_string()))?
                .ticket
                .clone()
                .ok_or_else(|| ManagerError::NoTicket(node_id.to_string()))?
        };

        self.set_peer_state(node_id, PeerState::Connecting);
        let mut last_err: Option<ManagerError> = None;
        for attempt in 0..CONNECT_ATTEMPTS {
            if self.inner.shutdown.is_cancelled() {
                return Err(ManagerError::ShuttingDown);
            }
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt - 1)).await;
            }
            let connect = tokio::time::timeout(
                self.inner.ctx.config.connect_timeout,
                self.inner.transport.connect(&ticket),
            );
            match connect.await {
                Ok(Ok(stream)) => {
                    match SyncSession::connect(
                        stream,
                        Arc::clone(&self.inner.ctx),
                        self.inner.session_events.clone(),
                    )
                    .await
                    {
                        Ok(handle) => {
                            let handle = Arc::new(handle);
                            Self::install_session(
                                &self.inner,
                                handle.clone(),
                                Direction::Outgoing,
                            )
                            .await;
                            return Ok(handle);
                        }
                        Err(e @ SessionError::VaultMismatch(_))
                        | Err(e @ SessionError::VersionConflict(_)) => {
                            // Not transient; retrying cannot help.
                            self.set_peer_state(node_id, PeerState::Error);
                            return Err(e.into());
                        }
                        Err(e) => last_err = Some(e.into()),
                    }
                }
                Ok(Err(e)) => last_err = Some(e.into()),
                Err(_) => {
                    last_err = Some(ManagerError::Session(SessionError::Transient(
                        "connect timeout".into(),
                    )))
                }
            }
        }
        self.set_peer_state(node_id, PeerState::Error);
        Err(last_err.unwrap_or(ManagerError::UnknownPeer(node_id.to_string())))
    }

    async fn close_session(&self, node_id: &str) {
        let session = self.inner.sessions.lock().await.remove(node_id);
        if let Some(session) = session {
            session.handle.close().await;
        }
        self.set_peer_state(node_id, PeerState::Disconnected);
    }

    /// Record a new live session, resolving simultaneous-connect races.
    async fn install_session(
        inner: &Arc<ManagerInner>,
        handle: Arc<SessionHandle>,
        direction: Direction,
    ) {
        let node_id = handle.remote_node_id();
        let local_id = inner.ctx.local_id.to_string();

        let replaced = {
            let mut sessions = inner.sessions.lock().await;
            match sessions.get(&node_id) {
                Some(existing) if existing.handle.is_alive() => {
                    if new_session_wins(existing.direction, direction, &local_id, &node_id) {
                        let old = sessions.insert(
                            node_id.clone(),
                            LiveSession {
                                handle: Arc::clone(&handle),
                                direction,
                            },
                        );
                        old.map(|s| s.handle)
                    } else {
                        debug!(peer_id = %node_id, "duplicate session, keeping existing");
                        drop(sessions);
                        handle.close().await;
                        return;
                    }
                }
                _ => {
                    sessions.insert(
                        node_id.clone(),
                        LiveSession {
                            handle: Arc::clone(&handle),
                            direction,
                        },
                    );
                    None
                }
            }
        };
        if let Some(old) = replaced {
            debug!(peer_id = %node_id, "duplicate session, replacing existing");
            old.close().await;
        }

        // Track the peer in the roster (handshake metadata included).
        {
            let mut roster = inner.roster.write().unwrap_or_else(|e| e.into_inner());
            let mut record = PeerRecord::new(node_id.clone(), None, now_ms());
            record.hostname = handle.remote().hostname.clone();
            record.nickname = handle.remote().nickname.clone();
            let _ = roster.upsert(record);
        }
        Self::set_peer_state_inner(inner, &node_id, PeerState::Syncing);
        inner.events.emit(&PeerEvent::Connected {
            node_id: node_id.clone(),
        });
    }

    async fn accept_loop(inner: Arc<ManagerInner>) {
        loop {
            if inner.shutdown.is_cancelled() {
                return;
            }
            let stream = match inner.transport.accept().await {
                Ok(stream) => stream,
                Err(TransportError::Closed) => return,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    continue;
                }
            };
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                match SyncSession::accept(
                    stream,
                    Arc::clone(&inner.ctx),
                    inner.session_events.clone(),
                )
                .await
                {
                    Ok(handle) => {
                        let handle = Arc::new(handle);
                        let node_id = handle.remote_node_id();
                        let trusted = {
                            let roster =
                                inner.roster.read().unwrap_or_else(|e| e.into_inner());
                            roster.get(&node_id).map(|r| r.trusted).unwrap_or(false)
                        };
                        Self::install_session(&inner, handle, Direction::Incoming).await;
                        if !trusted {
                            inner.events.emit(&PeerEvent::PairingRequest {
                                node_id: node_id.clone(),
                            });
                            if inner.config.auto_accept_pairing {
                                {
                                    let mut roster = inner
                                        .roster
                                        .write()
                                        .unwrap_or_else(|e| e.into_inner());
                                    if let Some(record) = roster.get_mut(&node_id) {
                                        record.trusted = true;
                                    }
                                }
                                inner.events.emit(&PeerEvent::PairingAccepted { node_id });
                            }
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "incoming session rejected");
                    }
                }
            });
        }
    }

    /// Apply session notifications to roster state and re-emit them as
    /// peer events.
    async fn session_event_loop(
        inner: Arc<ManagerInner>,
        mut rx: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            match event {
                SessionEvent::StateChanged { node_id, state } => {
                    let peer_state = match state {
                        SessionState::Disconnected | SessionState::Closing => {
                            PeerState::Disconnected
                        }
                        SessionState::Connecting | SessionState::Handshaking => {
                            PeerState::Connecting
                        }
                        SessionState::Syncing => PeerState::Syncing,
                        SessionState::Idle => PeerState::Synced,
                        SessionState::Error => PeerState::Error,
                    };
                    Self::set_peer_state_inner(&inner, &node_id, peer_state);
                }
                SessionEvent::PeerVersion {
                    node_id,
                    version_vector,
                } => {
                    inner
                        .peer_versions
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(node_id.clone(), version_vector);
                    let mut roster = inner.roster.write().unwrap_or_else(|e| e.into_inner());
                    if let Some(record) = roster.get_mut(&node_id) {
                        record.last_seen = now_ms();
                    }
                }
                SessionEvent::Synced { node_id } => {
                    {
                        let mut roster =
                            inner.roster.write().unwrap_or_else(|e| e.into_inner());
                        if let Some(record) = roster.get_mut(&node_id) {
                            record.last_synced = Some(now_ms());
                        }
                    }
                    inner.events.emit(&PeerEvent::Synced { node_id });
                }
                SessionEvent::Error { node_id, error } => {
                    inner.events.emit(&PeerEvent::Error { node_id, error });
                }
                SessionEvent::Closed { node_id } => {
                    inner.sessions.lock().await.remove(&node_id);
                    Self::set_peer_state_inner(&inner, &node_id, PeerState::Disconnected);
                    inner.events.emit(&PeerEvent::Disconnected { node_id });
                }
            }
        }
    }

    /// Broadcast local edits to every live session as incremental updates.
    async fn local_change_loop(inner: Arc<ManagerInner>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let _subscription = {
            let doc = inner.ctx.document.lock().await;
            doc.on_change(move |event| {
                if matches!(event, DocEvent::LocalChange { .. }) {
                    let _ = tx.send(());
                }
            })
        };

        while rx.recv().await.is_some() {
            if inner.shutdown.is_cancelled() {
                return;
            }
            // Coalesce bursts of local edits.
            while rx.try_recv().is_ok() {}

            let targets: Vec<(String, Arc<SessionHandle>)> = {
                let sessions = inner.sessions.lock().await;
                sessions
                    .iter()
                    .filter(|(_, s)| s.handle.is_alive())
                    .map(|(id, s)| (id.clone(), Arc::clone(&s.handle)))
                    .collect()
            };
            for (node_id, session) in targets {
                let since = {
                    let versions =
                        inner.peer_versions.read().unwrap_or_else(|e| e.into_inner());
                    versions
                        .get(&node_id)
                        .and_then(|bytes| VersionVector::decode(bytes).ok())
                        .unwrap_or_default()
                };
                let delta = {
                    let doc = inner.ctx.document.lock().await;
                    doc.export_delta(&since)
                };
                match delta {
                    Ok(delta) if !delta.is_empty() => {
                        // Blocks when the peer's queue is full: backpressure.
                        if let Err(e) = session.push_update(delta).await {
                            debug!(peer_id = %node_id, error = %e, "update push failed");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "delta export failed"),
                }
            }
        }
    }

    async fn autosync_loop(manager: Arc<PeerManager>) {
        let interval = manager.inner.config.auto_sync_interval;
        loop {
            tokio::time::sleep(interval).await;
            if manager.inner.shutdown.is_cancelled() {
                return;
            }
            let (synced, failed) = manager.sync_all().await;
            debug!(synced = synced, failed = failed, "autosync cycle finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::transport::MemoryHub;

    struct TestNode {
        manager: Arc<PeerManager>,
        document: Arc<Mutex<DocumentManager>>,
        storage: Arc<MemoryStorage>,
    }

    async fn make_node(hub: &Arc<MemoryHub>, name: &str) -> TestNode {
        let storage = Arc::new(MemoryStorage::new());
        let replica = ReplicaId::generate();
        let document = Arc::new(Mutex::new(
            DocumentManager::initialize(storage.clone(), replica)
                .await
                .unwrap(),
        ));
        let manager = PeerManager::initialize(
            Arc::clone(&document),
            Arc::new(BlobStore::new(storage.clone())),
            Arc::new(ConflictTracker::new()),
            storage.clone(),
            Arc::new(hub.transport(name)),
            ManagerConfig {
                auto_accept_pairing: true,
                hostname: Some(name.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        TestNode {
            manager,
            document,
            storage,
        }
    }

    /// Seed `b` with `a`'s vault snapshot so they sync the same vault.
    async fn share_vault(a: &TestNode, b: &TestNode) {
        let snapshot = {
            let mut doc = a.document.lock().await;
            doc.set_text_content("/seed.md", "seed").unwrap();
            doc.export_full().unwrap()
        };
        let peer = a.document.lock().await.replica_id();
        b.document
            .lock()
            .await
            .import(&snapshot, crate::document::ImportOrigin::Remote(peer))
            .unwrap();
    }

    #[tokio::test]
    async fn test_add_peer_and_sync() {
        let hub = MemoryHub::new();
        let a = make_node(&hub, "node-a").await;
        let b = make_node(&hub, "node-b").await;
        share_vault(&a, &b).await;

        a.document.lock().await.set_text_content("/a.md", "hello").unwrap();
        b.document.lock().await.set_text_content("/b.md", "world").unwrap();

        let invite = b.manager.generate_invite().unwrap();
        let node_id = a.manager.add_peer(&invite, Some("laptop")).await.unwrap();
        assert_eq!(node_id, "node-b");
        a.manager.sync_peer(&node_id).await.unwrap();

        assert_eq!(
            a.document.lock().await.get_text_content("/b.md").unwrap(),
            "world"
        );
        assert_eq!(
            b.document.lock().await.get_text_content("/a.md").unwrap(),
            "hello"
        );

        let peer = a.manager.get_peer("node-b").unwrap();
        assert!(peer.record.trusted);
        assert!(peer.record.last_synced.is_some());
        assert!(peer.bytes_sent > 0);

        a.manager.shutdown().await.unwrap();
        b.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_roster_persisted_across_restart() {
        let hub = MemoryHub::new();
        let a = make_node(&hub, "node-a").await;
        let b = make_node(&hub, "node-b").await;
        share_vault(&a, &b).await;

        let invite = b.manager.generate_invite().unwrap();
        a.manager.add_peer(&invite, None).await.unwrap();
        a.manager.shutdown().await.unwrap();

        // Reload the roster from the same storage.
        let store = RosterStore::new(a.storage.clone());
        let roster = store.load().await.unwrap();
        assert!(roster.get("node-b").is_some());
        assert!(roster.get("node-b").unwrap().trusted);

        b.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_all_counts() {
        let hub = MemoryHub::new();
        let a = make_node(&hub, "node-a").await;
        let b = make_node(&hub, "node-b").await;
        share_vault(&a, &b).await;

        let invite = b.manager.generate_invite().unwrap();
        a.manager.add_peer(&invite, None).await.unwrap();

        let (synced, failed) = a.manager.sync_all().await;
        assert_eq!(synced, 1);
        assert_eq!(failed, 0);

        a.manager.shutdown().await.unwrap();
        b.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_unknown_peer_fails() {
        let hub = MemoryHub::new();
        let a = make_node(&hub, "node-a").await;
        assert!(matches!(
            a.manager.sync_peer("ghost").await,
            Err(ManagerError::UnknownPeer(_))
        ));
        a.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_peer() {
        let hub = MemoryHub::new();
        let a = make_node(&hub, "node-a").await;
        let b = make_node(&hub, "node-b").await;
        share_vault(&a, &b).await;

        let invite = b.manager.generate_invite().unwrap();
        let node_id = a.manager.add_peer(&invite, None).await.unwrap();
        a.manager.sync_peer(&node_id).await.unwrap();

        a.manager.remove_peer(&node_id).await.unwrap();
        assert!(a.manager.get_peer(&node_id).is_none());
        assert!(matches!(
            a.manager.remove_peer(&node_id).await,
            Err(ManagerError::UnknownPeer(_))
        ));

        a.manager.shutdown().await.unwrap();
        b.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_sync_states_populated() {
        let hub = MemoryHub::new();
        let a = make_node(&hub, "node-a").await;
        let b = make_node(&hub, "node-b").await;
        share_vault(&a, &b).await;

        let invite = b.manager.generate_invite().unwrap();
        let node_id = a.manager.add_peer(&invite, None).await.unwrap();
        a.manager.sync_peer(&node_id).await.unwrap();

        let states = a.manager.get_peer_sync_states();
        assert!(states.contains_key("node-b"));

        a.manager.shutdown().await.unwrap();
        b.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let hub = MemoryHub::new();
        let a = make_node(&hub, "node-a").await;
        let b = make_node(&hub, "node-b").await;
        share_vault(&a, &b).await;

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = a.manager.on_event(move |event| {
            seen_clone.lock().unwrap().push(format!("{event:?}"));
        });

        let invite = b.manager.generate_invite().unwrap();
        let node_id = a.manager.add_peer(&invite, None).await.unwrap();
        a.manager.sync_peer(&node_id).await.unwrap();

        let events = seen.lock().unwrap().clone();
        assert!(events.iter().any(|e| e.contains("PairingRequest")));
        assert!(events.iter().any(|e| e.contains("PairingAccepted")));
        assert!(events.iter().any(|e| e.contains("Connected")));

        a.manager.shutdown().await.unwrap();
        b.manager.shutdown().await.unwrap();
    }

    #[test]
    fn test_simultaneous_connect_agreement() {
        // A ("aaaa") and B ("bbbb") dial each other at once. A keeps its
        // outgoing session; B keeps its incoming one: same session.
        // A's view: existing outgoing, new incoming.
        assert!(!new_session_wins(
            Direction::Outgoing,
            Direction::Incoming,
            "aaaa",
            "bbbb"
        ));
        // B's view: existing outgoing, new incoming.
        assert!(new_session_wins(
            Direction::Outgoing,
            Direction::Incoming,
            "bbbb",
            "aaaa"
        ));
        // Reconnect in the same direction always replaces.
        assert!(new_session_wins(
            Direction::Outgoing,
            Direction::Outgoing,
            "aaaa",
            "bbbb"
        ));
        assert!(new_session_wins(
            Direction::Incoming,
            Direction::Incoming,
            "bbbb",
            "aaaa"
        ));
    }
}
