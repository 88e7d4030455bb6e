//! Per-peer sync session: the wire protocol state machine.
//!
//! One session per peer. The session owns its stream, performs the
//! handshake, runs the initial sync exchange, streams blobs, and then sits
//! in steady state applying unsolicited updates. Frames from one peer are
//! handled strictly in order; an import completes before the next frame is
//! processed.

use crate::blobs::BlobStore;
use crate::conflicts::ConflictTracker;
use crate::document::{DocumentManager, ImportOrigin};
use crate::protocol::{
    encode_frame, ErrorCode, FrameBuffer, Handshake, Message, ProtocolError, BLOB_CHUNK_SIZE,
    PROTOCOL_VERSION,
};
use crate::replica_id::ReplicaId;
use crate::transport::{StreamConn, TransportError};
use loro::VersionVector;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Malformed input: {0}")]
    Malformed(String),

    #[error("Protocol version conflict (remote {0})")]
    VersionConflict(u32),

    #[error("Vault mismatch (remote vault {0})")]
    VaultMismatch(String),

    #[error("Integrity failure: {0}")]
    Integrity(String),

    #[error("Transient: {0}")]
    Transient(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Queue overflow")]
    ResourceExhausted,

    #[error("Fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        SessionError::Transient(e.to_string())
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::Malformed(e.to_string())
    }
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Syncing,
    Idle,
    Closing,
    Error,
}

/// Tunables; defaults match the documented protocol timeouts.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub sync_response_timeout: Duration,
    pub blob_frame_timeout: Duration,
    pub close_drain_timeout: Duration,
    /// Bound on queued outgoing frames; producers block beyond it.
    pub outgoing_queue_limit: usize,
    /// Blobs allowed in flight without an ack.
    pub blob_inflight_window: usize,
    /// Attempts per blob before giving up.
    pub blob_retry_limit: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(15),
            sync_response_timeout: Duration::from_secs(30),
            blob_frame_timeout: Duration::from_secs(30),
            close_drain_timeout: Duration::from_secs(2),
            outgoing_queue_limit: 64,
            blob_inflight_window: 4,
            blob_retry_limit: 3,
        }
    }
}

/// Exponential backoff for reconnects: `250 ms · 2^attempt`, capped at
/// 30 s, with ±20% jitter.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = 250f64 * 2f64.powi(attempt.min(16) as i32);
    let capped = base.min(30_000.0);
    let jitter = rand::rng().random_range(0.8..1.2);
    Duration::from_millis((capped * jitter) as u64)
}

/// Shared dependencies a session operates on.
pub struct SessionContext {
    pub local_id: ReplicaId,
    pub hostname: Option<String>,
    pub nickname: Option<String>,
    pub document: Arc<Mutex<DocumentManager>>,
    pub blobs: Arc<BlobStore>,
    pub conflicts: Arc<ConflictTracker>,
    pub config: SessionConfig,
}

/// Notifications from a running session to its manager.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        node_id: String,
        state: SessionState,
    },
    /// The peer advertised or acked this engine-encoded version vector.
    PeerVersion {
        node_id: String,
        version_vector: Vec<u8>,
    },
    /// One full sync cycle reached idle.
    Synced {
        node_id: String,
    },
    Error {
        node_id: String,
        error: String,
    },
    Closed {
        node_id: String,
    },
}

#[derive(Debug)]
enum Command {
    PushUpdate(Vec<u8>),
    SyncNow(oneshot::Sender<()>),
    Close,
}

/// Byte counters accumulated by a session.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
}

/// Handle to a spawned session task.
pub struct SessionHandle {
    remote: Handshake,
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<SessionState>,
    stats: Arc<SessionStats>,
}

impl SessionHandle {
    /// Remote handshake recorded at session start.
    pub fn remote(&self) -> &Handshake {
        &self.remote
    }

    pub fn remote_node_id(&self) -> String {
        self.remote.peer_id.to_string()
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn is_alive(&self) -> bool {
        !matches!(
            self.state(),
            SessionState::Disconnected | SessionState::Error
        )
    }

    /// Queue an unsolicited incremental update. Blocks once the outgoing
    /// queue is full (backpressure toward local editors).
    pub async fn push_update(&self, data: Vec<u8>) -> Result<()> {
        self.cmd_tx
            .send(Command::PushUpdate(data))
            .await
            .map_err(|_| SessionError::Transient("session closed".into()))
    }

    /// Run (or join) a sync cycle; resolves when the session is idle.
    pub async fn sync_now(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SyncNow(tx))
            .await
            .map_err(|_| SessionError::Transient("session closed".into()))?;
        rx.await
            .map_err(|_| SessionError::Transient("session ended before sync completed".into()))
    }

    /// Drain outgoing writes (bounded) and tear the stream down.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close).await;
        let mut state_rx = self.state_rx.clone();
        let _ = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if matches!(
                    *state_rx.borrow(),
                    SessionState::Disconnected | SessionState::Error
                ) {
                    break;
                }
                if state_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
    }
}

/// Establishes sessions and runs their protocol loop.
pub struct SyncSession;

impl SyncSession {
    /// Handshake over an already-established stream we accepted.
    pub async fn accept(
        stream: Box<dyn StreamConn>,
        ctx: Arc<SessionContext>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<SessionHandle> {
        Self::start(stream, ctx, events).await
    }

    /// Handshake over a stream we dialed.
    pub async fn connect(
        stream: Box<dyn StreamConn>,
        ctx: Arc<SessionContext>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<SessionHandle> {
        Self::start(stream, ctx, events).await
    }

    async fn start(
        stream: Box<dyn StreamConn>,
        ctx: Arc<SessionContext>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<SessionHandle> {
        let stream: Arc<dyn StreamConn> = Arc::from(stream);
        let stats = Arc::new(SessionStats::default());

        // Both sides send their handshake, then await the other's.
        let local_hs = {
            let doc = ctx.document.lock().await;
            Handshake {
                protocol_version: PROTOCOL_VERSION,
                peer_id: ctx.local_id,
                vault_id: doc.vault_id().map(str::to_string),
                hostname: ctx.hostname.clone(),
                nickname: ctx.nickname.clone(),
                version_vector: doc.current_version().encode(),
            }
        };
        let frame = encode_frame(&Message::Handshake(local_hs.clone()))?;
        stats.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
        stream.send(&frame).await?;

        let (remote_hs, leftover) = tokio::time::timeout(
            ctx.config.handshake_timeout,
            recv_handshake(stream.as_ref(), &stats),
        )
        .await
        .map_err(|_| SessionError::Transient("handshake timeout".into()))??;

        if remote_hs.protocol_version != PROTOCOL_VERSION {
            send_error(
                stream.as_ref(),
                ErrorCode::Incompatible,
                &format!("protocol version {PROTOCOL_VERSION} required"),
            )
            .await;
            stream.close().await;
            return Err(SessionError::VersionConflict(remote_hs.protocol_version));
        }
        if let (Some(ours), Some(theirs)) = (&local_hs.vault_id, &remote_hs.vault_id) {
            if ours != theirs {
                send_error(stream.as_ref(), ErrorCode::VaultMismatch, "different vault").await;
                stream.close().await;
                return Err(SessionError::VaultMismatch(theirs.clone()));
            }
        }

        let node_id = remote_hs.peer_id.to_string();
        let _ = events.send(SessionEvent::PeerVersion {
            node_id: node_id.clone(),
            version_vector: remote_hs.version_vector.clone(),
        });
        info!(
            peer_id = %node_id,
            hostname = ?remote_hs.hostname,
            "session handshake complete"
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(ctx.config.outgoing_queue_limit);
        let (state_tx, state_rx) = watch::channel(SessionState::Syncing);

        // Reader task: forwards stream chunks into a channel so the main
        // loop can select over commands and bytes uniformly.
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(64);
        let reader_stream = Arc::clone(&stream);
        let reader_stats = Arc::clone(&stats);
        let reader: JoinHandle<()> = tokio::spawn(async move {
            loop {
                match reader_stream.recv().await {
                    Ok(Some(chunk)) => {
                        reader_stats
                            .bytes_received
                            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                        if in_tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        });

        let mut frames = FrameBuffer::new();
        frames.extend(&leftover);

        let runner = SessionRunner {
            ctx,
            stream,
            events,
            node_id,
            remote: remote_hs.clone(),
            state_tx,
            stats: Arc::clone(&stats),
            reader,
            frames,
            outstanding_sync: false,
            awaiting_acks: 0,
            requested_blobs: HashMap::new(),
            partial_blobs: HashMap::new(),
            completed_blobs: HashSet::new(),
            send_queue: VecDeque::new(),
            unacked_blobs: HashMap::new(),
            sync_waiters: Vec::new(),
            synced_reported: false,
        };
        tokio::spawn(runner.run(cmd_rx, in_rx));

        Ok(SessionHandle {
            remote: remote_hs,
            cmd_tx,
            state_rx,
            stats,
        })
    }
}

/// Receive frames until the handshake arrives; returns it plus any bytes
/// that followed it in the same chunks.
async fn recv_handshake(
    stream: &dyn StreamConn,
    stats: &SessionStats,
) -> Result<(Handshake, Vec<u8>)> {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let mut frames = FrameBuffer::new();
        frames.extend(&buf);
        if let Some(msg) = frames.next_frame()? {
            let consumed = buf.len() - frames.pending_len();
            let leftover = buf[consumed..].to_vec();
            return match msg {
                Message::Handshake(hs) => Ok((hs, leftover)),
                Message::Error { code, message } => Err(SessionError::Fatal(format!(
                    "peer rejected handshake ({code:?}): {message}"
                ))),
                other => Err(SessionError::Malformed(format!(
                    "expected handshake, got {}",
                    other.name()
                ))),
            };
        }
        match stream.recv().await? {
            Some(chunk) => {
                stats
                    .bytes_received
                    .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                buf.extend_from_slice(&chunk);
            }
            None => {
                return Err(SessionError::Transient(
                    "peer closed during handshake".into(),
                ))
            }
        }
    }
}

async fn send_error(stream: &dyn StreamConn, code: ErrorCode, message: &str) {
    if let Ok(frame) = encode_frame(&Message::Error {
        code,
        message: message.to_string(),
    }) {
        let _ = stream.send(&frame).await;
    }
}

struct PendingBlob {
    hash: String,
    attempts: u32,
}

struct SessionRunner {
    ctx: Arc<SessionContext>,
    stream: Arc<dyn StreamConn>,
    events: mpsc::UnboundedSender<SessionEvent>,
    node_id: String,
    remote: Handshake,
    state_tx: watch::Sender<SessionState>,
    stats: Arc<SessionStats>,
    reader: JoinHandle<()>,
    frames: FrameBuffer,

    /// A sync-request of ours is awaiting its response.
    outstanding_sync: bool,
    /// Frames we sent that the peer has not acked yet.
    awaiting_acks: usize,
    /// Blobs we asked the peer for: hash -> verification failures so far.
    requested_blobs: HashMap<String, u32>,
    /// In-progress inbound blob assemblies: hash -> (buffer, total).
    partial_blobs: HashMap<String, (Vec<u8>, u64)>,
    /// Blobs fully received this session (duplicate transfers ignored).
    completed_blobs: HashSet<String>,
    /// Outbound blobs queued behind the in-flight window.
    send_queue: VecDeque<PendingBlob>,
    /// Outbound blobs sent and awaiting a blob-ack.
    unacked_blobs: HashMap<String, PendingBlob>,
    /// Waiters resolved at the next idle point.
    sync_waiters: Vec<oneshot::Sender<()>>,
    synced_reported: bool,
}

impl SessionRunner {
    fn set_state(&self, state: SessionState) {
        let _ = self.state_tx.send(state);
        let _ = self.events.send(SessionEvent::StateChanged {
            node_id: self.node_id.clone(),
            state,
        });
    }

    async fn send(&self, msg: &Message) -> Result<()> {
        let frame = encode_frame(msg)?;
        self.stats
            .bytes_sent
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        self.stream.send(&frame).await?;
        Ok(())
    }

    fn is_idle(&self) -> bool {
        !self.outstanding_sync
            && self.awaiting_acks == 0
            && self.requested_blobs.is_empty()
            && self.partial_blobs.is_empty()
            && self.send_queue.is_empty()
            && self.unacked_blobs.is_empty()
    }

    fn settle_if_idle(&mut self) {
        if !self.is_idle() {
            return;
        }
        for waiter in self.sync_waiters.drain(..) {
            let _ = waiter.send(());
        }
        if *self.state_tx.borrow() != SessionState::Idle {
            self.set_state(SessionState::Idle);
        }
        if !self.synced_reported {
            self.synced_reported = true;
            let _ = self.events.send(SessionEvent::Synced {
                node_id: self.node_id.clone(),
            });
        }
    }

    /// Deadline for the frame we are currently waiting on, if any.
    fn pending_deadline(&self) -> Option<Instant> {
        let cfg = &self.ctx.config;
        if self.outstanding_sync {
            Some(Instant::now() + cfg.sync_response_timeout)
        } else if !self.partial_blobs.is_empty()
            || !self.requested_blobs.is_empty()
            || !self.unacked_blobs.is_empty()
        {
            Some(Instant::now() + cfg.blob_frame_timeout)
        } else {
            None
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut in_rx: mpsc::Receiver<Vec<u8>>,
    ) {
        let result = self.run_inner(&mut cmd_rx, &mut in_rx).await;
        match result {
            Ok(()) => {
                self.set_state(SessionState::Disconnected);
                let _ = self.events.send(SessionEvent::Closed {
                    node_id: self.node_id.clone(),
                });
            }
            Err(e) => {
                warn!(peer_id = %self.node_id, error = %e, "session ended with error");
                self.set_state(SessionState::Error);
                let _ = self.events.send(SessionEvent::Error {
                    node_id: self.node_id.clone(),
                    error: e.to_string(),
                });
            }
        }
        // Outstanding blob transfers are abandoned; partial bytes were
        // never installed. Waiters are dropped so sync_now reports an
        // interrupted cycle.
        self.sync_waiters.clear();
        self.stream.close().await;
        self.reader.abort();
    }

    async fn run_inner(
        &mut self,
        cmd_rx: &mut mpsc::Receiver<Command>,
        in_rx: &mut mpsc::Receiver<Vec<u8>>,
    ) -> Result<()> {
        // Initial sync: each side requests the other's missing operations.
        self.start_sync_cycle().await?;

        loop {
            // Drain any fully-buffered frames before waiting for I/O.
            while let Some(msg) = self.frames.next_frame()? {
                if !self.handle_message(msg).await? {
                    return Ok(());
                }
            }
            self.settle_if_idle();

            let deadline = self.pending_deadline();
            tokio::select! {
                chunk = in_rx.recv() => match chunk {
                    Some(chunk) => self.frames.extend(&chunk),
                    None => {
                        debug!(peer_id = %self.node_id, "peer disconnected");
                        return Ok(());
                    }
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::PushUpdate(data)) => {
                        self.awaiting_acks += 1;
                        self.synced_reported = false;
                        self.set_state(SessionState::Syncing);
                        self.send(&Message::Update { data }).await?;
                    }
                    Some(Command::SyncNow(waiter)) => {
                        self.sync_waiters.push(waiter);
                        if self.is_idle() {
                            self.synced_reported = false;
                            self.start_sync_cycle().await?;
                        }
                    }
                    Some(Command::Close) | None => {
                        self.set_state(SessionState::Closing);
                        self.drain_close(cmd_rx).await;
                        return Ok(());
                    }
                },
                _ = sleep_until_opt(deadline) => {
                    return Err(SessionError::Transient("peer response timeout".into()));
                }
            }
        }
    }

    /// Best-effort drain of queued updates before teardown.
    async fn drain_close(&mut self, cmd_rx: &mut mpsc::Receiver<Command>) {
        let deadline = Instant::now() + self.ctx.config.close_drain_timeout;
        while !cmd_rx.is_empty() {
            match tokio::time::timeout_at(deadline, cmd_rx.recv()).await {
                Ok(Some(Command::PushUpdate(data))) => {
                    if self.send(&Message::Update { data }).await.is_err() {
                        break;
                    }
                }
                Ok(Some(Command::SyncNow(_))) | Ok(Some(Command::Close)) => {}
                Ok(None) | Err(_) => break,
            }
        }
    }

    async fn start_sync_cycle(&mut self) -> Result<()> {
        self.set_state(SessionState::Syncing);
        let vv = {
            let doc = self.ctx.document.lock().await;
            doc.current_version().encode()
        };
        self.outstanding_sync = true;
        self.send(&Message::SyncRequest { version_vector: vv })
            .await
    }

    /// Handle one frame. Returns `false` when the session should end
    /// cleanly.
    async fn handle_message(&mut self, msg: Message) -> Result<bool> {
        debug!(peer_id = %self.node_id, msg = msg.name(), "frame received");
        match msg {
            Message::Handshake(_) => {
                return Err(SessionError::Malformed("unexpected handshake".into()));
            }

            Message::SyncRequest { version_vector } => {
                let remote_vv = VersionVector::decode(&version_vector)
                    .map_err(|e| SessionError::Malformed(e.to_string()))?;
                let _ = self.events.send(SessionEvent::PeerVersion {
                    node_id: self.node_id.clone(),
                    version_vector,
                });
                let (updates, our_vv) = {
                    let doc = self.ctx.document.lock().await;
                    (
                        doc.export_delta(&remote_vv)
                            .map_err(|e| SessionError::Fatal(e.to_string()))?,
                        doc.current_version().encode(),
                    )
                };
                self.awaiting_acks += 1;
                self.synced_reported = false;
                self.send(&Message::SyncResponse {
                    updates,
                    version_vector: our_vv,
                })
                .await?;
            }

            Message::SyncResponse {
                updates,
                version_vector,
            } => {
                self.outstanding_sync = false;
                let _ = self.events.send(SessionEvent::PeerVersion {
                    node_id: self.node_id.clone(),
                    version_vector,
                });
                let applied = updates.is_empty() || self.apply_update(&updates).await?;
                if applied {
                    self.ack().await?;
                }
                self.request_missing_blobs().await?;
            }

            Message::Update { data } => {
                if self.apply_update(&data).await? {
                    self.ack().await?;
                }
                self.request_missing_blobs().await?;
            }

            Message::Ack { version_vector } => {
                self.awaiting_acks = self.awaiting_acks.saturating_sub(1);
                let _ = self.events.send(SessionEvent::PeerVersion {
                    node_id: self.node_id.clone(),
                    version_vector,
                });
            }

            Message::BlobRequest { hashes } => {
                let mut available = Vec::new();
                let mut missing = Vec::new();
                for hash in hashes {
                    if self
                        .ctx
                        .blobs
                        .has(&hash)
                        .await
                        .map_err(|e| SessionError::Fatal(e.to_string()))?
                    {
                        available.push(hash.clone());
                        self.send_queue.push_back(PendingBlob { hash, attempts: 0 });
                    } else {
                        missing.push(hash);
                    }
                }
                self.send(&Message::BlobHave { available, missing })
                    .await?;
                self.pump_blob_sends().await?;
            }

            Message::BlobHave { available, missing } => {
                for hash in missing {
                    warn!(peer_id = %self.node_id, hash = %hash, "peer is missing requested blob");
                    self.requested_blobs.remove(&hash);
                }
                debug!(count = available.len(), "peer will stream blobs");
            }

            Message::BlobTransfer {
                hash,
                data,
                offset,
                total,
            } => {
                self.handle_blob_transfer(hash, data, offset, total).await?;
            }

            Message::BlobAck { hash, received } => {
                if let Some(mut pending) = self.unacked_blobs.remove(&hash) {
                    if !received {
                        pending.attempts += 1;
                        if pending.attempts < self.ctx.config.blob_retry_limit {
                            warn!(hash = %hash, attempts = pending.attempts, "blob rejected, retrying");
                            self.send_queue.push_back(pending);
                        } else {
                            warn!(hash = %hash, "blob rejected too many times, giving up");
                        }
                    }
                }
                self.pump_blob_sends().await?;
            }

            Message::Error { code, message } => {
                warn!(peer_id = %self.node_id, code = ?code, message = %message, "peer reported error");
                match code {
                    ErrorCode::VaultMismatch | ErrorCode::Incompatible => {
                        return Err(SessionError::Fatal(format!("{code:?}: {message}")));
                    }
                    // Application-level rejection of something we sent;
                    // counts as a negative ack, session stays open.
                    ErrorCode::Malformed | ErrorCode::Internal => {
                        self.awaiting_acks = self.awaiting_acks.saturating_sub(1);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Import update bytes. Returns whether they were applied; a rejected
    /// update is answered with an error frame instead of an ack.
    async fn apply_update(&mut self, bytes: &[u8]) -> Result<bool> {
        let outcome = {
            let mut doc = self.ctx.document.lock().await;
            match doc.import(bytes, ImportOrigin::Remote(self.remote.peer_id)) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(peer_id = %self.node_id, error = %e, "rejecting peer update");
                    send_error(self.stream.as_ref(), ErrorCode::Malformed, &e.to_string())
                        .await;
                    let _ = self.events.send(SessionEvent::Error {
                        node_id: self.node_id.clone(),
                        error: e.to_string(),
                    });
                    return Ok(false);
                }
            }
        };

        let peer_name = self
            .remote
            .nickname
            .clone()
            .or_else(|| self.remote.hostname.clone());
        for path in &outcome.changed_paths {
            for edit in &outcome.edits {
                self.ctx.conflicts.record_edit(
                    path,
                    &edit.peer.to_string(),
                    peer_name.as_deref(),
                    Some(edit.timestamp),
                );
            }
        }
        Ok(true)
    }

    /// Ack everything applied so far. The snapshot is persisted first so
    /// the ack really means "durably applied".
    async fn ack(&mut self) -> Result<()> {
        let vv = {
            let doc = self.ctx.document.lock().await;
            doc.save()
                .await
                .map_err(|e| SessionError::Fatal(e.to_string()))?;
            doc.current_version().encode()
        };
        self.send(&Message::Ack { version_vector: vv }).await
    }

    /// Ask the peer for blobs referenced by live binary nodes that we do
    /// not hold locally.
    async fn request_missing_blobs(&mut self) -> Result<()> {
        let referenced: Vec<String> = {
            let doc = self.ctx.document.lock().await;
            doc.live_blob_hashes().into_iter().collect()
        };
        let missing = self
            .ctx
            .blobs
            .get_missing(&referenced)
            .await
            .map_err(|e| SessionError::Fatal(e.to_string()))?;
        let fresh: Vec<String> = missing
            .into_iter()
            .filter(|h| {
                !self.requested_blobs.contains_key(h) && !self.partial_blobs.contains_key(h)
            })
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }
        for hash in &fresh {
            self.requested_blobs.insert(hash.clone(), 0);
        }
        self.synced_reported = false;
        debug!(count = fresh.len(), "requesting blobs");
        self.send(&Message::BlobRequest { hashes: fresh }).await
    }

    /// Send queued blobs while the in-flight window has room.
    async fn pump_blob_sends(&mut self) -> Result<()> {
        while self.unacked_blobs.len() < self.ctx.config.blob_inflight_window {
            let Some(pending) = self.send_queue.pop_front() else {
                break;
            };
            let Some(bytes) = self
                .ctx
                .blobs
                .get(&pending.hash)
                .await
                .map_err(|e| SessionError::Fatal(e.to_string()))?
            else {
                warn!(hash = %pending.hash, "blob vanished before send");
                continue;
            };
            let total = bytes.len() as u64;
            let mut offset = 0u64;
            if bytes.is_empty() {
                self.send(&Message::BlobTransfer {
                    hash: pending.hash.clone(),
                    data: Vec::new(),
                    offset: 0,
                    total: 0,
                })
                .await?;
            }
            for chunk in bytes.chunks(BLOB_CHUNK_SIZE) {
                self.send(&Message::BlobTransfer {
                    hash: pending.hash.clone(),
                    data: chunk.to_vec(),
                    offset,
                    total,
                })
                .await?;
                offset += chunk.len() as u64;
                tokio::task::yield_now().await;
            }
            self.unacked_blobs.insert(pending.hash.clone(), pending);
        }
        Ok(())
    }

    async fn handle_blob_transfer(
        &mut self,
        hash: String,
        data: Vec<u8>,
        offset: u64,
        total: u64,
    ) -> Result<()> {
        if self.completed_blobs.contains(&hash) {
            debug!(hash = %hash, "duplicate blob transfer ignored");
            return Ok(());
        }

        let consistent = {
            let (buffer, expected_total) = self
                .partial_blobs
                .entry(hash.clone())
                .or_insert_with(|| (Vec::new(), total));
            if *expected_total == total && buffer.len() as u64 == offset {
                buffer.extend_from_slice(&data);
                true
            } else {
                false
            }
        };
        if !consistent {
            // Out-of-order or inconsistent chunk: discard and negative-ack.
            warn!(hash = %hash, offset = offset, "inconsistent blob chunk");
            self.partial_blobs.remove(&hash);
            self.send(&Message::BlobAck {
                hash,
                received: false,
            })
            .await?;
            return Ok(());
        }

        let complete = self
            .partial_blobs
            .get(&hash)
            .map(|(buffer, total)| buffer.len() as u64 >= *total)
            .unwrap_or(false);
        if !complete {
            return Ok(());
        }

        let (bytes, _) = self.partial_blobs.remove(&hash).expect("entry exists");
        let ok = self
            .ctx
            .blobs
            .verify_and_add(bytes, &hash, "application/octet-stream")
            .await
            .map_err(|e| SessionError::Fatal(e.to_string()))?;

        if ok {
            self.completed_blobs.insert(hash.clone());
            self.requested_blobs.remove(&hash);
            self.send(&Message::BlobAck {
                hash,
                received: true,
            })
            .await?;
        } else {
            // Integrity failure: negative-ack; the sender retries up to
            // its limit. Track our own failures and stop expecting the
            // blob after the bound.
            let attempts = self.requested_blobs.entry(hash.clone()).or_insert(0);
            *attempts += 1;
            let give_up = *attempts >= self.ctx.config.blob_retry_limit;
            self.send(&Message::BlobAck {
                hash: hash.clone(),
                received: false,
            })
            .await?;
            if give_up {
                warn!(hash = %hash, "blob failed verification too often, giving up");
                self.requested_blobs.remove(&hash);
            }
        }
        Ok(())
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::transport::{MemoryHub, Transport};

    async fn make_ctx(name: &str) -> (Arc<SessionContext>, Arc<Mutex<DocumentManager>>) {
        let storage = Arc::new(MemoryStorage::new());
        let replica = ReplicaId::generate();
        let document = Arc::new(Mutex::new(
            DocumentManager::initialize(storage.clone(), replica)
                .await
                .unwrap(),
        ));
        let ctx = Arc::new(SessionContext {
            local_id: replica,
            hostname: Some(name.to_string()),
            nickname: None,
            document: Arc::clone(&document),
            blobs: Arc::new(BlobStore::new(storage)),
            conflicts: Arc::new(ConflictTracker::new()),
            config: SessionConfig::default(),
        });
        (ctx, document)
    }

    /// Seed two contexts into the same vault.
    async fn share_vault(a: &Arc<Mutex<DocumentManager>>, b: &Arc<Mutex<DocumentManager>>) {
        let snapshot = {
            let mut doc = a.lock().await;
            doc.set_text_content("/seed.md", "seed").unwrap();
            doc.export_full().unwrap()
        };
        let peer = a.lock().await.replica_id();
        b.lock()
            .await
            .import(&snapshot, ImportOrigin::Remote(peer))
            .unwrap();
    }

    async fn connect_pair(
        ctx_a: Arc<SessionContext>,
        ctx_b: Arc<SessionContext>,
    ) -> (
        SessionHandle,
        SessionHandle,
        mpsc::UnboundedReceiver<SessionEvent>,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let hub = MemoryHub::new();
        let ta = hub.transport("a");
        let tb = hub.transport("b");
        let (ev_a_tx, ev_a_rx) = mpsc::unbounded_channel();
        let (ev_b_tx, ev_b_rx) = mpsc::unbounded_channel();

        let stream_a = ta.connect(&tb.generate_invite().unwrap()).await.unwrap();
        let accept_b = tokio::spawn(async move { tb.accept().await.unwrap() });

        let (ha, hb) = tokio::join!(SyncSession::connect(stream_a, ctx_a, ev_a_tx), async move {
            let stream_b = accept_b.await.unwrap();
            SyncSession::accept(stream_b, ctx_b, ev_b_tx).await
        });
        (ha.unwrap(), hb.unwrap(), ev_a_rx, ev_b_rx)
    }

    #[tokio::test]
    async fn test_initial_sync_converges() {
        let (ctx_a, doc_a) = make_ctx("a").await;
        let (ctx_b, doc_b) = make_ctx("b").await;
        share_vault(&doc_a, &doc_b).await;

        doc_a.lock().await.set_text_content("/a.md", "hello").unwrap();
        doc_b.lock().await.set_text_content("/b.md", "world").unwrap();

        let (ha, hb, _ev_a, _ev_b) = connect_pair(ctx_a, ctx_b).await;
        ha.sync_now().await.unwrap();
        hb.sync_now().await.unwrap();

        assert_eq!(
            doc_a.lock().await.get_text_content("/b.md").unwrap(),
            "world"
        );
        assert_eq!(
            doc_b.lock().await.get_text_content("/a.md").unwrap(),
            "hello"
        );

        ha.close().await;
        hb.close().await;
    }

    #[tokio::test]
    async fn test_vault_mismatch_aborts_session() {
        let (ctx_a, doc_a) = make_ctx("a").await;
        let (ctx_b, doc_b) = make_ctx("b").await;
        // Distinct vaults: each commits its own first change.
        doc_a.lock().await.set_text_content("/a.md", "a").unwrap();
        doc_b.lock().await.set_text_content("/b.md", "b").unwrap();

        let hub = MemoryHub::new();
        let ta = hub.transport("a");
        let tb = hub.transport("b");
        let (ev_a_tx, _ev_a_rx) = mpsc::unbounded_channel();
        let (ev_b_tx, _ev_b_rx) = mpsc::unbounded_channel();

        let stream_a = ta.connect(&tb.generate_invite().unwrap()).await.unwrap();
        let accept_b = tokio::spawn(async move { tb.accept().await.unwrap() });

        let (ra, rb) = tokio::join!(SyncSession::connect(stream_a, ctx_a, ev_a_tx), async move {
            let stream_b = accept_b.await.unwrap();
            SyncSession::accept(stream_b, ctx_b, ev_b_tx).await
        });
        // At least one side detects the mismatch; neither converges.
        assert!(ra.is_err() || rb.is_err());
        let err = ra.err().or(rb.err()).unwrap();
        assert!(matches!(
            err,
            SessionError::VaultMismatch(_) | SessionError::Fatal(_) | SessionError::Transient(_)
        ));
    }

    #[tokio::test]
    async fn test_steady_state_update_push() {
        let (ctx_a, doc_a) = make_ctx("a").await;
        let (ctx_b, doc_b) = make_ctx("b").await;
        share_vault(&doc_a, &doc_b).await;

        let (ha, hb, _ev_a, _ev_b) = connect_pair(ctx_a, ctx_b).await;
        ha.sync_now().await.unwrap();

        // Local edit on A, pushed as an unsolicited incremental update.
        let before = doc_b.lock().await.current_version();
        let delta = {
            let mut doc = doc_a.lock().await;
            doc.set_text_content("/live.md", "streamed").unwrap();
            doc.export_delta(&before).unwrap()
        };
        ha.push_update(delta).await.unwrap();
        ha.sync_now().await.unwrap();

        assert_eq!(
            doc_b.lock().await.get_text_content("/live.md").unwrap(),
            "streamed"
        );
        ha.close().await;
        hb.close().await;
    }

    #[tokio::test]
    async fn test_blob_round_trip() {
        let (ctx_a, doc_a) = make_ctx("a").await;
        let (ctx_b, doc_b) = make_ctx("b").await;
        share_vault(&doc_a, &doc_b).await;

        // A stores a 1 MiB blob of bytes (i mod 256) and references it.
        let payload: Vec<u8> = (0..1_048_576u32).map(|i| (i % 256) as u8).collect();
        let hash = ctx_a
            .blobs
            .add(payload.clone(), "application/octet-stream")
            .await
            .unwrap();
        doc_a
            .lock()
            .await
            .create_binary("/big.bin", &hash, "application/octet-stream")
            .unwrap();

        let (ha, hb, _ev_a, _ev_b) = connect_pair(ctx_a.clone(), ctx_b.clone()).await;
        ha.sync_now().await.unwrap();
        hb.sync_now().await.unwrap();

        let fetched = ctx_b.blobs.get(&hash).await.unwrap().unwrap();
        assert_eq!(fetched, payload);
        assert_eq!(
            ctx_b.blobs.get_meta(&hash).await.unwrap().unwrap().size,
            1_048_576
        );
        assert_eq!(
            doc_b
                .lock()
                .await
                .get_file_meta("/big.bin")
                .unwrap()
                .blob_hash
                .as_deref(),
            Some(hash.as_str())
        );
        ha.close().await;
        hb.close().await;
    }

    #[tokio::test]
    async fn test_session_reports_peer_versions() {
        let (ctx_a, doc_a) = make_ctx("a").await;
        let (ctx_b, doc_b) = make_ctx("b").await;
        share_vault(&doc_a, &doc_b).await;

        let (ha, hb, mut ev_a, _ev_b) = connect_pair(ctx_a, ctx_b).await;
        ha.sync_now().await.unwrap();

        let mut saw_version = false;
        while let Ok(event) = ev_a.try_recv() {
            if matches!(event, SessionEvent::PeerVersion { .. }) {
                saw_version = true;
            }
        }
        assert!(saw_version);
        ha.close().await;
        hb.close().await;
    }

    #[tokio::test]
    async fn test_conflict_tracker_observes_remote_edits() {
        let (ctx_a, doc_a) = make_ctx("a").await;
        let (ctx_b, doc_b) = make_ctx("b").await;
        share_vault(&doc_a, &doc_b).await;

        // Both sides edit the same file before syncing.
        doc_a.lock().await.set_text_content("/n.md", "from a").unwrap();
        doc_b.lock().await.set_text_content("/n.md", "from b").unwrap();
        let a_id = doc_a.lock().await.replica_id().to_string();
        let b_id = doc_b.lock().await.replica_id().to_string();
        ctx_a.conflicts.record_edit("/n.md", &a_id, None, None);
        ctx_b.conflicts.record_edit("/n.md", &b_id, None, None);

        let (ha, hb, _ev_a, _ev_b) = connect_pair(ctx_a.clone(), ctx_b.clone()).await;
        ha.sync_now().await.unwrap();
        hb.sync_now().await.unwrap();

        // The remote edit lands within the window on at least one side.
        assert!(
            ctx_a.conflicts.get_conflict("/n.md").is_some()
                || ctx_b.conflicts.get_conflict("/n.md").is_some()
        );
        ha.close().await;
        hb.close().await;
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        for _ in 0..20 {
            let d0 = backoff_delay(0);
            assert!(d0 >= Duration::from_millis(200) && d0 <= Duration::from_millis(300));
            let d4 = backoff_delay(4);
            assert!(d4 >= Duration::from_millis(3200) && d4 <= Duration::from_millis(4800));
            let huge = backoff_delay(30);
            assert!(huge <= Duration::from_millis(36_000));
        }
    }
}
