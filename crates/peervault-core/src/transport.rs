//! Transport trait for peer-to-peer networking.
//!
//! A transport identifies this process by an opaque `nodeId`, turns invite
//! tickets into connections, and accepts incoming ones. A stream is an
//! ordered, byte-preserving, bidirectional channel; the framed protocol of
//! [`crate::protocol`] runs on top.
//!
//! Implementations:
//! - `MemoryTransport` (here) - in-process hub, used by tests
//! - `WsTransport` (in peervault-daemon) - WebSocket over TCP

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

/// Maximum accepted invite ticket length.
pub const MAX_TICKET_LEN: usize = 4096;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid ticket: {0}")]
    InvalidTicket(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Basic shape validation shared by all ticket formats: non-empty,
/// printable ASCII, bounded length.
pub fn validate_ticket(ticket: &str) -> Result<()> {
    if ticket.is_empty() {
        return Err(TransportError::InvalidTicket("empty".into()));
    }
    if ticket.len() > MAX_TICKET_LEN {
        return Err(TransportError::InvalidTicket("too long".into()));
    }
    if !ticket.bytes().all(|b| (0x20..0x7f).contains(&b)) {
        return Err(TransportError::InvalidTicket("non-printable".into()));
    }
    Ok(())
}

/// An ordered, byte-preserving, bidirectional channel to one peer.
#[async_trait]
pub trait StreamConn: Send + Sync {
    /// Send one chunk. Chunk boundaries are not preserved.
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Receive the next chunk, or `None` once the peer closed.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Close the channel. Idempotent.
    async fn close(&self);
}

/// Transport layer: connection establishment and invites.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn initialize(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;

    /// Opaque identity of the local node.
    fn node_id(&self) -> String;

    /// Dial the peer identified by `ticket`.
    async fn connect(&self, ticket: &str) -> Result<Box<dyn StreamConn>>;

    /// Wait for the next incoming connection.
    async fn accept(&self) -> Result<Box<dyn StreamConn>>;

    /// Produce a ticket other peers can use to reach this node.
    fn generate_invite(&self) -> Result<String>;

    /// Derive the remote node id from a ticket without connecting.
    fn ticket_node_id(&self, ticket: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// In-memory transport
// ---------------------------------------------------------------------------

const MEM_TICKET_PREFIX: &str = "mem:";

/// In-process stream half backed by channels.
pub struct MemoryStream {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MemoryStream {
    fn pair() -> (Self, Self) {
        let (tx_a, rx_b) = mpsc::unbounded_channel();
        let (tx_b, rx_a) = mpsc::unbounded_channel();
        (
            Self {
                tx: Mutex::new(Some(tx_a)),
                rx: tokio::sync::Mutex::new(rx_a),
            },
            Self {
                tx: Mutex::new(Some(tx_b)),
                rx: tokio::sync::Mutex::new(rx_b),
            },
        )
    }
}

#[async_trait]
impl StreamConn for MemoryStream {
    async fn send(&self, data: &[u8]) -> Result<()> {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx
                .send(data.to_vec())
                .map_err(|_| TransportError::SendFailed("peer closed".into())),
            None => Err(TransportError::Closed),
        }
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

/// Registry connecting in-memory transports by node id.
#[derive(Default)]
pub struct MemoryHub {
    listeners: Mutex<HashMap<String, mpsc::UnboundedSender<MemoryStream>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a transport for `node_id` on this hub.
    pub fn transport(self: &Arc<Self>, node_id: &str) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node_id.to_string(), tx);
        MemoryTransport {
            hub: Arc::clone(self),
            node_id: node_id.to_string(),
            incoming: tokio::sync::Mutex::new(rx),
        }
    }
}

/// In-process transport for tests and local wiring.
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    node_id: String,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryStream>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.hub
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.node_id);
        Ok(())
    }

    fn node_id(&self) -> String {
        self.node_id.clone()
    }

    async fn connect(&self, ticket: &str) -> Result<Box<dyn StreamConn>> {
        let remote = self.ticket_node_id(ticket)?;
        let (ours, theirs) = MemoryStream::pair();
        let listener = {
            let listeners = self.hub.listeners.lock().unwrap_or_else(|e| e.into_inner());
            listeners
                .get(&remote)
                .cloned()
                .ok_or_else(|| TransportError::PeerNotFound(remote.clone()))?
        };
        listener
            .send(theirs)
            .map_err(|_| TransportError::ConnectionFailed(format!("{remote} not accepting")))?;
        Ok(Box::new(ours))
    }

    async fn accept(&self) -> Result<Box<dyn StreamConn>> {
        match self.incoming.lock().await.recv().await {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(TransportError::Closed),
        }
    }

    fn generate_invite(&self) -> Result<String> {
        Ok(format!("{MEM_TICKET_PREFIX}{}", self.node_id))
    }

    fn ticket_node_id(&self, ticket: &str) -> Result<String> {
        validate_ticket(ticket)?;
        ticket
            .strip_prefix(MEM_TICKET_PREFIX)
            .map(str::to_string)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TransportError::InvalidTicket(ticket.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_ticket() {
        assert!(validate_ticket("mem:abc").is_ok());
        assert!(validate_ticket("").is_err());
        assert!(validate_ticket(&"x".repeat(5000)).is_err());
        assert!(validate_ticket("bad\nticket").is_err());
    }

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let hub = MemoryHub::new();
        let a = hub.transport("node-a");
        let b = hub.transport("node-b");

        let ticket = b.generate_invite().unwrap();
        // connect() enqueues the peer half; accept() picks it up.
        let conn_a = a.connect(&ticket).await.unwrap();
        let conn_b = b.accept().await.unwrap();

        conn_a.send(b"ping").await.unwrap();
        assert_eq!(conn_b.recv().await.unwrap(), Some(b"ping".to_vec()));
        conn_b.send(b"pong").await.unwrap();
        assert_eq!(conn_a.recv().await.unwrap(), Some(b"pong".to_vec()));
    }

    #[tokio::test]
    async fn test_close_signals_peer() {
        let hub = MemoryHub::new();
        let a = hub.transport("node-a");
        let b = hub.transport("node-b");

        let ticket = b.generate_invite().unwrap();
        let conn_a = a.connect(&ticket).await.unwrap();
        let conn_b = b.accept().await.unwrap();

        conn_a.close().await;
        assert_eq!(conn_b.recv().await.unwrap(), None);
        assert!(conn_a.send(b"after close").await.is_err());
    }

    #[tokio::test]
    async fn test_connect_unknown_peer_fails() {
        let hub = MemoryHub::new();
        let a = hub.transport("node-a");
        assert!(matches!(
            a.connect("mem:ghost").await,
            Err(TransportError::PeerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_ticket_node_id() {
        let hub = MemoryHub::new();
        let a = hub.transport("node-a");
        assert_eq!(a.ticket_node_id("mem:other").unwrap(), "other");
        assert!(a.ticket_node_id("bogus").is_err());
        assert!(a.ticket_node_id("mem:").is_err());
    }
}
