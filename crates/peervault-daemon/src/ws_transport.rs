//! WebSocket transport: ordered byte streams over tokio-tungstenite.
//!
//! Invite tickets are `pv1:` followed by hex-encoded JSON binding the
//! issuer's node id to its reachable addresses.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use peervault_core::transport::{
    validate_ticket, Result, StreamConn, Transport, TransportError,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

const TICKET_PREFIX: &str = "pv1:";

type WsConn = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Addresses and identity carried by a ticket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct TicketInfo {
    node_id: String,
    addrs: Vec<String>,
}

fn encode_ticket(info: &TicketInfo) -> String {
    let json = serde_json::to_vec(info).expect("ticket serializes");
    format!("{TICKET_PREFIX}{}", hex::encode(json))
}

fn decode_ticket(ticket: &str) -> Result<TicketInfo> {
    validate_ticket(ticket)?;
    let body = ticket
        .strip_prefix(TICKET_PREFIX)
        .ok_or_else(|| TransportError::InvalidTicket("missing pv1 prefix".into()))?;
    let json = hex::decode(body)
        .map_err(|_| TransportError::InvalidTicket("not hex".into()))?;
    serde_json::from_slice(&json)
        .map_err(|_| TransportError::InvalidTicket("bad ticket body".into()))
}

/// One WebSocket connection as an ordered byte stream.
pub struct WsStream {
    write: Mutex<SplitSink<WsConn, WsMessage>>,
    read: Mutex<SplitStream<WsConn>>,
}

impl WsStream {
    fn new(conn: WsConn) -> Self {
        let (write, read) = conn.split();
        Self {
            write: Mutex::new(write),
            read: Mutex::new(read),
        }
    }
}

#[async_trait]
impl StreamConn for WsStream {
    async fn send(&self, data: &[u8]) -> Result<()> {
        self.write
            .lock()
            .await
            .send(WsMessage::Binary(data.to_vec().into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut read = self.read.lock().await;
        loop {
            match read.next().await {
                Some(Ok(WsMessage::Binary(data))) => return Ok(Some(data.to_vec())),
                Some(Ok(WsMessage::Text(text))) => return Ok(Some(text.as_bytes().to_vec())),
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => continue,
                Some(Ok(WsMessage::Close(_))) => return Ok(None),
                Some(Ok(WsMessage::Frame(_))) => continue,
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                    return Ok(None)
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
                None => return Ok(None),
            }
        }
    }

    async fn close(&self) {
        let _ = self.write.lock().await.send(WsMessage::Close(None)).await;
    }
}

/// WebSocket transport bound to a TCP listen address.
pub struct WsTransport {
    node_id: String,
    listen: String,
    bound: StdMutex<Option<SocketAddr>>,
    incoming: Mutex<Option<mpsc::Receiver<WsStream>>>,
    listener_task: StdMutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    pub fn new(node_id: String, listen: String) -> Self {
        Self {
            node_id,
            listen,
            bound: StdMutex::new(None),
            incoming: Mutex::new(None),
            listener_task: StdMutex::new(None),
        }
    }

    /// Address the listener actually bound to (after `initialize`).
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn initialize(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let bound = listener
            .local_addr()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        *self.bound.lock().unwrap_or_else(|e| e.into_inner()) = Some(bound);
        info!(addr = %bound, "listening for peers");

        let (tx, rx) = mpsc::channel(16);
        *self.incoming.lock().await = Some(rx);
        let task = tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "tcp accept failed");
                        continue;
                    }
                };
                match accept_async(MaybeTlsStream::Plain(stream)).await {
                    Ok(ws) => {
                        debug!(addr = %addr, "incoming connection");
                        if tx.send(WsStream::new(ws)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => debug!(addr = %addr, error = %e, "websocket upgrade failed"),
                }
            }
        });
        *self
            .listener_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(task);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(task) = self
            .listener_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        self.incoming.lock().await.take();
        Ok(())
    }

    fn node_id(&self) -> String {
        self.node_id.clone()
    }

    async fn connect(&self, ticket: &str) -> Result<Box<dyn StreamConn>> {
        let info = decode_ticket(ticket)?;
        let mut last_err = None;
        for addr in &info.addrs {
            let url = format!("ws://{addr}");
            match connect_async(&url).await {
                Ok((conn, _)) => {
                    debug!(addr = %addr, peer = %info.node_id, "connected");
                    return Ok(Box::new(WsStream::new(conn)));
                }
                Err(e) => last_err = Some(e.to_string()),
            }
        }
        Err(TransportError::ConnectionFailed(
            last_err.unwrap_or_else(|| "no addresses in ticket".into()),
        ))
    }

    async fn accept(&self) -> Result<Box<dyn StreamConn>> {
        let mut guard = self.incoming.lock().await;
        let rx = guard.as_mut().ok_or(TransportError::Closed)?;
        match rx.recv().await {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(TransportError::Closed),
        }
    }

    fn generate_invite(&self) -> Result<String> {
        let addr = self
            .bound_addr()
            .ok_or_else(|| TransportError::ConnectionFailed("not listening".into()))?;
        Ok(encode_ticket(&TicketInfo {
            node_id: self.node_id.clone(),
            addrs: vec![addr.to_string()],
        }))
    }

    fn ticket_node_id(&self, ticket: &str) -> Result<String> {
        Ok(decode_ticket(ticket)?.node_id)
    }
}
