//! Wire protocol: length-prefixed framed messages between peers.
//!
//! Each frame is `u32 length (LE) || kind (1 byte) || payload`, where
//! `length` counts the kind byte plus the payload. Payloads are bincode;
//! both sides agree on the encoding via the handshake `protocol_version`.
//! CRDT update bytes and version vectors travel opaque, in the engine's
//! own encoding.

use crate::replica_id::ReplicaId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current protocol version. Peers with a different version are rejected
/// during the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single frame (kind + payload).
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// Chunk size for blob transfer frames.
pub const BLOB_CHUNK_SIZE: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Unknown message kind: {0}")]
    UnknownKind(u8),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Error codes carried by `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The peer syncs a different vault.
    VaultMismatch,
    /// Protocol versions differ.
    Incompatible,
    /// The peer sent bytes we could not process.
    Malformed,
    /// Internal failure while handling a frame.
    Internal,
}

/// Handshake payload, sent by both sides on session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub protocol_version: u32,
    pub peer_id: ReplicaId,
    /// `None` for a pristine replica that has not joined a vault yet.
    pub vault_id: Option<String>,
    pub hostname: Option<String>,
    pub nickname: Option<String>,
    /// Engine-encoded version vector.
    pub version_vector: Vec<u8>,
}

/// All protocol messages. The wire kind byte is stable; see
/// [`Message::kind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Handshake(Handshake),
    SyncRequest {
        version_vector: Vec<u8>,
    },
    SyncResponse {
        updates: Vec<u8>,
        version_vector: Vec<u8>,
    },
    /// Unsolicited incremental update.
    Update {
        data: Vec<u8>,
    },
    Ack {
        version_vector: Vec<u8>,
    },
    BlobRequest {
        hashes: Vec<String>,
    },
    BlobHave {
        available: Vec<String>,
        missing: Vec<String>,
    },
    BlobTransfer {
        hash: String,
        data: Vec<u8>,
        offset: u64,
        total: u64,
    },
    BlobAck {
        hash: String,
        received: bool,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl Message {
    /// Stable wire kind byte.
    pub fn kind(&self) -> u8 {
        match self {
            Message::Handshake(_) => 0,
            Message::SyncRequest { .. } => 1,
            Message::SyncResponse { .. } => 2,
            Message::Update { .. } => 3,
            Message::Ack { .. } => 4,
            Message::BlobRequest { .. } => 5,
            Message::BlobHave { .. } => 6,
            Message::BlobTransfer { .. } => 7,
            Message::BlobAck { .. } => 8,
            Message::Error { .. } => 9,
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "handshake",
            Message::SyncRequest { .. } => "sync-request",
            Message::SyncResponse { .. } => "sync-response",
            Message::Update { .. } => "update",
            Message::Ack { .. } => "ack",
            Message::BlobRequest { .. } => "blob-request",
            Message::BlobHave { .. } => "blob-have",
            Message::BlobTransfer { .. } => "blob-transfer",
            Message::BlobAck { .. } => "blob-ack",
            Message::Error { .. } => "error",
        }
    }
}

/// Encode a message into a full frame.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>> {
    let payload =
        bincode::serialize(msg).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;
    let body_len = payload.len() + 1;
    if body_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body_len));
    }
    let mut frame = Vec::with_capacity(4 + body_len);
    frame.extend_from_slice(&(body_len as u32).to_le_bytes());
    frame.push(msg.kind());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn decode_body(body: &[u8]) -> Result<Message> {
    let kind = body[0];
    if kind > 9 {
        return Err(ProtocolError::UnknownKind(kind));
    }
    let msg: Message = bincode::deserialize(&body[1..])
        .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;
    if msg.kind() != kind {
        return Err(ProtocolError::MalformedPayload(format!(
            "kind byte {kind} does not match payload {}",
            msg.name()
        )));
    }
    Ok(msg)
}

/// Incremental frame decoder over an ordered byte stream.
///
/// Feed received chunks with [`FrameBuffer::extend`], then drain complete
/// frames with [`FrameBuffer::next_frame`].
#[derive(Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Decode the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Message>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let body_len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
            as usize;
        if body_len == 0 || body_len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(body_len));
        }
        if self.buf.len() < 4 + body_len {
            return Ok(None);
        }
        let msg = decode_body(&self.buf[4..4 + body_len])?;
        self.buf.drain(..4 + body_len);
        Ok(Some(msg))
    }

    /// Bytes waiting for a complete frame.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::Handshake(Handshake {
                protocol_version: PROTOCOL_VERSION,
                peer_id: ReplicaId::from(0xabcd),
                vault_id: Some("vault-1".into()),
                hostname: Some("laptop".into()),
                nickname: None,
                version_vector: vec![1, 2, 3],
            }),
            Message::SyncRequest {
                version_vector: vec![4, 5],
            },
            Message::SyncResponse {
                updates: vec![6; 100],
                version_vector: vec![7],
            },
            Message::Update { data: vec![8; 10] },
            Message::Ack {
                version_vector: vec![9],
            },
            Message::BlobRequest {
                hashes: vec!["aa".repeat(32)],
            },
            Message::BlobHave {
                available: vec!["bb".repeat(32)],
                missing: vec![],
            },
            Message::BlobTransfer {
                hash: "cc".repeat(32),
                data: vec![1; 64],
                offset: 0,
                total: 64,
            },
            Message::BlobAck {
                hash: "dd".repeat(32),
                received: true,
            },
            Message::Error {
                code: ErrorCode::VaultMismatch,
                message: "different vault".into(),
            },
        ]
    }

    #[test]
    fn test_roundtrip_every_kind() {
        for msg in sample_messages() {
            let frame = encode_frame(&msg).unwrap();
            let mut buf = FrameBuffer::new();
            buf.extend(&frame);
            let decoded = buf.next_frame().unwrap().unwrap();
            assert_eq!(decoded, msg);
            assert!(buf.next_frame().unwrap().is_none());
            assert_eq!(buf.pending_len(), 0);
        }
    }

    #[test]
    fn test_kind_bytes_are_stable() {
        let kinds: Vec<u8> = sample_messages().iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(&Message::Update { data: vec![0xaa] }).unwrap();
        let body_len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(body_len, frame.len() - 4);
        assert_eq!(frame[4], 3); // update kind
    }

    #[test]
    fn test_partial_frames_reassemble() {
        let msg = Message::Update {
            data: vec![0x42; 1000],
        };
        let frame = encode_frame(&msg).unwrap();
        let mut buf = FrameBuffer::new();

        // Feed in three arbitrary chunks.
        buf.extend(&frame[..3]);
        assert!(buf.next_frame().unwrap().is_none());
        buf.extend(&frame[3..500]);
        assert!(buf.next_frame().unwrap().is_none());
        buf.extend(&frame[500..]);
        assert_eq!(buf.next_frame().unwrap().unwrap(), msg);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let m1 = Message::Ack {
            version_vector: vec![1],
        };
        let m2 = Message::Update { data: vec![2] };
        let mut chunk = encode_frame(&m1).unwrap();
        chunk.extend(encode_frame(&m2).unwrap());

        let mut buf = FrameBuffer::new();
        buf.extend(&chunk);
        assert_eq!(buf.next_frame().unwrap().unwrap(), m1);
        assert_eq!(buf.next_frame().unwrap().unwrap(), m2);
        assert!(buf.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_oversize_length_rejected() {
        let mut buf = FrameBuffer::new();
        let huge = (MAX_FRAME_SIZE as u32 + 1).to_le_bytes();
        buf.extend(&huge);
        buf.extend(&[0u8; 16]);
        assert!(matches!(
            buf.next_frame(),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&2u32.to_le_bytes());
        frame.push(200);
        frame.push(0);
        let mut buf = FrameBuffer::new();
        buf.extend(&frame);
        assert!(matches!(
            buf.next_frame(),
            Err(ProtocolError::UnknownKind(200))
        ));
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&3u32.to_le_bytes());
        frame.push(0); // handshake kind
        frame.extend_from_slice(&[0xff, 0xff]);
        let mut buf = FrameBuffer::new();
        buf.extend(&frame);
        assert!(matches!(
            buf.next_frame(),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }
}
