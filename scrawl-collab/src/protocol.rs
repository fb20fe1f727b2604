//! Binary wire protocol for operation synchronization.
//!
//! Every WebSocket frame carries exactly one bincode-encoded
//! [`ClientMessage`] or [`ServerMessage`]. Frames are tagged enums rather
//! than opaque payloads so the server can validate structure at the
//! connection boundary before anything reaches a document.
//!
//! ```text
//! ┌─────────┬────────────────────────────────────┐
//! │ variant │ fields (varint ints, 16-byte uuids)│
//! │ tag     │ operations as component lists      │
//! └─────────┴────────────────────────────────────┘
//! ```
//!
//! Snapshots are the only large frames; their text rides LZ4-compressed
//! inside [`SnapshotPayload`]. A typical op frame is under 100 bytes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use scrawl_ot::Operation;

use crate::error::CollabError;
use crate::history::HistoryEntry;
use crate::presence::PresenceUpdate;

/// Messages sent from a client session to the server.
///
/// The first frame on every connection MUST be [`Join`](Self::Join);
/// anything else is rejected before it reaches a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Open a session on a document. `resume_from` carries the last
    /// version this client has integrated, or `None` for a fresh join
    /// that wants a full snapshot.
    Join {
        document_id: Uuid,
        session_id: Uuid,
        token: String,
        resume_from: Option<u64>,
    },

    /// Submit a local operation. The base version and originating
    /// session ride inside the operation itself; `local_seq` is the
    /// client-assigned sequence number used for ack matching and
    /// duplicate suppression.
    Op {
        document_id: Uuid,
        local_seq: u64,
        operation: Operation,
    },

    /// Request committed operations after `since_version`.
    HistoryRequest { since_version: u64 },

    /// Request a full snapshot of the current document state.
    SnapshotRequest,

    /// Presence update, relayed to other sessions without validation.
    Presence(PresenceUpdate),

    /// Liveness probe.
    Ping,
}

/// Messages sent from the server to client sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    /// The submitting session's operation was committed at `version`.
    /// Only the originator receives this; everyone else gets [`Op`](Self::Op).
    Ack { local_seq: u64, version: u64 },

    /// A remote session's operation was committed. `operation` is the
    /// form actually applied, fully transformed against its concurrent
    /// predecessors.
    Op {
        operation: Operation,
        version: u64,
        origin_session: Uuid,
    },

    /// Full document state at `SnapshotPayload::version`.
    Snapshot(SnapshotPayload),

    /// Committed operations answering a catch-up request, oldest first.
    History { entries: Vec<HistoryEntry> },

    /// Relayed presence update from another session.
    Presence {
        session_id: Uuid,
        update: PresenceUpdate,
    },

    /// Request-level failure. The connection stays open unless the code
    /// is fatal to the session (authentication, malformed stream).
    Error { code: ErrorCode, message: String },

    /// Liveness reply.
    Pong,
}

impl ClientMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

impl ServerMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Build an error frame from an engine error.
    pub fn error(err: &CollabError) -> Self {
        Self::Error {
            code: ErrorCode::from(err),
            message: err.to_string(),
        }
    }
}

/// Compressed document snapshot.
///
/// Snapshot text is LZ4-compressed with a length prefix, the same format
/// persisted stores use for document bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPayload {
    /// Document version the snapshot reflects.
    pub version: u64,
    /// LZ4-compressed UTF-8 text (length-prefixed).
    compressed: Vec<u8>,
}

impl SnapshotPayload {
    pub fn new(content: &str, version: u64) -> Self {
        Self {
            version,
            compressed: lz4_flex::compress_prepend_size(content.as_bytes()),
        }
    }

    /// Decompress the snapshot text.
    pub fn content(&self) -> Result<String, ProtocolError> {
        let bytes = lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| ProtocolError::SnapshotCorrupt(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| ProtocolError::SnapshotCorrupt(e.to_string()))
    }

    /// Size of the compressed text on the wire.
    pub fn compressed_len(&self) -> usize {
        self.compressed.len()
    }
}

/// Machine-readable error category carried in [`ServerMessage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    LengthMismatch,
    HistoryTrimmed,
    InvalidOperationSchema,
    ConflictUnresolvable,
    StorageUnavailable,
    Unauthorized,
    Internal,
}

impl From<&CollabError> for ErrorCode {
    fn from(err: &CollabError) -> Self {
        match err {
            CollabError::LengthMismatch { .. } => Self::LengthMismatch,
            CollabError::HistoryTrimmed { .. } => Self::HistoryTrimmed,
            CollabError::InvalidOperationSchema(_) => Self::InvalidOperationSchema,
            CollabError::ConflictUnresolvable => Self::ConflictUnresolvable,
            CollabError::StorageUnavailable(_) => Self::StorageUnavailable,
            CollabError::Unauthorized(_) => Self::Unauthorized,
            CollabError::DocumentClosed
            | CollabError::ConnectionClosed
            | CollabError::Timeout
            | CollabError::Protocol(_) => Self::Internal,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    SnapshotCorrupt(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::SnapshotCorrupt(e) => write!(f, "Snapshot payload corrupt: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_operation() -> Operation {
        Operation::new(4, Uuid::from_u128(1))
            .retain(2)
            .insert("hi")
            .delete(1)
            .retain(3)
    }

    #[test]
    fn test_join_roundtrip() {
        let msg = ClientMessage::Join {
            document_id: Uuid::from_u128(10),
            session_id: Uuid::from_u128(20),
            token: "secret".to_string(),
            resume_from: Some(17),
        };

        let encoded = msg.encode().unwrap();
        match ClientMessage::decode(&encoded).unwrap() {
            ClientMessage::Join { document_id, session_id, token, resume_from } => {
                assert_eq!(document_id, Uuid::from_u128(10));
                assert_eq!(session_id, Uuid::from_u128(20));
                assert_eq!(token, "secret");
                assert_eq!(resume_from, Some(17));
            }
            other => panic!("Expected Join, got {:?}", other),
        }
    }

    #[test]
    fn test_op_roundtrip() {
        let op = sample_operation();
        let msg = ClientMessage::Op {
            document_id: Uuid::from_u128(10),
            local_seq: 3,
            operation: op.clone(),
        };

        let encoded = msg.encode().unwrap();
        match ClientMessage::decode(&encoded).unwrap() {
            ClientMessage::Op { local_seq, operation, .. } => {
                assert_eq!(local_seq, 3);
                assert_eq!(operation.base_version, op.base_version);
                assert_eq!(operation.origin, op.origin);
                assert_eq!(operation.components(), op.components());
            }
            other => panic!("Expected Op, got {:?}", other),
        }
    }

    #[test]
    fn test_ack_roundtrip() {
        let msg = ServerMessage::Ack { local_seq: 7, version: 42 };
        let encoded = msg.encode().unwrap();

        match ServerMessage::decode(&encoded).unwrap() {
            ServerMessage::Ack { local_seq, version } => {
                assert_eq!(local_seq, 7);
                assert_eq!(version, 42);
            }
            other => panic!("Expected Ack, got {:?}", other),
        }
    }

    #[test]
    fn test_server_op_roundtrip() {
        let op = sample_operation();
        let msg = ServerMessage::Op {
            operation: op.clone(),
            version: 5,
            origin_session: Uuid::from_u128(20),
        };

        let encoded = msg.encode().unwrap();
        match ServerMessage::decode(&encoded).unwrap() {
            ServerMessage::Op { operation, version, origin_session } => {
                assert_eq!(version, 5);
                assert_eq!(origin_session, Uuid::from_u128(20));
                assert_eq!(operation.components(), op.components());
            }
            other => panic!("Expected Op, got {:?}", other),
        }
    }

    #[test]
    fn test_history_roundtrip() {
        let entries = vec![
            HistoryEntry {
                version: 5,
                operation: sample_operation(),
                origin: Uuid::from_u128(20),
            },
            HistoryEntry {
                version: 6,
                operation: Operation::new(5, Uuid::from_u128(21)).retain(7).insert("!"),
                origin: Uuid::from_u128(21),
            },
        ];

        let msg = ServerMessage::History { entries };
        let encoded = msg.encode().unwrap();

        match ServerMessage::decode(&encoded).unwrap() {
            ServerMessage::History { entries } => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].version, 5);
                assert_eq!(entries[1].version, 6);
            }
            other => panic!("Expected History, got {:?}", other),
        }
    }

    #[test]
    fn test_presence_roundtrip() {
        let update = PresenceUpdate::Cursor {
            position: 12,
            selection: Some((10, 14)),
            timestamp: 3,
        };
        let msg = ClientMessage::Presence(update.clone());
        let encoded = msg.encode().unwrap();

        match ClientMessage::decode(&encoded).unwrap() {
            ClientMessage::Presence(decoded) => assert_eq!(decoded, update),
            other => panic!("Expected Presence, got {:?}", other),
        }
    }

    #[test]
    fn test_ping_pong_roundtrip() {
        let ping = ClientMessage::Ping.encode().unwrap();
        let pong = ServerMessage::Pong.encode().unwrap();

        assert!(matches!(ClientMessage::decode(&ping).unwrap(), ClientMessage::Ping));
        assert!(matches!(ServerMessage::decode(&pong).unwrap(), ServerMessage::Pong));
    }

    #[test]
    fn test_snapshot_payload_roundtrip() {
        let content = "The quick brown fox jumps over the lazy dog. 日本語もある。";
        let payload = SnapshotPayload::new(content, 12);

        assert_eq!(payload.version, 12);
        assert_eq!(payload.content().unwrap(), content);
    }

    #[test]
    fn test_snapshot_compression_effective() {
        // Repetitive text should compress well below its raw size.
        let content = "lorem ipsum dolor sit amet ".repeat(500);
        let payload = SnapshotPayload::new(&content, 1);

        assert!(
            payload.compressed_len() < content.len() / 4,
            "Compression ineffective: {} bytes for {} bytes of text",
            payload.compressed_len(),
            content.len()
        );
        assert_eq!(payload.content().unwrap(), content);
    }

    #[test]
    fn test_snapshot_corrupt_payload_rejected() {
        let mut payload = SnapshotPayload::new("hello", 1);
        payload.compressed = vec![0xFF, 0x00, 0x12];
        assert!(payload.content().is_err());
    }

    #[test]
    fn test_error_frame_from_collab_error() {
        let err = CollabError::HistoryTrimmed { requested: 3, oldest: 40 };
        let msg = ServerMessage::error(&err);
        let encoded = msg.encode().unwrap();

        match ServerMessage::decode(&encoded).unwrap() {
            ServerMessage::Error { code, message } => {
                assert_eq!(code, ErrorCode::HistoryTrimmed);
                assert!(message.contains("version 3"));
            }
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            ErrorCode::from(&CollabError::LengthMismatch { expected: 1, got: 2 }),
            ErrorCode::LengthMismatch
        );
        assert_eq!(
            ErrorCode::from(&CollabError::Unauthorized("nope".into())),
            ErrorCode::Unauthorized
        );
        assert_eq!(
            ErrorCode::from(&CollabError::ConflictUnresolvable),
            ErrorCode::ConflictUnresolvable
        );
        assert_eq!(ErrorCode::from(&CollabError::Timeout), ErrorCode::Internal);
        assert_eq!(
            ErrorCode::from(&CollabError::DocumentClosed),
            ErrorCode::Internal
        );
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(ClientMessage::decode(&garbage).is_err());
        assert!(ServerMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_op_frame_size_efficient() {
        let msg = ClientMessage::Op {
            document_id: Uuid::new_v4(),
            local_seq: 1,
            operation: Operation::new(100, Uuid::new_v4()).retain(50).insert("a").retain(50),
        };
        let encoded = msg.encode().unwrap();

        // Tag + doc uuid + seq + op (2 uuid-sized fields, 3 components).
        assert!(
            encoded.len() < 100,
            "Op frame too large: {} bytes",
            encoded.len()
        );
    }

    #[test]
    fn test_empty_document_snapshot() {
        let payload = SnapshotPayload::new("", 0);
        assert_eq!(payload.content().unwrap(), "");
    }
}
