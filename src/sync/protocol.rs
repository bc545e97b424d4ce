//! Binary WebSocket protocol for DocOp and workspace tree synchronization.
//!
//! Every frame is a version byte, a message type byte, a 24-bit payload
//! length and a bincode payload. Text frames carrying the same envelopes as
//! JSON are accepted as a fallback.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::{self, Cursor};

use super::messages::{
    ClientToServerDocOp, GetDirectory, GetDirectoryResponse, GetFileContents,
    GetFileContentsResponse, RecoverFromMissedDocOps, RecoverFromMissedDocOpsResponse,
    ServerToClientDocOp, ServerToClientDocOps, WorkspaceTreeUpdate, WorkspaceTreeUpdateBroadcast,
};
use super::{ClientId, FileEditSessionKey};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

/// Message type identifiers for efficient binary encoding
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Connection
    Hello = 0x01,
    Welcome = 0x02,
    Goodbye = 0x03,
    Error = 0x04,

    // Document operations
    MutateDocument = 0x10,
    DocOpsApplied = 0x11,
    DocOpBroadcast = 0x12,
    RecoverMissedDocOps = 0x13,
    RecoveryResponse = 0x14,

    // File contents
    GetFileContents = 0x20,
    FileContents = 0x21,
    CloseFile = 0x22,

    // Workspace tree
    GetDirectory = 0x30,
    Directory = 0x31,
    MutateWorkspaceTree = 0x32,
    WorkspaceTreeUpdated = 0x33,
    WorkspaceTreeBroadcast = 0x34,

    // Admin/Debug
    Ping = 0xF0,
    Pong = 0xF1,
    Stats = 0xF2,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(MessageType::Hello),
            0x02 => Ok(MessageType::Welcome),
            0x03 => Ok(MessageType::Goodbye),
            0x04 => Ok(MessageType::Error),
            0x10 => Ok(MessageType::MutateDocument),
            0x11 => Ok(MessageType::DocOpsApplied),
            0x12 => Ok(MessageType::DocOpBroadcast),
            0x13 => Ok(MessageType::RecoverMissedDocOps),
            0x14 => Ok(MessageType::RecoveryResponse),
            0x20 => Ok(MessageType::GetFileContents),
            0x21 => Ok(MessageType::FileContents),
            0x22 => Ok(MessageType::CloseFile),
            0x30 => Ok(MessageType::GetDirectory),
            0x31 => Ok(MessageType::Directory),
            0x32 => Ok(MessageType::MutateWorkspaceTree),
            0x33 => Ok(MessageType::WorkspaceTreeUpdated),
            0x34 => Ok(MessageType::WorkspaceTreeBroadcast),
            0xF0 => Ok(MessageType::Ping),
            0xF1 => Ok(MessageType::Pong),
            0xF2 => Ok(MessageType::Stats),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        ProtocolError::Io(err.to_string())
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Initial handshake
    Hello {
        protocol_version: u8,
        client_name: String,
    },

    /// Graceful disconnect
    Goodbye { reason: Option<String> },

    /// Local edits to a file
    MutateDocument {
        request_id: u64,
        message: ClientToServerDocOp,
    },

    /// Ask for every op after a known revision
    RecoverMissedDocOps {
        request_id: u64,
        message: RecoverFromMissedDocOps,
    },

    /// Open a file and join its edit session
    GetFileContents {
        request_id: u64,
        message: GetFileContents,
    },

    /// Leave a file's edit session
    CloseFile {
        file_edit_session_key: FileEditSessionKey,
    },

    /// Directory listing
    GetDirectory {
        request_id: u64,
        message: GetDirectory,
    },

    /// Add, delete, move or copy workspace nodes
    MutateWorkspaceTree {
        request_id: u64,
        message: WorkspaceTreeUpdate,
    },

    /// Ping for keepalive
    Ping { timestamp: u64 },

    /// Ask for server statistics
    GetStats,
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Welcome response with the assigned client id
    Welcome {
        protocol_version: u8,
        client_id: ClientId,
        server_time: i64,
    },

    /// Error response
    Error {
        request_id: Option<u64>,
        code: ErrorCode,
        message: String,
    },

    /// Graceful disconnect acknowledgment
    Goodbye { reason: Option<String> },

    /// Reply to `MutateDocument`
    DocOpsApplied {
        request_id: u64,
        message: ServerToClientDocOps,
    },

    /// An op another collaborator made
    DocOpBroadcast { message: ServerToClientDocOp },

    /// Reply to `RecoverMissedDocOps`
    RecoveryResponse {
        request_id: u64,
        message: RecoverFromMissedDocOpsResponse,
    },

    /// Reply to `GetFileContents`
    FileContents {
        request_id: u64,
        message: GetFileContentsResponse,
    },

    /// Reply to `GetDirectory`
    Directory {
        request_id: u64,
        message: GetDirectoryResponse,
    },

    /// Reply to `MutateWorkspaceTree`
    WorkspaceTreeUpdated {
        request_id: u64,
        message: WorkspaceTreeUpdateBroadcast,
    },

    /// Tree change made by another collaborator. `None` tells the client the
    /// payload was lost and the tree must be reloaded.
    WorkspaceTreeBroadcast {
        message: Option<WorkspaceTreeUpdateBroadcast>,
    },

    /// Pong response
    Pong { timestamp: u64, server_time: i64 },

    /// Server statistics
    Stats {
        active_sessions: u32,
        connected_clients: u32,
        tree_version: u64,
        uptime_seconds: u64,
    },
}

impl ServerMessage {
    /// Request id this message answers, if it is a reply.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ServerMessage::Error { request_id, .. } => *request_id,
            ServerMessage::DocOpsApplied { request_id, .. }
            | ServerMessage::RecoveryResponse { request_id, .. }
            | ServerMessage::FileContents { request_id, .. }
            | ServerMessage::Directory { request_id, .. }
            | ServerMessage::WorkspaceTreeUpdated { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }
}

/// Error codes for server responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 0,
    InvalidMessage = 1,
    Unauthorized = 2,
    SessionNotFound = 3,
    FileNotFound = 4,
    ServerError = 5,
    VersionMismatch = 6,
    HistoryUnavailable = 7,
    DocumentOperation = 8,
    TreeMutationFailed = 9,
}

/// Protocol codec for encoding/decoding messages
pub struct SyncProtocol;

impl SyncProtocol {
    /// Encode a client message to bytes
    pub fn encode_client(msg: &ClientMessage) -> Result<Bytes, ProtocolError> {
        let msg_type = match msg {
            ClientMessage::Hello { .. } => MessageType::Hello,
            ClientMessage::Goodbye { .. } => MessageType::Goodbye,
            ClientMessage::MutateDocument { .. } => MessageType::MutateDocument,
            ClientMessage::RecoverMissedDocOps { .. } => MessageType::RecoverMissedDocOps,
            ClientMessage::GetFileContents { .. } => MessageType::GetFileContents,
            ClientMessage::CloseFile { .. } => MessageType::CloseFile,
            ClientMessage::GetDirectory { .. } => MessageType::GetDirectory,
            ClientMessage::MutateWorkspaceTree { .. } => MessageType::MutateWorkspaceTree,
            ClientMessage::Ping { .. } => MessageType::Ping,
            ClientMessage::GetStats => MessageType::Stats,
        };

        frame(msg_type, &bincode::serialize(msg)?)
    }

    /// Encode a server message to bytes
    pub fn encode_server(msg: &ServerMessage) -> Result<Bytes, ProtocolError> {
        let msg_type = match msg {
            ServerMessage::Welcome { .. } => MessageType::Welcome,
            ServerMessage::Error { .. } => MessageType::Error,
            ServerMessage::Goodbye { .. } => MessageType::Goodbye,
            ServerMessage::DocOpsApplied { .. } => MessageType::DocOpsApplied,
            ServerMessage::DocOpBroadcast { .. } => MessageType::DocOpBroadcast,
            ServerMessage::RecoveryResponse { .. } => MessageType::RecoveryResponse,
            ServerMessage::FileContents { .. } => MessageType::FileContents,
            ServerMessage::Directory { .. } => MessageType::Directory,
            ServerMessage::WorkspaceTreeUpdated { .. } => MessageType::WorkspaceTreeUpdated,
            ServerMessage::WorkspaceTreeBroadcast { .. } => MessageType::WorkspaceTreeBroadcast,
            ServerMessage::Pong { .. } => MessageType::Pong,
            ServerMessage::Stats { .. } => MessageType::Stats,
        };

        frame(msg_type, &bincode::serialize(msg)?)
    }

    /// Decode a client message from bytes
    pub fn decode_client(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
        let payload = unframe(data)?;
        Ok(bincode::deserialize(payload)?)
    }

    /// Decode a server message from bytes
    pub fn decode_server(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
        let payload = unframe(data)?;
        Ok(bincode::deserialize(payload)?)
    }

    /// Decode a client message sent as a JSON text frame
    pub fn decode_client_json(text: &str) -> Result<ClientMessage, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Create an error response message
    pub fn error_response(
        request_id: Option<u64>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> ServerMessage {
        ServerMessage::Error {
            request_id,
            code,
            message: message.into(),
        }
    }
}

fn frame(msg_type: MessageType, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    if payload.len() + HEADER_LEN > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(
            payload.len() + HEADER_LEN,
            MAX_MESSAGE_SIZE,
        ));
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(msg_type as u8);
    buf.put_u24(payload.len() as u32);
    buf.put_slice(payload);

    Ok(buf.freeze())
}

fn unframe(data: &[u8]) -> Result<&[u8], ProtocolError> {
    if data.len() < HEADER_LEN {
        return Err(ProtocolError::InvalidFormat(
            "Message too short".to_string(),
        ));
    }

    let mut cursor = Cursor::new(data);

    let version = cursor.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
    }

    MessageType::try_from(cursor.get_u8())?;
    let payload_len = cursor.get_uint(3) as usize;

    if data.len() < HEADER_LEN + payload_len {
        return Err(ProtocolError::InvalidFormat(format!(
            "Expected {} bytes, got {}",
            HEADER_LEN + payload_len,
            data.len()
        )));
    }

    Ok(&data[HEADER_LEN..HEADER_LEN + payload_len])
}

/// Extension trait for writing u24 values
trait BufMutExt {
    fn put_u24(&mut self, n: u32);
}

impl BufMutExt for BytesMut {
    fn put_u24(&mut self, n: u32) {
        self.put_u8((n >> 16) as u8);
        self.put_u8((n >> 8) as u8);
        self.put_u8(n as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::{DocOpBuilder, DocumentSelection, FilePosition};
    use crate::sync::messages::{DirInfo, Mutation};

    #[test]
    fn test_encode_decode_mutate_document() {
        let op = DocOpBuilder::new().insert("hi").retain_line(1).build();
        let msg = ClientMessage::MutateDocument {
            request_id: 9,
            message: ClientToServerDocOp {
                file_edit_session_key: "3".to_string(),
                client_id: "client-1".to_string(),
                cc_revision: 4,
                selection: Some(DocumentSelection {
                    user_id: "client-1".to_string(),
                    base_position: FilePosition::new(0, 2),
                    cursor_position: FilePosition::new(0, 2),
                }),
                doc_ops: vec![op.to_json().unwrap()],
            },
        };

        let encoded = SyncProtocol::encode_client(&msg).unwrap();
        assert_eq!(encoded[1], MessageType::MutateDocument as u8);
        let decoded = SyncProtocol::decode_client(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_encode_decode_directory_reply() {
        let mut root = DirInfo::new("", "0");
        root.sub_directories.push(DirInfo {
            is_complete: false,
            ..DirInfo::new("src", "1")
        });
        let msg = ServerMessage::Directory {
            request_id: 2,
            message: GetDirectoryResponse {
                path: "/".to_string(),
                base_directory: Some(root),
                root_id: "12".to_string(),
            },
        };

        let encoded = SyncProtocol::encode_server(&msg).unwrap();
        let decoded = SyncProtocol::decode_server(&encoded).unwrap();
        assert_eq!(decoded.request_id(), Some(2));
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_tree_broadcast_without_payload() {
        let msg = ServerMessage::WorkspaceTreeBroadcast { message: None };
        let encoded = SyncProtocol::encode_server(&msg).unwrap();
        let decoded = SyncProtocol::decode_server(&encoded).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.request_id(), None);
    }

    #[test]
    fn test_json_text_fallback() {
        let msg = ClientMessage::MutateWorkspaceTree {
            request_id: 1,
            message: WorkspaceTreeUpdate {
                author_client_id: "c".to_string(),
                mutations: vec![Mutation::delete("/old.txt")],
            },
        };
        let text = serde_json::to_string(&msg).unwrap();
        assert_eq!(SyncProtocol::decode_client_json(&text).unwrap(), msg);
    }

    #[test]
    fn test_version_mismatch() {
        let mut data = SyncProtocol::encode_client(&ClientMessage::Ping { timestamp: 0 })
            .unwrap()
            .to_vec();
        data[0] = 99;

        match SyncProtocol::decode_client(&data) {
            Err(ProtocolError::VersionMismatch(expected, got)) => {
                assert_eq!(expected, PROTOCOL_VERSION);
                assert_eq!(got, 99);
            }
            other => panic!("Expected version mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_message_type() {
        let mut data = SyncProtocol::encode_client(&ClientMessage::Ping { timestamp: 0 })
            .unwrap()
            .to_vec();
        data[1] = 0x99;
        assert!(matches!(
            SyncProtocol::decode_client(&data),
            Err(ProtocolError::UnknownMessageType(0x99))
        ));
    }

    #[test]
    fn test_truncated_message() {
        assert!(SyncProtocol::decode_server(&[PROTOCOL_VERSION, 0x02]).is_err());
    }
}
