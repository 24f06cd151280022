//! Binary protocol for room sessions.
//!
//! Every frame is `[version u8][type u8][length u24][bincode payload]`.
//! The type byte is checked against the decoded payload so a peer cannot
//! smuggle one message kind under another's header.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::{self, Cursor};

use super::awareness::AwarenessFields;
use super::{ClientInfo, RoomId, SessionId};
use crate::crdt::{ClientId, DocumentState, Operation, StateVector};

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

    // Replication
    SyncRequest = 0x10,
    SyncResponse = 0x11,
    Snapshot = 0x12,
    Update = 0x13,
    Ack = 0x14,

    // Awareness (high-frequency)
    AwarenessUpdate = 0x40,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(MessageType::Hello),
            0x02 => Ok(MessageType::Welcome),
            0x03 => Ok(MessageType::Goodbye),
            0x04 => Ok(MessageType::Error),
            0x10 => Ok(MessageType::SyncRequest),
            0x11 => Ok(MessageType::SyncResponse),
            0x12 => Ok(MessageType::Snapshot),
            0x13 => Ok(MessageType::Update),
            0x14 => Ok(MessageType::Ack),
            0x40 => Ok(MessageType::AwarenessUpdate),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
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

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        ProtocolError::Io(err.to_string())
    }
}

/// Messages exchanged between a client session and a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// First frame of a connection
    Hello {
        protocol_version: u8,
        room_id: RoomId,
        client: ClientInfo,
        resume_token: Option<String>,
    },

    /// Server accepted the session
    Welcome {
        protocol_version: u8,
        session_id: SessionId,
        resume_token: String,
        server_time: i64,
        /// Highest clock the room holds from this client id
        client_clock: u64,
    },

    /// "This is what I have"; the peer answers with what is missing
    SyncRequest { state_vector: StateVector },

    /// Operations the requester was missing
    SyncResponse { operations: Vec<Operation> },

    /// Full document state, sent when history no longer covers the gap
    Snapshot { state: Box<DocumentState> },

    /// New operations
    Update { operations: Vec<Operation> },

    /// Heartbeat acknowledgement of everything applied so far
    Ack { state_vector: StateVector },

    /// Presence of one client; `None` fields means the client left
    AwarenessUpdate {
        client_id: ClientId,
        fields: Option<AwarenessFields>,
        timestamp: i64,
    },

    Error { code: ErrorCode, message: String },

    Goodbye { reason: Option<String> },
}

impl WireMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            WireMessage::Hello { .. } => MessageType::Hello,
            WireMessage::Welcome { .. } => MessageType::Welcome,
            WireMessage::SyncRequest { .. } => MessageType::SyncRequest,
            WireMessage::SyncResponse { .. } => MessageType::SyncResponse,
            WireMessage::Snapshot { .. } => MessageType::Snapshot,
            WireMessage::Update { .. } => MessageType::Update,
            WireMessage::Ack { .. } => MessageType::Ack,
            WireMessage::AwarenessUpdate { .. } => MessageType::AwarenessUpdate,
            WireMessage::Error { .. } => MessageType::Error,
            WireMessage::Goodbye { .. } => MessageType::Goodbye,
        }
    }

    /// Create an error message
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        WireMessage::Error {
            code,
            message: message.into(),
        }
    }
}

/// Error codes carried by `WireMessage::Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 0,
    InvalidMessage = 1,
    /// The session could not be resumed incrementally; a snapshot follows
    VersionConflict = 2,
    RoomNotFound = 3,
    RoomFull = 4,
    ServerError = 5,
    VersionMismatch = 6,
    Unauthorized = 7,
}

/// Frame codec for [`WireMessage`]
pub struct WireCodec;

impl WireCodec {
    pub fn encode(msg: &WireMessage) -> Result<Bytes, ProtocolError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() + HEADER_LEN > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(
                payload.len() + HEADER_LEN,
                MAX_MESSAGE_SIZE,
            ));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(msg.message_type() as u8);
        buf.put_u24(payload.len() as u32);
        buf.put_slice(&payload);

        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<WireMessage, ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::InvalidFormat(
                "Message too short".to_string(),
            ));
        }
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(data.len(), MAX_MESSAGE_SIZE));
        }

        let mut cursor = Cursor::new(data);

        let version = cursor.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
        }

        let msg_type = MessageType::try_from(cursor.get_u8())?;
        let payload_len = cursor.get_uint(3) as usize;

        if data.len() < HEADER_LEN + payload_len {
            return Err(ProtocolError::InvalidFormat(format!(
                "Expected {} bytes, got {}",
                HEADER_LEN + payload_len,
                data.len()
            )));
        }

        let payload = &data[HEADER_LEN..HEADER_LEN + payload_len];
        let msg: WireMessage = bincode::deserialize(payload)?;

        if msg.message_type() != msg_type {
            return Err(ProtocolError::InvalidFormat(format!(
                "Header says {:?}, payload is {:?}",
                msg_type,
                msg.message_type()
            )));
        }

        Ok(msg)
    }
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
