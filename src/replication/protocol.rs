//! Replication Protocol
//!
//! Defines the wire protocol for communication between peers.

use serde::{Deserialize, Serialize};

use crate::oplog::{OperationEntry, Sequence, OPERATION_FORMAT_VERSION};
use crate::state::{PeerAddress, PeerSet};

/// Protocol messages for peer communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Membership ==========
    /// A peer introduces itself
    Connect {
        peer: PeerAddress,
    },

    /// Peers known before the caller was added
    ConnectAck {
        peers: PeerSet,
    },

    /// Subscribe to peer-set snapshots (server streaming)
    StreamPeerUpdates,

    /// One peer-set snapshot
    PeerUpdate {
        peers: PeerSet,
    },

    // ========== Heartbeat/Health ==========
    /// Liveness probe
    Heartbeat,

    /// Liveness acknowledgement with the responder's watermark
    HeartbeatAck {
        watermark: Sequence,
    },

    // ========== Log Replication ==========
    /// Request entries above a sequence (server streaming)
    StreamLog {
        from_sequence: Sequence,
    },

    /// One streamed log entry
    LogEntry {
        entry: OperationEntry,
    },

    /// End of a finite stream
    StreamEnd,

    /// Deliver a broadcast entry
    SubmitOperation {
        entry: OperationEntry,
    },

    /// Whether the submitted entry was applied or discarded as a duplicate
    SubmitAck {
        applied: bool,
    },

    // ========== Error ==========
    /// Error response
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Request not valid in this position of the exchange
    UnexpectedMessage,
    /// The node is shutting down
    ShuttingDown,
    /// Local log or store failure while handling the request
    Internal,
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Connect { .. } => "Connect",
            Message::ConnectAck { .. } => "ConnectAck",
            Message::StreamPeerUpdates => "StreamPeerUpdates",
            Message::PeerUpdate { .. } => "PeerUpdate",
            Message::Heartbeat => "Heartbeat",
            Message::HeartbeatAck { .. } => "HeartbeatAck",
            Message::StreamLog { .. } => "StreamLog",
            Message::LogEntry { .. } => "LogEntry",
            Message::StreamEnd => "StreamEnd",
            Message::SubmitOperation { .. } => "SubmitOperation",
            Message::SubmitAck { .. } => "SubmitAck",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
    /// Operation format version of the sender
    pub version: u8,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 9;

    /// Largest frame body accepted from a peer
    pub const MAX_LENGTH: u32 = 32 * 1024 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
            version: OPERATION_FORMAT_VERSION,
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes[8] = self.version;
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            checksum: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            version: bytes[8],
        }
    }
}
