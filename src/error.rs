//! P2PSync Error Types

use thiserror::Error;

use crate::oplog::Sequence;

/// Result type alias for P2PSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// P2PSync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Operation log errors
    #[error("Operation log error: {0}")]
    Log(String),

    #[error("Operation log corrupted at offset {offset}: {reason}")]
    LogCorrupted { offset: u64, reason: String },

    #[error("Sequence {sequence} is not above the watermark {watermark}")]
    SequenceRegression { sequence: Sequence, watermark: Sequence },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // State store errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    // Replication errors
    #[error("Catch-up failed: no bootstrap peer reachable ({0})")]
    CatchUpFailed(String),

    #[error("Engine is not active (state: {0})")]
    NotActive(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is a transient transport failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
        )
    }
}
