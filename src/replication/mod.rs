//! Replication Module
//!
//! Moves operations between peers: broadcast of local mutations, in-order
//! application of received entries, catch-up for joining nodes and
//! heartbeat-based failure detection.

pub mod protocol;
mod detector;
mod engine;
mod service;

pub use detector::FailureDetector;
pub use engine::{ApplyFailure, ReplicationEngine};
pub use protocol::{ErrorCode, FrameHeader, Message};
pub use service::PeerService;
pub(crate) use service::error_reply;

use serde::Serialize;
use std::time::Duration;

/// Configuration for replication
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Time between heartbeat probes of one peer
    pub heartbeat_interval: Duration,
    /// Time to wait for one heartbeat response
    pub heartbeat_timeout: Duration,
    /// Consecutive failed probes before a peer is declared unreachable
    pub failure_threshold: u32,
    /// Pending resync requests before new ones are dropped
    pub resync_queue_size: usize,
    /// Capacity of the apply-failure channel
    pub apply_failure_capacity: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(1000),
            heartbeat_timeout: Duration::from_millis(500),
            failure_threshold: 3,
            resync_queue_size: 16,
            apply_failure_capacity: 64,
        }
    }
}

/// Lifecycle of a replication engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Created, not started
    Joining,
    /// Replaying a bootstrap peer's log
    CatchingUp,
    /// Serving and replicating
    Active,
    /// Shut down
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Joining => write!(f, "joining"),
            EngineState::CatchingUp => write!(f, "catching_up"),
            EngineState::Active => write!(f, "active"),
            EngineState::Stopped => write!(f, "stopped"),
        }
    }
}

/// What `receive` did with an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveOutcome {
    /// Applied and recorded in the log
    Applied,
    /// At or below the watermark, discarded
    Duplicate,
}

impl ReceiveOutcome {
    /// Whether the entry was applied
    pub fn is_applied(&self) -> bool {
        matches!(self, ReceiveOutcome::Applied)
    }
}
