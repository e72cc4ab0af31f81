//! P2PSync - Peer-to-Peer Operation Replication
//!
//! Keeps the local data stores of a loosely coupled set of peers in sync by
//! replicating every mutating operation accepted anywhere in the network.
//!
//! # Architecture
//!
//! Every node keeps a durable, append-only operation log. Local mutations
//! are appended and pushed to every known peer; entries received from peers
//! are applied through a [`executor::StateStore`] when they are above the
//! node's watermark. A joining node replays a bootstrap peer's log, then
//! registers with it and with every peer it learns about.
//!
//! There is no leader and no quorum. Replication is eventual and
//! order-preserving per origin, with last-writer-wins semantics at the
//! storage layer.
//!
//! # Features
//!
//! - Length-prefixed, checksummed operation log with torn-tail recovery
//! - Peer registry with change notification
//! - Heartbeat failure detection with heartbeat-triggered resync
//! - Catch-up for late-joining nodes
//! - TCP and in-process transports
//! - SQLite-backed forum state store
//! - HTTP status API

pub mod api;
pub mod config;
pub mod error;
pub mod executor;
pub mod network;
pub mod oplog;
pub mod replication;
pub mod state;

pub use config::P2PSyncConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::P2PSyncConfig;
    pub use crate::error::{Error, Result};
    pub use crate::executor::{MemoryStore, SqliteStore, StateStore};
    pub use crate::network::{MemoryNetwork, NetworkClient, NetworkServer, PeerClient};
    pub use crate::oplog::{Operation, OperationEntry, OperationLog, Sequence};
    pub use crate::replication::{
        EngineState, PeerService, ReceiveOutcome, ReplicationConfig, ReplicationEngine,
    };
    pub use crate::state::{PeerAddress, PeerRegistry, PeerSet};
}
