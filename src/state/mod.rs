//! State Management Module
//!
//! Handles peer membership: who this node replicates to and probes.

mod membership;

pub use membership::{PeerAddress, PeerRegistry, PeerSet, PeerUpdates};
