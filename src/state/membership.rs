//! Peer Membership Management
//!
//! Tracks the set of reachable peers and notifies subscribers whenever the
//! set changes.

use std::collections::{BTreeSet, HashSet};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Mutex;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::error::{Error, Result};

/// Network address of a peer, its identity in the cluster
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for PeerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("Invalid peer address '{}': expected host:port", s)))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::Config(format!("Invalid peer address '{}': empty host", s)));
        }

        let port = port
            .parse::<u16>()
            .map_err(|e| Error::Config(format!("Invalid port in peer address '{}': {}", s, e)))?;

        Ok(Self::new(host, port))
    }
}

/// Set of peers as seen at one point in time
pub type PeerSet = BTreeSet<PeerAddress>;

/// Registry of currently reachable peers.
///
/// The set lives inside a watch channel, so every mutation and its change
/// notification happen under the same lock. This node's own address is
/// never admitted.
pub struct PeerRegistry {
    /// This node's address
    local: PeerAddress,
    /// Current peer set
    peers: watch::Sender<PeerSet>,
    /// Peers removed as unreachable; only an explicit add brings them back
    departed: Mutex<HashSet<PeerAddress>>,
}

impl PeerRegistry {
    /// Create an empty registry for the node at `local`
    pub fn new(local: PeerAddress) -> Self {
        let (peers, _) = watch::channel(PeerSet::new());
        Self {
            local,
            peers,
            departed: Mutex::new(HashSet::new()),
        }
    }

    /// This node's own address
    pub fn local_address(&self) -> &PeerAddress {
        &self.local
    }

    /// Add a peer introduced directly (Connect or join).
    ///
    /// Returns true if the peer was not already present.
    pub fn add(&self, peer: PeerAddress) -> bool {
        if peer == self.local {
            return false;
        }
        self.departed_set().remove(&peer);

        let added = self.peers.send_if_modified(|set| set.insert(peer.clone()));
        if added {
            tracing::info!("Peer {} added ({} peers)", peer, self.len());
        }
        added
    }

    /// Merge a peer list received from another node.
    ///
    /// Skips this node and peers already declared unreachable. Returns the
    /// peers that were newly added.
    pub fn merge<I>(&self, peers: I) -> Vec<PeerAddress>
    where
        I: IntoIterator<Item = PeerAddress>,
    {
        let departed = self.departed_set().clone();
        let mut added = Vec::new();

        self.peers.send_if_modified(|set| {
            for peer in peers {
                if peer == self.local || departed.contains(&peer) {
                    continue;
                }
                if set.insert(peer.clone()) {
                    added.push(peer);
                }
            }
            !added.is_empty()
        });

        if !added.is_empty() {
            tracing::info!("Learned {} new peer(s) from peer list update", added.len());
        }
        added
    }

    /// Remove a peer that failed its heartbeat threshold.
    ///
    /// Returns true if the peer was present.
    pub fn remove(&self, peer: &PeerAddress) -> bool {
        self.departed_set().insert(peer.clone());

        let removed = self.peers.send_if_modified(|set| set.remove(peer));
        if removed {
            tracing::info!("Peer {} removed ({} peers)", peer, self.len());
        }
        removed
    }

    /// Point-in-time copy of the peer set
    pub fn snapshot(&self) -> PeerSet {
        self.peers.borrow().clone()
    }

    /// Check whether a peer is present
    pub fn contains(&self, peer: &PeerAddress) -> bool {
        self.peers.borrow().contains(peer)
    }

    /// Check whether a peer was removed as unreachable
    pub fn is_departed(&self, peer: &PeerAddress) -> bool {
        self.departed_set().contains(peer)
    }

    /// Number of peers
    pub fn len(&self) -> usize {
        self.peers.borrow().len()
    }

    /// Check if there are no peers
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to membership changes.
    ///
    /// The stream yields the current set immediately, then a fresh snapshot
    /// after each change. Changes that happen faster than the subscriber
    /// polls are coalesced into the latest snapshot.
    pub fn subscribe(&self) -> PeerUpdates {
        PeerUpdates {
            inner: WatchStream::new(self.peers.subscribe()),
        }
    }

    fn departed_set(&self) -> std::sync::MutexGuard<'_, HashSet<PeerAddress>> {
        // A poisoned set is still a valid set
        self.departed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Infinite stream of peer-set snapshots
pub struct PeerUpdates {
    inner: WatchStream<PeerSet>,
}

impl Stream for PeerUpdates {
    type Item = PeerSet;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    fn addr(port: u16) -> PeerAddress {
        PeerAddress::new("127.0.0.1", port)
    }

    #[test]
    fn test_peer_address_parse() {
        let peer: PeerAddress = "node-2.example.com:7654".parse().unwrap();
        assert_eq!(peer, PeerAddress::new("node-2.example.com", 7654));
        assert_eq!(peer.to_string(), "node-2.example.com:7654");

        let v6: PeerAddress = "[::1]:9000".parse().unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.to_string(), "[::1]:9000");

        assert!("localhost".parse::<PeerAddress>().is_err());
        assert!("localhost:notaport".parse::<PeerAddress>().is_err());
        assert!(":80".parse::<PeerAddress>().is_err());
    }

    #[test]
    fn test_add_remove_idempotent() {
        let registry = PeerRegistry::new(addr(7000));

        assert!(registry.add(addr(7001)));
        assert!(!registry.add(addr(7001)));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(&addr(7001)));
        assert!(!registry.remove(&addr(7001)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_never_contains_self() {
        let registry = PeerRegistry::new(addr(7000));
        assert!(!registry.add(addr(7000)));
        assert!(registry.merge(vec![addr(7000), addr(7002)]) == vec![addr(7002)]);
        assert!(!registry.contains(&addr(7000)));
    }

    #[test]
    fn test_merge_does_not_resurrect_departed() {
        let registry = PeerRegistry::new(addr(7000));
        registry.add(addr(7001));
        registry.remove(&addr(7001));
        assert!(registry.is_departed(&addr(7001)));

        assert!(registry.merge(vec![addr(7001)]).is_empty());
        assert!(!registry.contains(&addr(7001)));

        // A fresh connect brings it back
        assert!(registry.add(addr(7001)));
        assert!(!registry.is_departed(&addr(7001)));
    }

    #[tokio::test]
    async fn test_subscribe_sees_current_then_changes() {
        let registry = PeerRegistry::new(addr(7000));
        registry.add(addr(7001));

        let mut updates = registry.subscribe();
        let first = updates.next().await.unwrap();
        assert_eq!(first, PeerSet::from([addr(7001)]));

        registry.add(addr(7002));
        let second = tokio::time::timeout(Duration::from_secs(1), updates.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, PeerSet::from([addr(7001), addr(7002)]));

        // No-op changes do not wake subscribers
        registry.add(addr(7002));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), updates.next())
                .await
                .is_err()
        );
    }
}
