//! In-Process Network
//!
//! Routes peer calls directly to registered services. Several nodes can
//! share one process, and links between them can be cut.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

use super::PeerClient;
use crate::error::{Error, Result};
use crate::oplog::{OperationEntry, Sequence};
use crate::replication::{PeerService, ReceiveOutcome};
use crate::state::{PeerAddress, PeerSet};

#[derive(Default)]
struct Routes {
    services: HashMap<PeerAddress, PeerService>,
    /// Directed links that drop every call
    cut: HashSet<(PeerAddress, PeerAddress)>,
}

/// Shared switchboard for in-process peers
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    routes: Arc<RwLock<Routes>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `service` reachable at `address`
    pub fn register(&self, address: PeerAddress, service: PeerService) {
        tracing::debug!("Memory network: registered {}", address);
        self.write().services.insert(address, service);
    }

    /// Make `address` unreachable, as if the node crashed
    pub fn unregister(&self, address: &PeerAddress) {
        self.write().services.remove(address);
    }

    /// Drop every call from `from` to `to`
    pub fn cut(&self, from: &PeerAddress, to: &PeerAddress) {
        self.write().cut.insert((from.clone(), to.clone()));
    }

    /// Client that issues calls on behalf of `from`
    pub fn client(&self, from: &PeerAddress) -> Arc<dyn PeerClient> {
        Arc::new(MemoryClient {
            from: from.clone(),
            network: self.clone(),
        })
    }

    fn resolve(&self, from: &PeerAddress, to: &PeerAddress) -> Result<PeerService> {
        let routes = self.read();
        if routes.cut.contains(&(from.clone(), to.clone())) {
            return Err(Error::ConnectionFailed {
                address: to.to_string(),
                reason: "link is cut".into(),
            });
        }
        routes
            .services
            .get(to)
            .cloned()
            .ok_or_else(|| Error::UnknownPeer(to.to_string()))
    }

    fn read(&self) -> RwLockReadGuard<'_, Routes> {
        self.routes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Routes> {
        self.routes.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// [`PeerClient`] over a [`MemoryNetwork`]
pub struct MemoryClient {
    from: PeerAddress,
    network: MemoryNetwork,
}

#[async_trait]
impl PeerClient for MemoryClient {
    async fn connect(&self, peer: &PeerAddress, from: &PeerAddress) -> Result<PeerSet> {
        self.network.resolve(&self.from, peer)?.connect(from.clone())
    }

    async fn heartbeat(&self, peer: &PeerAddress) -> Result<Sequence> {
        self.network.resolve(&self.from, peer)?.heartbeat()
    }

    async fn stream_log(
        &self,
        peer: &PeerAddress,
        from_sequence: Sequence,
    ) -> Result<BoxStream<'static, Result<OperationEntry>>> {
        self.network.resolve(&self.from, peer)?.stream_log(from_sequence)
    }

    async fn submit_operation(
        &self,
        peer: &PeerAddress,
        entry: OperationEntry,
    ) -> Result<ReceiveOutcome> {
        let service = self.network.resolve(&self.from, peer)?;
        service.submit_operation(entry).await
    }

    async fn stream_peer_updates(
        &self,
        peer: &PeerAddress,
    ) -> Result<BoxStream<'static, Result<PeerSet>>> {
        let updates = self.network.resolve(&self.from, peer)?.stream_peer_updates()?;
        Ok(updates.map(Ok).boxed())
    }
}
