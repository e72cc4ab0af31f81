//! Replication Engine
//!
//! Owns one node's replication state: the operation log, the peer registry
//! and the failure detector. Local mutations are appended and pushed to
//! every peer; entries from peers are applied in sequence order; a joining
//! node replays a bootstrap peer's log before it goes active.

use std::sync::{Arc, Mutex, Weak};

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::detector::FailureDetector;
use super::{EngineState, ReceiveOutcome, ReplicationConfig};
use crate::error::{Error, Result};
use crate::executor::StateStore;
use crate::network::PeerClient;
use crate::oplog::{Operation, OperationEntry, OperationKind, OperationLog, Sequence};
use crate::state::{PeerAddress, PeerRegistry, PeerSet, PeerUpdates};

/// An entry that was recorded although the state store rejected it
#[derive(Debug, Clone)]
pub struct ApplyFailure {
    pub sequence: Sequence,
    pub kind: OperationKind,
    pub reason: String,
}

/// Replication engine for one node
pub struct ReplicationEngine {
    local: PeerAddress,
    config: ReplicationConfig,
    log: Arc<OperationLog>,
    store: Arc<dyn StateStore>,
    registry: Arc<PeerRegistry>,
    client: Arc<dyn PeerClient>,
    detector: FailureDetector,
    state: watch::Sender<EngineState>,
    apply_failures: broadcast::Sender<ApplyFailure>,
    /// Taken by the resync worker when the engine goes active
    resync_rx: Mutex<Option<mpsc::Receiver<PeerAddress>>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ReplicationEngine {
    /// Create an engine in the `Joining` state
    pub fn new(
        local: PeerAddress,
        config: ReplicationConfig,
        log: Arc<OperationLog>,
        store: Arc<dyn StateStore>,
        client: Arc<dyn PeerClient>,
    ) -> Arc<Self> {
        let registry = Arc::new(PeerRegistry::new(local.clone()));
        let (resync_tx, resync_rx) = mpsc::channel(config.resync_queue_size.max(1));
        let detector = FailureDetector::new(
            config.clone(),
            client.clone(),
            registry.clone(),
            log.clone(),
            resync_tx,
        );
        let (state, _) = watch::channel(EngineState::Joining);
        let (apply_failures, _) = broadcast::channel(config.apply_failure_capacity.max(1));

        Arc::new(Self {
            local,
            config,
            log,
            store,
            registry,
            client,
            detector,
            state,
            apply_failures,
            resync_rx: Mutex::new(Some(resync_rx)),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Start replicating.
    ///
    /// With no bootstrap peers the node starts a new network and is active
    /// immediately. Otherwise bootstrap peers are tried in order and the
    /// first one that streams its log is the catch-up source; if none can,
    /// this fails with [`Error::CatchUpFailed`] and the engine never becomes
    /// active.
    pub async fn start(self: &Arc<Self>, bootstrap: &[PeerAddress]) -> Result<()> {
        let current = self.state();
        if current != EngineState::Joining {
            return Err(Error::Internal(format!("Engine already started (state: {})", current)));
        }

        if bootstrap.is_empty() {
            tracing::info!("No bootstrap peers, {} starts a new network", self.local);
            return self.activate();
        }

        self.set_state(EngineState::CatchingUp);
        let source = self.initial_catch_up(bootstrap).await?;

        self.join_through(&source).await;

        // Entries appended on the source between the first pass and our
        // registration were neither streamed nor broadcast to us
        match self.catch_up(&source).await {
            Ok(applied) => tracing::debug!("Second catch-up pass from {} applied {} entries", source, applied),
            Err(e) => tracing::warn!("Second catch-up pass from {} failed: {}", source, e),
        }

        self.spawn_peer_update_follower(source);
        self.activate()
    }

    fn activate(self: &Arc<Self>) -> Result<()> {
        self.spawn_resync_worker();
        if !self.set_state(EngineState::Active) && self.state() == EngineState::Stopped {
            return Err(Error::ShuttingDown);
        }
        tracing::info!(
            "Replication active on {} (watermark {}, {} peers)",
            self.local,
            self.watermark(),
            self.registry.len()
        );
        Ok(())
    }

    async fn initial_catch_up(&self, bootstrap: &[PeerAddress]) -> Result<PeerAddress> {
        let mut failures = Vec::new();

        for peer in bootstrap {
            if self.shutdown.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match self.catch_up(peer).await {
                Ok(applied) => {
                    tracing::info!(
                        "Caught up from bootstrap {}: {} entries applied, watermark {}",
                        peer,
                        applied,
                        self.watermark()
                    );
                    return Ok(peer.clone());
                }
                Err(e) => {
                    tracing::warn!("Bootstrap peer {} unusable: {}", peer, e);
                    failures.push(format!("{}: {}", peer, e));
                }
            }
        }

        tracing::error!("Catch-up failed, none of {} bootstrap peers reachable", bootstrap.len());
        Err(Error::CatchUpFailed(failures.join("; ")))
    }

    /// Register with the catch-up source and everyone it knows
    async fn join_through(&self, source: &PeerAddress) {
        match self.client.connect(source, &self.local).await {
            Ok(snapshot) => {
                self.admit(source.clone());
                let learned = self.registry.merge(snapshot);
                for peer in &learned {
                    self.detector.watch(peer.clone());
                }
                self.introduce_all(learned).await;
            }
            Err(e) => {
                tracing::warn!("Could not register with bootstrap {}: {}", source, e);
            }
        }
    }

    /// Send Connect to each peer, following any peers their replies reveal
    async fn introduce_all(&self, mut pending: Vec<PeerAddress>) {
        while let Some(peer) = pending.pop() {
            if self.shutdown.is_cancelled() {
                return;
            }

            match self.client.connect(&peer, &self.local).await {
                Ok(snapshot) => {
                    let learned = self.registry.merge(snapshot);
                    for peer in &learned {
                        self.detector.watch(peer.clone());
                    }
                    pending.extend(learned);
                }
                // Left to the failure detector
                Err(e) => tracing::debug!("Could not introduce {} to {}: {}", self.local, peer, e),
            }
        }
    }

    /// Add a directly connected peer and start probing it afresh.
    ///
    /// The new heartbeat task is in place before the peer is added, so a
    /// task left over from an earlier failure cannot remove it again.
    fn admit(&self, peer: PeerAddress) {
        self.detector.rearm(peer.clone());
        self.registry.add(peer);
    }

    /// Handle an inbound Connect.
    ///
    /// Returns the peer set as it was before `peer` was added.
    pub fn on_peer_joined(&self, peer: PeerAddress) -> PeerSet {
        let mut snapshot = self.registry.snapshot();
        snapshot.remove(&peer);
        tracing::debug!("Peer {} connected, sharing {} known peers", peer, snapshot.len());
        self.admit(peer);
        snapshot
    }

    /// Append a local operation and push it to every current peer.
    ///
    /// Returns once the entry is durable locally. Delivery to peers runs in
    /// the background and failures there are only logged.
    pub async fn broadcast(&self, operation: Operation) -> Result<OperationEntry> {
        match self.state() {
            EngineState::Active => {}
            EngineState::Stopped => return Err(Error::ShuttingDown),
            other => return Err(Error::NotActive(other.to_string())),
        }

        let entry = self.log.append(operation).await?;
        let peers = self.registry.snapshot();
        tracing::debug!(
            "Broadcasting entry {} ({}) to {} peers",
            entry.sequence,
            entry.operation.kind(),
            peers.len()
        );

        for peer in peers {
            self.spawn_send(peer, entry.clone());
        }
        Ok(entry)
    }

    fn spawn_send(&self, peer: PeerAddress, entry: OperationEntry) {
        let client = self.client.clone();
        let token = self.shutdown.clone();

        self.tasks.spawn(async move {
            let sequence = entry.sequence;
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::trace!("Send of entry {} to {} cancelled", sequence, peer);
                }
                result = client.submit_operation(&peer, entry) => match result {
                    Ok(outcome) => tracing::trace!("Peer {} reported {:?} for entry {}", peer, outcome, sequence),
                    // Unreachable peers are the failure detector's concern
                    Err(e) if e.is_retryable() => tracing::debug!("Could not send entry {} to {}: {}", sequence, peer, e),
                    Err(e) => tracing::warn!("Failed to send entry {} to {}: {}", sequence, peer, e),
                },
            }
        });
    }

    /// Apply and record an entry from a peer if it is above the watermark.
    ///
    /// The sequence lock is held from the comparison until the entry is
    /// durable, so concurrent deliveries of the same entry apply it once.
    pub async fn receive(&self, entry: OperationEntry) -> Result<ReceiveOutcome> {
        if self.state() == EngineState::Stopped {
            return Err(Error::ShuttingDown);
        }

        let mut guard = self.log.lock().await;
        let watermark = guard.watermark();
        if entry.sequence <= watermark {
            tracing::trace!("Discarding entry {} at or below watermark {}", entry.sequence, watermark);
            return Ok(ReceiveOutcome::Duplicate);
        }

        if let Err(e) = self.store.apply(&entry.operation).await {
            self.report_apply_failure(&entry, e.to_string());
        }

        guard.append_at(entry.sequence, entry.operation)?;
        Ok(ReceiveOutcome::Applied)
    }

    /// Log and publish an entry the state store did not accept
    pub fn report_apply_failure(&self, entry: &OperationEntry, reason: String) {
        tracing::error!(
            "Failed to apply entry {} ({}): {}",
            entry.sequence,
            entry.operation.kind(),
            reason
        );
        // Nobody listening is fine
        let _ = self.apply_failures.send(ApplyFailure {
            sequence: entry.sequence,
            kind: entry.operation.kind(),
            reason,
        });
    }

    /// Replay `peer`'s log above the local watermark.
    ///
    /// Returns the number of entries applied.
    pub async fn catch_up(&self, peer: &PeerAddress) -> Result<u64> {
        let from = self.watermark();
        tracing::debug!("Catching up from {} above {}", peer, from);

        let mut stream = self.client.stream_log(peer, from).await?;
        let mut applied = 0;

        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(Error::Cancelled),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(entry)) => {
                    if self.receive(entry).await?.is_applied() {
                        applied += 1;
                    }
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }

        Ok(applied)
    }

    fn spawn_resync_worker(self: &Arc<Self>) {
        let rx = self.resync_rx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut rx) = rx else {
            return;
        };

        let engine = Arc::downgrade(self);
        let token = self.shutdown.clone();

        self.tasks.spawn(async move {
            loop {
                let peer = tokio::select! {
                    _ = token.cancelled() => break,
                    peer = rx.recv() => match peer {
                        Some(peer) => peer,
                        None => break,
                    },
                };

                let Some(engine) = engine.upgrade() else {
                    break;
                };
                if !engine.registry.contains(&peer) {
                    continue;
                }

                match engine.catch_up(&peer).await {
                    Ok(0) => {}
                    Ok(applied) => tracing::info!("Resynced {} entries from {}", applied, peer),
                    Err(Error::Cancelled) | Err(Error::ShuttingDown) => break,
                    Err(e) => tracing::warn!("Resync from {} failed: {}", peer, e),
                }
            }
            tracing::debug!("Resync worker stopped");
        });
    }

    fn spawn_peer_update_follower(self: &Arc<Self>, source: PeerAddress) {
        let engine: Weak<Self> = Arc::downgrade(self);
        let client = self.client.clone();
        let token = self.shutdown.clone();

        self.tasks.spawn(async move {
            let mut updates = tokio::select! {
                _ = token.cancelled() => return,
                updates = client.stream_peer_updates(&source) => match updates {
                    Ok(updates) => updates,
                    Err(e) => {
                        tracing::warn!("Could not follow peer updates from {}: {}", source, e);
                        return;
                    }
                },
            };

            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => break,
                    next = updates.next() => next,
                };

                let peers = match next {
                    Some(Ok(peers)) => peers,
                    Some(Err(e)) => {
                        tracing::warn!("Peer update stream from {} failed: {}", source, e);
                        break;
                    }
                    None => break,
                };

                let Some(engine) = engine.upgrade() else {
                    break;
                };
                let learned = engine.registry.merge(peers);
                for peer in &learned {
                    engine.detector.watch(peer.clone());
                }
                engine.introduce_all(learned).await;
            }
            tracing::debug!("Stopped following peer updates from {}", source);
        });
    }

    /// Stop all background work and wait for it to finish
    pub async fn stop(&self) {
        let previous = self.state.send_replace(EngineState::Stopped);
        if previous == EngineState::Stopped {
            return;
        }

        tracing::info!("Stopping replication engine on {}", self.local);
        self.shutdown.cancel();
        self.detector.shutdown().await;
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!("Replication engine on {} stopped", self.local);
    }

    fn set_state(&self, next: EngineState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == EngineState::Stopped || *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            tracing::debug!("Engine on {} is now {}", self.local, next);
        }
        changed
    }

    /// Current lifecycle state
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Receiver that observes lifecycle changes
    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// Highest sequence in the local log
    pub fn watermark(&self) -> Sequence {
        self.log.watermark()
    }

    /// Current peer set
    pub fn peers(&self) -> PeerSet {
        self.registry.snapshot()
    }

    /// Stream of peer-set snapshots
    pub fn subscribe_peers(&self) -> PeerUpdates {
        self.registry.subscribe()
    }

    /// Entries the state store rejected
    pub fn subscribe_apply_failures(&self) -> broadcast::Receiver<ApplyFailure> {
        self.apply_failures.subscribe()
    }

    /// Local log entries above `from_sequence`
    pub fn stream_log(&self, from_sequence: Sequence) -> Result<BoxStream<'static, Result<OperationEntry>>> {
        self.log.stream_from(from_sequence)
    }

    pub fn local_address(&self) -> &PeerAddress {
        &self.local
    }

    pub fn log(&self) -> &Arc<OperationLog> {
        &self.log
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn detector(&self) -> &FailureDetector {
        &self.detector
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogConfig;
    use crate::executor::MemoryStore;
    use crate::network::MemoryNetwork;
    use crate::oplog::entry::tests::post;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct Node {
        engine: Arc<ReplicationEngine>,
        store: Arc<MemoryStore>,
        _dir: TempDir,
    }

    fn node(network: &MemoryNetwork, port: u16, store: MemoryStore) -> Node {
        let dir = tempdir().unwrap();
        let address = PeerAddress::new("127.0.0.1", port);
        let log = OperationLog::open(
            dir.path(),
            LogConfig {
                fsync: false,
                compression: false,
            },
        )
        .unwrap();
        let store = Arc::new(store);
        let config = ReplicationConfig {
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_millis(50),
            ..ReplicationConfig::default()
        };
        let engine = ReplicationEngine::new(
            address,
            config,
            Arc::new(log),
            store.clone(),
            network.client(&PeerAddress::new("127.0.0.1", port)),
        );
        Node {
            engine,
            store,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_receive_applies_once() {
        let network = MemoryNetwork::new();
        let n = node(&network, 7100, MemoryStore::new());
        n.engine.start(&[]).await.unwrap();

        let entry = OperationEntry::new(1, post(1, "once"));
        assert_eq!(n.engine.receive(entry.clone()).await.unwrap(), ReceiveOutcome::Applied);
        assert_eq!(n.engine.receive(entry).await.unwrap(), ReceiveOutcome::Duplicate);

        assert_eq!(n.store.applied().await, 1);
        assert_eq!(n.engine.log().len(), 1);
        assert_eq!(n.engine.watermark(), 1);
        n.engine.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_receive_of_same_entry() {
        let network = MemoryNetwork::new();
        let n = node(&network, 7101, MemoryStore::new());
        n.engine.start(&[]).await.unwrap();

        let entry = OperationEntry::new(5, post(5, "race"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = n.engine.clone();
                let entry = entry.clone();
                tokio::spawn(async move { engine.receive(entry).await.unwrap() })
            })
            .collect();

        let mut applied = 0;
        for handle in handles {
            if handle.await.unwrap().is_applied() {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
        assert_eq!(n.store.applied().await, 1);
        n.engine.stop().await;
    }

    #[tokio::test]
    async fn test_apply_failure_is_published_and_recorded() {
        let network = MemoryNetwork::new();
        let n = node(&network, 7102, MemoryStore::rejecting(OperationKind::PostCreated));
        n.engine.start(&[]).await.unwrap();
        let mut failures = n.engine.subscribe_apply_failures();

        let outcome = n.engine.receive(OperationEntry::new(1, post(1, "bad"))).await.unwrap();
        assert_eq!(outcome, ReceiveOutcome::Applied);
        assert_eq!(n.engine.watermark(), 1);

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.sequence, 1);
        assert_eq!(failure.kind, OperationKind::PostCreated);
        n.engine.stop().await;
    }

    #[tokio::test]
    async fn test_log_write_failure_propagates() {
        let network = MemoryNetwork::new();
        let n = node(&network, 7108, MemoryStore::new());
        n.engine.start(&[]).await.unwrap();
        n.engine.broadcast(post(1, "kept")).await.unwrap();

        n.engine.log().fail_next_write(3).await;
        assert!(matches!(n.engine.broadcast(post(2, "lost")).await, Err(Error::Io(_))));
        assert_eq!(n.engine.watermark(), 1);
        assert_eq!(n.engine.log().len(), 1);

        n.engine.log().fail_next_write(0).await;
        let entry = OperationEntry::new(2, post(2, "remote"));
        assert!(matches!(n.engine.receive(entry.clone()).await, Err(Error::Io(_))));
        assert_eq!(n.engine.watermark(), 1);
        assert_eq!(n.engine.log().len(), 1);

        // Not recorded, so a redelivery is not a duplicate
        assert_eq!(n.engine.receive(entry).await.unwrap(), ReceiveOutcome::Applied);
        assert_eq!(n.engine.watermark(), 2);
        n.engine.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_requires_active() {
        let network = MemoryNetwork::new();
        let n = node(&network, 7103, MemoryStore::new());

        assert!(matches!(
            n.engine.broadcast(post(1, "early")).await,
            Err(Error::NotActive(_))
        ));

        n.engine.start(&[]).await.unwrap();
        let entry = n.engine.broadcast(post(1, "ok")).await.unwrap();
        assert_eq!(entry.sequence, 1);

        n.engine.stop().await;
        assert!(matches!(
            n.engine.broadcast(post(2, "late")).await,
            Err(Error::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_on_peer_joined_excludes_joiner() {
        let network = MemoryNetwork::new();
        let n = node(&network, 7104, MemoryStore::new());
        n.engine.start(&[]).await.unwrap();

        let first = PeerAddress::new("127.0.0.1", 7105);
        let second = PeerAddress::new("127.0.0.1", 7106);

        assert!(n.engine.on_peer_joined(first.clone()).is_empty());
        let snapshot = n.engine.on_peer_joined(second.clone());
        assert_eq!(snapshot, PeerSet::from([first.clone()]));
        assert_eq!(n.engine.peers(), PeerSet::from([first, second]));
        assert_eq!(n.engine.detector().watched().len(), 2);

        n.engine.stop().await;
        assert!(n.engine.detector().watched().is_empty());
    }

    #[tokio::test]
    async fn test_start_twice_and_stop_idempotent() {
        let network = MemoryNetwork::new();
        let n = node(&network, 7107, MemoryStore::new());
        let mut states = n.engine.watch_state();

        n.engine.start(&[]).await.unwrap();
        assert_eq!(*states.borrow_and_update(), EngineState::Active);
        assert!(n.engine.start(&[]).await.is_err());

        n.engine.stop().await;
        n.engine.stop().await;
        assert_eq!(n.engine.state(), EngineState::Stopped);
    }
}
