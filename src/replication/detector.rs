//! Failure Detector
//!
//! One heartbeat task per peer. A peer that misses `failure_threshold`
//! consecutive probes is removed from the registry and its task ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::ReplicationConfig;
use crate::network::PeerClient;
use crate::oplog::OperationLog;
use crate::state::{PeerAddress, PeerRegistry};

/// A running heartbeat task
struct Watch {
    id: u64,
    token: CancellationToken,
}

struct DetectorInner {
    config: ReplicationConfig,
    client: Arc<dyn PeerClient>,
    registry: Arc<PeerRegistry>,
    log: Arc<OperationLog>,
    /// Peers whose watermark is ahead of ours
    resync: mpsc::Sender<PeerAddress>,
    watched: Mutex<HashMap<PeerAddress, Watch>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Supervises the heartbeat tasks of all peers
#[derive(Clone)]
pub struct FailureDetector {
    inner: Arc<DetectorInner>,
}

impl FailureDetector {
    /// Create a detector. Peers reporting a watermark above the local log's
    /// are sent to `resync`.
    pub fn new(
        config: ReplicationConfig,
        client: Arc<dyn PeerClient>,
        registry: Arc<PeerRegistry>,
        log: Arc<OperationLog>,
        resync: mpsc::Sender<PeerAddress>,
    ) -> Self {
        Self {
            inner: Arc::new(DetectorInner {
                config,
                client,
                registry,
                log,
                resync,
                watched: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Start monitoring `peer`. Does nothing if it is already monitored or
    /// the detector is shut down.
    pub fn watch(&self, peer: PeerAddress) {
        self.start(peer, false);
    }

    /// Start a fresh heartbeat task for `peer`, replacing any running one.
    ///
    /// Used when the peer has just contacted us: a task still counting
    /// failures from before can no longer remove it.
    pub fn rearm(&self, peer: PeerAddress) {
        self.start(peer, true);
    }

    fn start(&self, peer: PeerAddress, replace: bool) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        let mut watched = self.inner.watched();
        if let Some(existing) = watched.get(&peer) {
            if !replace {
                return;
            }
            existing.token.cancel();
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.inner.shutdown.child_token();
        watched.insert(
            peer.clone(),
            Watch {
                id,
                token: token.clone(),
            },
        );
        drop(watched);

        tracing::debug!("Starting heartbeat for {}", peer);
        let inner = self.inner.clone();
        self.inner.tasks.spawn(inner.monitor(peer, id, token));
    }

    /// Stop monitoring `peer` without touching the registry
    pub fn unwatch(&self, peer: &PeerAddress) {
        if let Some(watch) = self.inner.watched().remove(peer) {
            watch.token.cancel();
            tracing::debug!("Stopped heartbeat for {}", peer);
        }
    }

    /// Peers currently monitored
    pub fn watched(&self) -> Vec<PeerAddress> {
        let mut peers: Vec<_> = self.inner.watched().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Cancel every heartbeat task and wait for them to finish
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.watched().clear();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        tracing::debug!("Failure detector stopped");
    }
}

impl DetectorInner {
    fn watched(&self) -> MutexGuard<'_, HashMap<PeerAddress, Watch>> {
        self.watched.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn monitor(self: Arc<Self>, peer: PeerAddress, id: u64, token: CancellationToken) {
        // First probe after one interval, spread so peers added together are
        // not probed in lockstep
        let interval = self.config.heartbeat_interval;
        let jitter_ms = rand::thread_rng().gen_range(0..=interval.as_millis() as u64 / 4);
        let start = Instant::now() + interval + Duration::from_millis(jitter_ms);
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            // Failed probes are retried without waiting for the next tick
            loop {
                let probe = tokio::select! {
                    _ = token.cancelled() => return,
                    probe = timeout(self.config.heartbeat_timeout, self.client.heartbeat(&peer)) => probe,
                };

                match probe {
                    Ok(Ok(watermark)) => {
                        if failures > 0 {
                            tracing::info!("Peer {} answered again after {} failed probes", peer, failures);
                        }
                        failures = 0;
                        self.check_watermark(&peer, watermark);
                        break;
                    }
                    Ok(Err(e)) => {
                        failures += 1;
                        tracing::debug!("Heartbeat to {} failed ({}/{}): {}", peer, failures, self.config.failure_threshold, e);
                    }
                    Err(_) => {
                        failures += 1;
                        tracing::debug!("Heartbeat to {} timed out ({}/{})", peer, failures, self.config.failure_threshold);
                    }
                }

                if failures >= self.config.failure_threshold {
                    self.declare_unreachable(&peer, id);
                    return;
                }
            }
        }
    }

    fn check_watermark(&self, peer: &PeerAddress, watermark: u64) {
        let local = self.log.watermark();
        if watermark <= local {
            return;
        }

        tracing::debug!("Peer {} is ahead ({} > {}), requesting resync", peer, watermark, local);
        if self.resync.try_send(peer.clone()).is_err() {
            tracing::trace!("Resync queue full, skipping request for {}", peer);
        }
    }

    fn declare_unreachable(&self, peer: &PeerAddress, id: u64) {
        // A task that was replaced by rearm() must not remove the peer. The
        // check and the removal share the map lock with rearm().
        let mut watched = self.watched();
        if watched.get(peer).map(|w| w.id) != Some(id) {
            tracing::debug!("Stale heartbeat task for {} ended", peer);
            return;
        }
        watched.remove(peer);

        if self.registry.remove(peer) {
            tracing::warn!(
                "Peer {} unreachable after {} failed heartbeats, removed",
                peer,
                self.config.failure_threshold
            );
        }
    }
}
