//! Peer Service
//!
//! Inbound side of the peer protocol: what a node does when another node
//! connects, probes, streams or submits to it.

use std::sync::Arc;

use futures::stream::BoxStream;

use super::protocol::{ErrorCode, Message};
use super::{EngineState, ReceiveOutcome, ReplicationEngine};
use crate::error::{Error, Result};
use crate::oplog::{OperationEntry, Sequence};
use crate::state::{PeerAddress, PeerSet, PeerUpdates};

/// Service endpoint backed by a replication engine
#[derive(Clone)]
pub struct PeerService {
    engine: Arc<ReplicationEngine>,
}

impl PeerService {
    pub fn new(engine: Arc<ReplicationEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<ReplicationEngine> {
        &self.engine
    }

    fn ensure_running(&self) -> Result<()> {
        if self.engine.state() == EngineState::Stopped {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    /// A peer introduces itself; returns the peers known before it
    pub fn connect(&self, from: PeerAddress) -> Result<PeerSet> {
        self.ensure_running()?;
        Ok(self.engine.on_peer_joined(from))
    }

    /// Liveness probe; returns the local watermark
    pub fn heartbeat(&self) -> Result<Sequence> {
        self.ensure_running()?;
        Ok(self.engine.watermark())
    }

    /// Finite stream of local entries above `from_sequence`
    pub fn stream_log(&self, from_sequence: Sequence) -> Result<BoxStream<'static, Result<OperationEntry>>> {
        self.ensure_running()?;
        self.engine.stream_log(from_sequence)
    }

    /// Deliver a broadcast entry
    pub async fn submit_operation(&self, entry: OperationEntry) -> Result<ReceiveOutcome> {
        self.engine.receive(entry).await
    }

    /// Membership snapshots, current one first
    pub fn stream_peer_updates(&self) -> Result<PeerUpdates> {
        self.ensure_running()?;
        Ok(self.engine.subscribe_peers())
    }

    /// Answer a single request/response message.
    ///
    /// Streaming requests are served by the transport, which drives
    /// [`stream_log`](Self::stream_log) and
    /// [`stream_peer_updates`](Self::stream_peer_updates) itself.
    pub async fn handle(&self, message: Message) -> Message {
        let result = match message {
            Message::Connect { peer } => self.connect(peer).map(|peers| Message::ConnectAck { peers }),
            Message::Heartbeat => self
                .heartbeat()
                .map(|watermark| Message::HeartbeatAck { watermark }),
            Message::SubmitOperation { entry } => self
                .submit_operation(entry)
                .await
                .map(|outcome| Message::SubmitAck {
                    applied: outcome.is_applied(),
                }),
            other => {
                return Message::Error {
                    code: ErrorCode::UnexpectedMessage,
                    message: format!("{} is not a request", other.type_name()),
                }
            }
        };

        result.unwrap_or_else(|e| error_reply(&e))
    }
}

/// Wire form of a local error
pub(crate) fn error_reply(error: &Error) -> Message {
    let code = match error {
        Error::ShuttingDown | Error::Cancelled => ErrorCode::ShuttingDown,
        _ => ErrorCode::Internal,
    };
    Message::Error {
        code,
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogConfig;
    use crate::executor::MemoryStore;
    use crate::network::MemoryNetwork;
    use crate::oplog::entry::tests::post;
    use crate::oplog::OperationLog;
    use crate::replication::ReplicationConfig;
    use futures::StreamExt;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_handle_dispatch() {
        let dir = tempdir().unwrap();
        let network = MemoryNetwork::new();
        let local = PeerAddress::new("127.0.0.1", 7200);
        let log = OperationLog::open(
            dir.path(),
            LogConfig {
                fsync: false,
                compression: false,
            },
        )
        .unwrap();
        let engine = ReplicationEngine::new(
            local.clone(),
            ReplicationConfig::default(),
            Arc::new(log),
            Arc::new(MemoryStore::new()),
            network.client(&local),
        );
        engine.start(&[]).await.unwrap();
        let service = PeerService::new(engine.clone());

        let entry = OperationEntry::new(4, post(4, "via handle"));
        match service.handle(Message::SubmitOperation { entry: entry.clone() }).await {
            Message::SubmitAck { applied } => assert!(applied),
            other => panic!("unexpected {}", other.type_name()),
        }
        match service.handle(Message::SubmitOperation { entry }).await {
            Message::SubmitAck { applied } => assert!(!applied),
            other => panic!("unexpected {}", other.type_name()),
        }

        match service.handle(Message::Heartbeat).await {
            Message::HeartbeatAck { watermark } => assert_eq!(watermark, 4),
            other => panic!("unexpected {}", other.type_name()),
        }

        let joiner = PeerAddress::new("127.0.0.1", 7201);
        match service.handle(Message::Connect { peer: joiner.clone() }).await {
            Message::ConnectAck { peers } => assert!(peers.is_empty()),
            other => panic!("unexpected {}", other.type_name()),
        }
        assert!(engine.peers().contains(&joiner));

        let streamed: Vec<_> = service.stream_log(0).unwrap().collect().await;
        assert_eq!(streamed.len(), 1);

        assert!(matches!(
            service.handle(Message::StreamEnd).await,
            Message::Error {
                code: ErrorCode::UnexpectedMessage,
                ..
            }
        ));

        engine.stop().await;
        assert!(matches!(
            service.handle(Message::Heartbeat).await,
            Message::Error {
                code: ErrorCode::ShuttingDown,
                ..
            }
        ));
    }
}
