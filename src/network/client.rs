//! Network Client
//!
//! TCP client for calling other nodes. Every call opens its own connection;
//! streaming calls keep it until the stream ends or is dropped.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{expect_reply, read_message, unexpected, write_message, PeerClient};
use crate::error::{Error, Result};
use crate::oplog::{OperationEntry, Sequence};
use crate::replication::{Message, ReceiveOutcome};
use crate::state::{PeerAddress, PeerSet};

/// Network client for connecting to peer nodes
#[derive(Debug, Clone)]
pub struct NetworkClient {
    /// Connection timeout
    connect_timeout: Duration,
    /// Request timeout, also the longest wait between streamed log entries
    request_timeout: Duration,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }

    /// Send a message to a peer and wait for response
    pub async fn send(&self, peer: &PeerAddress, message: Message) -> Result<Message> {
        let result = timeout(self.request_timeout, self.send_inner(peer, message)).await;

        match result {
            Ok(inner_result) => expect_reply(peer, inner_result?),
            Err(_) => Err(Error::ConnectionTimeout(peer.to_string())),
        }
    }

    /// Send without timeout wrapper
    async fn send_inner(&self, peer: &PeerAddress, message: Message) -> Result<Message> {
        let stream = self.connect_to(peer).await?;
        let (mut reader, mut writer) = stream.into_split();

        write_message(&mut writer, &message).await?;
        read_message(&mut reader).await
    }

    /// Open a connection and send the request that starts a stream
    async fn open_stream(
        &self,
        peer: &PeerAddress,
        request: Message,
    ) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
        let stream = self.connect_to(peer).await?;
        let (reader, mut writer) = stream.into_split();
        timeout(self.request_timeout, write_message(&mut writer, &request))
            .await
            .map_err(|_| Error::ConnectionTimeout(peer.to_string()))??;
        Ok((reader, writer))
    }

    /// Connect to an address
    async fn connect_to(&self, peer: &PeerAddress) -> Result<TcpStream> {
        let address = peer.to_string();
        let result = timeout(self.connect_timeout, TcpStream::connect(&address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address,
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address)),
        }
    }
}

#[async_trait]
impl PeerClient for NetworkClient {
    async fn connect(&self, peer: &PeerAddress, from: &PeerAddress) -> Result<PeerSet> {
        match self.send(peer, Message::Connect { peer: from.clone() }).await? {
            Message::ConnectAck { peers } => Ok(peers),
            other => Err(unexpected(peer, "ConnectAck", &other)),
        }
    }

    async fn heartbeat(&self, peer: &PeerAddress) -> Result<Sequence> {
        match self.send(peer, Message::Heartbeat).await? {
            Message::HeartbeatAck { watermark } => Ok(watermark),
            other => Err(unexpected(peer, "HeartbeatAck", &other)),
        }
    }

    async fn stream_log(
        &self,
        peer: &PeerAddress,
        from_sequence: Sequence,
    ) -> Result<BoxStream<'static, Result<OperationEntry>>> {
        let connection = self
            .open_stream(peer, Message::StreamLog { from_sequence })
            .await?;
        let request_timeout = self.request_timeout;
        let peer = peer.clone();

        let entries = futures::stream::unfold(Some(connection), move |state| {
            let peer = peer.clone();
            async move {
                let (mut reader, writer) = state?;
                let next = match timeout(request_timeout, read_message(&mut reader)).await {
                    Err(_) => Err(Error::ConnectionTimeout(peer.to_string())),
                    Ok(Err(e)) => Err(e),
                    Ok(Ok(message)) => expect_reply(&peer, message),
                };

                match next {
                    Ok(Message::LogEntry { entry }) => Some((Ok(entry), Some((reader, writer)))),
                    Ok(Message::StreamEnd) => None,
                    Ok(other) => Some((Err(unexpected(&peer, "LogEntry", &other)), None)),
                    Err(e) => Some((Err(e), None)),
                }
            }
        });

        Ok(entries.boxed())
    }

    async fn submit_operation(
        &self,
        peer: &PeerAddress,
        entry: OperationEntry,
    ) -> Result<ReceiveOutcome> {
        match self.send(peer, Message::SubmitOperation { entry }).await? {
            Message::SubmitAck { applied: true } => Ok(ReceiveOutcome::Applied),
            Message::SubmitAck { applied: false } => Ok(ReceiveOutcome::Duplicate),
            other => Err(unexpected(peer, "SubmitAck", &other)),
        }
    }

    async fn stream_peer_updates(
        &self,
        peer: &PeerAddress,
    ) -> Result<BoxStream<'static, Result<PeerSet>>> {
        let connection = self.open_stream(peer, Message::StreamPeerUpdates).await?;
        let peer = peer.clone();

        // Membership can stay quiet for a long time, so reads are not bounded
        let updates = futures::stream::unfold(Some(connection), move |state| {
            let peer = peer.clone();
            async move {
                let (mut reader, writer) = state?;
                match read_message(&mut reader).await.and_then(|m| expect_reply(&peer, m)) {
                    Ok(Message::PeerUpdate { peers }) => Some((Ok(peers), Some((reader, writer)))),
                    Ok(Message::StreamEnd) => None,
                    Ok(other) => Some((Err(unexpected(&peer, "PeerUpdate", &other)), None)),
                    Err(e) => Some((Err(e), None)),
                }
            }
        });

        Ok(updates.boxed())
    }
}
