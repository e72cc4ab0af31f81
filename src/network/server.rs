//! Network Server
//!
//! TCP server exposing a node's [`PeerService`] to other nodes.

use futures::StreamExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{read_message, write_message};
use crate::error::{Error, Result};
use crate::oplog::Sequence;
use crate::replication::{error_reply, ErrorCode, Message, PeerService};

/// Network server for peer communication
pub struct NetworkServer {
    /// Bound listener
    listener: TcpListener,
    /// Service handling requests
    service: PeerService,
    /// Shutdown signal
    shutdown: CancellationToken,
    /// Connection tasks
    connections: TaskTracker,
}

impl NetworkServer {
    /// Bind the listener
    pub async fn bind(bind_address: &str, service: PeerService) -> Result<Self> {
        let listener = TcpListener::bind(bind_address).await?;
        Self::from_listener(listener, service)
    }

    /// Serve on an already bound listener
    pub fn from_listener(listener: TcpListener, service: PeerService) -> Result<Self> {
        tracing::info!("Peer server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            service,
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Token that stops the server when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until shut down, then wait for open connections
    pub async fn run(self) -> Result<()> {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let remote = addr.to_string();
                            let service = self.service.clone();
                            let shutdown = self.shutdown.clone();

                            self.connections.spawn(async move {
                                if let Err(e) = handle_connection(socket, &remote, service, shutdown).await {
                                    tracing::warn!("Connection error from {}: {}", remote, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        self.connections.close();
        self.connections.wait().await;
        tracing::info!("Peer server stopped");
        Ok(())
    }
}

/// Serve requests on one connection until the peer hangs up
async fn handle_connection(
    socket: TcpStream,
    remote: &str,
    service: PeerService,
    shutdown: CancellationToken,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = read_message(&mut reader) => message,
        };

        match message {
            Ok(message) => {
                tracing::trace!("Received {} from {}", message.type_name(), remote);

                match message {
                    Message::StreamLog { from_sequence } => {
                        serve_log(&service, from_sequence, &mut writer, &shutdown).await?;
                    }
                    Message::StreamPeerUpdates => {
                        serve_peer_updates(&service, &mut writer, &shutdown).await?;
                    }
                    request => {
                        let response = service.handle(request).await;
                        write_message(&mut writer, &response).await?;
                    }
                }
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading message from {}: {}", remote, e);
                break;
            }
        }
    }

    Ok(())
}

async fn serve_log(
    service: &PeerService,
    from_sequence: Sequence,
    writer: &mut OwnedWriteHalf,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut entries = match service.stream_log(from_sequence) {
        Ok(entries) => entries,
        Err(e) => return write_message(writer, &error_reply(&e)).await,
    };

    let mut sent = 0u64;
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return Err(Error::ShuttingDown),
            next = entries.next() => next,
        };

        match next {
            Some(Ok(entry)) => {
                write_message(writer, &Message::LogEntry { entry }).await?;
                sent += 1;
            }
            Some(Err(e)) => {
                tracing::error!("Failed to read log for stream: {}", e);
                return write_message(
                    writer,
                    &Message::Error {
                        code: ErrorCode::Internal,
                        message: e.to_string(),
                    },
                )
                .await;
            }
            None => break,
        }
    }

    tracing::debug!("Streamed {} entries above {}", sent, from_sequence);
    write_message(writer, &Message::StreamEnd).await
}

async fn serve_peer_updates(
    service: &PeerService,
    writer: &mut OwnedWriteHalf,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut updates = match service.stream_peer_updates() {
        Ok(updates) => updates,
        Err(e) => return write_message(writer, &error_reply(&e)).await,
    };

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = updates.next() => next,
        };

        match next {
            Some(peers) => write_message(writer, &Message::PeerUpdate { peers }).await?,
            None => break,
        }
    }

    write_message(writer, &Message::StreamEnd).await
}
