//! Network Module
//!
//! Transport between peers. The replication core talks to other nodes only
//! through [`PeerClient`]; TCP and in-process implementations live here.

mod client;
mod memory;
mod server;

pub use client::NetworkClient;
pub use memory::{MemoryClient, MemoryNetwork};
pub use server::NetworkServer;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::{Error, Result};
use crate::oplog::{OperationEntry, Sequence, OPERATION_FORMAT_VERSION};
use crate::replication::{FrameHeader, Message, ReceiveOutcome};
use crate::state::{PeerAddress, PeerSet};

/// Outbound calls to a remote peer's service endpoint
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Introduce `from` to `peer`; returns the peers it knew before
    async fn connect(&self, peer: &PeerAddress, from: &PeerAddress) -> Result<PeerSet>;

    /// Probe `peer`; returns its watermark
    async fn heartbeat(&self, peer: &PeerAddress) -> Result<Sequence>;

    /// Stream `peer`'s log entries above `from_sequence`
    async fn stream_log(
        &self,
        peer: &PeerAddress,
        from_sequence: Sequence,
    ) -> Result<BoxStream<'static, Result<OperationEntry>>>;

    /// Deliver one broadcast entry
    async fn submit_operation(
        &self,
        peer: &PeerAddress,
        entry: OperationEntry,
    ) -> Result<ReceiveOutcome>;

    /// Subscribe to `peer`'s membership snapshots
    async fn stream_peer_updates(
        &self,
        peer: &PeerAddress,
    ) -> Result<BoxStream<'static, Result<PeerSet>>>;
}

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.version != OPERATION_FORMAT_VERSION {
        return Err(Error::Protocol(format!(
            "Unsupported frame version {} (expected {})",
            header.version, OPERATION_FORMAT_VERSION
        )));
    }
    if header.length > FrameHeader::MAX_LENGTH {
        return Err(Error::Protocol(format!("Frame of {} bytes exceeds limit", header.length)));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    // Deserialize
    let message = Message::deserialize(&body)?;
    Ok(message)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

/// Turn an `Error` reply into a protocol error, pass anything else through
pub(crate) fn expect_reply(peer: &PeerAddress, message: Message) -> Result<Message> {
    match message {
        Message::Error { code, message } => Err(Error::Protocol(format!(
            "{} replied {:?}: {}",
            peer, code, message
        ))),
        other => Ok(other),
    }
}

/// Error for a reply that does not match the request
pub(crate) fn unexpected(peer: &PeerAddress, expected: &str, got: &Message) -> Error {
    Error::Protocol(format!(
        "Expected {} from {}, got {}",
        expected,
        peer,
        got.type_name()
    ))
}
