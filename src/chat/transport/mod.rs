//! Transport layer for chat connections.
//!
//! A provider hands out our identity, dials peers, and reports everything
//! that happens on its channels as [`TransportEvent`]s on one queue. The
//! session consumes that queue; it never blocks on the network.

mod memory;
mod tcp;

pub use memory::{MemoryChannel, MemoryNetwork, MemoryProvider};
pub use tcp::{TcpChannel, TcpProvider};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::chat::error::ChatError;
use crate::chat::protocol::MessageFrame;

/// Largest frame accepted from the wire.
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Opaque identity assigned by the provider when it opens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    /// Wrap an identity string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identity string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process-unique channel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Something that happened on the provider or one of its channels.
#[derive(Debug)]
pub enum TransportEvent<C> {
    /// The provider is ready and assigned our identity.
    Open(PeerIdentity),
    /// A peer connected to us. The channel is open.
    Connection(C),
    /// An outbound channel finished opening.
    ChannelOpen(ChannelId),
    /// Raw frame bytes arrived on a channel.
    Data(ChannelId, Vec<u8>),
    /// A channel closed.
    ChannelClose(ChannelId),
    /// A channel failed.
    ChannelError(ChannelId, String),
    /// Provider-level failure.
    Error(String),
}

/// Queue the provider reports events on.
pub type EventSender<C> = mpsc::UnboundedSender<TransportEvent<C>>;

/// Receiving end of the event queue.
pub type EventReceiver<C> = mpsc::UnboundedReceiver<TransportEvent<C>>;

/// A reliable, ordered, bidirectional frame channel.
pub trait DataChannel: Send {
    /// Channel id, matching the ids in [`TransportEvent`]s.
    fn id(&self) -> ChannelId;

    /// Identity of the peer on the other end.
    fn remote(&self) -> &PeerIdentity;

    /// Queue a frame for sending. Never blocks.
    fn send(&self, frame: &MessageFrame) -> Result<(), ChatError>;

    /// Close the channel. Idempotent.
    fn close(&self);
}

/// Peer discovery and channel establishment.
#[async_trait]
pub trait PeerProvider: Send {
    /// Channel type this provider produces.
    type Channel: DataChannel + 'static;

    /// Start the provider. It reports `Open(identity)` on `events` once ready
    /// and keeps reporting inbound connections and channel activity there.
    async fn open(&mut self, events: EventSender<Self::Channel>) -> Result<(), ChatError>;

    /// Dial a peer. The channel reports `ChannelOpen` when usable.
    async fn connect(&mut self, remote: &PeerIdentity) -> Result<Self::Channel, ChatError>;

    /// Release every resource held by the provider. Idempotent.
    fn destroy(&mut self);
}

/// Helper to write a length-prefixed message asynchronously.
pub async fn write_length_prefixed<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), ChatError> {
    let len = u32::try_from(data.len())
        .map_err(|_| ChatError::Transport(format!("Frame too large: {} bytes", data.len())))?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Helper to read a length-prefixed message asynchronously.
pub async fn read_length_prefixed<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Vec<u8>, ChatError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_LEN {
        return Err(ChatError::Transport(format!(
            "Frame too large: {} bytes",
            len
        )));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_length_prefixed_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_length_prefixed(&mut a, b"hello").await.unwrap();
        write_length_prefixed(&mut a, b"").await.unwrap();

        assert_eq!(read_length_prefixed(&mut b).await.unwrap(), b"hello");
        assert!(read_length_prefixed(&mut b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_FRAME_LEN as u32 + 1).to_le_bytes();
        a.write_all(&len).await.unwrap();

        let result = read_length_prefixed(&mut b).await;
        assert!(matches!(result, Err(ChatError::Transport(_))));
    }

    #[test]
    fn test_channel_ids_unique() {
        let a = ChannelId::next();
        let b = ChannelId::next();
        assert_ne!(a, b);
    }
}
