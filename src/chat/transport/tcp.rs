//! TCP transport for chat connections.
//!
//! This provides a TCP-based provider using tokio for async I/O. The provider
//! identity is the listener's bound address, and dialing a peer means
//! connecting to its address. Frames are length-prefixed JSON.
//!
//! Each channel runs a reader task that turns incoming frames into events and
//! a writer task fed by an unbounded queue, so `send` never blocks.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

use crate::chat::error::ChatError;
use crate::chat::protocol::MessageFrame;
use crate::chat::transport::{
    read_length_prefixed, write_length_prefixed, ChannelId, DataChannel, EventSender,
    PeerIdentity, PeerProvider, TransportEvent,
};

enum Outbound {
    Frame(Vec<u8>),
    Close,
}

struct ChannelShared {
    id: ChannelId,
    closed: AtomicBool,
    outbound: mpsc::UnboundedSender<Outbound>,
    events: EventSender<TcpChannel>,
    reader: Mutex<Option<AbortHandle>>,
}

/// TCP channel handle. Clones refer to the same connection.
#[derive(Clone)]
pub struct TcpChannel {
    shared: Arc<ChannelShared>,
    remote: PeerIdentity,
}

impl std::fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpChannel")
            .field("id", &self.shared.id)
            .field("remote", &self.remote)
            .finish()
    }
}

impl TcpChannel {
    /// Wrap a connected stream, spawning its reader and writer tasks.
    fn spawn(stream: TcpStream, events: EventSender<TcpChannel>) -> Self {
        let id = ChannelId::next();
        let remote = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(ChannelShared {
            id,
            closed: AtomicBool::new(false),
            outbound,
            events: events.clone(),
            reader: Mutex::new(None),
        });

        let writer_events = events.clone();
        tokio::spawn(async move {
            let mut writer = BufWriter::new(write_half);
            while let Some(item) = outbound_rx.recv().await {
                match item {
                    Outbound::Frame(bytes) => {
                        if let Err(e) = write_length_prefixed(&mut writer, &bytes).await {
                            let _ = writer_events.send(TransportEvent::ChannelError(id, e.to_string()));
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = writer.shutdown().await;
                        break;
                    }
                }
            }
        });

        let reader_shared = Arc::downgrade(&shared);
        let reader = tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            loop {
                match read_length_prefixed(&mut reader).await {
                    Ok(bytes) => {
                        if events.send(TransportEvent::Data(id, bytes)).is_err() {
                            break;
                        }
                    }
                    Err(ChatError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                        debug!(channel = %id, "peer closed connection");
                        break;
                    }
                    Err(e) => {
                        let _ = events.send(TransportEvent::ChannelError(id, e.to_string()));
                        break;
                    }
                }
            }
            // Remote side went away; report the close once.
            if let Some(shared) = reader_shared.upgrade() {
                if !shared.closed.swap(true, Ordering::SeqCst) {
                    let _ = shared.outbound.send(Outbound::Close);
                    let _ = events.send(TransportEvent::ChannelClose(id));
                }
            } else {
                let _ = events.send(TransportEvent::ChannelClose(id));
            }
        });

        *shared.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(reader.abort_handle());

        Self {
            shared,
            remote: PeerIdentity::new(remote),
        }
    }

    /// Whether the channel has been closed by either side.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl DataChannel for TcpChannel {
    fn id(&self) -> ChannelId {
        self.shared.id
    }

    fn remote(&self) -> &PeerIdentity {
        &self.remote
    }

    fn send(&self, frame: &MessageFrame) -> Result<(), ChatError> {
        if self.is_closed() {
            return Err(ChatError::ChannelClosed);
        }
        let bytes = frame.to_bytes()?;
        self.shared
            .outbound
            .send(Outbound::Frame(bytes))
            .map_err(|_| ChatError::ChannelClosed)
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shared.outbound.send(Outbound::Close);
        if let Some(reader) = self
            .shared
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reader.abort();
        }
        let _ = self
            .shared
            .events
            .send(TransportEvent::ChannelClose(self.shared.id));
    }
}

/// TCP peer provider.
pub struct TcpProvider {
    bind_addr: String,
    identity: Option<PeerIdentity>,
    events: Option<EventSender<TcpChannel>>,
    accept_task: Option<JoinHandle<()>>,
    channels: Arc<Mutex<Vec<TcpChannel>>>,
}

impl TcpProvider {
    /// Create a provider that will listen on `bind_addr`.
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            identity: None,
            events: None,
            accept_task: None,
            channels: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The bound address, once open.
    pub fn identity(&self) -> Option<&PeerIdentity> {
        self.identity.as_ref()
    }

    fn track(channels: &Mutex<Vec<TcpChannel>>, channel: &TcpChannel) {
        let mut list = channels.lock().unwrap_or_else(PoisonError::into_inner);
        list.retain(|c| !c.is_closed());
        list.push(channel.clone());
    }
}

#[async_trait]
impl PeerProvider for TcpProvider {
    type Channel = TcpChannel;

    async fn open(&mut self, events: EventSender<TcpChannel>) -> Result<(), ChatError> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| ChatError::Transport(format!("Failed to bind: {}", e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ChatError::Transport(format!("Failed to get local addr: {}", e)))?;

        let identity = PeerIdentity::new(local_addr.to_string());
        debug!(id = %identity, "tcp provider listening");

        let accept_events = events.clone();
        let channels = self.channels.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!(%addr, "accepted tcp connection");
                        let channel = TcpChannel::spawn(stream, accept_events.clone());
                        TcpProvider::track(&channels, &channel);
                        if accept_events.send(TransportEvent::Connection(channel)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "tcp accept failed");
                        if accept_events
                            .send(TransportEvent::Error(format!("Failed to accept: {}", e)))
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });

        let _ = events.send(TransportEvent::Open(identity.clone()));
        self.identity = Some(identity);
        self.events = Some(events);
        self.accept_task = Some(task);
        Ok(())
    }

    async fn connect(&mut self, remote: &PeerIdentity) -> Result<TcpChannel, ChatError> {
        let events = self
            .events
            .clone()
            .ok_or_else(|| ChatError::Transport("provider is not open".to_string()))?;

        let stream = TcpStream::connect(remote.as_str())
            .await
            .map_err(|e| ChatError::Transport(format!("Failed to connect: {}", e)))?;

        let channel = TcpChannel::spawn(stream, events.clone());
        Self::track(&self.channels, &channel);
        let _ = events.send(TransportEvent::ChannelOpen(channel.id()));
        Ok(channel)
    }

    fn destroy(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }

        let channels: Vec<TcpChannel> = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for channel in channels {
            channel.close();
        }

        if self.events.take().is_some() {
            debug!("tcp provider destroyed");
        }
    }
}

impl Drop for TcpProvider {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_provider() -> (TcpProvider, mpsc::UnboundedReceiver<TransportEvent<TcpChannel>>, PeerIdentity) {
        let mut provider = TcpProvider::new("127.0.0.1:0");
        let (tx, mut rx) = mpsc::unbounded_channel();
        provider.open(tx).await.unwrap();
        let id = match rx.recv().await {
            Some(TransportEvent::Open(id)) => id,
            other => panic!("expected open, got {:?}", other),
        };
        (provider, rx, id)
    }

    #[tokio::test]
    async fn test_tcp_connect_and_exchange() {
        let (_server, mut server_rx, server_id) = open_provider().await;
        let (mut client, mut client_rx, _) = open_provider().await;

        let client_end = client.connect(&server_id).await.unwrap();
        assert!(matches!(client_rx.recv().await, Some(TransportEvent::ChannelOpen(id)) if id == client_end.id()));

        let server_end = match server_rx.recv().await {
            Some(TransportEvent::Connection(ch)) => ch,
            other => panic!("expected connection, got {:?}", other),
        };

        client_end.send(&MessageFrame::UserInfo { name: "bob".into() }).unwrap();
        match server_rx.recv().await {
            Some(TransportEvent::Data(id, bytes)) => {
                assert_eq!(id, server_end.id());
                assert_eq!(
                    MessageFrame::from_bytes(&bytes).unwrap(),
                    MessageFrame::UserInfo { name: "bob".into() }
                );
            }
            other => panic!("expected data, got {:?}", other),
        }

        server_end.send(&MessageFrame::StopTyping).unwrap();
        match client_rx.recv().await {
            Some(TransportEvent::Data(_, bytes)) => {
                assert_eq!(MessageFrame::from_bytes(&bytes).unwrap(), MessageFrame::StopTyping);
            }
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tcp_remote_close_reported() {
        let (_server, mut server_rx, server_id) = open_provider().await;
        let (mut client, mut client_rx, _) = open_provider().await;

        let client_end = client.connect(&server_id).await.unwrap();
        client_rx.recv().await.unwrap();
        let server_end = match server_rx.recv().await {
            Some(TransportEvent::Connection(ch)) => ch,
            other => panic!("expected connection, got {:?}", other),
        };

        server_end.close();
        loop {
            match client_rx.recv().await {
                Some(TransportEvent::ChannelClose(id)) => {
                    assert_eq!(id, client_end.id());
                    break;
                }
                Some(_) => continue,
                None => panic!("event queue closed"),
            }
        }
        assert!(client_end.is_closed());
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        let (mut client, _rx, _) = open_provider().await;

        // Bind then drop to get an address nobody listens on.
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };

        let result = client.connect(&PeerIdentity::new(addr.to_string())).await;
        assert!(matches!(result, Err(ChatError::Transport(_))));
    }
}
