//! In-process transport.
//!
//! A [`MemoryNetwork`] is a registry of open providers keyed by identity.
//! Channels are pairs of ends that post straight into each other's event
//! queues, so two sessions in one process can talk without sockets. Used for
//! tests and for running a session in isolation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::chat::error::ChatError;
use crate::chat::protocol::MessageFrame;
use crate::chat::transport::{
    ChannelId, DataChannel, EventSender, PeerIdentity, PeerProvider, TransportEvent,
};

struct Endpoint {
    events: EventSender<MemoryChannel>,
    channels: Arc<Mutex<Vec<MemoryChannel>>>,
}

/// Shared registry of in-process peers.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    peers: Arc<Mutex<HashMap<PeerIdentity, Endpoint>>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider that will register as `id` when opened.
    pub fn provider(&self, id: impl Into<String>) -> MemoryProvider {
        MemoryProvider {
            network: self.clone(),
            identity: PeerIdentity::new(id),
            events: None,
            channels: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Whether a peer with this identity is currently open.
    pub fn is_registered(&self, id: &str) -> bool {
        self.lock().contains_key(&PeerIdentity::new(id))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerIdentity, Endpoint>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One end of an in-process channel.
#[derive(Clone)]
pub struct MemoryChannel {
    id: ChannelId,
    peer_id: ChannelId,
    remote: PeerIdentity,
    local_events: EventSender<MemoryChannel>,
    peer_events: EventSender<MemoryChannel>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .finish()
    }
}

impl MemoryChannel {
    /// Whether either end closed the channel.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl DataChannel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn remote(&self) -> &PeerIdentity {
        &self.remote
    }

    fn send(&self, frame: &MessageFrame) -> Result<(), ChatError> {
        if self.is_closed() {
            return Err(ChatError::ChannelClosed);
        }
        let bytes = frame.to_bytes()?;
        self.peer_events
            .send(TransportEvent::Data(self.peer_id, bytes))
            .map_err(|_| ChatError::Transport(format!("peer {} is gone", self.remote)))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.local_events.send(TransportEvent::ChannelClose(self.id));
        let _ = self.peer_events.send(TransportEvent::ChannelClose(self.peer_id));
    }
}

/// Provider backed by a [`MemoryNetwork`].
pub struct MemoryProvider {
    network: MemoryNetwork,
    identity: PeerIdentity,
    events: Option<EventSender<MemoryChannel>>,
    channels: Arc<Mutex<Vec<MemoryChannel>>>,
}

impl MemoryProvider {
    /// Identity this provider registers under.
    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    fn track(channels: &Arc<Mutex<Vec<MemoryChannel>>>, channel: MemoryChannel) {
        let mut list = channels.lock().unwrap_or_else(PoisonError::into_inner);
        list.retain(|c| !c.is_closed());
        list.push(channel);
    }
}

#[async_trait]
impl PeerProvider for MemoryProvider {
    type Channel = MemoryChannel;

    async fn open(&mut self, events: EventSender<MemoryChannel>) -> Result<(), ChatError> {
        {
            let mut peers = self.network.lock();
            if peers.contains_key(&self.identity) {
                return Err(ChatError::Transport(format!(
                    "ID \"{}\" is taken",
                    self.identity
                )));
            }
            peers.insert(
                self.identity.clone(),
                Endpoint {
                    events: events.clone(),
                    channels: self.channels.clone(),
                },
            );
        }

        debug!(id = %self.identity, "memory provider open");
        let _ = events.send(TransportEvent::Open(self.identity.clone()));
        self.events = Some(events);
        Ok(())
    }

    async fn connect(&mut self, remote: &PeerIdentity) -> Result<MemoryChannel, ChatError> {
        let own_events = self
            .events
            .clone()
            .ok_or_else(|| ChatError::Transport("provider is not open".to_string()))?;

        let (peer_events, peer_channels) = {
            let peers = self.network.lock();
            let endpoint = peers.get(remote).ok_or_else(|| {
                ChatError::Transport(format!("Could not connect to peer {}", remote))
            })?;
            (endpoint.events.clone(), endpoint.channels.clone())
        };

        let local_id = ChannelId::next();
        let remote_id = ChannelId::next();
        let closed = Arc::new(AtomicBool::new(false));

        let local_end = MemoryChannel {
            id: local_id,
            peer_id: remote_id,
            remote: remote.clone(),
            local_events: own_events.clone(),
            peer_events: peer_events.clone(),
            closed: closed.clone(),
        };
        let remote_end = MemoryChannel {
            id: remote_id,
            peer_id: local_id,
            remote: self.identity.clone(),
            local_events: peer_events.clone(),
            peer_events: own_events.clone(),
            closed,
        };

        Self::track(&self.channels, local_end.clone());
        Self::track(&peer_channels, remote_end.clone());

        peer_events
            .send(TransportEvent::Connection(remote_end))
            .map_err(|_| ChatError::Transport(format!("Could not connect to peer {}", remote)))?;
        let _ = own_events.send(TransportEvent::ChannelOpen(local_id));

        debug!(from = %self.identity, to = %remote, channel = %local_id, "memory channel opened");
        Ok(local_end)
    }

    fn destroy(&mut self) {
        self.network.lock().remove(&self.identity);

        let channels: Vec<MemoryChannel> = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for channel in channels {
            channel.close();
        }

        if self.events.take().is_some() {
            debug!(id = %self.identity, "memory provider destroyed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_open_registers_and_reports_identity() {
        let network = MemoryNetwork::new();
        let mut provider = network.provider("A1");
        let (tx, mut rx) = mpsc::unbounded_channel();

        provider.open(tx).await.unwrap();

        assert!(network.is_registered("A1"));
        assert!(matches!(rx.recv().await, Some(TransportEvent::Open(id)) if id.as_str() == "A1"));
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let network = MemoryNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        network.provider("A1").open(tx.clone()).await.unwrap();

        let result = network.provider("A1").open(tx).await;
        assert!(matches!(result, Err(ChatError::Transport(_))));
    }

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let network = MemoryNetwork::new();
        let mut a = network.provider("A1");
        let mut b = network.provider("B1");
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        a.open(a_tx).await.unwrap();
        b.open(b_tx).await.unwrap();
        a_rx.recv().await.unwrap();
        b_rx.recv().await.unwrap();

        let b_end = b.connect(&PeerIdentity::new("A1")).await.unwrap();
        assert!(matches!(b_rx.recv().await, Some(TransportEvent::ChannelOpen(id)) if id == b_end.id()));

        let a_end = match a_rx.recv().await {
            Some(TransportEvent::Connection(ch)) => ch,
            other => panic!("expected connection, got {:?}", other),
        };
        assert_eq!(a_end.remote().as_str(), "B1");

        b_end.send(&MessageFrame::StopTyping).unwrap();
        match a_rx.recv().await {
            Some(TransportEvent::Data(id, bytes)) => {
                assert_eq!(id, a_end.id());
                assert_eq!(MessageFrame::from_bytes(&bytes).unwrap(), MessageFrame::StopTyping);
            }
            other => panic!("expected data, got {:?}", other),
        }

        a_end.close();
        assert!(matches!(b_rx.recv().await, Some(TransportEvent::ChannelClose(id)) if id == b_end.id()));
        assert!(matches!(b_end.send(&MessageFrame::StopTyping), Err(ChatError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_connect_unknown_peer_fails() {
        let network = MemoryNetwork::new();
        let mut b = network.provider("B1");
        let (tx, _rx) = mpsc::unbounded_channel();
        b.open(tx).await.unwrap();

        let result = b.connect(&PeerIdentity::new("nobody")).await;
        assert!(matches!(result, Err(ChatError::Transport(_))));
    }

    #[tokio::test]
    async fn test_destroy_unregisters_and_closes() {
        let network = MemoryNetwork::new();
        let mut a = network.provider("A1");
        let mut b = network.provider("B1");
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        a.open(a_tx).await.unwrap();
        b.open(b_tx).await.unwrap();
        a_rx.recv().await.unwrap();

        let b_end = b.connect(&PeerIdentity::new("A1")).await.unwrap();
        let a_end = match a_rx.recv().await {
            Some(TransportEvent::Connection(ch)) => ch,
            other => panic!("expected connection, got {:?}", other),
        };

        b.destroy();
        assert!(!network.is_registered("B1"));
        assert!(b_end.is_closed());
        assert!(matches!(a_rx.recv().await, Some(TransportEvent::ChannelClose(id)) if id == a_end.id()));

        // Second destroy is a no-op
        b.destroy();
    }
}
