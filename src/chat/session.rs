//! Peer session: the unit of construction and teardown.
//!
//! A `PeerSession` exclusively owns the transport provider, the single active
//! channel, the key slot, presence signaling, the connection state machine and
//! the message log. Everything is driven from one event queue: transport
//! events posted by the provider and firings of the idle-typing timer. Nothing
//! here blocks; frames are queued on the channel and handled one at a time.
//!
//! Key exchange: both sides generate a local key when the provider assigns
//! their identity. The side that dials sends its key in a `Key` frame as soon
//! as the channel opens; the accepting side imports it and replaces its own.

use std::collections::VecDeque;
use std::fmt;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chat::config::{validate_display_name, ChatConfig};
use crate::chat::error::ChatError;
use crate::chat::log::{ChatEntry, MessageLog};
use crate::chat::presence::{PresenceSignaling, PresenceState};
use crate::chat::protocol::MessageFrame;
use crate::chat::state::{ConnectionState, ConnectionStateMachine, StateInput};
use crate::chat::transport::{
    ChannelId, DataChannel, EventReceiver, EventSender, PeerIdentity, PeerProvider,
    TransportEvent,
};
use crate::crypto::{
    decrypt_message, encrypt_message, export_key, generate_local_key, import_key,
    EncryptedPayload, KeyOrigin, SymmetricKey,
};

/// System entry appended after our key went out.
pub const KEY_SENT_TEXT: &str = "Encryption key sent";
/// System entry appended after the peer's key was imported.
pub const KEY_RECEIVED_TEXT: &str = "Encryption key received";
/// System entry appended when the channel closes.
pub const CONNECTION_CLOSED_TEXT: &str = "Connection closed";

/// User-facing notifications, the non-UI side of toast messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A channel opened.
    ConnectionEstablished,
    /// The channel closed.
    ConnectionClosed,
    /// A remote message was decrypted.
    NewMessage,
    /// A received key could not be imported.
    KeyImportFailed,
    /// No local key could be generated.
    KeyGenerationFailed,
    /// An action needs an open channel and key.
    NoConnection,
    /// Connect was attempted without a peer id.
    EnterPeerId,
    /// A display name was rejected.
    EnterName,
    /// Transport failure, with the text that was logged.
    Error(String),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::ConnectionEstablished => f.write_str("Connection established"),
            Notice::ConnectionClosed => f.write_str("Connection closed"),
            Notice::NewMessage => f.write_str("New message"),
            Notice::KeyImportFailed => f.write_str("Failed to import encryption key"),
            Notice::KeyGenerationFailed => f.write_str("Failed to generate encryption key"),
            Notice::NoConnection => f.write_str("Not connected"),
            Notice::EnterPeerId => f.write_str("Enter the peer ID to connect to"),
            Notice::EnterName => f.write_str("Enter a name"),
            Notice::Error(text) => f.write_str(text),
        }
    }
}

/// One encrypted chat session with a single peer.
pub struct PeerSession<P: PeerProvider> {
    provider: P,
    config: ChatConfig,
    events_tx: EventSender<P::Channel>,
    events_rx: EventReceiver<P::Channel>,
    timer_rx: mpsc::UnboundedReceiver<u64>,

    peer_id: Option<PeerIdentity>,
    state: ConnectionStateMachine,

    key: Option<SymmetricKey>,
    key_origin: Option<KeyOrigin>,

    channel: Option<P::Channel>,
    channel_open: bool,

    presence: PresenceSignaling,
    display_name: Option<String>,
    log: MessageLog,
    notices: VecDeque<Notice>,
    destroyed: bool,
}

impl<P: PeerProvider> PeerSession<P> {
    /// Create a session around a provider. Call [`open`](Self::open) next.
    pub fn new(provider: P, config: ChatConfig) -> Result<Self, ChatError> {
        config.validate()?;
        let display_name = config
            .display_name
            .as_deref()
            .map(validate_display_name)
            .transpose()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let presence = PresenceSignaling::new(
            config.typing_idle_timeout(),
            config.remote_placeholder.clone(),
            timer_tx,
        );

        Ok(Self {
            provider,
            config,
            events_tx,
            events_rx,
            timer_rx,
            peer_id: None,
            state: ConnectionStateMachine::new(),
            key: None,
            key_origin: None,
            channel: None,
            channel_open: false,
            presence,
            display_name,
            log: MessageLog::new(),
            notices: VecDeque::new(),
            destroyed: false,
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Our identity, once the provider assigned it.
    pub fn peer_id(&self) -> Option<&PeerIdentity> {
        self.peer_id.as_ref()
    }

    /// Current connection state.
    pub fn state(&self) -> &ConnectionState {
        self.state.state()
    }

    /// The state machine, including its history.
    pub fn state_machine(&self) -> &ConnectionStateMachine {
        &self.state
    }

    /// Whether a channel is open.
    pub fn is_connected(&self) -> bool {
        self.channel.is_some() && self.channel_open
    }

    /// Identity of the peer on the active channel.
    pub fn remote_peer(&self) -> Option<&PeerIdentity> {
        self.channel.as_ref().map(|c| c.remote())
    }

    /// Whether a key is in the key slot.
    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// Where the current key came from.
    pub fn key_origin(&self) -> Option<KeyOrigin> {
        self.key_origin
    }

    /// Presence state of the peer.
    pub fn presence(&self) -> &PresenceState {
        self.presence.state()
    }

    /// Whether our own typing burst is in progress.
    pub fn is_local_typing(&self) -> bool {
        self.presence.is_burst_active()
    }

    /// Our display name.
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// The chat log.
    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    /// Session configuration.
    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Take all pending notices.
    pub fn take_notices(&mut self) -> Vec<Notice> {
        self.notices.drain(..).collect()
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Start the provider. Our identity arrives as an `Open` event.
    pub async fn open(&mut self) -> Result<(), ChatError> {
        if self.destroyed {
            return Err(ChatError::Transport("session destroyed".to_string()));
        }
        if let Err(e) = self.provider.open(self.events_tx.clone()).await {
            self.on_transport_failure(format!("Error: {}", e), e.to_string());
            return Err(e);
        }
        Ok(())
    }

    /// Wait for the next event and handle it.
    pub async fn process_next(&mut self) {
        tokio::select! {
            Some(event) = self.events_rx.recv() => self.handle_transport_event(event),
            Some(generation) = self.timer_rx.recv() => self.handle_idle_timeout(generation),
            else => {}
        }
    }

    /// Handle every event that is already queued. Returns how many ran.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        loop {
            if let Ok(event) = self.events_rx.try_recv() {
                self.handle_transport_event(event);
            } else if let Ok(generation) = self.timer_rx.try_recv() {
                self.handle_idle_timeout(generation);
            } else {
                return handled;
            }
            handled += 1;
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent<P::Channel>) {
        if self.destroyed {
            if let TransportEvent::Connection(channel) = event {
                channel.close();
            }
            return;
        }

        match event {
            TransportEvent::Open(id) => self.on_open(id),
            TransportEvent::Connection(channel) => self.on_inbound(channel),
            TransportEvent::ChannelOpen(id) => self.on_channel_open(id),
            TransportEvent::Data(id, bytes) => self.on_data(id, &bytes),
            TransportEvent::ChannelClose(id) => self.on_channel_close(id),
            TransportEvent::ChannelError(id, message) => self.on_channel_error(id, message),
            TransportEvent::Error(message) => {
                self.on_transport_failure(format!("Error: {}", message), message)
            }
        }
    }

    fn handle_idle_timeout(&mut self, generation: u64) {
        if !self.presence.on_idle_timeout(generation) {
            return;
        }
        if let Some(channel) = self.open_channel() {
            if let Err(e) = channel.send(&MessageFrame::StopTyping) {
                warn!(error = %e, "failed to send stop-typing");
            }
        }
    }

    fn is_active(&self, id: ChannelId) -> bool {
        self.channel.as_ref().map(|c| c.id()) == Some(id)
    }

    fn open_channel(&self) -> Option<&P::Channel> {
        if self.channel_open {
            self.channel.as_ref()
        } else {
            None
        }
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    fn on_open(&mut self, id: PeerIdentity) {
        if self.peer_id.is_some() {
            warn!(%id, "provider reported a second identity, ignoring");
            return;
        }
        if let Err(e) = self.state.apply(StateInput::PeerIdAssigned) {
            warn!(error = %e, "identity assigned in unexpected state");
        }
        info!(%id, "peer identity assigned");
        self.peer_id = Some(id);
        self.install_local_key();
    }

    fn on_inbound(&mut self, channel: P::Channel) {
        if !self.state.is_connected() {
            if let Err(e) = self.state.apply(StateInput::ChannelOpened) {
                warn!(error = %e, remote = %channel.remote(), "refusing inbound channel");
                channel.close();
                return;
            }
        }

        if let Some(previous) = &self.channel {
            warn!(
                previous = %previous.remote(),
                new = %channel.remote(),
                "closing active channel in favour of new inbound connection"
            );
        }
        self.retire_channel();

        info!(remote = %channel.remote(), channel = %channel.id(), "inbound channel adopted");
        self.presence.reset();
        self.channel = Some(channel);
        self.channel_open = true;
        self.notices.push_back(Notice::ConnectionEstablished);
        self.announce_display_name();
    }

    fn on_channel_open(&mut self, id: ChannelId) {
        if !self.is_active(id) || self.channel_open {
            debug!(channel = %id, "ignoring open for inactive channel");
            return;
        }
        if let Err(e) = self.state.apply(StateInput::ChannelOpened) {
            warn!(error = %e, "channel opened in unexpected state");
        }
        self.channel_open = true;
        info!(channel = %id, "outbound channel open");

        let sent = match (&self.key, &self.channel) {
            (Some(key), Some(channel)) => {
                let frame = MessageFrame::Key { key: export_key(key) };
                Some(channel.send(&frame))
            }
            _ => None,
        };
        match sent {
            Some(Ok(())) => {
                debug!(channel = %id, "key frame sent");
                self.log.push_system(KEY_SENT_TEXT);
            }
            Some(Err(e)) => warn!(error = %e, "failed to send key frame"),
            None => {
                warn!("no local key to send, messages are disabled until a key is exchanged");
                self.notices.push_back(Notice::KeyGenerationFailed);
            }
        }

        self.announce_display_name();
        self.notices.push_back(Notice::ConnectionEstablished);
    }

    fn on_data(&mut self, id: ChannelId, bytes: &[u8]) {
        if !self.is_active(id) {
            debug!(channel = %id, "discarding frame from inactive channel");
            return;
        }
        let frame = match MessageFrame::from_bytes(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.on_malformed_frame(id, bytes, e);
                return;
            }
        };
        debug!(channel = %id, kind = frame.kind(), "frame received");

        match frame {
            MessageFrame::Key { key } => self.on_key_frame(&key),
            MessageFrame::Message { iv, encrypted } => {
                self.on_message_frame(EncryptedPayload {
                    iv,
                    ciphertext: encrypted,
                })
            }
            MessageFrame::Typing { user } => {
                self.presence.receive_typing(user.as_deref().unwrap_or(""))
            }
            MessageFrame::StopTyping => self.presence.receive_stop_typing(),
            MessageFrame::UserInfo { name } => self.presence.receive_user_info(&name),
        }
    }

    fn on_key_frame(&mut self, encoded: &str) {
        match import_key(encoded) {
            Ok(key) => {
                info!("imported peer key");
                self.key = Some(key);
                self.key_origin = Some(KeyOrigin::Remote);
                self.log.push_system(KEY_RECEIVED_TEXT);
            }
            Err(e) => self.reject_key(e),
        }
    }

    fn reject_key(&mut self, error: ChatError) {
        warn!(error = %error, "peer key rejected, messages disabled until a valid key arrives");
        self.key = None;
        self.key_origin = None;
        self.notices.push_back(Notice::KeyImportFailed);
    }

    /// A frame that failed strict decoding. Its `type` tag still decides
    /// whether the peer should see a trace of it.
    fn on_malformed_frame(&mut self, id: ChannelId, bytes: &[u8], error: ChatError) {
        match MessageFrame::peek_type(bytes).as_deref() {
            Some("message") => {
                warn!(channel = %id, error = %error, "malformed message frame");
                self.log.append(ChatEntry::decryption_failed());
            }
            Some("key") => self.reject_key(error),
            _ => warn!(channel = %id, error = %error, "dropping malformed frame"),
        }
    }

    fn on_message_frame(&mut self, payload: EncryptedPayload) {
        match decrypt_message(self.key.as_ref(), &payload) {
            Ok(text) => {
                self.log.push_remote(text);
                self.notices.push_back(Notice::NewMessage);
            }
            Err(e) => {
                warn!(error = %e, "message could not be decrypted");
                self.log.append(ChatEntry::decryption_failed());
            }
        }
    }

    fn on_channel_close(&mut self, id: ChannelId) {
        if !self.is_active(id) {
            debug!(channel = %id, "ignoring close for inactive channel");
            return;
        }
        self.channel = None;
        self.handle_disconnected();
    }

    fn on_channel_error(&mut self, id: ChannelId, message: String) {
        if !self.is_active(id) {
            debug!(channel = %id, error = %message, "ignoring error for inactive channel");
            return;
        }
        self.on_transport_failure(format!("Connection error: {}", message), message);
    }

    fn on_transport_failure(&mut self, text: String, reason: String) {
        warn!(%reason, "transport failure");
        if let Err(e) = self.state.apply(StateInput::TransportFailed(reason)) {
            warn!(error = %e, "could not enter error state");
        }
        self.log.push_system(text.clone());
        self.notices.push_back(Notice::Error(text));
    }

    /// Common path once the active channel is gone. The channel field must
    /// already be cleared.
    fn handle_disconnected(&mut self) {
        self.channel_open = false;
        if let Err(e) = self.state.apply(StateInput::ChannelClosed) {
            debug!(error = %e, "close in unexpected state");
        }
        self.presence.reset();
        self.log.push_system(CONNECTION_CLOSED_TEXT);
        self.notices.push_back(Notice::ConnectionClosed);
        info!("channel closed");

        // Force a fresh exchange on the next connection.
        self.key = None;
        self.key_origin = None;
        self.install_local_key();
    }

    /// Close a channel that is being replaced and drop everything tied to
    /// its peer: the typing timer, the remote typing flag and the key.
    /// No state edge is applied; the caller adopts the next channel.
    fn retire_channel(&mut self) {
        let previous = match self.channel.take() {
            Some(previous) => previous,
            None => return,
        };
        info!(remote = %previous.remote(), channel = %previous.id(), "retiring channel");
        previous.close();
        self.channel_open = false;
        self.presence.reset();
        self.key = None;
        self.key_origin = None;
        self.install_local_key();
    }

    fn install_local_key(&mut self) {
        if self.key_origin == Some(KeyOrigin::Remote) {
            debug!("keeping imported peer key over fresh local key");
            return;
        }
        match generate_local_key() {
            Ok(key) => {
                debug!("generated local key");
                self.key = Some(key);
                self.key_origin = Some(KeyOrigin::Local);
            }
            Err(e) => {
                warn!(error = %e, "local key generation failed");
                self.notices.push_back(Notice::KeyGenerationFailed);
            }
        }
    }

    fn announce_display_name(&self) {
        if let (Some(name), Some(channel)) = (&self.display_name, self.open_channel()) {
            let frame = MessageFrame::UserInfo { name: name.clone() };
            if let Err(e) = channel.send(&frame) {
                warn!(error = %e, "failed to send user info");
            }
        }
    }

    // ------------------------------------------------------------------
    // User actions
    // ------------------------------------------------------------------

    /// Dial a peer by identity.
    ///
    /// An empty id is rejected with `Validation` and changes nothing. On
    /// success the state is `Connecting` until the channel reports open.
    pub async fn connect(&mut self, remote: &str) -> Result<(), ChatError> {
        let remote = remote.trim();
        if remote.is_empty() {
            self.notices.push_back(Notice::EnterPeerId);
            return Err(ChatError::Validation("remote peer id is empty".to_string()));
        }
        if self.destroyed {
            return Err(ChatError::Transport("session destroyed".to_string()));
        }

        self.state.apply(StateInput::ConnectAttempt)?;
        info!(%remote, "connecting");

        match self.provider.connect(&PeerIdentity::new(remote)).await {
            Ok(channel) => {
                self.retire_channel();
                self.channel = Some(channel);
                self.channel_open = false;
                Ok(())
            }
            Err(e) => {
                self.on_transport_failure(format!("Connection error: {}", e), e.to_string());
                Err(e)
            }
        }
    }

    /// Encrypt and send a chat message.
    ///
    /// On success the plaintext is appended as a `Local` entry and any
    /// typing burst ends with an explicit `StopTyping`.
    pub fn send_message(&mut self, text: &str) -> Result<(), ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::Validation("message is empty".to_string()));
        }
        let len = text.chars().count();
        if len > self.config.max_message_len {
            return Err(ChatError::Validation(format!(
                "Message too long: {} > {}",
                len, self.config.max_message_len
            )));
        }

        let channel = match (&self.channel, self.channel_open) {
            (Some(channel), true) => channel,
            _ => {
                self.notices.push_back(Notice::NoConnection);
                return Err(ChatError::ChannelClosed);
            }
        };

        let payload = match encrypt_message(self.key.as_ref(), text) {
            Ok(payload) => payload,
            Err(e) => {
                self.notices.push_back(Notice::NoConnection);
                return Err(e);
            }
        };

        channel.send(&MessageFrame::message(payload))?;
        self.log.push_local(text);

        if self.presence.on_message_sent() {
            if let Err(e) = channel.send(&MessageFrame::StopTyping) {
                warn!(error = %e, "failed to send stop-typing");
            }
        }
        Ok(())
    }

    /// Register a local keystroke for typing presence.
    ///
    /// Does nothing without an open channel. The idle timer is a tokio task,
    /// so this must run inside a tokio runtime; outside one the keystroke is
    /// logged and no `Typing` frame is sent.
    pub fn keystroke(&mut self) {
        let channel = match (&self.channel, self.channel_open) {
            (Some(channel), true) => channel,
            _ => return,
        };
        let user = self.display_name.clone();

        if self.presence.on_keystroke() {
            if let Err(e) = channel.send(&MessageFrame::Typing { user }) {
                warn!(error = %e, "failed to send typing");
            }
        }
    }

    /// Set our display name and announce it if connected.
    pub fn set_display_name(&mut self, name: &str) -> Result<(), ChatError> {
        let name = match validate_display_name(name) {
            Ok(name) => name,
            Err(e) => {
                self.notices.push_back(Notice::EnterName);
                return Err(e);
            }
        };
        self.display_name = Some(name);
        self.announce_display_name();
        Ok(())
    }

    /// Close the active channel.
    pub fn disconnect(&mut self) -> Result<(), ChatError> {
        match self.channel.take() {
            Some(channel) => {
                channel.close();
                self.handle_disconnected();
                Ok(())
            }
            None => {
                self.notices.push_back(Notice::NoConnection);
                Err(ChatError::ChannelClosed)
            }
        }
    }

    /// Tear the session down: cancel the typing timer, close the channel and
    /// release the provider. Idempotent; also runs on drop.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.presence.cancel_timer();
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.channel_open = false;
        self.provider.destroy();
        info!("session destroyed");
    }
}

impl<P: PeerProvider> Drop for PeerSession<P> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::log::Sender;
    use crate::chat::transport::{MemoryNetwork, MemoryProvider};

    async fn opened(network: &MemoryNetwork, id: &str) -> PeerSession<MemoryProvider> {
        let config = ChatConfig::default().with_display_name(id.to_lowercase());
        let mut session = PeerSession::new(network.provider(id), config).unwrap();
        session.open().await.unwrap();
        session.process_pending();
        session
    }

    #[tokio::test]
    async fn test_open_assigns_identity_and_key() {
        let network = MemoryNetwork::new();
        let session = opened(&network, "A1").await;

        assert_eq!(session.peer_id().unwrap().as_str(), "A1");
        assert_eq!(session.state(), &ConnectionState::PeerIdAssigned);
        assert!(session.has_key());
        assert_eq!(session.key_origin(), Some(KeyOrigin::Local));
    }

    #[tokio::test]
    async fn test_empty_remote_id_rejected_without_transition() {
        let network = MemoryNetwork::new();
        let mut session = opened(&network, "A1").await;

        let result = session.connect("   ").await;
        assert!(matches!(result, Err(ChatError::Validation(_))));
        assert_eq!(session.state(), &ConnectionState::PeerIdAssigned);
        assert_eq!(session.take_notices(), vec![Notice::EnterPeerId]);
    }

    #[tokio::test]
    async fn test_connect_to_missing_peer_enters_error() {
        let network = MemoryNetwork::new();
        let mut session = opened(&network, "B1").await;

        assert!(session.connect("ghost").await.is_err());
        assert!(matches!(session.state(), ConnectionState::Error(_)));
        let last = session.log().last().unwrap();
        assert_eq!(last.sender, Sender::System);
        assert!(last.text.contains("Could not connect to peer ghost"));
    }

    #[tokio::test]
    async fn test_send_without_channel_fails() {
        let network = MemoryNetwork::new();
        let mut session = opened(&network, "A1").await;

        assert!(matches!(session.send_message("hi"), Err(ChatError::ChannelClosed)));
        assert!(session.log().is_empty());
        assert_eq!(session.take_notices(), vec![Notice::NoConnection]);
    }

    #[tokio::test]
    async fn test_message_length_limit() {
        let network = MemoryNetwork::new();
        let mut session = opened(&network, "A1").await;

        let long = "a".repeat(session.config().max_message_len + 1);
        assert!(matches!(session.send_message(&long), Err(ChatError::Validation(_))));
        assert!(matches!(session.send_message(""), Err(ChatError::Validation(_))));
    }

    #[tokio::test]
    async fn test_set_display_name_validates() {
        let network = MemoryNetwork::new();
        let mut session = opened(&network, "A1").await;

        assert!(session.set_display_name("  ").is_err());
        assert_eq!(session.take_notices(), vec![Notice::EnterName]);

        session.set_display_name(" Alice ").unwrap();
        assert_eq!(session.display_name(), Some("Alice"));
    }

    #[tokio::test]
    async fn test_disconnect_without_channel() {
        let network = MemoryNetwork::new();
        let mut session = opened(&network, "A1").await;

        assert!(matches!(session.disconnect(), Err(ChatError::ChannelClosed)));
        assert_eq!(session.state(), &ConnectionState::PeerIdAssigned);
    }

    #[tokio::test]
    async fn test_destroy_releases_provider() {
        let network = MemoryNetwork::new();
        let mut session = opened(&network, "A1").await;
        assert!(network.is_registered("A1"));

        session.destroy();
        assert!(!network.is_registered("A1"));
        assert!(session.connect("B1").await.is_err());

        // Drop after explicit destroy is harmless.
        drop(session);
    }

    #[tokio::test]
    async fn test_drop_releases_provider() {
        let network = MemoryNetwork::new();
        {
            let _session = opened(&network, "A1").await;
            assert!(network.is_registered("A1"));
        }
        assert!(!network.is_registered("A1"));
    }

    async fn connected(network: &MemoryNetwork) -> (PeerSession<MemoryProvider>, PeerSession<MemoryProvider>) {
        let mut a = opened(network, "A1").await;
        let mut b = opened(network, "B1").await;
        b.connect("A1").await.unwrap();
        b.process_pending();
        a.process_pending();
        b.process_pending();
        (a, b)
    }

    fn active_id(session: &PeerSession<MemoryProvider>) -> ChannelId {
        session.channel.as_ref().map(|c| c.id()).unwrap()
    }

    #[tokio::test]
    async fn test_garbage_and_stale_events_ignored() {
        let network = MemoryNetwork::new();
        let (mut a, _b) = connected(&network).await;
        let active = active_id(&a);
        let before = a.log().len();
        a.take_notices();

        a.handle_transport_event(TransportEvent::Data(active, b"{not json".to_vec()));
        a.handle_transport_event(TransportEvent::Data(active, br#"{"type":"file"}"#.to_vec()));
        a.handle_transport_event(TransportEvent::Data(
            ChannelId::next(),
            MessageFrame::Typing { user: Some("x".into()) }.to_bytes().unwrap(),
        ));
        a.handle_transport_event(TransportEvent::ChannelClose(ChannelId::next()));

        assert_eq!(a.log().len(), before);
        assert!(a.take_notices().is_empty());
        assert!(!a.presence().is_remote_typing);
        assert!(a.has_key());
        assert!(a.is_connected());
    }

    #[tokio::test]
    async fn test_malformed_message_frames_leave_placeholders() {
        let network = MemoryNetwork::new();
        let (mut a, _b) = connected(&network).await;
        let active = active_id(&a);
        let before = a.log().len();
        a.take_notices();

        a.handle_transport_event(TransportEvent::Data(
            active,
            br#"{"type":"message","iv":123,"encrypted":"AAAA"}"#.to_vec(),
        ));
        a.handle_transport_event(TransportEvent::Data(
            active,
            br#"{"type":"message","encrypted":"AAAA"}"#.to_vec(),
        ));

        let entries = a.log().since(before);
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.is_decryption_failure()));
        assert!(entries.iter().all(|e| e.sender == Sender::Remote));
        assert!(a.take_notices().is_empty());
        assert!(a.is_connected());
    }

    #[tokio::test]
    async fn test_malformed_key_frame_clears_key() {
        let network = MemoryNetwork::new();
        let (mut a, _b) = connected(&network).await;
        let active = active_id(&a);
        assert!(a.has_key());
        a.take_notices();

        a.handle_transport_event(TransportEvent::Data(active, br#"{"type":"key"}"#.to_vec()));

        assert!(!a.has_key());
        assert_eq!(a.key_origin(), None);
        assert_eq!(a.take_notices(), vec![Notice::KeyImportFailed]);
        assert!(matches!(a.send_message("hi"), Err(ChatError::NoKey)));
    }

    #[tokio::test]
    async fn test_typing_with_null_user_uses_placeholder() {
        let network = MemoryNetwork::new();
        let (mut a, _b) = connected(&network).await;
        let active = active_id(&a);

        a.handle_transport_event(TransportEvent::Data(
            active,
            br#"{"type":"typing","user":null}"#.to_vec(),
        ));

        assert!(a.presence().is_remote_typing);
        assert_eq!(
            a.presence().remote_display_name.as_deref(),
            Some(a.config().remote_placeholder.as_str())
        );
    }

    #[tokio::test]
    async fn test_connect_after_channel_error_starts_clean() {
        let network = MemoryNetwork::new();
        let (mut a, mut b) = connected(&network).await;
        let mut c = opened(&network, "C1").await;
        let active = active_id(&a);
        let old_key = export_key(a.key.as_ref().unwrap());
        assert_eq!(a.key_origin(), Some(KeyOrigin::Remote));

        a.keystroke();
        b.keystroke();
        b.process_pending();
        a.process_pending();
        assert!(a.is_local_typing());
        assert!(a.presence().is_remote_typing);

        a.handle_transport_event(TransportEvent::ChannelError(active, "boom".into()));
        a.connect("C1").await.unwrap();

        assert!(!a.is_local_typing());
        assert!(!a.presence().is_remote_typing);
        assert_eq!(a.key_origin(), Some(KeyOrigin::Local));
        assert_ne!(export_key(a.key.as_ref().unwrap()), old_key);

        for _ in 0..2 {
            a.process_pending();
            c.process_pending();
            b.process_pending();
        }
        assert_eq!(a.state(), &ConnectionState::Connected);
        assert_eq!(a.remote_peer().map(|p| p.as_str()), Some("C1"));
        assert_eq!(c.key_origin(), Some(KeyOrigin::Remote));
        assert_ne!(export_key(c.key.as_ref().unwrap()), old_key);
        assert_eq!(
            export_key(c.key.as_ref().unwrap()),
            export_key(a.key.as_ref().unwrap())
        );
        assert_eq!(b.state(), &ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_imported_key_survives_local_generation() {
        let network = MemoryNetwork::new();
        let (mut a, _b) = connected(&network).await;
        assert_eq!(a.key_origin(), Some(KeyOrigin::Remote));

        a.install_local_key();
        assert_eq!(a.key_origin(), Some(KeyOrigin::Remote));
    }

    #[tokio::test]
    async fn test_channel_error_then_close() {
        let network = MemoryNetwork::new();
        let (mut a, _b) = connected(&network).await;
        let active = a.channel.as_ref().map(|c| c.id()).unwrap();
        a.take_notices();

        a.handle_transport_event(TransportEvent::ChannelError(active, "boom".into()));
        assert_eq!(a.state(), &ConnectionState::Error("boom".into()));
        assert!(a.log().last().unwrap().text.contains("boom"));
        assert!(matches!(a.take_notices().as_slice(), [Notice::Error(_)]));

        a.handle_transport_event(TransportEvent::ChannelClose(active));
        assert_eq!(a.state(), &ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_provider_error_logged_verbatim() {
        let network = MemoryNetwork::new();
        let mut a = opened(&network, "A1").await;

        a.handle_transport_event(TransportEvent::Error("network unreachable".into()));
        assert!(matches!(a.state(), ConnectionState::Error(_)));
        let last = a.log().last().unwrap();
        assert_eq!(last.sender, Sender::System);
        assert!(last.text.contains("network unreachable"));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let network = MemoryNetwork::new();
        let mut config = ChatConfig::default();
        config.typing_idle_timeout_ms = 0;
        assert!(PeerSession::new(network.provider("A1"), config).is_err());
    }
}
