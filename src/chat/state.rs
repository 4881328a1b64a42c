//! Connection lifecycle state machine.
//!
//! ```text
//! Idle -> PeerIdAssigned -> Connecting -> Connected -> Disconnected
//!              |                              ^             |
//!              +---------- (inbound) ---------+             +--> Connecting
//!
//! Connecting   --(channel closed before open)--> Disconnected
//! Disconnected --(inbound)--> Connected
//!
//! any state --(transport failure)--> Error(reason)
//! Error --(connect)--> Connecting
//! Error --(inbound)--> Connected
//! Error --(channel closed)--> Disconnected
//! ```
//!
//! Inputs that do not match an edge are refused and leave the state as is.

use std::fmt;

use tracing::debug;

use crate::chat::error::ChatError;

/// Connection lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Session created, no identity yet.
    Idle,
    /// The provider assigned our identity.
    PeerIdAssigned,
    /// Outbound connect in progress.
    Connecting,
    /// A channel is open.
    Connected,
    /// The channel closed.
    Disconnected,
    /// Transport-level failure. Recoverable by connecting again.
    Error(String),
}

impl ConnectionState {
    /// Short display string for the state.
    pub fn display(&self) -> &str {
        match self {
            ConnectionState::Idle => "Not connected",
            ConnectionState::PeerIdAssigned => "Peer ID generated",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Error(_) => "Error",
        }
    }

    /// Whether a connect attempt may start from this state.
    pub fn can_connect(&self) -> bool {
        matches!(
            self,
            ConnectionState::PeerIdAssigned
                | ConnectionState::Disconnected
                | ConnectionState::Error(_)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Error(reason) => write!(f, "Error({})", reason),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Inputs driving the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateInput {
    /// The provider assigned our identity.
    PeerIdAssigned,
    /// The user started an outbound connect.
    ConnectAttempt,
    /// A channel opened (outbound open or inbound adoption).
    ChannelOpened,
    /// The active channel closed.
    ChannelClosed,
    /// A transport-level failure.
    TransportFailed(String),
}

/// Tracks the connection state and guards its transitions.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    identity_assigned: bool,
    history: Vec<ConnectionState>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    /// Create a machine in `Idle`.
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            identity_assigned: false,
            history: vec![ConnectionState::Idle],
        }
    }

    /// Current state.
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Every state entered so far, starting with `Idle`.
    pub fn history(&self) -> &[ConnectionState] {
        &self.history
    }

    /// Whether an identity has been assigned at some point.
    pub fn identity_assigned(&self) -> bool {
        self.identity_assigned
    }

    /// Whether the machine is `Connected`.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Apply an input, returning the new state.
    pub fn apply(&mut self, input: StateInput) -> Result<&ConnectionState, ChatError> {
        let next = self.next_state(&input)?;
        debug!(from = %self.state, to = %next, "connection state transition");

        if next == ConnectionState::PeerIdAssigned {
            self.identity_assigned = true;
        }
        self.history.push(next.clone());
        self.state = next;
        Ok(&self.state)
    }

    fn next_state(&self, input: &StateInput) -> Result<ConnectionState, ChatError> {
        use ConnectionState as S;

        let next = match (&self.state, input) {
            (_, StateInput::TransportFailed(reason)) => S::Error(reason.clone()),
            (S::Idle, StateInput::PeerIdAssigned) => S::PeerIdAssigned,
            (s, StateInput::ConnectAttempt) if s.can_connect() => S::Connecting,
            // Inbound channels may arrive in any state after identity assignment.
            (S::Connecting | S::PeerIdAssigned | S::Disconnected | S::Error(_), StateInput::ChannelOpened)
                if self.identity_assigned =>
            {
                S::Connected
            }
            (S::Connected | S::Connecting | S::Error(_), StateInput::ChannelClosed) => S::Disconnected,
            (from, input) => {
                return Err(ChatError::InvalidTransition {
                    from: from.to_string(),
                    to: format!("{:?}", input),
                })
            }
        };
        Ok(next)
    }
}
