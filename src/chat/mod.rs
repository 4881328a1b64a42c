//! # Peer Chat Module
//!
//! One-to-one encrypted chat over a pluggable peer transport.
//!
//! A [`PeerSession`] owns everything for one conversation: the transport
//! provider and its single active channel, the shared AES-GCM key, typing
//! presence, the connection state machine, and the message log. All of it is
//! driven from one event queue, so handlers never race each other.
//!
//! ## Security Model
//!
//! - **AES-256-GCM** with a fresh random nonce per message
//! - **Key sent in the clear** over the peer channel; confidentiality rests
//!   on the transport
//! - **Presence frames unencrypted**: typing and display name are hints
//! - **Keys zeroized** on drop and rotated on every disconnect

mod config;
mod error;
pub mod log;
mod presence;
pub mod protocol;
mod session;
mod state;
pub mod transport;

pub use config::{validate_display_name, ChatConfig};
pub use error::ChatError;
pub use log::{ChatEntry, EntryKind, MessageLog, Sender};
pub use presence::{PresenceSignaling, PresenceState};
pub use protocol::MessageFrame;
pub use session::{Notice, PeerSession, CONNECTION_CLOSED_TEXT, KEY_RECEIVED_TEXT, KEY_SENT_TEXT};
pub use state::{ConnectionState, ConnectionStateMachine, StateInput};
