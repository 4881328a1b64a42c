//! # peerchat - encrypted one-to-one chat between peers
//!
//! Two peers obtain identities from a transport provider, one dials the
//! other, and they exchange a symmetric key over the resulting channel. Chat
//! messages are encrypted with AES-256-GCM; typing and display-name presence
//! travel alongside as plain frames.
//!
//! ## Overview
//!
//! - [`crypto`] generates, exports and imports keys and seals messages
//! - [`chat::PeerSession`] drives one conversation from transport events
//! - [`chat::transport`] defines the provider seam, with an in-process
//!   network for tests and a TCP provider for real use
//!
//! ## Example
//!
//! ```no_run
//! use peerchat::chat::transport::MemoryNetwork;
//! use peerchat::chat::{ChatConfig, PeerSession};
//!
//! # async fn demo() -> Result<(), peerchat::chat::ChatError> {
//! let network = MemoryNetwork::new();
//! let mut alice = PeerSession::new(network.provider("alice"), ChatConfig::default())?;
//! let mut bob = PeerSession::new(network.provider("bob"), ChatConfig::default())?;
//! alice.open().await?;
//! bob.open().await?;
//! alice.process_pending();
//! bob.process_pending();
//!
//! bob.connect("alice").await?;
//! bob.process_pending();
//! alice.process_pending();
//!
//! bob.send_message("hi")?;
//! alice.process_pending();
//! # Ok(())
//! # }
//! ```

pub mod chat;
pub mod crypto;

pub use chat::{ChatConfig, ChatError, PeerSession};
pub use crypto::{EncryptedPayload, SymmetricKey};
