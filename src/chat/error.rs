//! Chat error types.

use thiserror::Error;

/// Errors that can occur during chat operations.
#[derive(Error, Debug)]
pub enum ChatError {
    /// User input rejected before any state change.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The secure random source could not produce a key.
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// A received key could not be imported.
    #[error("Key import failed: {0}")]
    KeyImport(String),

    /// No shared key has been established yet.
    #[error("No encryption key established")]
    NoKey,

    /// Encryption of an outgoing message failed.
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// An incoming message could not be authenticated or decrypted.
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Transport error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A frame could not be encoded or decoded.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// The connection state machine refused a transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        /// State the machine was in.
        from: String,
        /// State that was requested.
        to: String,
    },

    /// No channel is open.
    #[error("Channel closed")]
    ChannelClosed,

    /// Configuration could not be loaded or is invalid.
    #[error("Config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Serialization(err.to_string())
    }
}
