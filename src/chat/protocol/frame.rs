//! Wire frame types for the chat protocol.
//!
//! These types define what actually gets sent over the data channel. Each
//! frame is one JSON object tagged by its `type` field:
//!
//! ```text
//! {"type":"key","key":"<base64 32 bytes>"}
//! {"type":"message","iv":"<base64 12 bytes>","encrypted":"<base64>"}
//! {"type":"typing","user":"alice"}
//! {"type":"stop-typing"}
//! {"type":"user-info","name":"alice"}
//! ```
//!
//! Only `message` carries encrypted content. Presence frames are plain.

use serde::{Deserialize, Serialize};

use crate::chat::ChatError;
use crate::crypto::EncryptedPayload;

/// A complete frame as sent over the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessageFrame {
    /// The initiator's raw AES-GCM key, base64.
    Key {
        /// Exported key material.
        key: String,
    },
    /// An encrypted chat message.
    Message {
        /// Base64 nonce.
        iv: String,
        /// Base64 ciphertext with tag.
        encrypted: String,
    },
    /// The sender started typing.
    Typing {
        /// Sender's display name. Absent or null means unnamed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
    },
    /// The sender stopped typing.
    StopTyping,
    /// The sender announces its display name.
    UserInfo {
        /// Display name.
        name: String,
    },
}

impl MessageFrame {
    /// Build a `Message` frame from an encrypted payload.
    pub fn message(payload: EncryptedPayload) -> Self {
        MessageFrame::Message {
            iv: payload.iv,
            encrypted: payload.ciphertext,
        }
    }

    /// Short frame kind for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageFrame::Key { .. } => "key",
            MessageFrame::Message { .. } => "message",
            MessageFrame::Typing { .. } => "typing",
            MessageFrame::StopTyping => "stop-typing",
            MessageFrame::UserInfo { .. } => "user-info",
        }
    }

    /// Serialize to bytes for transport.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ChatError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChatError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Read the `type` tag of a JSON object without decoding the rest.
    ///
    /// Used to classify frames that fail strict decoding.
    pub fn peek_type(bytes: &[u8]) -> Option<String> {
        let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
        value.get("type")?.as_str().map(str::to_string)
    }
}
