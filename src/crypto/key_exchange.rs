//! Shared symmetric key generation and exchange.
//!
//! Each side generates its own AES-256-GCM key when the session opens. The
//! connecting side ships its key in a `Key` frame right after the channel
//! opens, and the accepting side replaces its own key with the imported one.
//! Key material travels as standard base64 of the raw 32 bytes.

use aes_gcm::{Aes256Gcm, Key};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::chat::ChatError;

/// Raw key length for AES-256-GCM.
pub const KEY_SIZE: usize = 32;

/// A 256-bit AES-GCM key.
///
/// Never mutated after construction; it is replaced wholesale on exchange or
/// reconnect. The bytes are zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    bytes: [u8; KEY_SIZE],
}

impl SymmetricKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    pub(crate) fn as_aes_key(&self) -> &Key<Aes256Gcm> {
        Key::<Aes256Gcm>::from_slice(&self.bytes)
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Generate a fresh local key from the OS random source.
pub fn generate_local_key() -> Result<SymmetricKey, ChatError> {
    let mut bytes = [0u8; KEY_SIZE];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| ChatError::KeyGeneration(e.to_string()))?;
    Ok(SymmetricKey::from_bytes(bytes))
}

/// Serialize a key for transmission in a `Key` frame.
pub fn export_key(key: &SymmetricKey) -> String {
    BASE64.encode(key.as_bytes())
}

/// Import a key received in a `Key` frame.
///
/// Rejects anything that is not valid base64 of exactly 32 bytes.
pub fn import_key(encoded: &str) -> Result<SymmetricKey, ChatError> {
    let mut decoded = BASE64
        .decode(encoded.trim())
        .map_err(|e| ChatError::KeyImport(e.to_string()))?;

    if decoded.len() != KEY_SIZE {
        let got = decoded.len();
        decoded.zeroize();
        return Err(ChatError::KeyImport(format!(
            "expected {} key bytes, got {}",
            KEY_SIZE, got
        )));
    }

    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(&decoded);
    decoded.zeroize();
    Ok(SymmetricKey::from_bytes(bytes))
}

/// Where the key currently in a session's key slot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    /// Generated locally when the session opened or after a disconnect.
    Local,
    /// Imported from the peer's `Key` frame.
    Remote,
}
