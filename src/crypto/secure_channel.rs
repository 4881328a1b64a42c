//! Per-message authenticated encryption.
//!
//! This module provides message encryption using:
//! - AES-256-GCM with the session's shared key
//! - A fresh random 96-bit nonce for every message
//!
//! Nonce and ciphertext (with the 16-byte tag appended) travel as base64.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::chat::ChatError;
use crate::crypto::key_exchange::SymmetricKey;

/// Nonce size for AES-GCM.
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size appended to every ciphertext.
pub const TAG_SIZE: usize = 16;

/// Encrypted message body as carried by a `Message` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    /// Base64 nonce (12 bytes).
    pub iv: String,
    /// Base64 ciphertext followed by the GCM tag.
    pub ciphertext: String,
}

/// Encrypt a chat message under the current key.
///
/// Fails with `NoKey` when no key has been established yet.
pub fn encrypt_message(key: Option<&SymmetricKey>, text: &str) -> Result<EncryptedPayload, ChatError> {
    let key = key.ok_or(ChatError::NoKey)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng
        .try_fill_bytes(&mut nonce_bytes)
        .map_err(|e| ChatError::Encryption(e.to_string()))?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = Aes256Gcm::new(key.as_aes_key());
    let ciphertext = cipher
        .encrypt(nonce, text.as_bytes())
        .map_err(|e| ChatError::Encryption(e.to_string()))?;

    Ok(EncryptedPayload {
        iv: BASE64.encode(nonce_bytes),
        ciphertext: BASE64.encode(ciphertext),
    })
}

/// Decrypt a received `Message` payload.
///
/// Every failure (bad base64, wrong nonce length, tag mismatch, wrong key,
/// non UTF-8 plaintext) maps to `Decryption`. A missing key maps to `NoKey`.
pub fn decrypt_message(key: Option<&SymmetricKey>, payload: &EncryptedPayload) -> Result<String, ChatError> {
    let key = key.ok_or(ChatError::NoKey)?;

    let nonce_bytes = BASE64
        .decode(&payload.iv)
        .map_err(|e| ChatError::Decryption(format!("invalid iv: {}", e)))?;
    if nonce_bytes.len() != NONCE_SIZE {
        return Err(ChatError::Decryption(format!(
            "iv must be {} bytes, got {}",
            NONCE_SIZE,
            nonce_bytes.len()
        )));
    }

    let ciphertext = BASE64
        .decode(&payload.ciphertext)
        .map_err(|e| ChatError::Decryption(format!("invalid ciphertext: {}", e)))?;
    if ciphertext.len() < TAG_SIZE {
        return Err(ChatError::Decryption("ciphertext too short".to_string()));
    }

    let cipher = Aes256Gcm::new(key.as_aes_key());
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
        .map_err(|_| ChatError::Decryption("authentication failed".to_string()))?;

    String::from_utf8(plaintext).map_err(|e| ChatError::Decryption(e.to_string()))
}
