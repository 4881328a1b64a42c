//! Cryptographic operations for peerchat.
//!
//! This module provides:
//! - Symmetric key generation, export and import (AES-256)
//! - Message encryption with AES-GCM and a fresh random nonce per message

pub mod key_exchange;
pub mod secure_channel;

pub use key_exchange::{export_key, generate_local_key, import_key, KeyOrigin, SymmetricKey, KEY_SIZE};
pub use secure_channel::{decrypt_message, encrypt_message, EncryptedPayload, NONCE_SIZE, TAG_SIZE};
