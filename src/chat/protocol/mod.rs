//! Chat protocol types.
//!
//! Five frame kinds share one reliable, ordered channel. `Key` bootstraps the
//! shared AES-GCM key, `Message` carries AEAD ciphertext, and `Typing`,
//! `StopTyping` and `UserInfo` are unencrypted presence hints.

mod frame;

pub use frame::MessageFrame;
