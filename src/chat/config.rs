//! Chat configuration.
//!
//! Stored as TOML in `<config dir>/peerchat/config.toml`. Every field has a
//! default, so a missing file or a partial file is fine.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chat::error::ChatError;

/// Default idle time after the last keystroke before `StopTyping` is sent.
pub const DEFAULT_TYPING_IDLE_TIMEOUT_MS: u64 = 2000;

/// Default name shown for a peer that sent `Typing` without a name.
pub const DEFAULT_REMOTE_PLACEHOLDER: &str = "Remote user";

/// Default maximum message length in characters.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 4096;

/// Default TCP bind address (ephemeral port on loopback).
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:0";

/// Configuration for a chat session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChatConfig {
    /// Our display name, announced in `Typing` and `UserInfo` frames.
    pub display_name: Option<String>,

    /// Idle time after the last keystroke before `StopTyping` fires.
    pub typing_idle_timeout_ms: u64,

    /// Name used when the peer's `Typing` frame has no user.
    pub remote_placeholder: String,

    /// Maximum message length in characters.
    pub max_message_len: usize,

    /// Address the TCP provider listens on.
    pub bind_addr: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            display_name: None,
            typing_idle_timeout_ms: DEFAULT_TYPING_IDLE_TIMEOUT_MS,
            remote_placeholder: DEFAULT_REMOTE_PLACEHOLDER.to_string(),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
        }
    }
}

impl ChatConfig {
    /// Set the display name.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Set the typing idle timeout.
    pub fn with_typing_idle_timeout(mut self, timeout: Duration) -> Self {
        self.typing_idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the bind address.
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    /// Typing idle timeout as a `Duration`.
    pub fn typing_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_idle_timeout_ms)
    }

    /// Check values that would make the session misbehave.
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.typing_idle_timeout_ms == 0 {
            return Err(ChatError::Config(
                "typing_idle_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_message_len == 0 {
            return Err(ChatError::Config(
                "max_message_len must be greater than zero".to_string(),
            ));
        }
        if let Some(name) = &self.display_name {
            validate_display_name(name)?;
        }
        Ok(())
    }

    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ChatError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ChatError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default location.
    pub fn load_default() -> Result<Self, ChatError> {
        Self::load(&Self::default_path()?)
    }

    /// Save configuration as TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ChatError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| ChatError::Config(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Default config file path.
    pub fn default_path() -> Result<PathBuf, ChatError> {
        let config_dir = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .ok_or_else(|| ChatError::Config("Could not find config directory".to_string()))?;
        Ok(config_dir.join("peerchat").join("config.toml"))
    }
}

/// Validate a display name, returning the trimmed value.
pub fn validate_display_name(name: &str) -> Result<String, ChatError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ChatError::Validation("display name is empty".to_string()));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ChatConfig::default();
        assert_eq!(config.typing_idle_timeout(), Duration::from_secs(2));
        assert_eq!(config.remote_placeholder, DEFAULT_REMOTE_PLACEHOLDER);
        assert_eq!(config.max_message_len, DEFAULT_MAX_MESSAGE_LEN);
        assert!(config.display_name.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = ChatConfig::default();
        config.typing_idle_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(ChatError::Config(_))));

        let mut config = ChatConfig::default();
        config.max_message_len = 0;
        assert!(matches!(config.validate(), Err(ChatError::Config(_))));
    }

    #[test]
    fn test_display_name_validation() {
        assert_eq!(validate_display_name("  alice ").unwrap(), "alice");
        assert!(matches!(
            validate_display_name("   "),
            Err(ChatError::Validation(_))
        ));
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChatConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, ChatConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = ChatConfig::default()
            .with_display_name("alice")
            .with_typing_idle_timeout(Duration::from_millis(500))
            .with_bind_addr("0.0.0.0:7000");
        config.save(&path).unwrap();

        assert_eq!(ChatConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "display_name = \"bob\"\n").unwrap();

        let config = ChatConfig::load(&path).unwrap();
        assert_eq!(config.display_name.as_deref(), Some("bob"));
        assert_eq!(config.typing_idle_timeout_ms, DEFAULT_TYPING_IDLE_TIMEOUT_MS);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "typing_idle_timeout_ms = \"soon\"\n").unwrap();

        assert!(matches!(ChatConfig::load(&path), Err(ChatError::Config(_))));
    }
}
