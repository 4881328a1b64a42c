//! Append-only chat history.

use std::time::{SystemTime, UNIX_EPOCH};

/// Who produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    /// Message typed by the local user.
    Local,
    /// Message received from the peer.
    Remote,
    /// Status line (key exchange, connection changes, errors).
    System,
}

/// What an entry holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// Ordinary text.
    Text,
    /// Placeholder for a `Message` frame that could not be decrypted.
    DecryptionFailed,
}

/// Text shown in place of a message that failed to decrypt.
pub const DECRYPTION_ERROR_TEXT: &str = "Decryption Error";

/// One immutable chat log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    /// Who sent it.
    pub sender: Sender,
    /// Entry kind.
    pub kind: EntryKind,
    /// Text content.
    pub text: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
}

impl ChatEntry {
    /// Create a text entry stamped with the current time.
    pub fn new(sender: Sender, text: impl Into<String>) -> Self {
        Self {
            sender,
            kind: EntryKind::Text,
            text: text.into(),
            timestamp: now_millis(),
        }
    }

    /// Create a system entry.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Sender::System, text)
    }

    /// Create a placeholder for an undecryptable remote message.
    pub fn decryption_failed() -> Self {
        Self {
            sender: Sender::Remote,
            kind: EntryKind::DecryptionFailed,
            text: DECRYPTION_ERROR_TEXT.to_string(),
            timestamp: now_millis(),
        }
    }

    /// Whether this entry is a decryption failure placeholder.
    pub fn is_decryption_failure(&self) -> bool {
        self.kind == EntryKind::DecryptionFailed
    }

    /// Format the timestamp as HH:MM:SS (UTC).
    pub fn formatted_time(&self) -> String {
        let secs = (self.timestamp / 1000) % 86400;
        let hours = secs / 3600;
        let minutes = (secs % 3600) / 60;
        let seconds = secs % 60;
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Ordered, append-only record of chat entries.
///
/// There is no way to remove or edit an entry once appended.
#[derive(Debug, Default, Clone)]
pub struct MessageLog {
    entries: Vec<ChatEntry>,
}

impl MessageLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    pub fn append(&mut self, entry: ChatEntry) {
        self.entries.push(entry);
    }

    /// Append a local message.
    pub fn push_local(&mut self, text: impl Into<String>) {
        self.append(ChatEntry::new(Sender::Local, text));
    }

    /// Append a remote message.
    pub fn push_remote(&mut self, text: impl Into<String>) {
        self.append(ChatEntry::new(Sender::Remote, text));
    }

    /// Append a system message.
    pub fn push_system(&mut self, text: impl Into<String>) {
        self.append(ChatEntry::system(text));
    }

    /// All entries in order.
    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    /// Entries appended at or after `index`.
    pub fn since(&self, index: usize) -> &[ChatEntry] {
        self.entries.get(index..).unwrap_or(&[])
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent entry.
    pub fn last(&self) -> Option<&ChatEntry> {
        self.entries.last()
    }

    /// Entries from a given sender.
    pub fn by_sender(&self, sender: Sender) -> impl Iterator<Item = &ChatEntry> {
        self.entries.iter().filter(move |e| e.sender == sender)
    }
}
