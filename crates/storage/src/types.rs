use super::ids::EntryId;

/// Storage-local speaker kind, intentionally decoupled from engine-layer enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sender {
    User,
    Ai,
    System,
}

/// One durable chat-log row.
///
/// `seq` is the log-assigned creation order and is the only ordering the
/// conversation view relies on; `timestamp_ms` is advisory display data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub id: EntryId,
    pub seq: u64,
    pub text: String,
    pub sender: Sender,
    pub username: String,
    pub timestamp_ms: u64,
    pub is_streaming: bool,
}

/// An entry before the log has assigned its id and sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub text: String,
    pub sender: Sender,
    pub username: String,
    pub timestamp_ms: u64,
    pub is_streaming: bool,
}

impl NewEntry {
    pub fn new(
        sender: Sender,
        username: impl Into<String>,
        text: impl Into<String>,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            text: text.into(),
            sender,
            username: username.into(),
            timestamp_ms,
            is_streaming: false,
        }
    }

    pub fn streaming(mut self) -> Self {
        self.is_streaming = true;
        self
    }
}

/// Partial update for one entry; `None` fields keep their stored value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EntryPatch {
    pub text: Option<String>,
    pub is_streaming: Option<bool>,
}

impl EntryPatch {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            is_streaming: None,
        }
    }

    pub fn stream_closed() -> Self {
        Self {
            text: None,
            is_streaming: Some(false),
        }
    }
}

/// Per-identity settings row. Created with defaults on first join and
/// never deleted, so it survives leaving the room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsRecord {
    pub username: String,
    pub theme: String,
    pub api_credential: String,
    pub behavior_instruction: String,
}
