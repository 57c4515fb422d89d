use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod memory;
pub mod notify;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::EntryId;
pub use memory::MemoryLog;
pub use notify::{ChangeFeed, LogEvent, LogEvents};
pub use sqlite::SqliteLog;
pub use types::{EntryPatch, EntryRecord, NewEntry, Sender, SettingsRecord};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The durable, append-only chat log.
///
/// The log is the single source of truth and may be written by several
/// sessions at once; it alone assigns entry ids. Entries are never removed
/// individually; the whole log clears atomically or not at all.
pub trait EntryLog: Send + Sync {
    fn append(&self, input: NewEntry) -> BoxFuture<'_, StorageResult<EntryRecord>>;
    fn update(&self, entry_id: EntryId, patch: EntryPatch)
    -> BoxFuture<'_, StorageResult<EntryRecord>>;
    fn list(&self) -> BoxFuture<'_, StorageResult<Vec<EntryRecord>>>;
    fn clear(&self) -> BoxFuture<'_, StorageResult<()>>;
    fn subscribe(&self) -> LogEvents;
}

/// Per-identity settings persistence. May share a backing store with the
/// entry log; callers supply defaults when no row exists yet.
pub trait SettingsStore: Send + Sync {
    fn load(&self, username: &str) -> BoxFuture<'_, StorageResult<Option<SettingsRecord>>>;
    fn save(&self, record: SettingsRecord) -> BoxFuture<'_, StorageResult<()>>;
}
