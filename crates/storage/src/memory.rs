use std::collections::HashMap;
use std::sync::Mutex;

use super::error::{NotFoundSnafu, StorageResult};
use super::ids::EntryId;
use super::notify::{ChangeFeed, LogEvent, LogEvents};
use super::types::{EntryPatch, EntryRecord, NewEntry, SettingsRecord};
use super::{BoxFuture, EntryLog, SettingsStore};

#[derive(Debug, Default)]
struct MemoryState {
    entries: Vec<EntryRecord>,
    settings: HashMap<String, SettingsRecord>,
    next_seq: u64,
}

/// In-memory durable log with the same contract and change feed as the
/// sqlite implementation.
///
/// This is the single-device variant of the log: persistence scoped to the
/// process, notifications fanned out in-process. It doubles as the test
/// backing store.
#[derive(Debug, Default)]
pub struct MemoryLog {
    state: Mutex<MemoryState>,
    feed: ChangeFeed,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn append_entry(&self, input: NewEntry) -> EntryRecord {
        let record = {
            let mut state = self.state.lock().expect("memory log state poisoned");
            state.next_seq += 1;
            let record = EntryRecord {
                id: EntryId::new_v7(),
                seq: state.next_seq,
                text: input.text,
                sender: input.sender,
                username: input.username,
                timestamp_ms: input.timestamp_ms,
                is_streaming: input.is_streaming,
            };
            state.entries.push(record.clone());
            record
        };

        self.feed.publish(LogEvent::Upserted(record.clone()));
        record
    }

    fn update_entry(&self, entry_id: EntryId, patch: EntryPatch) -> StorageResult<EntryRecord> {
        let record = {
            let mut state = self.state.lock().expect("memory log state poisoned");
            let Some(entry) = state.entries.iter_mut().find(|entry| entry.id == entry_id) else {
                return NotFoundSnafu {
                    stage: "memory-entry-update-missing",
                    entity: "entry",
                    id: entry_id.to_string(),
                }
                .fail();
            };

            if let Some(text) = patch.text {
                entry.text = text;
            }
            if let Some(is_streaming) = patch.is_streaming {
                entry.is_streaming = is_streaming;
            }
            entry.clone()
        };

        self.feed.publish(LogEvent::Upserted(record.clone()));
        Ok(record)
    }
}

impl EntryLog for MemoryLog {
    fn append(&self, input: NewEntry) -> BoxFuture<'_, StorageResult<EntryRecord>> {
        Box::pin(async move { Ok(self.append_entry(input)) })
    }

    fn update(
        &self,
        entry_id: EntryId,
        patch: EntryPatch,
    ) -> BoxFuture<'_, StorageResult<EntryRecord>> {
        Box::pin(async move { self.update_entry(entry_id, patch) })
    }

    fn list(&self) -> BoxFuture<'_, StorageResult<Vec<EntryRecord>>> {
        Box::pin(async move {
            let state = self.state.lock().expect("memory log state poisoned");
            Ok(state.entries.clone())
        })
    }

    fn clear(&self) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            {
                let mut state = self.state.lock().expect("memory log state poisoned");
                state.entries.clear();
            }
            self.feed.publish(LogEvent::Cleared);
            Ok(())
        })
    }

    fn subscribe(&self) -> LogEvents {
        self.feed.subscribe()
    }
}

impl SettingsStore for MemoryLog {
    fn load(&self, username: &str) -> BoxFuture<'_, StorageResult<Option<SettingsRecord>>> {
        let username = username.to_string();
        Box::pin(async move {
            let state = self.state.lock().expect("memory log state poisoned");
            Ok(state.settings.get(&username).cloned())
        })
    }

    fn save(&self, record: SettingsRecord) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().expect("memory log state poisoned");
            state.settings.insert(record.username.clone(), record);
            Ok(())
        })
    }
}
