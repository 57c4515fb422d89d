//! The ordered conversation projection and its merge rules.
//!
//! Two layers make up the view: confirmed entries mirroring the durable
//! log, keyed by their log-assigned id, and an optimistic overlay of
//! pending writes keyed by locally minted tokens. Entries keep the position
//! they were inserted at; no code path re-sorts the view, so a streaming
//! entry never jumps while its text grows.

use banter_storage::{EntryId, EntryRecord, NewEntry, Sender};

/// Locally minted marker for one optimistic entry awaiting id assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingToken(u64);

/// One visible line: either an acknowledged log row or a pending write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEntry {
    Pending {
        token: PendingToken,
        draft: NewEntry,
    },
    Confirmed(EntryRecord),
}

impl ViewEntry {
    pub fn entry_id(&self) -> Option<EntryId> {
        match self {
            Self::Pending { .. } => None,
            Self::Confirmed(record) => Some(record.id),
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Pending { draft, .. } => &draft.text,
            Self::Confirmed(record) => &record.text,
        }
    }

    pub fn sender(&self) -> Sender {
        match self {
            Self::Pending { draft, .. } => draft.sender,
            Self::Confirmed(record) => record.sender,
        }
    }

    pub fn username(&self) -> &str {
        match self {
            Self::Pending { draft, .. } => &draft.username,
            Self::Confirmed(record) => &record.username,
        }
    }

    pub fn is_streaming(&self) -> bool {
        match self {
            Self::Pending { draft, .. } => draft.is_streaming,
            Self::Confirmed(record) => record.is_streaming,
        }
    }
}

/// Append-ordered, id-deduplicated conversation state for one session.
#[derive(Debug, Default)]
pub struct ConversationView {
    entries: Vec<ViewEntry>,
    next_pending_token: u64,
}

impl ConversationView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ViewEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, entry_id: EntryId) -> bool {
        self.position_of(entry_id).is_some()
    }

    pub fn confirmed(&self, entry_id: EntryId) -> Option<&EntryRecord> {
        self.entries.iter().find_map(|entry| match entry {
            ViewEntry::Confirmed(record) if record.id == entry_id => Some(record),
            _ => None,
        })
    }

    /// Replaces the whole projection with freshly listed log rows.
    pub fn replace(&mut self, records: Vec<EntryRecord>) {
        self.entries = records.into_iter().map(ViewEntry::Confirmed).collect();
    }

    /// Makes a local write visible before the log has acknowledged it.
    pub fn stage_local(&mut self, draft: NewEntry) -> PendingToken {
        self.next_pending_token += 1;
        let token = PendingToken(self.next_pending_token);
        self.entries.push(ViewEntry::Pending { token, draft });
        token
    }

    /// Reconciles an acknowledged write with the overlay.
    ///
    /// If a change notification for the same id already landed, the pending
    /// slot is dropped rather than duplicated: the id is the merge key and
    /// only the log mints ids. Otherwise the pending slot is swapped in
    /// place so the entry keeps its append position.
    pub fn confirm_local(&mut self, token: PendingToken, record: EntryRecord) -> bool {
        if self.contains(record.id) {
            self.entries.retain(
                |entry| !matches!(entry, ViewEntry::Pending { token: pending, .. } if *pending == token),
            );
            return false;
        }

        if let Some(slot) = self.entries.iter_mut().find(
            |entry| matches!(entry, ViewEntry::Pending { token: pending, .. } if *pending == token),
        ) {
            *slot = ViewEntry::Confirmed(record);
            return true;
        }

        // The overlay slot is gone (a clear raced the acknowledgment); the
        // write is durable regardless, so surface it at the tail.
        self.entries.push(ViewEntry::Confirmed(record));
        true
    }

    /// Applies one change notification: insert at the tail when the id is
    /// new, otherwise replace the mutable fields in place. Applying the
    /// same notification twice is a no-op the second time.
    pub fn upsert_remote(&mut self, record: EntryRecord) {
        match self.position_of(record.id) {
            Some(index) => self.entries[index] = ViewEntry::Confirmed(record),
            None => self.entries.push(ViewEntry::Confirmed(record)),
        }
    }

    /// In-place partial update for the streaming accumulation path.
    pub fn patch(
        &mut self,
        entry_id: EntryId,
        text: Option<String>,
        is_streaming: Option<bool>,
    ) -> bool {
        let Some(index) = self.position_of(entry_id) else {
            return false;
        };

        if let ViewEntry::Confirmed(record) = &mut self.entries[index] {
            if let Some(text) = text {
                record.text = text;
            }
            if let Some(is_streaming) = is_streaming {
                record.is_streaming = is_streaming;
            }
        }
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn position_of(&self, entry_id: EntryId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.entry_id() == Some(entry_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: u64, text: &str) -> EntryRecord {
        EntryRecord {
            id: EntryId::new_v7(),
            seq,
            text: text.to_string(),
            sender: Sender::User,
            username: "ada".to_string(),
            timestamp_ms: 1_700_000_000_000 + seq,
            is_streaming: false,
        }
    }

    fn draft(text: &str) -> NewEntry {
        NewEntry::new(Sender::User, "ada", text, 1_700_000_000_000)
    }

    #[test]
    fn remote_insert_is_idempotent() {
        let mut view = ConversationView::new();
        let entry = record(1, "hello");

        view.upsert_remote(entry.clone());
        let after_once = view.entries().to_vec();
        view.upsert_remote(entry);
        assert_eq!(view.entries(), &after_once[..]);
    }

    #[test]
    fn updates_never_move_an_entry() {
        let mut view = ConversationView::new();
        view.upsert_remote(record(1, "before"));
        let mut streaming = record(2, "");
        streaming.is_streaming = true;
        let streaming_id = streaming.id;
        view.upsert_remote(streaming.clone());
        view.upsert_remote(record(3, "after"));

        let original_len = view.len();
        for partial in ["Hel", "Hello", "Hello!"] {
            let mut updated = streaming.clone();
            updated.text = partial.to_string();
            view.upsert_remote(updated);

            assert_eq!(view.len(), original_len);
            assert_eq!(view.entries()[1].entry_id(), Some(streaming_id));
            assert_eq!(view.entries()[1].text(), partial);
        }
    }

    #[test]
    fn confirm_swaps_the_pending_slot_in_place() {
        let mut view = ConversationView::new();
        view.upsert_remote(record(1, "first"));
        let token = view.stage_local(draft("optimistic"));
        view.upsert_remote(record(2, "interleaved"));

        let confirmed = record(3, "optimistic");
        assert!(view.confirm_local(token, confirmed.clone()));

        assert_eq!(view.len(), 3);
        assert_eq!(view.entries()[1].entry_id(), Some(confirmed.id));
        assert_eq!(view.entries()[1].text(), "optimistic");
    }

    #[test]
    fn confirm_after_remote_notification_drops_the_overlay() {
        let mut view = ConversationView::new();
        let token = view.stage_local(draft("raced"));

        // The log's notification for this very write arrives first.
        let acknowledged = record(1, "raced");
        view.upsert_remote(acknowledged.clone());
        assert_eq!(view.len(), 2);

        assert!(!view.confirm_local(token, acknowledged.clone()));
        assert_eq!(view.len(), 1, "no duplicate for the same id");
        assert_eq!(view.entries()[0].entry_id(), Some(acknowledged.id));
    }

    #[test]
    fn distinct_pending_drafts_are_never_coalesced() {
        let mut view = ConversationView::new();
        let first = view.stage_local(draft("same text"));
        let second = view.stage_local(draft("same text"));
        assert_ne!(first, second);
        assert_eq!(view.len(), 2);
    }

    #[test]
    fn patch_touches_only_named_fields() {
        let mut view = ConversationView::new();
        let mut streaming = record(1, "");
        streaming.is_streaming = true;
        let id = streaming.id;
        view.upsert_remote(streaming);

        assert!(view.patch(id, Some("partial".to_string()), None));
        assert!(view.entries()[0].is_streaming());
        assert_eq!(view.entries()[0].text(), "partial");

        assert!(view.patch(id, None, Some(false)));
        assert_eq!(view.entries()[0].text(), "partial");
        assert!(!view.entries()[0].is_streaming());

        assert!(!view.patch(EntryId::new_v7(), None, Some(false)));
    }

    #[test]
    fn clear_empties_both_layers() {
        let mut view = ConversationView::new();
        view.upsert_remote(record(1, "confirmed"));
        view.stage_local(draft("pending"));

        view.clear();
        assert!(view.is_empty());
    }
}
