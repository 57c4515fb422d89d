use tokio::sync::broadcast;

use super::types::EntryRecord;

const CHANGE_FEED_CAPACITY: usize = 256;

/// One change notification from the durable log.
///
/// `Upserted` fires at least once per create or update, carrying the full
/// resulting row. `Cleared` fires after an atomic clear so other sessions
/// can drop their projection instead of diffing row-by-row.
#[derive(Debug, Clone)]
pub enum LogEvent {
    Upserted(EntryRecord),
    Cleared,
}

/// Publisher half of the change feed, owned by a log implementation.
#[derive(Debug)]
pub struct ChangeFeed {
    sender: broadcast::Sender<LogEvent>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> LogEvents {
        LogEvents {
            receiver: self.sender.subscribe(),
        }
    }

    /// Publishes to whoever is listening; a feed with no subscribers is fine.
    pub fn publish(&self, event: LogEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscriber half of the change feed.
pub struct LogEvents {
    receiver: broadcast::Receiver<LogEvent>,
}

impl LogEvents {
    /// Waits for the next notification. Returns `None` once the feed closes.
    pub async fn recv(&mut self) -> Option<LogEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // A lagged subscriber catches up from the log itself;
                    // the feed is at-least-once, not a replay buffer.
                    tracing::warn!(skipped, "change feed subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking drain step for cooperative processing between intents.
    pub fn try_recv(&mut self) -> Option<LogEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "change feed subscriber lagged");
                }
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::EntryId;
    use crate::types::Sender;

    fn sample_record(text: &str) -> EntryRecord {
        EntryRecord {
            id: EntryId::new_v7(),
            seq: 1,
            text: text.to_string(),
            sender: Sender::User,
            username: "ada".to_string(),
            timestamp_ms: 1_700_000_000_000,
            is_streaming: false,
        }
    }

    #[test]
    fn delivers_published_events_in_order() {
        let feed = ChangeFeed::new();
        let mut events = feed.subscribe();

        feed.publish(LogEvent::Upserted(sample_record("one")));
        feed.publish(LogEvent::Cleared);

        match events.try_recv() {
            Some(LogEvent::Upserted(record)) => assert_eq!(record.text, "one"),
            other => panic!("expected upsert first, got {other:?}"),
        }
        assert!(matches!(events.try_recv(), Some(LogEvent::Cleared)));
        assert!(events.try_recv().is_none());
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        let feed = ChangeFeed::new();
        feed.publish(LogEvent::Cleared);
    }
}
