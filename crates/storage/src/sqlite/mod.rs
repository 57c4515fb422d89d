use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu, StorageResult,
};
use super::ids::EntryId;
use super::notify::{ChangeFeed, LogEvent, LogEvents};
use super::types::{EntryPatch, EntryRecord, NewEntry, Sender, SettingsRecord};
use super::{BoxFuture, EntryLog, SettingsStore};

/// Sqlite-backed durable log and settings store.
///
/// One writer pool per process; concurrent sessions against the same file
/// are serialized through WAL plus the busy timeout, and every successful
/// mutation is republished on the change feed so observers converge
/// without polling.
#[derive(Debug)]
pub struct SqliteLog {
    pool: SqlitePool,
    feed: ChangeFeed,
}

impl SqliteLog {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        // Explicit PRAGMA writes make bootstrap behavior deterministic for QA checks.
        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        Ok(Self {
            pool,
            feed: ChangeFeed::new(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn append_entry(&self, input: NewEntry) -> StorageResult<EntryRecord> {
        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "entry-append-begin",
        })?;

        let next_seq =
            sqlx::query_scalar::<_, i64>("SELECT COALESCE(MAX(seq), 0) + 1 FROM entries")
                .fetch_one(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "entry-append-next-seq",
                })?;

        let now = unix_timestamp_seconds();
        let entry_id = EntryId::new_v7();
        let timestamp_ms = u64_to_i64(input.timestamp_ms, "entry-append-timestamp")?;

        sqlx::query(
            "INSERT INTO entries (id, seq, text, sender, username, timestamp_ms, is_streaming, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry_id.to_string())
        .bind(next_seq)
        .bind(input.text.clone())
        .bind(sender_to_sql(input.sender))
        .bind(input.username.clone())
        .bind(timestamp_ms)
        .bind(input.is_streaming)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "entry-append-insert",
        })?;

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "entry-append-commit",
        })?;

        let record = EntryRecord {
            id: entry_id,
            seq: i64_to_u64(next_seq, "entry-append-seq")?,
            text: input.text,
            sender: input.sender,
            username: input.username,
            timestamp_ms: input.timestamp_ms,
            is_streaming: input.is_streaming,
        };

        self.feed.publish(LogEvent::Upserted(record.clone()));
        Ok(record)
    }

    async fn update_entry(&self, entry_id: EntryId, patch: EntryPatch) -> StorageResult<EntryRecord> {
        let now = unix_timestamp_seconds();
        let update_result = sqlx::query(
            "UPDATE entries SET text = COALESCE(?, text), is_streaming = COALESCE(?, is_streaming), updated_at = ? WHERE id = ?",
        )
        .bind(patch.text)
        .bind(patch.is_streaming)
        .bind(now)
        .bind(entry_id.to_string())
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "entry-update-apply",
        })?;

        if update_result.rows_affected() == 0 {
            return NotFoundSnafu {
                stage: "entry-update-missing",
                entity: "entry",
                id: entry_id.to_string(),
            }
            .fail();
        }

        let row = sqlx::query_as::<_, EntryRow>(
            "SELECT id, seq, text, sender, username, timestamp_ms, is_streaming FROM entries WHERE id = ?",
        )
        .bind(entry_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "entry-update-load",
        })?
        .ok_or_else(|| super::error::StorageError::NotFound {
            stage: "entry-update-load-missing",
            entity: "entry",
            id: entry_id.to_string(),
        })?;

        let record = entry_row_to_record(row)?;
        self.feed.publish(LogEvent::Upserted(record.clone()));
        Ok(record)
    }

    async fn list_entries(&self) -> StorageResult<Vec<EntryRecord>> {
        let rows = sqlx::query_as::<_, EntryRow>(
            "SELECT id, seq, text, sender, username, timestamp_ms, is_streaming FROM entries ORDER BY seq ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "entry-list-query",
        })?;

        rows.into_iter().map(entry_row_to_record).collect()
    }

    async fn clear_entries(&self) -> StorageResult<()> {
        // Single DELETE statement keeps the wipe all-or-nothing.
        sqlx::query("DELETE FROM entries")
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "entry-clear-apply",
            })?;

        self.feed.publish(LogEvent::Cleared);
        Ok(())
    }

    async fn load_settings(&self, username: &str) -> StorageResult<Option<SettingsRecord>> {
        let row = sqlx::query_as::<_, SettingsRow>(
            "SELECT username, theme, api_credential, behavior_instruction FROM settings WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "settings-load-query",
        })?;

        Ok(row.map(settings_row_to_record))
    }

    async fn save_settings(&self, record: SettingsRecord) -> StorageResult<()> {
        let now = unix_timestamp_seconds();
        sqlx::query(
            "INSERT INTO settings (username, theme, api_credential, behavior_instruction, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(username) DO UPDATE SET theme = excluded.theme, api_credential = excluded.api_credential, behavior_instruction = excluded.behavior_instruction, updated_at = excluded.updated_at",
        )
        .bind(record.username)
        .bind(record.theme)
        .bind(record.api_credential)
        .bind(record.behavior_instruction)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "settings-save-upsert",
        })?;

        Ok(())
    }
}

impl EntryLog for SqliteLog {
    fn append(&self, input: NewEntry) -> BoxFuture<'_, StorageResult<EntryRecord>> {
        Box::pin(self.append_entry(input))
    }

    fn update(
        &self,
        entry_id: EntryId,
        patch: EntryPatch,
    ) -> BoxFuture<'_, StorageResult<EntryRecord>> {
        Box::pin(self.update_entry(entry_id, patch))
    }

    fn list(&self) -> BoxFuture<'_, StorageResult<Vec<EntryRecord>>> {
        Box::pin(self.list_entries())
    }

    fn clear(&self) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(self.clear_entries())
    }

    fn subscribe(&self) -> LogEvents {
        self.feed.subscribe()
    }
}

impl SettingsStore for SqliteLog {
    fn load(&self, username: &str) -> BoxFuture<'_, StorageResult<Option<SettingsRecord>>> {
        let username = username.to_string();
        Box::pin(async move { self.load_settings(&username).await })
    }

    fn save(&self, record: SettingsRecord) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(self.save_settings(record))
    }
}

#[derive(Debug, FromRow)]
struct EntryRow {
    id: String,
    seq: i64,
    text: String,
    sender: String,
    username: String,
    timestamp_ms: i64,
    is_streaming: bool,
}

#[derive(Debug, FromRow)]
struct SettingsRow {
    username: String,
    theme: String,
    api_credential: String,
    behavior_instruction: String,
}

fn entry_row_to_record(row: EntryRow) -> StorageResult<EntryRecord> {
    Ok(EntryRecord {
        id: EntryId::parse(&row.id)?,
        seq: i64_to_u64(row.seq, "entry-row-seq")?,
        text: row.text,
        sender: sender_from_sql(&row.sender)?,
        username: row.username,
        timestamp_ms: i64_to_u64(row.timestamp_ms, "entry-row-timestamp")?,
        is_streaming: row.is_streaming,
    })
}

fn settings_row_to_record(row: SettingsRow) -> SettingsRecord {
    SettingsRecord {
        username: row.username,
        theme: row.theme,
        api_credential: row.api_credential,
        behavior_instruction: row.behavior_instruction,
    }
}

fn sender_to_sql(sender: Sender) -> &'static str {
    match sender {
        Sender::User => "user",
        Sender::Ai => "ai",
        Sender::System => "system",
    }
}

fn sender_from_sql(raw: &str) -> StorageResult<Sender> {
    match raw {
        "user" => Ok(Sender::User),
        "ai" => Ok(Sender::Ai),
        "system" => Ok(Sender::System),
        _ => InvariantViolationSnafu {
            stage: "entry-sender-from-sql",
            details: format!("unknown sender '{raw}'"),
        }
        .fail(),
    }
}

fn unix_timestamp_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_secs() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| super::error::StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| super::error::StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_bare_paths_and_memory_locations() {
        assert_eq!(
            normalize_database_url("/tmp/banter/chat.db"),
            "sqlite:///tmp/banter/chat.db"
        );
        assert_eq!(normalize_database_url(":memory:"), "sqlite::memory:");
        assert_eq!(
            normalize_database_url("sqlite::memory:"),
            "sqlite::memory:"
        );
    }

    #[test]
    fn sender_sql_mapping_is_total() {
        for sender in [Sender::User, Sender::Ai, Sender::System] {
            let roundtripped = sender_from_sql(sender_to_sql(sender)).expect("known mapping");
            assert_eq!(roundtripped, sender);
        }
        assert!(sender_from_sql("moderator").is_err());
    }
}
