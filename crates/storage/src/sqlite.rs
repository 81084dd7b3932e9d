use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tokio::sync::watch;

use super::error::{
    CreateSqliteDirectorySnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqlitePragmaSnafu, SqliteQuerySnafu, StorageResult,
};
use super::ids::ConversationId;
use super::types::{ConversationRecord, sort_by_recent_desc};
use super::{BoxFuture, ConversationStore, PreferenceStore};

#[derive(FromRow)]
struct ConversationRow {
    id: String,
    name: String,
    messages: String,
    saved_at_unix_ms: i64,
}

/// Sqlite-backed preference and conversation store.
///
/// Every write refreshes the relevant watch channel, so subscribers observe
/// persisted state without polling.
pub struct SqliteStore {
    pool: SqlitePool,
    preference_watchers: Mutex<HashMap<String, watch::Sender<Option<String>>>>,
    conversation_watcher: watch::Sender<Vec<ConversationRecord>>,
}

impl SqliteStore {
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

        let preference_rows: Vec<(String, String)> =
            sqlx::query_as("SELECT pref_key, pref_value FROM preferences")
                .fetch_all(&pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "sqlite-open-load-preferences",
                })?;

        let mut preference_watchers = HashMap::new();
        for (key, value) in preference_rows {
            let (sender, _) = watch::channel(Some(value));
            preference_watchers.insert(key, sender);
        }

        let conversations = load_conversations(&pool).await?;
        let (conversation_watcher, _) = watch::channel(conversations);

        Ok(Self {
            pool,
            preference_watchers: Mutex::new(preference_watchers),
            conversation_watcher,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn lock_preference_watchers(
        &self,
    ) -> MutexGuard<'_, HashMap<String, watch::Sender<Option<String>>>> {
        // The map only holds channel senders; state stays usable even if a
        // holder panicked mid-section.
        self.preference_watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn refresh_conversation_watch(&self) -> StorageResult<()> {
        let conversations = load_conversations(&self.pool).await?;
        self.conversation_watcher.send_replace(conversations);
        Ok(())
    }
}

impl PreferenceStore for SqliteStore {
    fn watch_preference(&self, key: &str) -> watch::Receiver<Option<String>> {
        let mut watchers = self.lock_preference_watchers();
        watchers
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    fn set_preference<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO preferences (pref_key, pref_value) VALUES (?1, ?2) \
                 ON CONFLICT(pref_key) DO UPDATE SET pref_value = excluded.pref_value",
            )
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "sqlite-set-preference",
            })?;

            tracing::debug!(key, "preference updated");

            self.lock_preference_watchers()
                .entry(key.to_string())
                .or_insert_with(|| watch::channel(None).0)
                .send_replace(Some(value.to_string()));
            Ok(())
        })
    }
}

impl ConversationStore for SqliteStore {
    fn watch_conversations(&self) -> watch::Receiver<Vec<ConversationRecord>> {
        self.conversation_watcher.subscribe()
    }

    fn upsert_conversation(&self, record: ConversationRecord) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO conversations (id, name, messages, saved_at_unix_ms) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(id) DO UPDATE SET \
                 name = excluded.name, \
                 messages = excluded.messages, \
                 saved_at_unix_ms = excluded.saved_at_unix_ms",
            )
            .bind(record.id.to_string())
            .bind(&record.name)
            .bind(&record.messages)
            .bind(record.saved_at_unix_ms as i64)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "sqlite-upsert-conversation",
            })?;

            tracing::debug!(conversation_id = %record.id, "conversation persisted");
            self.refresh_conversation_watch().await
        })
    }

    fn delete_conversation(&self, id: ConversationId) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            sqlx::query("DELETE FROM conversations WHERE id = ?1")
                .bind(id.to_string())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "sqlite-delete-conversation",
                })?;

            tracing::debug!(conversation_id = %id, "conversation deleted");
            self.refresh_conversation_watch().await
        })
    }

    fn conversation_name(
        &self,
        id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<String>>> {
        Box::pin(async move {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT name FROM conversations WHERE id = ?1")
                    .bind(id.to_string())
                    .fetch_optional(&self.pool)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "sqlite-conversation-name",
                    })?;
            Ok(row.map(|(name,)| name))
        })
    }
}

async fn load_conversations(pool: &SqlitePool) -> StorageResult<Vec<ConversationRecord>> {
    let rows: Vec<ConversationRow> =
        sqlx::query_as("SELECT id, name, messages, saved_at_unix_ms FROM conversations")
            .fetch_all(pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "sqlite-load-conversations",
            })?;

    let mut conversations = Vec::with_capacity(rows.len());
    for row in rows {
        // A row with an unparseable id is skipped rather than failing the
        // whole listing.
        match ConversationId::parse(&row.id) {
            Ok(id) => conversations.push(ConversationRecord::new(
                id,
                row.name,
                row.messages,
                row.saved_at_unix_ms as u64,
            )),
            Err(error) => {
                tracing::warn!(raw_id = %row.id, error = %error, "skipping conversation row");
            }
        }
    }

    conversations.sort_by(sort_by_recent_desc);
    Ok(conversations)
}

fn database_file_path(database_location: &str) -> Option<&str> {
    let path = database_location
        .strip_prefix("sqlite://")
        .or_else(|| database_location.strip_prefix("sqlite:"))
        .unwrap_or(database_location);

    if path.contains(":memory:") || path.is_empty() {
        None
    } else {
        Some(path)
    }
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    let Some(path) = database_file_path(database_location) else {
        return Ok(());
    };

    if let Some(parent) = Path::new(path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        database_location.to_string()
    } else {
        format!("sqlite://{database_location}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{API_KEY_PREFERENCE, current_unix_timestamp_ms};

    fn temp_database_path() -> String {
        std::env::temp_dir()
            .join(format!("banter-storage-test-{}.db", uuid::Uuid::now_v7()))
            .display()
            .to_string()
    }

    #[tokio::test]
    async fn preference_write_notifies_existing_watcher() {
        let store = SqliteStore::open(&temp_database_path()).await.unwrap();

        let mut watcher = store.watch_preference(API_KEY_PREFERENCE);
        assert_eq!(*watcher.borrow_and_update(), None);

        store
            .set_preference(API_KEY_PREFERENCE, "secret")
            .await
            .unwrap();
        watcher.changed().await.unwrap();
        assert_eq!(watcher.borrow().as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn preferences_survive_reopen() {
        let path = temp_database_path();

        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.set_preference("model", "gpt-4o").await.unwrap();
        }

        let reopened = SqliteStore::open(&path).await.unwrap();
        let watcher = reopened.watch_preference("model");
        assert_eq!(watcher.borrow().as_deref(), Some("gpt-4o"));
    }

    #[tokio::test]
    async fn conversations_roundtrip_with_watch_updates() {
        let store = SqliteStore::open(&temp_database_path()).await.unwrap();
        let mut watcher = store.watch_conversations();
        assert!(watcher.borrow_and_update().is_empty());

        let record = ConversationRecord::new(
            ConversationId::generate(),
            "trip planning",
            "USER|:|id-1|:|aGVsbG8=",
            current_unix_timestamp_ms(),
        );
        store.upsert_conversation(record.clone()).await.unwrap();

        watcher.changed().await.unwrap();
        assert_eq!(*watcher.borrow_and_update(), vec![record.clone()]);
        assert_eq!(
            store.conversation_name(record.id).await.unwrap().as_deref(),
            Some("trip planning")
        );

        store.delete_conversation(record.id).await.unwrap();
        watcher.changed().await.unwrap();
        assert!(watcher.borrow().is_empty());
        assert_eq!(store.conversation_name(record.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn upsert_replaces_existing_record() {
        let store = SqliteStore::open(&temp_database_path()).await.unwrap();
        let id = ConversationId::generate();

        store
            .upsert_conversation(ConversationRecord::new(id, "first", "payload-a", 1))
            .await
            .unwrap();
        store
            .upsert_conversation(ConversationRecord::new(id, "second", "payload-b", 2))
            .await
            .unwrap();

        let conversations = store.watch_conversations().borrow().clone();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].name, "second");
        assert_eq!(conversations[0].messages, "payload-b");
    }
}
