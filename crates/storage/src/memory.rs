use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::watch;

use super::ids::ConversationId;
use super::types::{ConversationRecord, sort_by_recent_desc};
use super::{BoxFuture, ConversationStore, PreferenceStore, StorageResult};

/// In-memory store with the same watch semantics as [`super::SqliteStore`].
/// Used by tests and demos; nothing survives the process.
pub struct MemoryStore {
    preferences: Mutex<HashMap<String, watch::Sender<Option<String>>>>,
    conversations: Mutex<Vec<ConversationRecord>>,
    conversation_watcher: watch::Sender<Vec<ConversationRecord>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            preferences: Mutex::new(HashMap::new()),
            conversations: Mutex::new(Vec::new()),
            conversation_watcher: watch::channel(Vec::new()).0,
        }
    }

    fn lock_preferences(&self) -> MutexGuard<'_, HashMap<String, watch::Sender<Option<String>>>> {
        self.preferences
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_conversations(&self) -> MutexGuard<'_, Vec<ConversationRecord>> {
        self.conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish_conversations(&self) {
        let mut conversations = self.lock_conversations().clone();
        conversations.sort_by(sort_by_recent_desc);
        self.conversation_watcher.send_replace(conversations);
    }
}

impl PreferenceStore for MemoryStore {
    fn watch_preference(&self, key: &str) -> watch::Receiver<Option<String>> {
        self.lock_preferences()
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
            self.lock_preferences()
                .entry(key.to_string())
                .or_insert_with(|| watch::channel(None).0)
                .send_replace(Some(value.to_string()));
            Ok(())
        })
    }
}

impl ConversationStore for MemoryStore {
    fn watch_conversations(&self) -> watch::Receiver<Vec<ConversationRecord>> {
        self.conversation_watcher.subscribe()
    }

    fn upsert_conversation(&self, record: ConversationRecord) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            {
                let mut conversations = self.lock_conversations();
                if let Some(existing) = conversations
                    .iter_mut()
                    .find(|conversation| conversation.id == record.id)
                {
                    *existing = record;
                } else {
                    conversations.push(record);
                }
            }
            self.publish_conversations();
            Ok(())
        })
    }

    fn delete_conversation(&self, id: ConversationId) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.lock_conversations()
                .retain(|conversation| conversation.id != id);
            self.publish_conversations();
            Ok(())
        })
    }

    fn conversation_name(
        &self,
        id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<String>>> {
        Box::pin(async move {
            Ok(self
                .lock_conversations()
                .iter()
                .find(|conversation| conversation.id == id)
                .map(|conversation| conversation.name.clone()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::API_KEY_PREFERENCE;

    #[tokio::test]
    async fn watcher_sees_preference_updates() {
        let store = MemoryStore::new();
        let mut watcher = store.watch_preference(API_KEY_PREFERENCE);

        store
            .set_preference(API_KEY_PREFERENCE, "key-123")
            .await
            .unwrap();
        watcher.changed().await.unwrap();
        assert_eq!(watcher.borrow().as_deref(), Some("key-123"));
    }

    #[tokio::test]
    async fn conversations_sorted_most_recent_first() {
        let store = MemoryStore::new();
        let older = ConversationRecord::new(ConversationId::generate(), "older", "", 10);
        let newer = ConversationRecord::new(ConversationId::generate(), "newer", "", 20);

        store.upsert_conversation(older.clone()).await.unwrap();
        store.upsert_conversation(newer.clone()).await.unwrap();

        let listed = store.watch_conversations().borrow().clone();
        assert_eq!(listed, vec![newer, older]);
    }
}
