use std::future::Future;
use std::pin::Pin;

use tokio::sync::watch;

pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::ConversationId;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{
    API_KEY_PREFERENCE, ConversationRecord, MODEL_PREFERENCE, current_unix_timestamp_ms,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Persisted key/value preferences with change notification.
///
/// A receiver returned by `watch_preference` carries the current value
/// immediately and every later write to the same key.
pub trait PreferenceStore: Send + Sync {
    fn watch_preference(&self, key: &str) -> watch::Receiver<Option<String>>;
    fn set_preference<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
    ) -> BoxFuture<'a, StorageResult<()>>;
}

/// Persisted named conversations with change notification.
pub trait ConversationStore: Send + Sync {
    fn watch_conversations(&self) -> watch::Receiver<Vec<ConversationRecord>>;
    fn upsert_conversation(&self, record: ConversationRecord) -> BoxFuture<'_, StorageResult<()>>;
    fn delete_conversation(&self, id: ConversationId) -> BoxFuture<'_, StorageResult<()>>;
    fn conversation_name(
        &self,
        id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<String>>>;
}

pub trait Storage: PreferenceStore + ConversationStore {}

impl<T> Storage for T where T: PreferenceStore + ConversationStore {}
