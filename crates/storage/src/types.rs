use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use super::ids::ConversationId;

/// Preference key holding the backend credential.
pub const API_KEY_PREFERENCE: &str = "api_key";
/// Preference key holding the selected model identifier.
pub const MODEL_PREFERENCE: &str = "model";

/// One persisted conversation. `messages` is the codec-encoded message
/// list; this crate treats it as an opaque string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub name: String,
    pub messages: String,
    pub saved_at_unix_ms: u64,
}

impl ConversationRecord {
    pub fn new(
        id: ConversationId,
        name: impl Into<String>,
        messages: impl Into<String>,
        saved_at_unix_ms: u64,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            messages: messages.into(),
            saved_at_unix_ms,
        }
    }
}

pub(crate) fn sort_by_recent_desc(
    left: &ConversationRecord,
    right: &ConversationRecord,
) -> Ordering {
    right
        .saved_at_unix_ms
        .cmp(&left.saved_at_unix_ms)
        .then_with(|| right.id.cmp(&left.id))
}

pub fn current_unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}
