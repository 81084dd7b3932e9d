//! Persisted conversation wire format.
//!
//! Each message is one record of `TAG|:|id|:|base64(text)`; records are
//! joined with `||MSG||`. Base64 keeps delimiter sequences and line breaks
//! out of the payload, so no escaping is needed. Decoding is tolerant:
//! malformed records are skipped and unknown tags are dropped, never
//! errors.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::message::{ChatMessage, MessageId, ModelMessage, UserMessage};

const MESSAGE_DELIMITER: &str = "||MSG||";
const FIELD_DELIMITER: &str = "|:|";

const USER_TAG: &str = "USER";
const MODEL_LOADED_TAG: &str = "MODEL_LOADED";
const MODEL_ERROR_TAG: &str = "MODEL_ERROR";

/// Encodes a message list to its persisted form. Callers finalize or drop
/// in-flight placeholders first; a stray `Loading` is skipped.
pub fn encode(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter_map(encode_message)
        .collect::<Vec<_>>()
        .join(MESSAGE_DELIMITER)
}

fn encode_message(message: &ChatMessage) -> Option<String> {
    let (tag, id, text) = match message {
        ChatMessage::User(user) => (USER_TAG, &user.id, user.text.as_str()),
        ChatMessage::Model(ModelMessage::Loaded { id, text }) => {
            (MODEL_LOADED_TAG, id, text.as_str())
        }
        ChatMessage::Model(ModelMessage::Error { id, text }) => {
            (MODEL_ERROR_TAG, id, text.as_str())
        }
        ChatMessage::Model(ModelMessage::Loading { .. }) => return None,
    };

    let encoded_text = BASE64.encode(text.as_bytes());
    Some(format!(
        "{tag}{FIELD_DELIMITER}{id}{FIELD_DELIMITER}{encoded_text}"
    ))
}

/// Decodes a persisted conversation. Empty input yields an empty list.
pub fn decode(data: &str) -> Vec<ChatMessage> {
    if data.trim().is_empty() {
        return Vec::new();
    }

    data.split(MESSAGE_DELIMITER)
        .filter_map(decode_record)
        .collect()
}

fn decode_record(record: &str) -> Option<ChatMessage> {
    let mut fields = record.splitn(3, FIELD_DELIMITER);
    let tag = fields.next()?;
    let raw_id = fields.next()?;
    let encoded_text = fields.next()?;

    let bytes = match BASE64.decode(encoded_text) {
        Ok(bytes) => bytes,
        Err(error) => {
            tracing::debug!(tag, error = %error, "skipping record with undecodable payload");
            return None;
        }
    };
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(error) => {
            tracing::debug!(tag, error = %error, "skipping record with non-utf8 payload");
            return None;
        }
    };

    let id = MessageId::new(raw_id);
    match tag {
        USER_TAG => Some(ChatMessage::User(UserMessage {
            id,
            text,
            image: None,
        })),
        MODEL_LOADED_TAG => Some(ChatMessage::Model(ModelMessage::Loaded { id, text })),
        MODEL_ERROR_TAG => Some(ChatMessage::Model(ModelMessage::Error { id, text })),
        // Unknown tags are future message kinds, not corruption.
        _ => None,
    }
}
