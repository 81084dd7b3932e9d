use std::fmt;

use banter_llm::HistoryTurn;
use uuid::Uuid;

/// Process-unique opaque identifier for one message. Stable list key,
/// never reused within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// A turn the user sent. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMessage {
    pub id: MessageId,
    pub text: String,
    pub image: Option<Vec<u8>>,
}

/// A model turn and its delivery state.
///
/// `Loading.text` mirrors the engine's stream accumulator; only the engine
/// writes it. `Loaded` and `Error` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelMessage {
    Loading { id: MessageId, text: String },
    Loaded { id: MessageId, text: String },
    Error { id: MessageId, text: String },
}

impl ModelMessage {
    pub fn id(&self) -> &MessageId {
        match self {
            Self::Loading { id, .. } | Self::Loaded { id, .. } | Self::Error { id, .. } => id,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Loading { text, .. } | Self::Loaded { text, .. } | Self::Error { text, .. } => {
                text
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatMessage {
    User(UserMessage),
    Model(ModelMessage),
}

impl ChatMessage {
    pub fn user(text: impl Into<String>, image: Option<Vec<u8>>) -> Self {
        Self::User(UserMessage {
            id: MessageId::generate(),
            text: text.into(),
            image,
        })
    }

    pub fn loading() -> Self {
        Self::Model(ModelMessage::Loading {
            id: MessageId::generate(),
            text: String::new(),
        })
    }

    pub fn model_error(text: impl Into<String>) -> Self {
        Self::Model(ModelMessage::Error {
            id: MessageId::generate(),
            text: text.into(),
        })
    }

    pub fn id(&self) -> &MessageId {
        match self {
            Self::User(user) => &user.id,
            Self::Model(model) => model.id(),
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Model(ModelMessage::Loading { .. }))
    }

    /// Classifies this message for remote-context replay. Errors and
    /// in-flight placeholders never enter history.
    pub fn history_turn(&self) -> Option<HistoryTurn> {
        match self {
            Self::User(user) => Some(HistoryTurn::user(user.text.clone())),
            Self::Model(ModelMessage::Loaded { text, .. }) => Some(HistoryTurn::model(text.clone())),
            Self::Model(ModelMessage::Loading { .. } | ModelMessage::Error { .. }) => None,
        }
    }
}

/// Human-readable transcript: one entry per message, blank-line separated,
/// in-flight placeholders omitted.
pub fn conversation_text(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter_map(|message| match message {
            ChatMessage::User(user) => Some(format!("User: {}", user.text)),
            ChatMessage::Model(ModelMessage::Loaded { text, .. }) => Some(format!("AI: {text}")),
            ChatMessage::Model(ModelMessage::Error { text, .. }) => Some(format!("Error: {text}")),
            ChatMessage::Model(ModelMessage::Loading { .. }) => None,
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use banter_llm::Role;

    #[test]
    fn generated_ids_are_unique() {
        let first = MessageId::generate();
        let second = MessageId::generate();
        assert_ne!(first, second);
    }

    #[test]
    fn history_replay_excludes_errors_and_placeholders() {
        let messages = vec![
            ChatMessage::user("question", None),
            ChatMessage::Model(ModelMessage::Loaded {
                id: MessageId::generate(),
                text: "answer".to_string(),
            }),
            ChatMessage::model_error("transport exploded"),
            ChatMessage::loading(),
        ];

        let turns: Vec<_> = messages
            .iter()
            .filter_map(ChatMessage::history_turn)
            .collect();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[0].text, "question");
        assert_eq!(turns[1].role, Role::Model);
        assert_eq!(turns[1].text, "answer");
    }

    #[test]
    fn transcript_skips_loading_and_labels_roles() {
        let messages = vec![
            ChatMessage::user("Hello", None),
            ChatMessage::Model(ModelMessage::Loaded {
                id: MessageId::generate(),
                text: "Hi there".to_string(),
            }),
            ChatMessage::loading(),
        ];

        assert_eq!(conversation_text(&messages), "User: Hello\n\nAI: Hi there");
    }

    #[test]
    fn transcript_of_empty_list_is_empty() {
        assert_eq!(conversation_text(&[]), "");
    }
}
