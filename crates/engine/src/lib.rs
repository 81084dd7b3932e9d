pub mod codec;
pub mod error;
pub mod message;
pub mod session;

pub use error::{EngineError, EngineResult};
pub use message::{ChatMessage, MessageId, ModelMessage, UserMessage, conversation_text};
pub use session::{ChatEngine, INTERRUPTED_MESSAGE, NO_CONTEXT_MESSAGE, SessionSnapshot};
