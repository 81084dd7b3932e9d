use snafu::Snafu;

use banter_storage::StorageError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("conversation name must not be empty"))]
    EmptyConversationName { stage: &'static str },
    #[snafu(display("session engine is no longer running"))]
    EngineStopped { stage: &'static str },
    #[snafu(display("storage operation failed on `{stage}`, {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
}

pub type EngineResult<T> = Result<T, EngineError>;
