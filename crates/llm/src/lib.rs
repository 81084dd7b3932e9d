pub mod backend;
pub mod rig_backend;

pub use backend::{
    BackendError, BackendFactory, BackendResult, ChatBackend, ChatContext, ContextWorker,
    DEFAULT_MODEL, HistoryTurn, Prompt, ReplyStream, Role, StreamEvent, StreamHandle,
    make_event_stream,
};
pub use rig_backend::{DEFAULT_ENDPOINT, RigBackendFactory, RigChatBackend};
