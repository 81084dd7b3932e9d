use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Chat speaker role as replayed into a remote context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Model,
}

/// One prior turn of conversation used to seed a remote context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTurn {
    pub role: Role,
    pub text: String,
}

impl HistoryTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::new(Role::Model, text)
    }
}

/// Outgoing prompt. The image payload is raw bytes; adapters that cannot
/// forward it must still deliver the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub text: String,
    pub image: Option<Vec<u8>>,
}

impl Prompt {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image: None,
        }
    }

    pub fn with_image(text: impl Into<String>, image: Vec<u8>) -> Self {
        Self {
            text: text.into(),
            image: Some(image),
        }
    }
}

/// Incremental stream output.
///
/// `Aborted` is the transport's way of saying "stopped, not failed", so
/// consumers can tear down without surfacing a spurious error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(String),
    Done,
    Error(String),
    Aborted,
}

pub type ContextWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BackendError {
    #[snafu(display("missing API key for backend '{backend_id}'"))]
    MissingApiKey {
        stage: &'static str,
        backend_id: String,
    },
    #[snafu(display("backend request rejected on `{stage}`: {message}"))]
    Rejected {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}

/// Receiving half of one streaming exchange.
///
/// Dropping the stream cancels the producer, so an owner that replaces its
/// handle never leaks a background worker.
pub struct ReplyStream {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

/// A started exchange: the event stream plus the worker future that feeds
/// it. The caller decides where the worker runs.
pub struct StreamHandle {
    pub stream: ReplyStream,
    pub worker: ContextWorker,
}

impl ReplyStream {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<StreamEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.events.try_recv().ok()
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for ReplyStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// An established multi-turn exchange with the backend.
pub trait ChatContext: Send + Sync {
    fn send_stream(&self, prompt: Prompt) -> BackendResult<StreamHandle>;
}

/// A configured backend able to open chat contexts from replayed history.
pub trait ChatBackend: Send + Sync {
    fn start_chat(&self, history: Vec<HistoryTurn>) -> BackendResult<Box<dyn ChatContext>>;
}

/// Builds a backend for one credential/model pair. Invoked on every
/// credential or model hot-swap.
pub trait BackendFactory: Send + Sync {
    fn create(&self, api_key: &str, model_id: &str) -> BackendResult<Arc<dyn ChatBackend>>;
}

pub fn make_event_stream() -> (
    mpsc::UnboundedSender<StreamEvent>,
    ReplyStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (event_tx, ReplyStream::new(event_rx, cancel_tx), cancel_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reply_stream_delivers_events_in_order() {
        let (event_tx, mut stream, _cancel_rx) = make_event_stream();
        event_tx.send(StreamEvent::Delta("a".to_string())).unwrap();
        event_tx.send(StreamEvent::Delta("b".to_string())).unwrap();
        event_tx.send(StreamEvent::Done).unwrap();
        drop(event_tx);

        assert_eq!(
            stream.recv().await,
            Some(StreamEvent::Delta("a".to_string()))
        );
        assert_eq!(
            stream.recv().await,
            Some(StreamEvent::Delta("b".to_string()))
        );
        assert_eq!(stream.recv().await, Some(StreamEvent::Done));
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn dropping_the_stream_signals_cancellation() {
        let (_event_tx, stream, mut cancel_rx) = make_event_stream();
        assert!(cancel_rx.try_recv().is_err());
        drop(stream);
        assert!(cancel_rx.await.is_ok());
    }

    #[tokio::test]
    async fn explicit_cancel_fires_once() {
        let (_event_tx, mut stream, mut cancel_rx) = make_event_stream();
        assert!(stream.cancel());
        assert!(!stream.cancel());
        assert!(cancel_rx.try_recv().is_ok());
    }
}
