use std::sync::{Arc, Mutex};

use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::backend::{
    BackendError, BackendFactory, BackendResult, ChatBackend, ChatContext, CompletionsFailedSnafu,
    ContextWorker, HistoryTurn, HttpClientSnafu, MissingApiKeySnafu, Prompt, Role, StreamEvent,
    StreamHandle, make_event_stream,
};

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct RigConfig {
    api_key: String,
    endpoint: String,
    model_id: String,
}

/// Builds OpenAI-compatible backends from credential/model pairs.
pub struct RigBackendFactory {
    endpoint: String,
}

impl RigBackendFactory {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into().trim().to_string();
        Self {
            endpoint: if endpoint.is_empty() {
                DEFAULT_ENDPOINT.to_string()
            } else {
                endpoint
            },
        }
    }
}

impl Default for RigBackendFactory {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT)
    }
}

impl BackendFactory for RigBackendFactory {
    fn create(&self, api_key: &str, model_id: &str) -> BackendResult<Arc<dyn ChatBackend>> {
        let backend = RigChatBackend::new(api_key, self.endpoint.clone(), model_id)?;
        Ok(Arc::new(backend))
    }
}

/// Chat backend over rig's OpenAI provider.
pub struct RigChatBackend {
    config: RigConfig,
}

impl RigChatBackend {
    pub fn new(
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        model_id: impl Into<String>,
    ) -> BackendResult<Self> {
        let config = RigConfig {
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
            model_id: model_id.into().trim().to_string(),
        };
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-backend-new",
                backend_id: "openai".to_string(),
            }
        );

        Ok(Self { config })
    }

    fn build_client(config: &RigConfig) -> BackendResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }
}

impl ChatBackend for RigChatBackend {
    fn start_chat(&self, history: Vec<HistoryTurn>) -> BackendResult<Box<dyn ChatContext>> {
        Ok(Box::new(RigChatContext {
            config: self.config.clone(),
            history: Arc::new(Mutex::new(history)),
        }))
    }
}

/// One established exchange. Turns are committed to the shared history only
/// after a stream completes, so cancelled and failed exchanges never leak
/// into replayed context.
struct RigChatContext {
    config: RigConfig,
    history: Arc<Mutex<Vec<HistoryTurn>>>,
}

impl ChatContext for RigChatContext {
    fn send_stream(&self, prompt: Prompt) -> BackendResult<StreamHandle> {
        if prompt.image.is_some() {
            tracing::warn!(
                model_id = %self.config.model_id,
                "image attachment dropped; the OpenAI-compatible adapter forwards text only"
            );
        }

        let turns = self
            .history
            .lock()
            .map_err(|_| BackendError::Rejected {
                stage: "send-stream-lock-history",
                message: "chat history lock poisoned".to_string(),
            })?
            .clone();

        let (event_tx, stream, cancel_rx) = make_event_stream();
        let worker: ContextWorker = Box::pin(run_stream_worker(
            self.config.clone(),
            turns,
            prompt.text,
            Arc::clone(&self.history),
            event_tx,
            cancel_rx,
        ));

        Ok(StreamHandle { stream, worker })
    }
}

fn to_rig_message(turn: &HistoryTurn) -> RigMessage {
    match turn.role {
        Role::User => RigMessage::user(turn.text.clone()),
        Role::Model => RigMessage::assistant(turn.text.clone()),
    }
}

async fn open_stream(
    config: &RigConfig,
    turns: &[HistoryTurn],
    prompt_text: &str,
) -> BackendResult<RigStreamingResponse> {
    let client = RigChatBackend::build_client(config)?;
    let model = client.completion_model(config.model_id.clone());

    let messages = turns.iter().map(to_rig_message).collect::<Vec<_>>();
    let prompt = RigMessage::user(prompt_text.to_string());

    model
        .completion_request(prompt)
        .messages(messages)
        .stream()
        .await
        .context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
}

fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<StreamEvent>
where
    R: Clone + Unpin,
{
    match item {
        StreamedAssistantContent::Text(text) => Some(StreamEvent::Delta(text.text)),
        // Reasoning traces are not part of the reply text this seam carries.
        StreamedAssistantContent::Reasoning(_)
        | StreamedAssistantContent::ReasoningDelta { .. }
        | StreamedAssistantContent::ToolCall { .. }
        | StreamedAssistantContent::ToolCallDelta { .. }
        | StreamedAssistantContent::Final(_) => None,
    }
}

fn commit_turns(history: &Arc<Mutex<Vec<HistoryTurn>>>, prompt_text: String, reply: String) {
    match history.lock() {
        Ok(mut turns) => {
            turns.push(HistoryTurn::user(prompt_text));
            turns.push(HistoryTurn::model(reply));
        }
        Err(_) => {
            tracing::warn!("chat history lock poisoned; completed turns not committed");
        }
    }
}

async fn run_stream_worker(
    config: RigConfig,
    turns: Vec<HistoryTurn>,
    prompt_text: String,
    history: Arc<Mutex<Vec<HistoryTurn>>>,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let mut stream = match open_stream(&config, &turns, &prompt_text).await {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(
                model_id = %config.model_id,
                error = %error,
                "failed to open backend stream"
            );
            let _ = event_tx.send(StreamEvent::Error(error.to_string()));
            return;
        }
    };

    let mut reply = String::new();
    let mut cancelled = false;
    let mut stream_failed = false;

    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                cancelled = true;
                // Cancel the upstream rig stream so provider IO stops promptly.
                tracing::debug!(model_id = %config.model_id, "backend stream cancelled");
                stream.cancel();
                break;
            }
            next_item = stream.next() => {
                match next_item {
                    Some(Ok(item)) => {
                        if let Some(StreamEvent::Delta(chunk)) = map_stream_item(item) {
                            reply.push_str(&chunk);
                            if event_tx.send(StreamEvent::Delta(chunk)).is_err() {
                                return;
                            }
                        }
                    }
                    Some(Err(source)) => {
                        stream_failed = true;
                        tracing::warn!(
                            model_id = %config.model_id,
                            error = %source,
                            "backend stream emitted an error chunk"
                        );
                        let error = BackendError::CompletionsFailed {
                            stage: "stream-chunk",
                            source,
                        };
                        let _ = event_tx.send(StreamEvent::Error(error.to_string()));
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    if !cancelled && !stream_failed {
        commit_turns(&history, prompt_text, reply);
        let _ = event_tx.send(StreamEvent::Done);
    }
}
