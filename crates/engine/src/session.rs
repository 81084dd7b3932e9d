//! The streaming session engine.
//!
//! One spawned worker task owns the live session; the [`ChatEngine`] handle
//! sends it commands over an unbounded channel and observes state through a
//! watch channel. Every mutation of the message list and flags happens on
//! the worker, so concurrent callers can never interleave partial updates.
//!
//! The active stream is a supersedable resource: starting a new send (or a
//! reset, load, or credential swap) cancels and replaces the previous
//! handle. The worker polls only the current handle's event channel, so a
//! superseded stream's fragments are structurally unobservable and a
//! cancelled exchange never finalizes.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use banter_llm::{
    BackendFactory, ChatBackend, ChatContext, DEFAULT_MODEL, HistoryTurn, Prompt, ReplyStream,
    StreamEvent,
};
use banter_storage::{
    API_KEY_PREFERENCE, ConversationId, ConversationRecord, ConversationStore, MODEL_PREFERENCE,
    PreferenceStore, Storage, current_unix_timestamp_ms,
};

use crate::codec;
use crate::error::{EngineError, EngineResult};
use crate::message::{ChatMessage, MessageId, ModelMessage, conversation_text};

/// Terminal text for a placeholder interrupted by teardown.
pub const INTERRUPTED_MESSAGE: &str = "Response interrupted";
/// Terminal text for a send issued before any remote context exists.
pub const NO_CONTEXT_MESSAGE: &str = "Chat service not initialized";

/// Read-only view of the session, republished after every mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub messages: Vec<ChatMessage>,
    pub can_send_message: bool,
    pub bound_conversation_name: Option<String>,
}

impl SessionSnapshot {
    fn initial() -> Self {
        Self {
            messages: Vec::new(),
            can_send_message: true,
            bound_conversation_name: None,
        }
    }

    pub fn transcript(&self) -> String {
        conversation_text(&self.messages)
    }
}

enum Command {
    Send {
        text: String,
        image: Option<Vec<u8>>,
        ack: oneshot::Sender<()>,
    },
    Reset {
        ack: oneshot::Sender<()>,
    },
    Save {
        name: String,
        reply: oneshot::Sender<EngineResult<ConversationId>>,
    },
    Load {
        record: ConversationRecord,
        ack: oneshot::Sender<()>,
    },
    Delete {
        record: ConversationRecord,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    Stop {
        ack: oneshot::Sender<()>,
    },
    Dispose,
}

/// Handle to one chat session.
///
/// Cheap to clone-share by reference; dropping the last handle closes the
/// command channel and ends the worker, which is also what [`dispose`]
/// does explicitly. [`stop`] is deliberately weaker: it cancels in-flight
/// work but keeps the worker alive, because the surrounding application
/// reuses the engine across view teardown/resume cycles.
///
/// [`dispose`]: ChatEngine::dispose
/// [`stop`]: ChatEngine::stop
pub struct ChatEngine {
    commands: mpsc::UnboundedSender<Command>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
}

impl ChatEngine {
    pub fn spawn(storage: Arc<dyn Storage>, backend_factory: Arc<dyn BackendFactory>) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::initial());

        let worker = SessionWorker {
            storage,
            backend_factory,
            snapshot_tx,
            messages: Vec::new(),
            can_send_message: true,
            backend: None,
            context: None,
            bound_conversation: None,
            active: None,
        };
        tokio::spawn(worker.run(command_rx));

        Self {
            commands: command_tx,
            snapshot_rx,
        }
    }

    /// Subscribes to session snapshots. The receiver always holds the
    /// latest published state.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Deterministic transcript of the current session.
    pub fn conversation_text(&self) -> String {
        self.snapshot_rx.borrow().transcript()
    }

    /// Sends a prompt, superseding any stream still in flight. Resolves
    /// once the send has been applied (user message appended and the
    /// stream opened), not when the reply finishes.
    pub async fn send_message(
        &self,
        text: impl Into<String>,
        image: Option<Vec<u8>>,
    ) -> EngineResult<()> {
        let (ack, done) = oneshot::channel();
        self.command(Command::Send {
            text: text.into(),
            image,
            ack,
        })?;
        await_worker(done, "send-message").await
    }

    /// Cancels any active stream, clears the session, and unbinds the
    /// saved conversation.
    pub async fn reset_conversation(&self) -> EngineResult<()> {
        let (ack, done) = oneshot::channel();
        self.command(Command::Reset { ack })?;
        await_worker(done, "reset-conversation").await
    }

    /// Persists the current messages under a new id and binds the session
    /// to it. The name must be non-empty.
    pub async fn save_conversation(&self, name: impl Into<String>) -> EngineResult<ConversationId> {
        let (reply, done) = oneshot::channel();
        self.command(Command::Save {
            name: name.into(),
            reply,
        })?;
        await_worker(done, "save-conversation").await?
    }

    /// Replaces the session with a persisted conversation and rebuilds the
    /// remote context from its replayable turns.
    pub async fn load_conversation(&self, record: ConversationRecord) -> EngineResult<()> {
        let (ack, done) = oneshot::channel();
        self.command(Command::Load { record, ack })?;
        await_worker(done, "load-conversation").await
    }

    /// Deletes a persisted conversation; if it is the bound one, the
    /// session resets.
    pub async fn delete_conversation(&self, record: ConversationRecord) -> EngineResult<()> {
        let (reply, done) = oneshot::channel();
        self.command(Command::Delete { record, reply })?;
        await_worker(done, "delete-conversation").await?
    }

    /// Teardown: cancels in-flight work and repairs the list, but keeps
    /// the worker alive for a later resume.
    pub async fn stop(&self) -> EngineResult<()> {
        let (ack, done) = oneshot::channel();
        self.command(Command::Stop { ack })?;
        await_worker(done, "stop").await
    }

    /// Ends the worker task entirely. The handle is unusable afterwards.
    pub fn dispose(&self) {
        let _ = self.commands.send(Command::Dispose);
    }

    fn command(&self, command: Command) -> EngineResult<()> {
        self.commands
            .send(command)
            .map_err(|_| EngineError::EngineStopped {
                stage: "send-command",
            })
    }
}

async fn await_worker<T>(done: oneshot::Receiver<T>, stage: &'static str) -> EngineResult<T> {
    done.await.map_err(|_| EngineError::EngineStopped { stage })
}

/// Bookkeeping for the single in-flight exchange.
struct ActiveStream {
    stream: ReplyStream,
    message_id: MessageId,
    accumulator: String,
}

struct SessionWorker {
    storage: Arc<dyn Storage>,
    backend_factory: Arc<dyn BackendFactory>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    messages: Vec<ChatMessage>,
    can_send_message: bool,
    backend: Option<Arc<dyn ChatBackend>>,
    context: Option<Box<dyn ChatContext>>,
    bound_conversation: Option<(ConversationId, String)>,
    active: Option<ActiveStream>,
}

impl SessionWorker {
    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<Command>) {
        let mut api_key_rx = self.storage.watch_preference(API_KEY_PREFERENCE);
        let mut model_rx = self.storage.watch_preference(MODEL_PREFERENCE);

        let api_key = api_key_rx.borrow_and_update().clone();
        let model = model_rx.borrow_and_update().clone();
        self.apply_preferences(api_key, model);
        self.publish();

        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(Command::Dispose) | None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                event = next_stream_event(&mut self.active) => {
                    self.handle_stream_event(event).await;
                }
                changed = api_key_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let api_key = api_key_rx.borrow_and_update().clone();
                    let model = model_rx.borrow_and_update().clone();
                    self.apply_preferences(api_key, model);
                    self.publish();
                }
                changed = model_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let api_key = api_key_rx.borrow_and_update().clone();
                    let model = model_rx.borrow_and_update().clone();
                    self.apply_preferences(api_key, model);
                    self.publish();
                }
            }
        }

        if let Some(mut active) = self.active.take() {
            active.stream.cancel();
        }
        tracing::debug!("session worker disposed");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send { text, image, ack } => {
                self.handle_send(text, image).await;
                let _ = ack.send(());
            }
            Command::Reset { ack } => {
                self.reset_session();
                let _ = ack.send(());
            }
            Command::Save { name, reply } => {
                let _ = reply.send(self.handle_save(name).await);
            }
            Command::Load { record, ack } => {
                self.handle_load(record);
                let _ = ack.send(());
            }
            Command::Delete { record, reply } => {
                let _ = reply.send(self.handle_delete(record).await);
            }
            Command::Stop { ack } => {
                self.handle_stop();
                let _ = ack.send(());
            }
            Command::Dispose => {}
        }
    }

    async fn handle_send(&mut self, text: String, image: Option<Vec<u8>>) {
        // Supersession, not queuing: only the newest request survives.
        self.cancel_active_stream("superseded-by-send");

        self.messages.push(ChatMessage::user(text.clone(), image.clone()));
        self.persist_bound_conversation().await;

        let Some(context) = &self.context else {
            tracing::warn!("send attempted without a remote context");
            self.messages.push(ChatMessage::model_error(NO_CONTEXT_MESSAGE));
            self.can_send_message = true;
            self.publish();
            return;
        };

        match context.send_stream(Prompt { text, image }) {
            Ok(handle) => {
                let placeholder = ChatMessage::loading();
                let message_id = placeholder.id().clone();
                self.messages.push(placeholder);
                self.can_send_message = false;
                tokio::spawn(handle.worker);
                self.active = Some(ActiveStream {
                    stream: handle.stream,
                    message_id,
                    accumulator: String::new(),
                });
            }
            Err(error) => {
                tracing::error!(error = %error, "failed to open reply stream");
                self.messages.push(ChatMessage::model_error(error.to_string()));
                self.can_send_message = true;
                self.persist_bound_conversation().await;
            }
        }
        self.publish();
    }

    async fn handle_stream_event(&mut self, event: Option<StreamEvent>) {
        match event {
            Some(StreamEvent::Delta(chunk)) => {
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                active.accumulator.push_str(&chunk);
                let id = active.message_id.clone();
                let text = active.accumulator.clone();
                self.replace_model_message(ModelMessage::Loading { id, text });
                self.publish();
            }
            Some(StreamEvent::Done) => self.finalize_active_stream(Ok(())).await,
            Some(StreamEvent::Error(description)) => {
                self.finalize_active_stream(Err(description)).await;
            }
            Some(StreamEvent::Aborted) => {
                // Transport stopped without failing; nothing to surface.
                if let Some(active) = self.active.take() {
                    tracing::debug!("stream aborted by transport");
                    self.remove_message(&active.message_id);
                }
                self.can_send_message = true;
                self.publish();
            }
            None => {
                self.finalize_active_stream(Err(
                    "backend stream ended before a terminal event".to_string()
                ))
                .await;
            }
        }
    }

    async fn finalize_active_stream(&mut self, result: Result<(), String>) {
        let Some(active) = self.active.take() else {
            return;
        };

        let replacement = match result {
            Ok(()) => ModelMessage::Loaded {
                id: active.message_id,
                text: active.accumulator,
            },
            Err(description) => {
                tracing::warn!(error = %description, "stream finished with an error");
                ModelMessage::Error {
                    id: active.message_id,
                    text: description,
                }
            }
        };
        self.replace_model_message(replacement);
        self.can_send_message = true;
        self.persist_bound_conversation().await;
        self.publish();
    }

    fn reset_session(&mut self) {
        self.cancel_active_stream("reset");
        self.messages.clear();
        self.bound_conversation = None;
        self.rebuild_context(Vec::new());
        self.publish();
    }

    async fn handle_save(&mut self, name: String) -> EngineResult<ConversationId> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(EngineError::EmptyConversationName {
                stage: "save-conversation",
            });
        }

        let id = ConversationId::generate();
        let record = ConversationRecord::new(
            id,
            name.clone(),
            self.encode_messages(),
            current_unix_timestamp_ms(),
        );
        self.storage
            .upsert_conversation(record)
            .await
            .map_err(|source| EngineError::Storage {
                stage: "save-conversation",
                source,
            })?;

        // Bind so later exchanges keep the persisted copy in sync.
        self.bound_conversation = Some((id, name));
        self.publish();
        Ok(id)
    }

    fn handle_load(&mut self, record: ConversationRecord) {
        self.cancel_active_stream("load-conversation");

        let decoded = codec::decode(&record.messages);
        let history = decoded
            .iter()
            .filter_map(ChatMessage::history_turn)
            .collect();

        // Hard replace: prior in-memory messages are discarded, not merged.
        self.messages = decoded;
        self.bound_conversation = Some((record.id, record.name));
        self.rebuild_context(history);
        self.publish();
    }

    async fn handle_delete(&mut self, record: ConversationRecord) -> EngineResult<()> {
        self.storage
            .delete_conversation(record.id)
            .await
            .map_err(|source| EngineError::Storage {
                stage: "delete-conversation",
                source,
            })?;

        if self
            .bound_conversation
            .as_ref()
            .is_some_and(|(bound_id, _)| *bound_id == record.id)
        {
            self.reset_session();
        }
        Ok(())
    }

    fn handle_stop(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.stream.cancel();
            // Mark the dangling placeholder so a resume does not silently
            // resurrect a dead stream.
            self.replace_model_message(ModelMessage::Error {
                id: active.message_id,
                text: INTERRUPTED_MESSAGE.to_string(),
            });
        }
        self.can_send_message = true;
        self.publish();
    }

    /// Credential/model hot-swap. A context rebuilt mid-stream cancels the
    /// stream first; the old context handle is replaced, never mutated.
    fn apply_preferences(&mut self, api_key: Option<String>, model: Option<String>) {
        let Some(api_key) = api_key.filter(|key| !key.trim().is_empty()) else {
            return;
        };
        let model_id = model
            .filter(|model| !model.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        match self.backend_factory.create(&api_key, &model_id) {
            Ok(backend) => {
                self.cancel_active_stream("credential-or-model-change");
                let history = if self.context.is_some() {
                    // Preserve the visible conversation across the swap.
                    self.messages
                        .iter()
                        .filter_map(ChatMessage::history_turn)
                        .collect()
                } else {
                    greeting_history()
                };
                self.backend = Some(backend);
                self.rebuild_context(history);
                tracing::info!(model_id = %model_id, "rebuilt chat context from preferences");
            }
            Err(error) => {
                tracing::error!(error = %error, "failed to build chat backend from preferences");
            }
        }
    }

    fn rebuild_context(&mut self, history: Vec<HistoryTurn>) {
        self.context = match &self.backend {
            Some(backend) => match backend.start_chat(history) {
                Ok(context) => Some(context),
                Err(error) => {
                    tracing::error!(error = %error, "failed to start chat context");
                    None
                }
            },
            None => None,
        };
    }

    /// Silent cancellation path shared by supersession, reset, load, and
    /// hot-swap: the in-flight placeholder is removed, never finalized.
    fn cancel_active_stream(&mut self, cause: &'static str) {
        if let Some(mut active) = self.active.take() {
            active.stream.cancel();
            tracing::debug!(cause, "cancelled in-flight stream");
            self.remove_message(&active.message_id);
            self.can_send_message = true;
        }
    }

    async fn persist_bound_conversation(&mut self) {
        let Some((id, name)) = self.bound_conversation.clone() else {
            return;
        };

        let record =
            ConversationRecord::new(id, name, self.encode_messages(), current_unix_timestamp_ms());
        if let Err(error) = self.storage.upsert_conversation(record).await {
            tracing::error!(conversation_id = %id, error = %error, "failed to persist conversation");
        }
    }

    fn encode_messages(&self) -> String {
        let persistable: Vec<ChatMessage> = self
            .messages
            .iter()
            .filter(|message| !message.is_loading())
            .cloned()
            .collect();
        codec::encode(&persistable)
    }

    fn replace_model_message(&mut self, replacement: ModelMessage) {
        let id = replacement.id().clone();
        if let Some(slot) = self
            .messages
            .iter_mut()
            .find(|message| *message.id() == id)
        {
            *slot = ChatMessage::Model(replacement);
        }
    }

    fn remove_message(&mut self, id: &MessageId) {
        self.messages.retain(|message| message.id() != id);
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(SessionSnapshot {
            messages: self.messages.clone(),
            can_send_message: self.can_send_message,
            bound_conversation_name: self
                .bound_conversation
                .as_ref()
                .map(|(_, name)| name.clone()),
        });
    }
}

async fn next_stream_event(active: &mut Option<ActiveStream>) -> Option<StreamEvent> {
    match active.as_mut() {
        Some(active) => active.stream.recv().await,
        None => std::future::pending().await,
    }
}

fn greeting_history() -> Vec<HistoryTurn> {
    vec![
        HistoryTurn::user("Hello AI."),
        HistoryTurn::model("Great to meet you. What would you like to know?"),
    ]
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use banter_llm::{
        BackendError, BackendResult, ChatBackend, ChatContext, ContextWorker, StreamHandle,
        make_event_stream,
    };
    use banter_storage::MemoryStore;

    use super::*;

    #[derive(Debug, Clone)]
    enum Script {
        Reply(Vec<&'static str>),
        Fail {
            after: Vec<&'static str>,
            error: &'static str,
        },
        Abort {
            after: Vec<&'static str>,
        },
        Hang,
        RejectSend,
    }

    #[derive(Default)]
    struct BackendLog {
        scripts: Mutex<VecDeque<Script>>,
        started_histories: Mutex<Vec<Vec<HistoryTurn>>>,
        prompts: Mutex<Vec<Prompt>>,
        created_models: Mutex<Vec<String>>,
    }

    impl BackendLog {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                ..Self::default()
            })
        }

        fn histories(&self) -> Vec<Vec<HistoryTurn>> {
            self.started_histories.lock().unwrap().clone()
        }

        fn prompts(&self) -> Vec<Prompt> {
            self.prompts.lock().unwrap().clone()
        }

        fn models(&self) -> Vec<String> {
            self.created_models.lock().unwrap().clone()
        }
    }

    struct ScriptedFactory {
        log: Arc<BackendLog>,
    }

    impl BackendFactory for ScriptedFactory {
        fn create(&self, _api_key: &str, model_id: &str) -> BackendResult<Arc<dyn ChatBackend>> {
            self.log.created_models.lock().unwrap().push(model_id.to_string());
            Ok(Arc::new(ScriptedBackend {
                log: Arc::clone(&self.log),
            }))
        }
    }

    struct ScriptedBackend {
        log: Arc<BackendLog>,
    }

    impl ChatBackend for ScriptedBackend {
        fn start_chat(&self, history: Vec<HistoryTurn>) -> BackendResult<Box<dyn ChatContext>> {
            self.log.started_histories.lock().unwrap().push(history);
            Ok(Box::new(ScriptedContext {
                log: Arc::clone(&self.log),
            }))
        }
    }

    struct ScriptedContext {
        log: Arc<BackendLog>,
    }

    impl ChatContext for ScriptedContext {
        fn send_stream(&self, prompt: Prompt) -> BackendResult<StreamHandle> {
            self.log.prompts.lock().unwrap().push(prompt);
            let script = self
                .log
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Script::Hang);

            if let Script::RejectSend = script {
                return Err(BackendError::Rejected {
                    stage: "scripted-send",
                    message: "scripted rejection".to_string(),
                });
            }

            let (event_tx, stream, cancel_rx) = make_event_stream();
            let worker: ContextWorker = Box::pin(async move {
                match script {
                    Script::Reply(fragments) => {
                        for fragment in fragments {
                            let _ = event_tx.send(StreamEvent::Delta(fragment.to_string()));
                        }
                        let _ = event_tx.send(StreamEvent::Done);
                    }
                    Script::Fail { after, error } => {
                        for fragment in after {
                            let _ = event_tx.send(StreamEvent::Delta(fragment.to_string()));
                        }
                        let _ = event_tx.send(StreamEvent::Error(error.to_string()));
                    }
                    Script::Abort { after } => {
                        for fragment in after {
                            let _ = event_tx.send(StreamEvent::Delta(fragment.to_string()));
                        }
                        let _ = event_tx.send(StreamEvent::Aborted);
                    }
                    Script::Hang => {
                        let _ = cancel_rx.await;
                    }
                    Script::RejectSend => unreachable!("handled above"),
                }
            });

            Ok(StreamHandle { stream, worker })
        }
    }

    struct Harness {
        engine: ChatEngine,
        storage: Arc<MemoryStore>,
        log: Arc<BackendLog>,
        snapshots: watch::Receiver<SessionSnapshot>,
    }

    async fn harness(scripts: Vec<Script>, with_credential: bool) -> Harness {
        let storage = Arc::new(MemoryStore::new());
        if with_credential {
            storage
                .set_preference(API_KEY_PREFERENCE, "test-key")
                .await
                .unwrap();
        }

        let log = BackendLog::new(scripts);
        let engine = ChatEngine::spawn(
            storage.clone(),
            Arc::new(ScriptedFactory {
                log: Arc::clone(&log),
            }),
        );
        let snapshots = engine.subscribe();

        Harness {
            engine,
            storage,
            log,
            snapshots,
        }
    }

    async fn wait_for(
        snapshots: &mut watch::Receiver<SessionSnapshot>,
        predicate: impl Fn(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let snapshot = snapshots.borrow_and_update();
                    if predicate(&snapshot) {
                        return snapshot.clone();
                    }
                }
                snapshots.changed().await.unwrap();
            }
        })
        .await
        .expect("timed out waiting for session snapshot")
    }

    fn settled(snapshot: &SessionSnapshot) -> bool {
        snapshot.can_send_message && !snapshot.messages.is_empty()
    }

    fn last_loaded_text(snapshot: &SessionSnapshot) -> Option<&str> {
        match snapshot.messages.last() {
            Some(ChatMessage::Model(ModelMessage::Loaded { text, .. })) => Some(text),
            _ => None,
        }
    }

    fn last_error_text(snapshot: &SessionSnapshot) -> Option<&str> {
        match snapshot.messages.last() {
            Some(ChatMessage::Model(ModelMessage::Error { text, .. })) => Some(text),
            _ => None,
        }
    }

    #[tokio::test]
    async fn send_accumulates_fragments_into_one_loaded_message() {
        let mut h = harness(vec![Script::Reply(vec!["Hel", "lo ", "there"])], true).await;

        h.engine.send_message("Hello", None).await.unwrap();
        let snapshot = wait_for(&mut h.snapshots, settled).await;

        assert_eq!(snapshot.messages.len(), 2);
        assert!(matches!(&snapshot.messages[0], ChatMessage::User(user) if user.text == "Hello"));
        assert_eq!(last_loaded_text(&snapshot), Some("Hello there"));

        let transcript = snapshot.transcript();
        assert!(transcript.contains("User: Hello"));
        assert!(transcript.contains("AI: Hello there"));

        // First run seeds the fixed greeting history.
        assert_eq!(h.log.histories()[0], greeting_history());
        assert_eq!(h.log.prompts().len(), 1);
        assert_eq!(h.log.prompts()[0].text, "Hello");
    }

    #[tokio::test]
    async fn newer_send_supersedes_a_hanging_stream() {
        let mut h = harness(vec![Script::Hang, Script::Reply(vec!["reply"])], true).await;

        h.engine.send_message("A", None).await.unwrap();
        assert!(!h.engine.snapshot().can_send_message);

        h.engine.send_message("B", None).await.unwrap();
        let snapshot = wait_for(&mut h.snapshots, settled).await;

        // Exactly one terminal message, from the newest send; nothing from
        // the superseded one.
        assert_eq!(snapshot.messages.len(), 3);
        assert!(matches!(&snapshot.messages[0], ChatMessage::User(user) if user.text == "A"));
        assert!(matches!(&snapshot.messages[1], ChatMessage::User(user) if user.text == "B"));
        assert_eq!(last_loaded_text(&snapshot), Some("reply"));
    }

    #[tokio::test]
    async fn send_without_context_fails_fast_and_keeps_sending_enabled() {
        let mut h = harness(Vec::new(), false).await;

        h.engine.send_message("Hello", None).await.unwrap();
        let snapshot = wait_for(&mut h.snapshots, settled).await;

        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(last_error_text(&snapshot), Some(NO_CONTEXT_MESSAGE));
        assert!(snapshot.can_send_message);
        assert!(h.log.histories().is_empty());
    }

    #[tokio::test]
    async fn rejected_stream_open_surfaces_a_terminal_error() {
        let mut h = harness(vec![Script::RejectSend], true).await;

        h.engine.send_message("Hello", None).await.unwrap();
        let snapshot = wait_for(&mut h.snapshots, settled).await;

        assert!(snapshot.can_send_message);
        assert!(
            last_error_text(&snapshot)
                .is_some_and(|text| text.contains("scripted rejection"))
        );
    }

    #[tokio::test]
    async fn mid_stream_failure_replaces_the_placeholder_with_an_error() {
        let mut h = harness(
            vec![Script::Fail {
                after: vec!["partial"],
                error: "connection reset",
            }],
            true,
        )
        .await;

        h.engine.send_message("Hello", None).await.unwrap();
        let snapshot = wait_for(&mut h.snapshots, |s| {
            s.can_send_message && last_error_text(s).is_some()
        })
        .await;

        assert_eq!(snapshot.messages.len(), 2);
        assert!(
            last_error_text(&snapshot).is_some_and(|text| text.contains("connection reset"))
        );
    }

    #[tokio::test]
    async fn transport_abort_is_silent() {
        let mut h = harness(
            vec![Script::Abort {
                after: vec!["half a"],
            }],
            true,
        )
        .await;

        h.engine.send_message("Hello", None).await.unwrap();
        let snapshot = wait_for(&mut h.snapshots, settled).await;

        // Only the user message remains; no error, no loaded reply.
        assert_eq!(snapshot.messages.len(), 1);
        assert!(matches!(&snapshot.messages[0], ChatMessage::User(_)));
        assert!(snapshot.can_send_message);
    }

    #[tokio::test]
    async fn reset_clears_state_and_reseeds_an_empty_context() {
        let mut h = harness(vec![Script::Reply(vec!["answer"])], true).await;

        h.engine.send_message("question", None).await.unwrap();
        wait_for(&mut h.snapshots, settled).await;

        h.engine.reset_conversation().await.unwrap();
        let snapshot = h.engine.snapshot();

        assert!(snapshot.messages.is_empty());
        assert!(snapshot.can_send_message);
        assert_eq!(snapshot.bound_conversation_name, None);
        assert_eq!(h.log.histories().last().unwrap(), &Vec::<HistoryTurn>::new());
    }

    #[tokio::test]
    async fn save_rejects_blank_names() {
        let h = harness(Vec::new(), true).await;

        let result = h.engine.save_conversation("   ").await;
        assert!(matches!(
            result,
            Err(EngineError::EmptyConversationName { .. })
        ));
        assert!(h.storage.watch_conversations().borrow().is_empty());
    }

    #[tokio::test]
    async fn empty_session_saves_and_loads_back_empty() {
        let h = harness(Vec::new(), true).await;

        let id = h.engine.save_conversation("fresh start").await.unwrap();
        let record = h.storage.watch_conversations().borrow()[0].clone();
        assert_eq!(record.id, id);
        assert_eq!(record.name, "fresh start");

        h.engine.load_conversation(record).await.unwrap();
        let snapshot = h.engine.snapshot();
        assert!(snapshot.messages.is_empty());
        assert_eq!(
            snapshot.bound_conversation_name.as_deref(),
            Some("fresh start")
        );
    }

    #[tokio::test]
    async fn bound_conversation_tracks_later_exchanges() {
        let mut h = harness(vec![Script::Reply(vec!["the answer"])], true).await;

        h.engine.save_conversation("notes").await.unwrap();
        h.engine.send_message("the question", None).await.unwrap();
        wait_for(&mut h.snapshots, |s| {
            s.can_send_message && last_loaded_text(s).is_some()
        })
        .await;

        let record = h.storage.watch_conversations().borrow()[0].clone();
        let persisted = codec::decode(&record.messages);
        assert_eq!(persisted.len(), 2);
        assert!(matches!(&persisted[0], ChatMessage::User(user) if user.text == "the question"));
        assert!(matches!(
            &persisted[1],
            ChatMessage::Model(ModelMessage::Loaded { text, .. }) if text == "the answer"
        ));
    }

    #[tokio::test]
    async fn load_replaces_messages_and_replays_history_without_errors() {
        let h = harness(Vec::new(), true).await;
        h.engine.send_message("stale", None).await.unwrap();

        let saved = vec![
            ChatMessage::user("q1", None),
            ChatMessage::Model(ModelMessage::Loaded {
                id: MessageId::generate(),
                text: "a1".to_string(),
            }),
            ChatMessage::model_error("old failure"),
        ];
        let record = ConversationRecord::new(
            ConversationId::generate(),
            "restored",
            codec::encode(&saved),
            current_unix_timestamp_ms(),
        );

        h.engine.load_conversation(record).await.unwrap();
        let snapshot = h.engine.snapshot();

        assert_eq!(snapshot.messages, saved);
        assert_eq!(snapshot.bound_conversation_name.as_deref(), Some("restored"));

        let replayed = h.log.histories().last().unwrap().clone();
        assert_eq!(
            replayed,
            vec![HistoryTurn::user("q1"), HistoryTurn::model("a1")]
        );
    }

    #[tokio::test]
    async fn deleting_the_bound_conversation_resets_the_session() {
        let mut h = harness(vec![Script::Reply(vec!["hi"])], true).await;

        h.engine.send_message("hello", None).await.unwrap();
        wait_for(&mut h.snapshots, settled).await;
        h.engine.save_conversation("doomed").await.unwrap();

        let record = h.storage.watch_conversations().borrow()[0].clone();
        h.engine.delete_conversation(record).await.unwrap();

        let snapshot = h.engine.snapshot();
        assert!(snapshot.messages.is_empty());
        assert_eq!(snapshot.bound_conversation_name, None);
        assert!(h.storage.watch_conversations().borrow().is_empty());
    }

    #[tokio::test]
    async fn deleting_an_unrelated_conversation_keeps_the_session() {
        let mut h = harness(vec![Script::Reply(vec!["hi"])], true).await;

        h.engine.send_message("hello", None).await.unwrap();
        wait_for(&mut h.snapshots, settled).await;

        let unrelated = ConversationRecord::new(
            ConversationId::generate(),
            "other",
            String::new(),
            current_unix_timestamp_ms(),
        );
        h.storage
            .upsert_conversation(unrelated.clone())
            .await
            .unwrap();
        h.engine.delete_conversation(unrelated).await.unwrap();

        assert_eq!(h.engine.snapshot().messages.len(), 2);
    }

    #[tokio::test]
    async fn hot_swap_mid_stream_cancels_and_replays_in_memory_history() {
        let mut h = harness(vec![Script::Hang], true).await;

        h.engine.send_message("A", None).await.unwrap();
        assert!(!h.engine.snapshot().can_send_message);

        h.storage
            .set_preference(MODEL_PREFERENCE, "bigger-model")
            .await
            .unwrap();

        let snapshot = wait_for(&mut h.snapshots, |s| s.can_send_message).await;

        // The hanging stream was cancelled; its placeholder vanished with it.
        assert_eq!(snapshot.messages.len(), 1);
        assert!(matches!(&snapshot.messages[0], ChatMessage::User(user) if user.text == "A"));

        assert_eq!(h.log.models(), vec!["gpt-4o-mini", "bigger-model"]);
        let histories = h.log.histories();
        assert_eq!(histories[0], greeting_history());
        assert_eq!(histories[1], vec![HistoryTurn::user("A")]);
    }

    #[tokio::test]
    async fn stop_marks_a_dangling_placeholder_interrupted_and_allows_resume() {
        let mut h = harness(vec![Script::Hang, Script::Reply(vec!["back"])], true).await;

        h.engine.send_message("A", None).await.unwrap();
        h.engine.stop().await.unwrap();

        let snapshot = h.engine.snapshot();
        assert!(snapshot.can_send_message);
        assert_eq!(last_error_text(&snapshot), Some(INTERRUPTED_MESSAGE));

        // The engine instance survives teardown; a later send works and the
        // dead stream stays dead.
        h.engine.send_message("B", None).await.unwrap();
        let snapshot = wait_for(&mut h.snapshots, |s| {
            s.can_send_message && last_loaded_text(s).is_some()
        })
        .await;

        assert_eq!(snapshot.messages.len(), 4);
        assert_eq!(last_loaded_text(&snapshot), Some("back"));
    }

    #[tokio::test]
    async fn commands_fail_cleanly_after_dispose() {
        let h = harness(Vec::new(), true).await;

        h.engine.dispose();
        let result =
            tokio::time::timeout(Duration::from_secs(5), h.engine.send_message("late", None))
                .await
                .expect("dispose must not leave callers hanging");
        assert!(matches!(result, Err(EngineError::EngineStopped { .. })));
    }
}
