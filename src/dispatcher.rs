//! Lifecycle of one outgoing turn: validate, call the backend, feed the
//! render buffer, cancel, finalize.

use crate::api::{ChatRequest, LLMApiProvider};
use crate::config::Credentials;
use crate::context::ChatContext;
use crate::error::{ChatError, ErrorCode};
use crate::models::{Attachment, FileReference, Message, MessageStatus, ModelConfig, Role};
use crate::render_buffer::StreamRenderBuffer;
use crate::storage::ChatStore;
use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// The backend a dispatcher talks to.
#[derive(Clone)]
pub struct Backend {
    pub provider: Arc<dyn LLMApiProvider>,
    pub model: ModelConfig,
    pub credentials: Credentials,
}

#[derive(Clone, Debug)]
pub struct DispatchSettings {
    pub render_delay: Duration,
    pub system_instruction: Option<String>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            render_delay: Duration::from_millis(100),
            system_instruction: None,
        }
    }
}

struct ActiveTurn {
    message_id: Uuid,
    cancel_tx: watch::Sender<bool>,
}

/// Awaitable handle on a dispatched turn.
pub struct TurnHandle {
    message_id: Uuid,
    context: ChatContext,
    handle: JoinHandle<Message>,
}

impl TurnHandle {
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// Waits for the turn to reach a terminal state and returns the assistant message.
    pub async fn wait(self) -> Option<Message> {
        match self.handle.await {
            Ok(message) => Some(message),
            Err(e) => {
                log::error!("Turn task for {} did not complete: {}", self.message_id, e);
                self.context.get(self.message_id)
            }
        }
    }
}

#[derive(Clone)]
pub struct MessageDispatcher {
    context: ChatContext,
    backend: Backend,
    settings: DispatchSettings,
    store: Option<Arc<dyn ChatStore>>,
    active: Arc<Mutex<Option<ActiveTurn>>>,
}

impl MessageDispatcher {
    pub fn new(context: ChatContext, backend: Backend, settings: DispatchSettings) -> Self {
        Self {
            context,
            backend,
            settings,
            store: None,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Persists user and assistant messages once each turn ends.
    pub fn with_store(mut self, store: Arc<dyn ChatStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.settings.system_instruction = Some(instruction.into());
        self
    }

    pub fn context(&self) -> &ChatContext {
        &self.context
    }

    pub fn credentials(&self) -> &Credentials {
        &self.backend.credentials
    }

    /// Sends a user turn.
    ///
    /// Returns `Ok(None)` without creating anything when there is no text, no
    /// attachment and no ready file reference. Only ready references are sent;
    /// the rest are left out of the turn. The caller's inputs are not modified.
    pub fn send(
        &self,
        content: &str,
        attachments: &[Attachment],
        file_references: &[FileReference],
    ) -> Result<Option<TurnHandle>, ChatError> {
        let ready: Vec<FileReference> = file_references
            .iter()
            .filter(|r| r.is_ready())
            .map(|r| FileReference {
                original_file: None,
                ..r.clone()
            })
            .collect();
        let skipped = file_references.len() - ready.len();
        if skipped > 0 {
            log::debug!("Leaving {} file reference(s) that are not ready out of the turn", skipped);
        }

        if content.trim().is_empty() && attachments.is_empty() && ready.is_empty() {
            log::debug!("Ignoring empty send in window {}", self.context.window_id());
            return Ok(None);
        }

        let mut active = self.lock_active();
        if let Some(in_flight) = self.context.in_flight() {
            return Err(ChatError::new(
                ErrorCode::TurnInFlight,
                format!("Message {} is still in progress", in_flight.id),
            ));
        }

        let window_id = self.context.window_id();
        let user = Message::user(window_id, content.to_string(), attachments.to_vec(), ready);
        let assistant = Message::assistant_placeholder(window_id);
        let message_id = assistant.id;

        let mut history = self.history();
        history.push(user.clone());
        let request = ChatRequest {
            model: self.backend.model.clone(),
            credentials: self.backend.credentials.clone(),
            system_instruction: self.settings.system_instruction.clone(),
            messages: history,
        };

        self.context.push(user.clone());
        self.context.push(assistant);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        *active = Some(ActiveTurn {
            message_id,
            cancel_tx,
        });
        drop(active);

        log::info!(
            "Dispatching turn {} in window {} ({} attachment(s), {} file reference(s))",
            message_id,
            window_id,
            user.attachments.len(),
            user.file_references.len()
        );
        let handle = tokio::spawn(self.clone().run_turn(request, user, message_id, cancel_rx));
        Ok(Some(TurnHandle {
            message_id,
            context: self.context.clone(),
            handle,
        }))
    }

    /// Sends the most recent user message again as a fresh turn.
    pub fn resend_last(&self) -> Result<Option<TurnHandle>, ChatError> {
        let last_user = self
            .context
            .messages()
            .into_iter()
            .rev()
            .find(|m| m.role == Role::User)
            .ok_or_else(|| ChatError::new(ErrorCode::EmptyContent, "Nothing to resend"))?;
        self.send(
            &last_user.content,
            &last_user.attachments,
            &last_user.file_references,
        )
    }

    /// Stops the streaming turn, if any. Content already rendered stays.
    /// Returns whether a turn was cancelled.
    pub fn cancel(&self) -> bool {
        let active = self.lock_active();
        let Some(turn) = active.as_ref() else {
            return false;
        };
        let streaming = self
            .context
            .get(turn.message_id)
            .map(|m| m.status == MessageStatus::Streaming)
            .unwrap_or(false);
        if !streaming {
            return false;
        }
        let cancelled = self.context.cancel(turn.message_id).is_some();
        turn.cancel_tx.send_replace(true);
        if cancelled {
            log::warn!("Cancellation requested for message {}. Stopping stream.", turn.message_id);
        }
        cancelled
    }

    /// Prior messages worth sending back to the backend. A question whose
    /// reply failed or was cancelled before any text is left out with it.
    fn history(&self) -> Vec<Message> {
        let messages = self.context.messages();
        let answered = |m: &Message| match m.status {
            MessageStatus::Complete => true,
            MessageStatus::Cancelled => !m.content.is_empty(),
            _ => false,
        };
        messages
            .iter()
            .enumerate()
            .filter(|(i, m)| {
                if !answered(m) {
                    return false;
                }
                match (m.role, messages.get(i + 1)) {
                    (Role::User, Some(reply)) if reply.role == Role::Assistant => answered(reply),
                    _ => true,
                }
            })
            .map(|(_, m)| m.clone())
            .collect()
    }

    async fn run_turn(
        self,
        request: ChatRequest,
        user: Message,
        message_id: Uuid,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Message {
        self.persist(&user).await;

        let sink_context = self.context.clone();
        let mut buffer = StreamRenderBuffer::new(move |content: String| {
            sink_context.set_content(message_id, &content);
        });

        match self.backend.provider.send_chat_stream_request(&request).await {
            Err(e) => {
                log::error!("Failed to initiate stream request for {}: {}", message_id, e);
                self.context.fail(message_id, e);
            }
            Ok(mut deltas) => {
                let mut full_content = String::new();
                let mut first_chunk = true;
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel_rx.changed() => {
                            buffer.cancel();
                            break;
                        }
                        next = deltas.next() => next,
                    };
                    match next {
                        Some(Ok(delta)) => {
                            if delta.is_empty() {
                                continue;
                            }
                            full_content.push_str(&delta);
                            if first_chunk {
                                first_chunk = false;
                                if self.context.transition(message_id, MessageStatus::Streaming).is_none() {
                                    break;
                                }
                            }
                            log::debug!("Turn {}: received chunk ({} chars so far)", message_id, full_content.len());
                            buffer.update(full_content.clone(), self.settings.render_delay, false);
                        }
                        Some(Err(e)) => {
                            log::error!("Turn {}: error receiving stream delta: {}", message_id, e);
                            buffer.update(full_content.clone(), Duration::ZERO, true);
                            self.context.fail(message_id, e);
                            break;
                        }
                        None => {
                            buffer.update(full_content.clone(), Duration::ZERO, true);
                            self.context.transition(message_id, MessageStatus::Complete);
                            break;
                        }
                    }
                }
                // Dropping the stream stops the backend call.
                drop(deltas);
            }
        }
        drop(buffer);

        {
            let mut active = self.lock_active();
            if active.as_ref().map(|t| t.message_id) == Some(message_id) {
                *active = None;
            }
        }

        let Some(finished) = self.context.get(message_id) else {
            log::warn!("Turn {} finished after its message was removed", message_id);
            return Message::assistant_placeholder(self.context.window_id());
        };
        log::info!("Turn {} finished with status {:?}", message_id, finished.status);
        self.persist(&finished).await;
        finished
    }

    async fn persist(&self, message: &Message) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save_message(message).await {
            log::error!("Failed to save message {}: {:?}", message.id, e);
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveTurn>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::DeltaStream;
    use crate::context::ChatEvent;
    use crate::models::{ChatWindow, FileReferenceStatus, LocalFile};
    use crate::storage::StorageManager;
    use async_trait::async_trait;
    use futures::stream;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;
    use tokio::time::sleep;

    type Delta = Result<String, ChatError>;

    enum Script {
        Reject(ChatError),
        Items(Vec<Delta>),
        Channel(mpsc::UnboundedReceiver<Delta>),
    }

    #[derive(Default)]
    struct FakeBackend {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl FakeBackend {
        fn with(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LLMApiProvider for FakeBackend {
        async fn send_chat_stream_request(&self, request: &ChatRequest) -> Result<DeltaStream, ChatError> {
            self.requests.lock().unwrap().push(request.clone());
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Script::Items(vec![]));
            match script {
                Script::Reject(e) => Err(e),
                Script::Items(items) => Ok(Box::pin(stream::iter(items))),
                Script::Channel(rx) => Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                }))),
            }
        }
    }

    fn model() -> ModelConfig {
        ModelConfig {
            id: Uuid::new_v4(),
            name: "Fake".into(),
            provider: "gemini".into(),
            api_url: "https://example.invalid".into(),
            api_key_ref: None,
            provider_options: Some(r#"{"model":"fake"}"#.into()),
        }
    }

    fn dispatcher(backend: Arc<FakeBackend>, delay_ms: u64) -> MessageDispatcher {
        let backend = Backend {
            provider: backend,
            model: model(),
            credentials: Credentials::new("key"),
        };
        let settings = DispatchSettings {
            render_delay: Duration::from_millis(delay_ms),
            system_instruction: Some("Be helpful.".into()),
        };
        MessageDispatcher::new(ChatContext::new(Uuid::new_v4()), backend, settings)
    }

    fn text(s: &str) -> Delta {
        Ok(s.to_string())
    }

    fn reference(status: FileReferenceStatus) -> FileReference {
        let file = LocalFile::from_bytes("doc.pdf", "application/pdf", vec![1; 8]);
        let mut reference = FileReference::uploading(Uuid::new_v4(), &file);
        reference.status = status;
        if status == FileReferenceStatus::Ready {
            reference.uri = "https://files.example/doc".into();
            reference.progress = None;
        }
        reference
    }

    #[tokio::test]
    async fn empty_send_is_a_no_op() {
        let backend = FakeBackend::with(vec![]);
        let dispatcher = dispatcher(backend.clone(), 10);

        assert!(dispatcher.send("", &[], &[]).unwrap().is_none());
        assert!(dispatcher.send("  \n\t", &[], &[]).unwrap().is_none());
        let not_ready = [
            reference(FileReferenceStatus::Uploading),
            reference(FileReferenceStatus::Error),
        ];
        assert!(dispatcher.send("", &[], &not_ready).unwrap().is_none());

        assert!(dispatcher.context().messages().is_empty());
        assert!(backend.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_with_only_ready_reference_keeps_just_that_reference() {
        let backend = FakeBackend::with(vec![Script::Items(vec![text("ok")])]);
        let dispatcher = dispatcher(backend.clone(), 10);
        let ready = reference(FileReferenceStatus::Ready);
        let refs = vec![reference(FileReferenceStatus::Uploading), ready.clone()];

        let handle = dispatcher.send("", &[], &refs).unwrap().unwrap();
        handle.wait().await.unwrap();

        let user = &dispatcher.context().messages()[0];
        assert_eq!(user.role, Role::User);
        assert_eq!(user.file_references.len(), 1);
        assert_eq!(user.file_references[0].id, ready.id);
        assert!(user.file_references[0].original_file.is_none());
        // Caller's list is untouched.
        assert_eq!(refs.len(), 2);
        assert!(refs[1].original_file.is_some());
    }

    #[tokio::test]
    async fn streamed_turn_completes_with_full_content() {
        let backend = FakeBackend::with(vec![Script::Items(vec![text("Hel"), text(""), text("lo")])]);
        let dispatcher = dispatcher(backend.clone(), 50);
        let mut events = dispatcher.context().subscribe();

        let handle = dispatcher.send("Hi", &[], &[]).unwrap().unwrap();
        let message_id = handle.message_id();
        let finished = handle.wait().await.unwrap();

        assert_eq!(finished.id, message_id);
        assert_eq!(finished.status, MessageStatus::Complete);
        assert_eq!(finished.content, "Hello");

        let mut statuses = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                ChatEvent::MessageAdded(m) | ChatEvent::MessageUpdated(m) if m.id == message_id => {
                    if statuses.last() != Some(&m.status) {
                        statuses.push(m.status);
                    }
                }
                _ => {}
            }
        }
        assert_eq!(
            statuses,
            vec![MessageStatus::Pending, MessageStatus::Streaming, MessageStatus::Complete]
        );

        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests[0].messages.len(), 1);
        assert_eq!(requests[0].messages[0].content, "Hi");
        assert_eq!(requests[0].system_instruction.as_deref(), Some("Be helpful."));
    }

    #[tokio::test]
    async fn empty_stream_completes_without_streaming() {
        let backend = FakeBackend::with(vec![Script::Items(vec![])]);
        let dispatcher = dispatcher(backend, 10);

        let finished = dispatcher.send("Hi", &[], &[]).unwrap().unwrap().wait().await.unwrap();
        assert_eq!(finished.status, MessageStatus::Complete);
        assert!(finished.content.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn render_updates_are_debounced() {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = FakeBackend::with(vec![Script::Channel(rx)]);
        let dispatcher = dispatcher(backend, 300);

        let handle = dispatcher.send("Hi", &[], &[]).unwrap().unwrap();
        let id = handle.message_id();
        for chunk in ["a", "b", "c"] {
            tx.send(text(chunk)).unwrap();
            sleep(Duration::from_millis(10)).await;
        }
        let message = dispatcher.context().get(id).unwrap();
        assert_eq!(message.status, MessageStatus::Streaming);
        assert_eq!(message.content, "");

        sleep(Duration::from_millis(300)).await;
        assert_eq!(dispatcher.context().get(id).unwrap().content, "abc");

        tx.send(text("d")).unwrap();
        drop(tx);
        let finished = handle.wait().await.unwrap();
        // Stream end flushes without waiting for the debounce window.
        assert_eq!(finished.content, "abcd");
        assert_eq!(finished.status, MessageStatus::Complete);
    }

    #[tokio::test]
    async fn mid_stream_error_keeps_partial_content() {
        let network = ChatError::new(ErrorCode::Network, "connection reset");
        let backend = FakeBackend::with(vec![Script::Items(vec![
            text("partial "),
            text("answer"),
            Err(network.clone()),
            text("never"),
        ])]);
        let dispatcher = dispatcher(backend, 1_000);
        let mut events = dispatcher.context().subscribe();

        let finished = dispatcher.send("Hi", &[], &[]).unwrap().unwrap().wait().await.unwrap();
        assert_eq!(finished.status, MessageStatus::Error);
        assert_eq!(finished.content, "partial answer");
        assert_eq!(finished.error, Some(network.clone()));

        let mut failure = None;
        while let Ok(event) = events.try_recv() {
            if let ChatEvent::TurnFailed { error, .. } = event {
                failure = Some(error);
            }
        }
        assert_eq!(failure, Some(network));
    }

    #[tokio::test]
    async fn failure_before_content_goes_straight_to_error() {
        let auth = ChatError::new(ErrorCode::AuthFailed, "invalid API key");
        let backend = FakeBackend::with(vec![Script::Reject(auth.clone())]);
        let dispatcher = dispatcher(backend, 10);
        let mut events = dispatcher.context().subscribe();

        let handle = dispatcher.send("Hi", &[], &[]).unwrap().unwrap();
        let id = handle.message_id();
        let finished = handle.wait().await.unwrap();

        assert_eq!(finished.status, MessageStatus::Error);
        assert!(finished.content.is_empty());
        assert!(!finished.error.unwrap().is_retryable());
        while let Ok(event) = events.try_recv() {
            if let ChatEvent::MessageUpdated(m) = event {
                assert!(m.id != id || m.status != MessageStatus::Streaming);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_freezes_last_committed_content() {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = FakeBackend::with(vec![Script::Channel(rx)]);
        let dispatcher = dispatcher(backend, 300);

        assert!(!dispatcher.cancel());
        let handle = dispatcher.send("Hi", &[], &[]).unwrap().unwrap();
        let id = handle.message_id();

        tx.send(text("Hel")).unwrap();
        sleep(Duration::from_millis(400)).await;
        assert_eq!(dispatcher.context().get(id).unwrap().content, "Hel");

        tx.send(text("lo")).unwrap();
        sleep(Duration::from_millis(10)).await;
        assert!(dispatcher.cancel());
        assert!(!dispatcher.cancel());

        // Late events from the backend are ignored.
        let _ = tx.send(text(" world"));
        sleep(Duration::from_secs(1)).await;

        let finished = handle.wait().await.unwrap();
        assert_eq!(finished.status, MessageStatus::Cancelled);
        assert_eq!(finished.content, "Hel");
        assert_eq!(dispatcher.context().get(id).unwrap().content, "Hel");
    }

    #[tokio::test(start_paused = true)]
    async fn one_turn_at_a_time() {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = FakeBackend::with(vec![
            Script::Channel(rx),
            Script::Items(vec![text("second")]),
        ]);
        let dispatcher = dispatcher(backend.clone(), 10);

        let first = dispatcher.send("one", &[], &[]).unwrap().unwrap();
        let err = dispatcher.send("two", &[], &[]).err().unwrap();
        assert_eq!(err.code(), ErrorCode::TurnInFlight);

        tx.send(text("first")).unwrap();
        drop(tx);
        first.wait().await.unwrap();

        let second = dispatcher.send("two", &[], &[]).unwrap().unwrap();
        assert_eq!(second.wait().await.unwrap().content, "second");

        let requests = backend.requests.lock().unwrap();
        let history: Vec<&str> = requests[1].messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(history, vec!["one", "first", "two"]);
    }

    #[tokio::test]
    async fn resend_after_error_starts_fresh_turn() {
        let backend = FakeBackend::with(vec![
            Script::Reject(ChatError::new(ErrorCode::ServiceUnavailable, "busy")),
            Script::Items(vec![text("recovered")]),
        ]);
        let dispatcher = dispatcher(backend.clone(), 10);

        let failed = dispatcher.send("question", &[], &[]).unwrap().unwrap().wait().await.unwrap();
        assert_eq!(failed.status, MessageStatus::Error);

        let retried = dispatcher.resend_last().unwrap().unwrap().wait().await.unwrap();
        assert_ne!(retried.id, failed.id);
        assert_eq!(retried.content, "recovered");
        assert_eq!(
            dispatcher.context().get(failed.id).unwrap().status,
            MessageStatus::Error
        );

        let requests = backend.requests.lock().unwrap();
        let history: Vec<&str> = requests[1].messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(history, vec!["question"]);
    }

    #[tokio::test]
    async fn history_skips_questions_whose_reply_failed() {
        let backend = FakeBackend::with(vec![
            Script::Items(vec![text("first answer")]),
            Script::Reject(ChatError::new(ErrorCode::QuotaExceeded, "quota")),
            Script::Items(vec![text("third answer")]),
        ]);
        let dispatcher = dispatcher(backend.clone(), 10);

        for prompt in ["first", "second", "third", "fourth"] {
            dispatcher.send(prompt, &[], &[]).unwrap().unwrap().wait().await.unwrap();
        }

        let requests = backend.requests.lock().unwrap();
        let history: Vec<&str> = requests[3].messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(history, vec!["first", "first answer", "third", "third answer", "fourth"]);
    }

    #[tokio::test]
    async fn finished_turn_is_persisted() {
        let storage = Arc::new(StorageManager::in_memory().await.unwrap());
        let backend = FakeBackend::with(vec![Script::Items(vec![text("stored")])]);
        let dispatcher = dispatcher(backend, 10).with_store(storage.clone());
        let window = ChatWindow {
            id: dispatcher.context().window_id(),
            title: "Test".into(),
            created_at: chrono::Utc::now(),
            last_updated_at: chrono::Utc::now(),
            model_config_id: Uuid::new_v4(),
        };
        storage.save_window(&window).await.unwrap();

        dispatcher.send("save me", &[], &[]).unwrap().unwrap().wait().await.unwrap();

        let stored = storage.load_messages(window.id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].content, "save me");
        assert_eq!(stored[1].content, "stored");
        assert_eq!(stored[1].status, MessageStatus::Complete);
    }
}
