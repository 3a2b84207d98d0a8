use crate::api::LLMApiProvider;
use crate::config::{get_api_key, AppConfig, Credentials};
use crate::context::ChatContext;
use crate::dispatcher::{Backend, DispatchSettings, MessageDispatcher};
use crate::encoder::AttachmentEncoder;
use crate::files::FileReferenceService;
use crate::intake::AttachmentIntake;
use crate::storage::{ChatStore, StorageManager};
use crate::upload::FileUploadCoordinator;
use anyhow::{Context, Result};
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

// Core application state shared by every chat window
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub storage: StorageManager,
    pub api_provider: Arc<dyn LLMApiProvider>,
    pub file_service: Arc<dyn FileReferenceService>,
    // One dispatcher per open window, keyed by window id
    dispatchers: Arc<DashMap<Uuid, MessageDispatcher>>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        storage: StorageManager,
        api_provider: Arc<dyn LLMApiProvider>,
        file_service: Arc<dyn FileReferenceService>,
    ) -> Self {
        Self {
            config,
            storage,
            api_provider,
            file_service,
            dispatchers: Arc::new(DashMap::new()),
        }
    }

    /// Returns the dispatcher of `window_id`, building it from stored history
    /// on first use.
    pub async fn dispatcher(&self, window_id: Uuid) -> Result<MessageDispatcher> {
        if let Some(existing) = self.dispatchers.get(&window_id) {
            return Ok(existing.value().clone());
        }

        let window = self
            .storage
            .list_windows()
            .await?
            .into_iter()
            .find(|w| w.id == window_id)
            .with_context(|| format!("Chat window {} not found", window_id))?;
        let model = self
            .storage
            .get_model_config(window.model_config_id)
            .await?
            .with_context(|| format!("Model config {} not found", window.model_config_id))?;
        let credentials = get_api_key(&model)?;
        let history = self.storage.load_messages(window_id).await?;
        log::info!("Opening window {} with {} stored message(s)", window_id, history.len());

        let backend = Backend {
            provider: Arc::clone(&self.api_provider),
            model,
            credentials,
        };
        let settings = DispatchSettings {
            render_delay: self.config.render_delay(),
            system_instruction: self.config.system_instruction.clone(),
        };
        let store: Arc<dyn ChatStore> = Arc::new(self.storage.clone());
        let dispatcher =
            MessageDispatcher::new(ChatContext::with_messages(window_id, history), backend, settings)
                .with_store(store);

        // A concurrent open may have won; keep whichever got there first.
        Ok(self
            .dispatchers
            .entry(window_id)
            .or_insert(dispatcher)
            .value()
            .clone())
    }

    /// A fresh composer intake using the configured attachment mode.
    pub fn intake(&self, credentials: Credentials) -> AttachmentIntake {
        AttachmentIntake::new(
            self.config.attachment_mode,
            AttachmentEncoder::new(self.config.inline_policy()),
            FileUploadCoordinator::new(Arc::clone(&self.file_service), self.config.upload_policy()),
            credentials,
        )
    }

    /// Stops generation in `window_id`, if a turn is streaming there.
    pub fn stop_generation(&self, window_id: Uuid) -> bool {
        match self.dispatchers.get(&window_id) {
            Some(dispatcher) => dispatcher.cancel(),
            None => false,
        }
    }

    /// Forgets the in-memory state of a window. Stored history is kept.
    pub fn close_window(&self, window_id: Uuid) {
        if let Some((_, dispatcher)) = self.dispatchers.remove(&window_id) {
            dispatcher.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ChatRequest, DeltaStream};
    use crate::error::{ChatError, ErrorCode};
    use crate::files::ProgressReporter;
    use crate::models::{LocalFile, MessageStatus, ModelConfig, UploadedFile};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;

    struct Echo;

    #[async_trait]
    impl LLMApiProvider for Echo {
        async fn send_chat_stream_request(&self, request: &ChatRequest) -> Result<DeltaStream, ChatError> {
            let last = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Ok(Box::pin(stream::iter(vec![Ok::<_, ChatError>(format!("echo: {}", last))])))
        }
    }

    struct NoUploads;

    #[async_trait]
    impl FileReferenceService for NoUploads {
        async fn upload(
            &self,
            file: &LocalFile,
            _bytes: Bytes,
            _credentials: &Credentials,
            _progress: ProgressReporter,
        ) -> Result<UploadedFile, ChatError> {
            Err(ChatError::new(
                ErrorCode::UnsupportedByService,
                format!("{} cannot be uploaded", file.name),
            ))
        }
    }

    async fn app_state() -> AppState {
        std::env::set_var("STREAMCHAT_TEST_STATE_KEY", "test-key");
        let storage = StorageManager::in_memory().await.unwrap();
        storage
            .add_model_config(&ModelConfig {
                id: Uuid::new_v4(),
                name: "Echo".into(),
                provider: "gemini".into(),
                api_url: "https://example.invalid".into(),
                api_key_ref: Some("env:STREAMCHAT_TEST_STATE_KEY".into()),
                provider_options: None,
            })
            .await
            .unwrap();
        let config = AppConfig {
            render_delay_ms: 1,
            ..AppConfig::default()
        };
        AppState::new(config, storage, Arc::new(Echo), Arc::new(NoUploads))
    }

    #[tokio::test]
    async fn reopened_window_restores_history() {
        let state = app_state().await;
        let window = state.storage.create_window("Chat").await.unwrap();

        let dispatcher = state.dispatcher(window.id).await.unwrap();
        let reply = dispatcher
            .send("ping", &[], &[])
            .unwrap()
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(reply.content, "echo: ping");
        assert_eq!(reply.status, MessageStatus::Complete);

        state.close_window(window.id);
        let reopened = state.dispatcher(window.id).await.unwrap();
        let contents: Vec<String> = reopened
            .context()
            .messages()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["ping", "echo: ping"]);
    }

    #[tokio::test]
    async fn unknown_window_is_an_error() {
        let state = app_state().await;
        assert!(state.dispatcher(Uuid::new_v4()).await.is_err());
        assert!(!state.stop_generation(Uuid::new_v4()));
    }
}
