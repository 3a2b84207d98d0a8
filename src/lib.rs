// Declare the modules
pub mod api;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod encoder;
pub mod error;
pub mod files;
pub mod intake;
pub mod models;
pub mod render_buffer;
pub mod state;
pub mod storage;
pub mod upload;

#[cfg(test)]
mod test_http;

use crate::api::{GeminiProvider, LLMApiProvider};
use crate::config::{set_api_key_in_keyring, AppConfig, AttachmentMode};
use crate::context::ChatEvent;
use crate::files::{FileReferenceService, GeminiFileService};
use crate::intake::IntakeOutcome;
use crate::models::MessageStatus;
use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use state::AppState;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use storage::StorageManager;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "streamchat")]
#[command(about = "Send a prompt with attachments and stream the reply")]
#[command(version)]
pub struct Cli {
    /// Prompt text
    pub prompt: Option<String>,

    /// Files to attach
    #[arg(short, long = "attach")]
    pub attach: Vec<PathBuf>,

    /// Upload attachments to the file service instead of inlining them
    #[arg(long)]
    pub upload: bool,

    /// Continue an existing chat window
    #[arg(long)]
    pub window: Option<Uuid>,

    /// JSON configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Store an API key in the OS keyring for the default model and exit
    #[arg(long, value_name = "API_KEY", conflicts_with_all = ["prompt", "attach", "window"])]
    pub set_key: Option<String>,
}

/// Saves `api_key` in the keyring and points the default model config at it.
async fn store_api_key(storage: &StorageManager, api_key: &str) -> Result<()> {
    let model_config = storage
        .first_model_config()
        .await?
        .context("No model configuration found")?;
    set_api_key_in_keyring(&model_config, api_key)?;
    storage.set_api_key_ref(model_config.id, "keyring").await?;
    log::info!("API key for '{}' stored in keyring", model_config.name);
    Ok(())
}

pub async fn run(cli: Cli) -> Result<()> {
    // Initialize logging
    env_logger::init();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if cli.upload {
        config.attachment_mode = AttachmentMode::RemoteUpload;
    }

    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("Failed to create data directory {}", config.data_dir.display()))?;
    let storage_manager = StorageManager::new(&config.database_path()).await?;
    storage_manager.add_default_model_config_if_none().await?;

    if let Some(api_key) = cli.set_key.as_deref() {
        store_api_key(&storage_manager, api_key).await?;
        eprintln!("API key stored.");
        return Ok(());
    }

    let api_provider: Arc<dyn LLMApiProvider> = Arc::new(GeminiProvider::new());
    let file_service: Arc<dyn FileReferenceService> = Arc::new(GeminiFileService::new(
        config.upload_api_url.clone(),
        config.upload_chunk_bytes,
    ));
    let app_state = AppState::new(config, storage_manager, api_provider, file_service);

    let window_id = match cli.window {
        Some(id) => id,
        None => {
            let title: String = cli.prompt.as_deref().unwrap_or("New chat").chars().take(40).collect();
            app_state.storage.create_window(&title).await?.id
        }
    };
    let dispatcher = app_state.dispatcher(window_id).await?;

    let mut intake = app_state.intake(dispatcher.credentials().clone());
    for outcome in intake.add_paths(&cli.attach).await {
        match outcome {
            IntakeOutcome::Attached(attachment) => {
                eprintln!("attached {} ({} bytes)", attachment.name, attachment.size);
            }
            IntakeOutcome::Uploading(mut task) => {
                let reference_id = task.reference_id();
                let mut progress = task.progress();
                while let Some(percent) = progress.next().await {
                    log::debug!("Upload {}: {}%", reference_id, percent);
                }
                drop(progress);
                let reference = task.wait().await;
                match reference.error {
                    None => eprintln!("uploaded {} as {}", reference.display_name, reference.uri),
                    Some(error) => eprintln!("upload of {} failed: {}", reference.display_name, error),
                }
            }
            IntakeOutcome::Rejected { name, error } => eprintln!("skipped {}: {}", name, error),
        }
    }
    let outgoing = intake.take_for_send();

    let mut events = dispatcher.context().subscribe();
    let prompt = cli.prompt.unwrap_or_default();
    let Some(handle) = dispatcher.send(&prompt, &outgoing.attachments, &outgoing.file_references)? else {
        eprintln!("Nothing to send.");
        return Ok(());
    };
    let message_id = handle.message_id();

    let printer = tokio::spawn(async move {
        let mut printed = 0usize;
        loop {
            let message = match events.recv().await {
                Ok(ChatEvent::MessageUpdated(message)) => message,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Display fell behind by {} event(s)", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if message.id != message_id {
                continue;
            }
            if let Some(fresh) = message.content.get(printed..) {
                print!("{}", fresh);
                let _ = std::io::stdout().flush();
                printed = message.content.len();
            }
            if message.status.is_terminal() {
                break;
            }
        }
    });

    let stopper = dispatcher.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.cancel();
        }
    });

    let finished = handle.wait().await;
    ctrl_c.abort();
    let _ = printer.await;
    println!();

    match finished {
        Some(message) if message.status == MessageStatus::Error => {
            let error = message
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            anyhow::bail!("Turn failed: {}", error)
        }
        Some(message) => {
            log::info!("Turn {} ended as {:?} in window {}", message.id, message.status, window_id);
            Ok(())
        }
        None => anyhow::bail!("Turn {} was lost", message_id),
    }
}
