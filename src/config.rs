use crate::encoder::AttachmentPolicy;
use crate::models::ModelConfig;
use anyhow::{Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const KEYRING_SERVICE_PREFIX: &str = "streamchat_api_key";
const ENV_PREFIX: &str = "STREAMCHAT_";

/// Where a newly selected file goes.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentMode {
    #[default]
    Inline,
    RemoteUpload,
}

/// Application settings. Loaded from an optional JSON file, then overridden
/// by `STREAMCHAT_*` environment variables.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub render_delay_ms: u64,
    pub attachment_mode: AttachmentMode,
    pub inline_max_bytes: u64,
    pub upload_max_bytes: u64,
    pub allowed_mime_types: Vec<String>,
    pub system_instruction: Option<String>,
    pub upload_api_url: String,
    pub upload_chunk_bytes: usize,
}

/// Per-user data directory, falling back to the working directory when the
/// platform has none.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("streamchat"))
        .unwrap_or_else(|| PathBuf::from(".streamchat"))
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            render_delay_ms: 100,
            attachment_mode: AttachmentMode::Inline,
            inline_max_bytes: 20 * 1024 * 1024,
            upload_max_bytes: 2 * 1024 * 1024 * 1024,
            allowed_mime_types: vec![
                "image/*".to_string(),
                "text/*".to_string(),
                "audio/*".to_string(),
                "video/*".to_string(),
                "application/pdf".to_string(),
                "application/json".to_string(),
            ],
            system_instruction: None,
            upload_api_url: "https://generativelanguage.googleapis.com".to_string(),
            upload_chunk_bytes: 256 * 1024,
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Applies `STREAMCHAT_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(dir) = var("DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(ms) = var("RENDER_DELAY_MS") {
            self.render_delay_ms = ms
                .parse()
                .with_context(|| format!("Invalid STREAMCHAT_RENDER_DELAY_MS '{}'", ms))?;
        }
        if let Some(mode) = var("ATTACHMENT_MODE") {
            self.attachment_mode = match mode.as_str() {
                "inline" => AttachmentMode::Inline,
                "remote_upload" | "upload" => AttachmentMode::RemoteUpload,
                other => anyhow::bail!("Unsupported STREAMCHAT_ATTACHMENT_MODE '{}'", other),
            };
        }
        if let Some(bytes) = var("INLINE_MAX_BYTES") {
            self.inline_max_bytes = bytes
                .parse()
                .with_context(|| format!("Invalid STREAMCHAT_INLINE_MAX_BYTES '{}'", bytes))?;
        }
        if let Some(bytes) = var("UPLOAD_MAX_BYTES") {
            self.upload_max_bytes = bytes
                .parse()
                .with_context(|| format!("Invalid STREAMCHAT_UPLOAD_MAX_BYTES '{}'", bytes))?;
        }
        if let Some(text) = var("SYSTEM_INSTRUCTION") {
            self.system_instruction = Some(text);
        }
        if let Some(url) = var("UPLOAD_API_URL") {
            self.upload_api_url = url;
        }
        Ok(())
    }

    pub fn render_delay(&self) -> Duration {
        Duration::from_millis(self.render_delay_ms)
    }

    pub fn inline_policy(&self) -> AttachmentPolicy {
        AttachmentPolicy::new(self.inline_max_bytes, self.allowed_mime_types.clone())
    }

    pub fn upload_policy(&self) -> AttachmentPolicy {
        AttachmentPolicy::new(self.upload_max_bytes, self.allowed_mime_types.clone())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("streamchat.sqlite")
    }
}

/// API credentials. The key never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    api_key: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("api_key", &"<redacted>").finish()
    }
}

// --- API Key Retrieval ---

/// Retrieves the API key for a given model configuration.
/// `api_key_ref` selects an environment variable (`env:NAME`) or the OS keyring.
pub fn get_api_key(config: &ModelConfig) -> Result<Credentials> {
    match config.api_key_ref.as_deref() {
        Some(ref_str) if ref_str.starts_with("env:") => {
            let env_var_name = ref_str.trim_start_matches("env:");
            log::debug!("Retrieving API key from environment variable: {}", env_var_name);
            std::env::var(env_var_name)
                .map(Credentials::new)
                .context(format!(
                    "Failed to get API key from environment variable '{}'",
                    env_var_name
                ))
        }
        Some("keyring") => {
            let service_name = format!("{}-{}", KEYRING_SERVICE_PREFIX, config.id);
            let entry = Entry::new(&service_name, &config.name)
                .context("Failed to create keyring entry")?;
            log::debug!("Retrieving API key from keyring for service: {}", service_name);
            entry.get_password().map(Credentials::new).context(format!(
                "Failed to get API key from keyring for '{}'. Please set it first.",
                config.name
            ))
        }
        Some(other) => Err(anyhow::anyhow!("Unsupported api_key_ref format: {}", other)),
        None => Err(anyhow::anyhow!(
            "API key reference not set for model config '{}'",
            config.name
        )),
    }
}

/// Stores an API key in the OS keyring for the given model configuration.
pub fn set_api_key_in_keyring(config: &ModelConfig, api_key: &str) -> Result<()> {
    let service_name = format!("{}-{}", KEYRING_SERVICE_PREFIX, config.id);
    let entry = Entry::new(&service_name, &config.name)
        .context("Failed to create keyring entry for setting password")?;
    log::info!("Setting API key in keyring for service: {}", service_name);
    entry.set_password(api_key).context(format!(
        "Failed to set API key in keyring for '{}'",
        config.name
    ))
}
