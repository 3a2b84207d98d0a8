use crate::error::{ChatError, ErrorCode};
use anyhow::Context;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Lifecycle of a message: pending -> streaming -> {complete | error | cancelled}.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Streaming,
    Complete,
    Error,
    Cancelled,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageStatus::Complete | MessageStatus::Error | MessageStatus::Cancelled
        )
    }

    /// The only legality check for status changes.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Streaming)
                | (Pending, Complete)
                | (Pending, Error)
                | (Streaming, Complete)
                | (Streaming, Error)
                | (Streaming, Cancelled)
        )
    }
}

// Represents a single conversational turn
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub window_id: Uuid,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub file_references: Vec<FileReference>,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ChatError>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(
        window_id: Uuid,
        content: String,
        attachments: Vec<Attachment>,
        file_references: Vec<FileReference>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            window_id,
            role: Role::User,
            content,
            attachments,
            file_references,
            status: MessageStatus::Complete,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn assistant_placeholder(window_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            window_id,
            role: Role::Assistant,
            content: String::new(),
            attachments: Vec::new(),
            file_references: Vec::new(),
            status: MessageStatus::Pending,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Returns a copy moved to `next`, or `None` if the transition is illegal.
    pub fn transitioned(&self, next: MessageStatus) -> Option<Self> {
        if !self.status.can_transition_to(next) {
            return None;
        }
        let mut updated = self.clone();
        updated.status = next;
        Some(updated)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    File,
}

impl AttachmentKind {
    pub fn from_mime(mime_type: &str) -> Self {
        if mime_type.starts_with("image/") {
            AttachmentKind::Image
        } else {
            AttachmentKind::File
        }
    }
}

/// Inline attachment with a base64 payload. Immutable once created.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub id: Uuid,
    pub kind: AttachmentKind,
    pub name: String,
    pub mime_type: String,
    pub data: String,
    pub size: u64,
}

impl Attachment {
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileReferenceStatus {
    Uploading,
    Ready,
    Error,
}

impl FileReferenceStatus {
    pub fn can_transition_to(self, next: FileReferenceStatus) -> bool {
        use FileReferenceStatus::*;
        matches!(
            (self, next),
            (Uploading, Ready) | (Uploading, Error) | (Error, Uploading)
        )
    }
}

/// A file uploaded (or being uploaded) to the remote file-reference service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileReference {
    pub id: Uuid,
    #[serde(default)]
    pub uri: String,
    pub mime_type: String,
    pub display_name: String,
    pub size_bytes: u64,
    pub status: FileReferenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    // Retained for retry; never persisted.
    #[serde(skip)]
    pub original_file: Option<LocalFile>,
}

impl FileReference {
    pub fn uploading(id: Uuid, file: &LocalFile) -> Self {
        Self {
            id,
            uri: String::new(),
            mime_type: file.mime_type.clone(),
            display_name: file.name.clone(),
            size_bytes: file.size,
            status: FileReferenceStatus::Uploading,
            progress: Some(0),
            error: None,
            error_code: None,
            original_file: Some(file.clone()),
        }
    }

    pub fn failed(id: Uuid, file: &LocalFile, err: &ChatError) -> Self {
        Self {
            status: FileReferenceStatus::Error,
            progress: None,
            error: Some(err.message().to_string()),
            error_code: Some(err.code()),
            ..Self::uploading(id, file)
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == FileReferenceStatus::Ready
    }

    /// True when the UI should show a retry control.
    pub fn is_retryable(&self) -> bool {
        self.status == FileReferenceStatus::Error
            && self.original_file.is_some()
            && self.error_code.map(ErrorCode::is_retryable).unwrap_or(false)
    }
}

/// Result returned by the remote file-reference service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UploadedFile {
    pub uri: String,
    pub mime_type: String,
    pub display_name: String,
    pub size_bytes: u64,
}

#[derive(Clone, PartialEq, Eq)]
pub enum FileSource {
    Path(PathBuf),
    Memory(Bytes),
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileSource::Path(path) => f.debug_tuple("Path").field(path).finish(),
            FileSource::Memory(bytes) => write!(f, "Memory({} bytes)", bytes.len()),
        }
    }
}

/// Handle on a user-selected file. Cheap to clone; reading never mutates the source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalFile {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub source: FileSource,
}

impl LocalFile {
    pub async fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Failed to read metadata for {}", path.display()))?;
        if !metadata.is_file() {
            anyhow::bail!("{} is not a regular file", path.display());
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let mime_type = mime_guess::from_path(path).first_or_octet_stream().to_string();
        Ok(Self {
            name,
            mime_type,
            size: metadata.len(),
            source: FileSource::Path(path.to_path_buf()),
        })
    }

    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            size: bytes.len() as u64,
            source: FileSource::Memory(bytes.into()),
        }
    }

    /// In-memory sources are shared, not copied.
    pub async fn read_bytes(&self) -> Result<Bytes, ChatError> {
        match &self.source {
            FileSource::Memory(bytes) => Ok(bytes.clone()),
            FileSource::Path(path) => tokio::fs::read(path).await.map(Bytes::from).map_err(|e| {
                ChatError::new(
                    ErrorCode::FileUnreadable,
                    format!("Failed to read {}: {}", self.name, e),
                )
            }),
        }
    }
}

// Represents the metadata for a chat window
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatWindow {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub title: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_updated_at: DateTime<Utc>,
    pub model_config_id: Uuid,
}

// Represents a configured API endpoint/model
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ModelConfig {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    pub provider: String, // e.g., "gemini"
    pub api_url: String,  // Base URL
    // Reference to the key, not the key itself: 'keyring' or 'env:MY_API_KEY'
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_ref: Option<String>,
    // Provider-specific JSON, e.g. {"model": "gemini-2.0-flash"}
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_options: Option<String>,
}
