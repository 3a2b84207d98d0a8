//! Inline attachment encoding for when remote upload is not in use.

use crate::error::{ChatError, ErrorCode};
use crate::models::{Attachment, AttachmentKind, LocalFile};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use uuid::Uuid;

/// Outcome of local file validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileCheck {
    Pass,
    Fail { code: ErrorCode, reason: String },
}

impl FileCheck {
    pub fn is_pass(&self) -> bool {
        matches!(self, FileCheck::Pass)
    }

    pub fn into_result(self) -> Result<(), ChatError> {
        match self {
            FileCheck::Pass => Ok(()),
            FileCheck::Fail { code, reason } => Err(ChatError::new(code, reason)),
        }
    }
}

/// Size ceiling and media-type allowlist. Entries are exact types
/// (`application/pdf`) or wildcards (`image/*`); an empty list allows all.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachmentPolicy {
    pub max_bytes: u64,
    pub allowed_mime_types: Vec<String>,
}

impl AttachmentPolicy {
    pub fn new(max_bytes: u64, allowed_mime_types: Vec<String>) -> Self {
        Self {
            max_bytes,
            allowed_mime_types,
        }
    }

    pub fn allows_mime(&self, mime_type: &str) -> bool {
        if self.allowed_mime_types.is_empty() {
            return true;
        }
        let mime_type = mime_type.to_ascii_lowercase();
        self.allowed_mime_types.iter().any(|allowed| {
            match allowed.strip_suffix("/*") {
                Some(prefix) => mime_type
                    .split_once('/')
                    .map(|(top, _)| top == prefix)
                    .unwrap_or(false),
                None => *allowed == mime_type,
            }
        })
    }

    pub fn check(&self, file: &LocalFile) -> FileCheck {
        if file.size == 0 {
            return FileCheck::Fail {
                code: ErrorCode::EmptyFile,
                reason: format!("{} is empty", file.name),
            };
        }
        if file.size > self.max_bytes {
            return FileCheck::Fail {
                code: ErrorCode::FileTooLarge,
                reason: format!(
                    "{} is {} bytes, larger than the {} byte limit",
                    file.name, file.size, self.max_bytes
                ),
            };
        }
        if !self.allows_mime(&file.mime_type) {
            return FileCheck::Fail {
                code: ErrorCode::UnsupportedMediaType,
                reason: format!("{} has unsupported type {}", file.name, file.mime_type),
            };
        }
        FileCheck::Pass
    }
}

pub struct AttachmentEncoder {
    policy: AttachmentPolicy,
}

impl AttachmentEncoder {
    pub fn new(policy: AttachmentPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &AttachmentPolicy {
        &self.policy
    }

    pub fn validate(&self, file: &LocalFile) -> FileCheck {
        self.policy.check(file)
    }

    pub async fn encode(&self, file: &LocalFile) -> Result<Attachment, ChatError> {
        self.validate(file).into_result()?;

        let bytes = file.read_bytes().await?;
        // Declared size may be stale; the ceiling applies to what was read.
        if bytes.len() as u64 > self.policy.max_bytes {
            return Err(ChatError::new(
                ErrorCode::FileTooLarge,
                format!("{} grew past the {} byte limit", file.name, self.policy.max_bytes),
            ));
        }

        log::debug!("Encoded attachment {} ({} bytes)", file.name, bytes.len());
        Ok(Attachment {
            id: Uuid::new_v4(),
            kind: AttachmentKind::from_mime(&file.mime_type),
            name: file.name.clone(),
            mime_type: file.mime_type.clone(),
            data: STANDARD.encode(&bytes),
            size: bytes.len() as u64,
        })
    }

    /// Encodes every file independently; results keep the input order.
    pub async fn encode_all(&self, files: &[LocalFile]) -> Vec<Result<Attachment, ChatError>> {
        let mut results = Vec::with_capacity(files.len());
        for file in files {
            let result = self.encode(file).await;
            if let Err(e) = &result {
                log::warn!("Skipping attachment {}: {}", file.name, e);
            }
            results.push(result);
        }
        results
    }
}
