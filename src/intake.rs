//! Entry point for files picked, dropped or pasted into the composer.
//!
//! Routes each file to inline encoding or remote upload according to the
//! configured mode and hands out what a send needs.

use crate::config::{AttachmentMode, Credentials};
use crate::encoder::AttachmentEncoder;
use crate::error::{ChatError, ErrorCode};
use crate::models::{Attachment, FileReference, LocalFile};
use crate::upload::{FileUploadCoordinator, UploadTask};
use chrono::{DateTime, Local};
use std::path::Path;
use uuid::Uuid;

/// Name given to clipboard images, which have no file name of their own.
pub fn pasted_file_name(mime_type: &str, timestamp: DateTime<Local>) -> String {
    let extension = mime_guess::get_mime_extensions_str(mime_type)
        .and_then(|extensions| extensions.first())
        .copied()
        .unwrap_or("bin");
    format!("pasted-image-{}.{}", timestamp.format("%Y%m%d-%H%M%S"), extension)
}

pub enum IntakeOutcome {
    Attached(Attachment),
    Uploading(UploadTask),
    Rejected { name: String, error: ChatError },
}

/// What a send takes from the composer.
#[derive(Debug, Default)]
pub struct Outgoing {
    pub attachments: Vec<Attachment>,
    pub file_references: Vec<FileReference>,
}

pub struct AttachmentIntake {
    mode: AttachmentMode,
    encoder: AttachmentEncoder,
    coordinator: FileUploadCoordinator,
    credentials: Credentials,
    attachments: Vec<Attachment>,
}

impl AttachmentIntake {
    pub fn new(
        mode: AttachmentMode,
        encoder: AttachmentEncoder,
        coordinator: FileUploadCoordinator,
        credentials: Credentials,
    ) -> Self {
        Self {
            mode,
            encoder,
            coordinator,
            credentials,
            attachments: Vec::new(),
        }
    }

    pub fn mode(&self) -> AttachmentMode {
        self.mode
    }

    pub fn coordinator(&self) -> &FileUploadCoordinator {
        &self.coordinator
    }

    /// Inline attachments waiting for the next send.
    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    pub async fn add_file(&mut self, file: LocalFile) -> IntakeOutcome {
        match self.mode {
            AttachmentMode::Inline => match self.encoder.encode(&file).await {
                Ok(attachment) => {
                    self.attachments.push(attachment.clone());
                    IntakeOutcome::Attached(attachment)
                }
                Err(error) => {
                    log::warn!("Could not attach {}: {}", file.name, error);
                    IntakeOutcome::Rejected {
                        name: file.name,
                        error,
                    }
                }
            },
            AttachmentMode::RemoteUpload => {
                IntakeOutcome::Uploading(self.coordinator.upload(file, self.credentials.clone()))
            }
        }
    }

    /// Adds files from disk one by one; a bad path only affects itself.
    pub async fn add_paths<P: AsRef<Path>>(&mut self, paths: &[P]) -> Vec<IntakeOutcome> {
        let mut outcomes = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let outcome = match LocalFile::from_path(path).await {
                Ok(file) => self.add_file(file).await,
                Err(e) => {
                    log::warn!("Could not open {}: {:?}", path.display(), e);
                    IntakeOutcome::Rejected {
                        name: path.display().to_string(),
                        error: ChatError::new(ErrorCode::FileUnreadable, format!("{:#}", e)),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    pub async fn add_pasted(&mut self, mime_type: &str, bytes: Vec<u8>, timestamp: DateTime<Local>) -> IntakeOutcome {
        let name = pasted_file_name(mime_type, timestamp);
        self.add_file(LocalFile::from_bytes(name, mime_type, bytes)).await
    }

    pub fn remove_attachment(&mut self, id: Uuid) -> bool {
        let before = self.attachments.len();
        self.attachments.retain(|a| a.id != id);
        self.attachments.len() != before
    }

    /// Takes inline attachments and ready references for a send. References
    /// still uploading or failed stay in the working set.
    pub fn take_for_send(&mut self) -> Outgoing {
        Outgoing {
            attachments: std::mem::take(&mut self.attachments),
            file_references: self.coordinator.consume_ready(),
        }
    }
}
