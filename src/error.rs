//! Error taxonomy shared by the dispatch, upload and encode paths.
//!
//! Every failure carries a machine-readable [`ErrorCode`] and a human-readable
//! message. The variant of [`ChatError`] is derived from the code, so retry
//! eligibility never depends on message text.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a failure.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Transient,
    Permanent,
    Stream,
}

/// Machine-readable failure code surfaced to the UI.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Local validation; the file codes refine the generic validation failure
    EmptyContent,
    FileTooLarge,
    UnsupportedMediaType,
    EmptyFile,
    TurnInFlight,
    OriginalFileUnavailable,
    NotRetryable,
    // Transient service errors
    Network,
    Timeout,
    ServiceUnavailable,
    FileUnreadable,
    // Permanent rejections
    QuotaExceeded,
    AuthFailed,
    UnsupportedByService,
    InvalidRequest,
    // Stream errors
    MalformedStream,
}

impl ErrorCode {
    pub fn kind(self) -> FailureKind {
        match self {
            ErrorCode::EmptyContent
            | ErrorCode::FileTooLarge
            | ErrorCode::UnsupportedMediaType
            | ErrorCode::EmptyFile
            | ErrorCode::TurnInFlight
            | ErrorCode::OriginalFileUnavailable
            | ErrorCode::NotRetryable => FailureKind::Validation,
            ErrorCode::Network
            | ErrorCode::Timeout
            | ErrorCode::ServiceUnavailable
            | ErrorCode::FileUnreadable => FailureKind::Transient,
            ErrorCode::QuotaExceeded
            | ErrorCode::AuthFailed
            | ErrorCode::UnsupportedByService
            | ErrorCode::InvalidRequest => FailureKind::Permanent,
            ErrorCode::MalformedStream => FailureKind::Stream,
        }
    }

    /// Whether the UI should offer a retry control for this code.
    pub fn is_retryable(self) -> bool {
        matches!(self.kind(), FailureKind::Transient | FailureKind::Stream)
    }

    /// Maps a non-success HTTP status onto a code.
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            401 | 403 => ErrorCode::AuthFailed,
            408 => ErrorCode::Timeout,
            415 => ErrorCode::UnsupportedByService,
            429 => ErrorCode::QuotaExceeded,
            400..=499 => ErrorCode::InvalidRequest,
            _ => ErrorCode::ServiceUnavailable,
        }
    }
}

/// Closed set of failures the pipeline reports.
#[derive(Error, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatError {
    #[error("{message}")]
    Validation { code: ErrorCode, message: String },
    #[error("{message}")]
    Transient { code: ErrorCode, message: String },
    #[error("{message}")]
    Permanent { code: ErrorCode, message: String },
    #[error("{message}")]
    Stream { code: ErrorCode, message: String },
}

impl ChatError {
    /// Builds the variant matching `code`.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match code.kind() {
            FailureKind::Validation => ChatError::Validation { code, message },
            FailureKind::Transient => ChatError::Transient { code, message },
            FailureKind::Permanent => ChatError::Permanent { code, message },
            FailureKind::Stream => ChatError::Stream { code, message },
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ChatError::Validation { code, .. }
            | ChatError::Transient { code, .. }
            | ChatError::Permanent { code, .. }
            | ChatError::Stream { code, .. } => *code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ChatError::Validation { message, .. }
            | ChatError::Transient { message, .. }
            | ChatError::Permanent { message, .. }
            | ChatError::Stream { message, .. } => message,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            ChatError::Validation { .. } => FailureKind::Validation,
            ChatError::Transient { .. } => FailureKind::Transient,
            ChatError::Permanent { .. } => FailureKind::Permanent,
            ChatError::Stream { .. } => FailureKind::Stream,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ChatError::Transient { .. } | ChatError::Stream { .. })
    }

    /// Error for a non-success HTTP response, keeping the service's body text.
    pub fn from_response(status: StatusCode, body: &str) -> Self {
        let detail = body.trim();
        let message = if detail.is_empty() {
            format!("Request failed with status {}", status)
        } else {
            format!("Request failed with status {}: {}", status, detail)
        };
        ChatError::new(ErrorCode::from_status(status), message)
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return ChatError::new(ErrorCode::Timeout, format!("Request timed out: {}", err));
        }
        if let Some(status) = err.status() {
            return ChatError::from_response(status, "");
        }
        if err.is_decode() {
            return ChatError::new(ErrorCode::MalformedStream, format!("Failed to decode response: {}", err));
        }
        ChatError::new(ErrorCode::Network, format!("Network error: {}", err))
    }
}
