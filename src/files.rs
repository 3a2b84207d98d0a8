//! Remote file-reference service: the collaborator the upload coordinator
//! talks to, and its resumable-upload HTTP implementation.

use crate::config::Credentials;
use crate::error::{ChatError, ErrorCode};
use crate::models::{LocalFile, UploadedFile};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use reqwest::header::CONTENT_LENGTH;
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use std::sync::Arc;

/// Receives byte-level progress from a service implementation.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn Fn(u64, u64) + Send + Sync>,
}

impl ProgressReporter {
    pub fn new(sink: impl Fn(u64, u64) + Send + Sync + 'static) -> Self {
        Self { sink: Arc::new(sink) }
    }

    pub fn report(&self, sent: u64, total: u64) {
        (self.sink)(sent, total);
    }
}

#[async_trait]
pub trait FileReferenceService: Send + Sync {
    async fn upload(
        &self,
        file: &LocalFile,
        bytes: Bytes,
        credentials: &Credentials,
        progress: ProgressReporter,
    ) -> Result<UploadedFile, ChatError>;
}

#[derive(Deserialize, Debug)]
struct UploadResponse {
    file: RemoteFile,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RemoteFile {
    uri: String,
    mime_type: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default, deserialize_with = "size_from_string_or_number")]
    size_bytes: Option<u64>,
}

// The service encodes int64 fields as JSON strings.
fn size_from_string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        Some(serde_json::Value::Number(n)) => n.as_u64(),
        _ => None,
    })
}

/// Splits `bytes` into chunks that share its buffer, reporting cumulative
/// progress as each chunk is handed to the transport.
fn chunk_stream(
    bytes: Bytes,
    chunk_size: usize,
    progress: ProgressReporter,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + Sync + 'static {
    let total = bytes.len();
    let chunk_size = chunk_size.max(1);
    stream::iter((0..total).step_by(chunk_size)).map(move |start| {
        let end = (start + chunk_size).min(total);
        progress.report(end as u64, total as u64);
        Ok(bytes.slice(start..end))
    })
}

pub struct GeminiFileService {
    client: Client,
    base_url: String,
    chunk_size: usize,
}

impl GeminiFileService {
    pub fn new(base_url: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            chunk_size,
        }
    }

    async fn start_session(&self, file: &LocalFile, total: u64, credentials: &Credentials) -> Result<String, ChatError> {
        let start_url = format!("{}/upload/v1beta/files", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&start_url)
            .header("x-goog-api-key", credentials.api_key())
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", total)
            .header("X-Goog-Upload-Header-Content-Type", file.mime_type.as_str())
            .json(&serde_json::json!({ "file": { "display_name": file.name } }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            log::error!("Upload session for {} rejected with status {}: {}", file.name, status, body);
            return Err(ChatError::from_response(status, &body));
        }

        response
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                ChatError::new(
                    ErrorCode::ServiceUnavailable,
                    "Upload session response did not include an upload URL",
                )
            })
    }
}

#[async_trait]
impl FileReferenceService for GeminiFileService {
    async fn upload(
        &self,
        file: &LocalFile,
        bytes: Bytes,
        credentials: &Credentials,
        progress: ProgressReporter,
    ) -> Result<UploadedFile, ChatError> {
        let total = bytes.len() as u64;
        log::info!("Uploading {} ({} bytes, {})", file.name, total, file.mime_type);

        let upload_url = self.start_session(file, total, credentials).await?;
        let body = reqwest::Body::wrap_stream(chunk_stream(bytes, self.chunk_size, progress));

        let response = self
            .client
            .post(&upload_url)
            .header(CONTENT_LENGTH, total)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            log::error!("Upload of {} failed with status {}: {}", file.name, status, body);
            return Err(ChatError::from_response(status, &body));
        }

        let parsed: UploadResponse = response.json().await.map_err(|e| {
            ChatError::new(
                ErrorCode::ServiceUnavailable,
                format!("Unexpected upload response for {}: {}", file.name, e),
            )
        })?;
        log::info!("Uploaded {} as {}", file.name, parsed.file.uri);

        Ok(UploadedFile {
            uri: parsed.file.uri,
            mime_type: parsed.file.mime_type,
            display_name: parsed.file.display_name.unwrap_or_else(|| file.name.clone()),
            size_bytes: parsed.file.size_bytes.unwrap_or(total),
        })
    }
}
