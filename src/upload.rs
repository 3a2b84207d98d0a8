//! Remote uploads of file references with progress, retry and per-file isolation.
//!
//! The coordinator owns the ordered working set of references shown in the
//! composer. Every write replaces a whole reference by id. Each upload attempt
//! is numbered; outcomes of a superseded attempt or of a removed reference are
//! discarded.

use crate::config::Credentials;
use crate::encoder::{AttachmentPolicy, FileCheck};
use crate::error::{ChatError, ErrorCode};
use crate::files::{FileReferenceService, ProgressReporter};
use crate::models::{FileReference, FileReferenceStatus, LocalFile};
use dashmap::DashMap;
use futures::Stream;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub enum UploadEvent {
    Changed(FileReference),
    Removed(Uuid),
}

struct Entry {
    reference: FileReference,
    attempt: u64,
}

struct Inner {
    service: Arc<dyn FileReferenceService>,
    policy: AttachmentPolicy,
    entries: Mutex<Vec<Entry>>,
    credentials: DashMap<Uuid, Credentials>,
    events: broadcast::Sender<UploadEvent>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replaces reference `id` with `f`'s result if `attempt` is still current.
    fn apply(
        &self,
        id: Uuid,
        attempt: u64,
        f: impl FnOnce(&FileReference) -> Option<FileReference>,
    ) -> Option<FileReference> {
        let updated = {
            let mut entries = self.lock();
            let Some(entry) = entries.iter_mut().find(|e| e.reference.id == id) else {
                log::debug!("Discarding update for removed file reference {}", id);
                return None;
            };
            if entry.attempt != attempt {
                log::debug!(
                    "Discarding update from superseded attempt {} of {} (current {})",
                    attempt,
                    id,
                    entry.attempt
                );
                return None;
            }
            let next = f(&entry.reference)?;
            entry.reference = next.clone();
            next
        };
        let _ = self.events.send(UploadEvent::Changed(updated.clone()));
        Some(updated)
    }

    fn set_progress(&self, id: Uuid, attempt: u64, percent: u8) {
        self.apply(id, attempt, |current| {
            let advancing = current.progress.map(|p| percent > p).unwrap_or(true);
            if current.status != FileReferenceStatus::Uploading || !advancing {
                return None;
            }
            let mut next = current.clone();
            next.progress = Some(percent);
            Some(next)
        });
    }

    fn fail(&self, id: Uuid, attempt: u64, file: &LocalFile, err: &ChatError) -> FileReference {
        log::error!("Upload of {} failed ({:?}): {}", file.name, err.code(), err);
        let failed = FileReference::failed(id, file, err);
        self.apply(id, attempt, |current| {
            current
                .status
                .can_transition_to(FileReferenceStatus::Error)
                .then(|| failed.clone())
        })
        .unwrap_or(failed)
    }
}

/// Handle on one upload attempt.
pub struct UploadTask {
    reference_id: Uuid,
    progress: mpsc::UnboundedReceiver<u8>,
    outcome: TaskOutcome,
}

enum TaskOutcome {
    Finished(FileReference),
    Running {
        handle: JoinHandle<FileReference>,
        fallback: FileReference,
    },
}

impl UploadTask {
    fn finished(reference: FileReference) -> Self {
        // Closed channel: the progress stream ends immediately.
        let (_, progress) = mpsc::unbounded_channel();
        Self {
            reference_id: reference.id,
            progress,
            outcome: TaskOutcome::Finished(reference),
        }
    }

    pub fn reference_id(&self) -> Uuid {
        self.reference_id
    }

    /// Progress percentages in receipt order. Ends when the attempt finishes.
    pub fn progress(&mut self) -> impl Stream<Item = u8> + '_ {
        futures::stream::poll_fn(move |cx| self.progress.poll_recv(cx))
    }

    /// Waits for the attempt and returns the reference it produced.
    pub async fn wait(self) -> FileReference {
        match self.outcome {
            TaskOutcome::Finished(reference) => reference,
            TaskOutcome::Running { handle, fallback } => match handle.await {
                Ok(reference) => reference,
                Err(e) => {
                    log::error!("Upload task for {} did not complete: {}", fallback.id, e);
                    fallback
                }
            },
        }
    }
}

#[derive(Clone)]
pub struct FileUploadCoordinator {
    inner: Arc<Inner>,
}

impl FileUploadCoordinator {
    pub fn new(service: Arc<dyn FileReferenceService>, policy: AttachmentPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                service,
                policy,
                entries: Mutex::new(Vec::new()),
                credentials: DashMap::new(),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of the working set, in insertion order.
    pub fn references(&self) -> Vec<FileReference> {
        self.inner.lock().iter().map(|e| e.reference.clone()).collect()
    }

    pub fn get(&self, id: Uuid) -> Option<FileReference> {
        self.inner
            .lock()
            .iter()
            .find(|e| e.reference.id == id)
            .map(|e| e.reference.clone())
    }

    /// Validates `file` and, if it passes, starts uploading it.
    ///
    /// A validation failure yields a reference in the error state without any
    /// network I/O.
    pub fn upload(&self, file: LocalFile, credentials: Credentials) -> UploadTask {
        let id = Uuid::new_v4();
        self.inner.credentials.insert(id, credentials.clone());

        let initial = match self.inner.policy.check(&file) {
            FileCheck::Pass => FileReference::uploading(id, &file),
            FileCheck::Fail { code, reason } => {
                log::warn!("Rejected {} before upload: {}", file.name, reason);
                FileReference::failed(id, &file, &ChatError::new(code, reason))
            }
        };

        self.inner.lock().push(Entry {
            reference: initial.clone(),
            attempt: 0,
        });
        let _ = self.inner.events.send(UploadEvent::Changed(initial.clone()));

        if initial.status == FileReferenceStatus::Error {
            return UploadTask::finished(initial);
        }
        self.spawn_attempt(id, 0, file, credentials, initial)
    }

    /// Uploads each file independently.
    pub fn upload_batch(&self, files: Vec<LocalFile>, credentials: &Credentials) -> Vec<UploadTask> {
        files
            .into_iter()
            .map(|file| self.upload(file, credentials.clone()))
            .collect()
    }

    /// Re-runs a failed upload with its retained original file, keeping the id.
    pub fn retry(&self, id: Uuid) -> Result<UploadTask, ChatError> {
        let credentials = self
            .inner
            .credentials
            .get(&id)
            .map(|c| c.value().clone())
            .ok_or_else(|| {
                ChatError::new(ErrorCode::NotRetryable, format!("No upload is known with id {}", id))
            })?;

        let (file, attempt, reset) = {
            let mut entries = self.inner.lock();
            let entry = entries
                .iter_mut()
                .find(|e| e.reference.id == id)
                .ok_or_else(|| {
                    ChatError::new(ErrorCode::NotRetryable, format!("No upload is known with id {}", id))
                })?;
            if entry.reference.status != FileReferenceStatus::Error {
                return Err(ChatError::new(
                    ErrorCode::NotRetryable,
                    format!("{} has not failed", entry.reference.display_name),
                ));
            }
            let Some(file) = entry.reference.original_file.clone() else {
                return Err(ChatError::new(
                    ErrorCode::OriginalFileUnavailable,
                    format!(
                        "Cannot retry {}: original file unavailable",
                        entry.reference.display_name
                    ),
                ));
            };
            entry.attempt += 1;
            let mut reset = entry.reference.clone();
            reset.status = FileReferenceStatus::Uploading;
            reset.progress = Some(0);
            reset.error = None;
            reset.error_code = None;
            entry.reference = reset.clone();
            (file, entry.attempt, reset)
        };
        let _ = self.inner.events.send(UploadEvent::Changed(reset.clone()));
        log::info!("Retrying upload of {} (attempt {})", file.name, attempt + 1);

        if let FileCheck::Fail { code, reason } = self.inner.policy.check(&file) {
            let failed = self.inner.fail(id, attempt, &file, &ChatError::new(code, reason));
            return Ok(UploadTask::finished(failed));
        }
        Ok(self.spawn_attempt(id, attempt, file, credentials, reset))
    }

    /// Drops a reference whatever its status. An in-flight request keeps
    /// running; its outcome is discarded.
    pub fn remove(&self, id: Uuid) -> bool {
        let removed = {
            let mut entries = self.inner.lock();
            let before = entries.len();
            entries.retain(|e| e.reference.id != id);
            entries.len() != before
        };
        if removed {
            self.inner.credentials.remove(&id);
            let _ = self.inner.events.send(UploadEvent::Removed(id));
        }
        removed
    }

    /// Takes every ready reference out of the working set for a send.
    /// Their original files are released; other references stay.
    pub fn consume_ready(&self) -> Vec<FileReference> {
        let consumed: Vec<FileReference> = {
            let mut entries = self.inner.lock();
            let (ready, rest): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut *entries)
                .into_iter()
                .partition(|e| e.reference.is_ready());
            *entries = rest;
            ready
                .into_iter()
                .map(|e| FileReference {
                    original_file: None,
                    ..e.reference
                })
                .collect()
        };
        for reference in &consumed {
            self.inner.credentials.remove(&reference.id);
            let _ = self.inner.events.send(UploadEvent::Removed(reference.id));
        }
        consumed
    }

    /// Clears the working set when the composing session resets.
    pub fn reset(&self) {
        let ids: Vec<Uuid> = self
            .inner
            .lock()
            .drain(..)
            .map(|e| e.reference.id)
            .collect();
        for id in ids {
            self.inner.credentials.remove(&id);
            let _ = self.inner.events.send(UploadEvent::Removed(id));
        }
    }

    fn spawn_attempt(
        &self,
        id: Uuid,
        attempt: u64,
        file: LocalFile,
        credentials: Credentials,
        fallback: FileReference,
    ) -> UploadTask {
        let (tx, progress) = mpsc::unbounded_channel();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run_attempt(inner, id, attempt, file, credentials, tx));
        UploadTask {
            reference_id: id,
            progress,
            outcome: TaskOutcome::Running { handle, fallback },
        }
    }
}

async fn run_attempt(
    inner: Arc<Inner>,
    id: Uuid,
    attempt: u64,
    file: LocalFile,
    credentials: Credentials,
    tx: mpsc::UnboundedSender<u8>,
) -> FileReference {
    let bytes = match file.read_bytes().await {
        Ok(bytes) => bytes,
        Err(e) => return inner.fail(id, attempt, &file, &e),
    };

    let last_percent = Arc::new(Mutex::new(0u8));
    let reporter = {
        let inner = Arc::clone(&inner);
        let tx = tx.clone();
        ProgressReporter::new(move |sent, total| {
            // 100 is reserved for the service's confirmation.
            let percent = if total == 0 {
                99
            } else {
                (sent.saturating_mul(100) / total).min(99) as u8
            };
            {
                let mut last = last_percent.lock().unwrap_or_else(|p| p.into_inner());
                if percent <= *last {
                    return;
                }
                *last = percent;
            }
            log::debug!("Upload {} at {}%", id, percent);
            inner.set_progress(id, attempt, percent);
            let _ = tx.send(percent);
        })
    };

    match inner.service.upload(&file, bytes, &credentials, reporter).await {
        Ok(uploaded) => {
            inner.set_progress(id, attempt, 100);
            let _ = tx.send(100);
            log::info!("Upload of {} ready at {}", file.name, uploaded.uri);
            let ready = FileReference {
                id,
                uri: uploaded.uri,
                mime_type: uploaded.mime_type,
                display_name: uploaded.display_name,
                size_bytes: uploaded.size_bytes,
                status: FileReferenceStatus::Ready,
                progress: None,
                error: None,
                error_code: None,
                original_file: None,
            };
            inner
                .apply(id, attempt, |current| {
                    current
                        .status
                        .can_transition_to(FileReferenceStatus::Ready)
                        .then(|| ready.clone())
                })
                .unwrap_or(ready)
        }
        Err(e) => inner.fail(id, attempt, &file, &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UploadedFile;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Scripted service: per file name, a queue of outcomes (default success).
    #[derive(Default)]
    struct FakeService {
        outcomes: Mutex<HashMap<String, VecDeque<Result<(), ChatError>>>>,
        reports: Vec<(u64, u64)>,
        gate: Option<Arc<Notify>>,
        calls: AtomicUsize,
    }

    impl FakeService {
        fn script(self, name: &str, outcomes: Vec<Result<(), ChatError>>) -> Self {
            self.outcomes
                .lock()
                .unwrap()
                .insert(name.to_string(), outcomes.into());
            self
        }
    }

    #[async_trait]
    impl FileReferenceService for FakeService {
        async fn upload(
            &self,
            file: &LocalFile,
            bytes: Bytes,
            _credentials: &Credentials,
            progress: ProgressReporter,
        ) -> Result<UploadedFile, ChatError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            for (sent, total) in &self.reports {
                progress.report(*sent, *total);
                tokio::task::yield_now().await;
            }
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .get_mut(&file.name)
                .and_then(|q| q.pop_front())
                .unwrap_or(Ok(()));
            outcome.map(|_| UploadedFile {
                uri: format!("https://files.example/{}", file.name),
                mime_type: file.mime_type.clone(),
                display_name: file.name.clone(),
                size_bytes: bytes.len() as u64,
            })
        }
    }

    fn policy() -> AttachmentPolicy {
        AttachmentPolicy::new(1024, vec!["image/*".into(), "application/pdf".into()])
    }

    fn setup(service: FakeService) -> (FileUploadCoordinator, Arc<FakeService>) {
        let service = Arc::new(service);
        let coordinator = FileUploadCoordinator::new(service.clone(), policy());
        (coordinator, service)
    }

    fn creds() -> Credentials {
        Credentials::new("test-key")
    }

    fn png(name: &str) -> LocalFile {
        LocalFile::from_bytes(name, "image/png", vec![1; 400])
    }

    fn transient() -> ChatError {
        ChatError::new(ErrorCode::ServiceUnavailable, "service unavailable")
    }

    #[tokio::test]
    async fn successful_upload_reports_monotonic_progress_ending_at_100() {
        let service = FakeService {
            reports: vec![(100, 400), (300, 400), (200, 400), (400, 400)],
            ..FakeService::default()
        };
        let (coordinator, _) = setup(service);
        let mut events = coordinator.subscribe();

        let mut task = coordinator.upload(png("cat.png"), creds());
        let id = task.reference_id();
        let seen: Vec<u8> = task.progress().collect().await;
        let reference = task.wait().await;

        assert_eq!(seen, vec![25, 75, 99, 100]);
        assert_eq!(reference.id, id);
        assert_eq!(reference.status, FileReferenceStatus::Ready);
        assert_eq!(reference.uri, "https://files.example/cat.png");
        assert_eq!(reference.progress, None);
        assert!(reference.original_file.is_none());
        assert_eq!(coordinator.get(id).unwrap(), reference);

        let mut progress_before_ready = Vec::new();
        while let Ok(UploadEvent::Changed(r)) = events.try_recv() {
            match r.status {
                FileReferenceStatus::Uploading => progress_before_ready.push(r.progress.unwrap()),
                FileReferenceStatus::Ready => break,
                FileReferenceStatus::Error => panic!("unexpected error"),
            }
        }
        assert!(progress_before_ready.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress_before_ready.first(), Some(&0));
        assert_eq!(progress_before_ready.last(), Some(&100));
    }

    #[tokio::test]
    async fn validation_failure_skips_network() {
        let (coordinator, service) = setup(FakeService::default());

        let oversized = LocalFile::from_bytes("huge.png", "image/png", vec![0; 2048]);
        let mut task = coordinator.upload(oversized, creds());
        assert!(task.progress().collect::<Vec<_>>().await.is_empty());
        let reference = task.wait().await;

        assert_eq!(reference.status, FileReferenceStatus::Error);
        assert_eq!(reference.error_code, Some(ErrorCode::FileTooLarge));
        assert!(!reference.is_retryable());
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn batch_failures_are_isolated() {
        let (coordinator, _) = setup(FakeService::default());
        let files = vec![
            png("one.png"),
            LocalFile::from_bytes("two.zip", "application/zip", vec![1; 10]),
            png("three.png"),
        ];

        let tasks = coordinator.upload_batch(files, &creds());
        let mut results = Vec::new();
        for task in tasks {
            results.push(task.wait().await);
        }

        assert_eq!(results[0].status, FileReferenceStatus::Ready);
        assert_eq!(results[1].status, FileReferenceStatus::Error);
        assert_eq!(results[1].error_code, Some(ErrorCode::UnsupportedMediaType));
        assert_eq!(results[2].status, FileReferenceStatus::Ready);
        let names: Vec<String> = coordinator
            .references()
            .into_iter()
            .map(|r| r.display_name)
            .collect();
        assert_eq!(names, vec!["one.png", "two.zip", "three.png"]);
    }

    #[tokio::test]
    async fn retry_keeps_identity_and_latest_error() {
        let quota = ChatError::new(ErrorCode::QuotaExceeded, "quota exceeded");
        let service = FakeService::default().script(
            "doc.png",
            vec![Err(transient()), Err(quota), Err(transient()), Ok(())],
        );
        let (coordinator, _) = setup(service);

        let first = coordinator.upload(png("doc.png"), creds()).wait().await;
        let id = first.id;
        assert_eq!(first.status, FileReferenceStatus::Error);
        assert_eq!(first.error_code, Some(ErrorCode::ServiceUnavailable));
        assert!(first.is_retryable());

        let second = coordinator.retry(id).unwrap().wait().await;
        assert_eq!(second.id, id);
        assert_eq!(second.error_code, Some(ErrorCode::QuotaExceeded));
        assert!(!second.is_retryable());
        assert!(second.original_file.is_some());

        let third = coordinator.retry(id).unwrap().wait().await;
        assert_eq!(third.error_code, Some(ErrorCode::ServiceUnavailable));

        let fourth = coordinator.retry(id).unwrap().wait().await;
        assert_eq!(fourth.id, id);
        assert_eq!(fourth.status, FileReferenceStatus::Ready);
        assert!(fourth.error.is_none());
        assert!(fourth.error_code.is_none());
        assert_eq!(coordinator.references().len(), 1);
    }

    #[tokio::test]
    async fn retry_resets_progress_and_error_before_attempt() {
        let gate = Arc::new(Notify::new());
        let service = FakeService {
            gate: Some(gate.clone()),
            ..FakeService::default()
        }
        .script("slow.png", vec![Err(transient())]);
        let (coordinator, _) = setup(service);

        let failed_task = coordinator.upload(png("slow.png"), creds());
        gate.notify_one();
        let failed = failed_task.wait().await;
        assert_eq!(failed.status, FileReferenceStatus::Error);

        let task = coordinator.retry(failed.id).unwrap();
        let during = coordinator.get(failed.id).unwrap();
        assert_eq!(during.status, FileReferenceStatus::Uploading);
        assert_eq!(during.progress, Some(0));
        assert!(during.error.is_none() && during.error_code.is_none());

        gate.notify_one();
        assert_eq!(task.wait().await.status, FileReferenceStatus::Ready);
    }

    #[tokio::test]
    async fn retry_without_original_file_fails_and_keeps_error() {
        let service = FakeService::default().script("gone.png", vec![Err(transient())]);
        let (coordinator, _) = setup(service);

        let failed = coordinator.upload(png("gone.png"), creds()).wait().await;
        {
            let mut entries = coordinator.inner.lock();
            entries[0].reference.original_file = None;
        }

        let err = coordinator.retry(failed.id).err().unwrap();
        assert_eq!(err.code(), ErrorCode::OriginalFileUnavailable);
        assert_eq!(
            coordinator.get(failed.id).unwrap().status,
            FileReferenceStatus::Error
        );
    }

    #[tokio::test]
    async fn retry_of_ready_reference_is_rejected() {
        let (coordinator, _) = setup(FakeService::default());
        let ready = coordinator.upload(png("done.png"), creds()).wait().await;

        let err = coordinator.retry(ready.id).err().unwrap();
        assert_eq!(err.code(), ErrorCode::NotRetryable);
        assert_eq!(coordinator.get(ready.id).unwrap().status, FileReferenceStatus::Ready);
    }

    #[tokio::test]
    async fn late_outcome_for_removed_reference_is_discarded() {
        let gate = Arc::new(Notify::new());
        let service = FakeService {
            gate: Some(gate.clone()),
            ..FakeService::default()
        };
        let (coordinator, service) = setup(service);

        let task = coordinator.upload(png("late.png"), creds());
        let id = task.reference_id();
        assert!(coordinator.remove(id));
        assert!(coordinator.get(id).is_none());

        gate.notify_one();
        let outcome = task.wait().await;
        assert_eq!(outcome.status, FileReferenceStatus::Ready);
        assert!(coordinator.references().is_empty());
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn consume_ready_leaves_pending_and_failed() {
        let gate = Arc::new(Notify::new());
        let (ready_coordinator, _) = setup(FakeService::default());
        let ready = ready_coordinator.upload(png("a.png"), creds()).wait().await;

        let service = FakeService {
            gate: Some(gate.clone()),
            ..FakeService::default()
        };
        let (coordinator, _) = setup(service);
        // Seed the working set with one ready reference from the other run.
        coordinator.inner.lock().push(Entry {
            reference: ready.clone(),
            attempt: 0,
        });
        let uploading = coordinator.upload(png("b.png"), creds());
        let rejected = coordinator
            .upload(LocalFile::from_bytes("c.exe", "application/x-msdownload", vec![1]), creds())
            .wait()
            .await;

        let consumed = coordinator.consume_ready();
        assert_eq!(consumed.len(), 1);
        assert_eq!(consumed[0].id, ready.id);
        assert!(consumed[0].original_file.is_none());

        let remaining: Vec<Uuid> = coordinator.references().iter().map(|r| r.id).collect();
        assert_eq!(remaining, vec![uploading.reference_id(), rejected.id]);

        coordinator.reset();
        assert!(coordinator.references().is_empty());
        gate.notify_one();
        uploading.wait().await;
        assert!(coordinator.references().is_empty());
    }
}
