//! Upload pipeline: idempotent hand-off of a downloaded file to the
//! destination platform.
//!
//! Idempotency rests on the `destination_url` column: before any upload the
//! pipeline re-reads it, and the success write only fires while the column is
//! still empty. An item whose URL is already recorded never reaches the
//! uploader again, no matter how many scheduler passes see it.

use std::sync::Arc;
#[cfg(test)]
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::UploadConfig;
use crate::core::ports::{UploadRequest, VideoUploader};
use crate::db::{Database, WorkItem};
use crate::error::UploadError;
use crate::retry::{backoff_delay, sleep_cancellable};

/// Title length cap in Unicode scalar values, including the truncation indicator
const TITLE_MAX_CHARS: usize = 100;

/// Placeholder when the upstream title is empty after normalization
const TITLE_PLACEHOLDER: &str = "untitled";

/// How an item cleared the upload stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The uploader ran and this pass recorded the destination URL
    Uploaded(String),
    /// A previous pass already recorded a destination URL; nothing was sent
    AlreadyUploaded(String),
    /// The item is flagged skip_upload; nothing was sent
    SkippedUpload,
}

/// Upload pipeline with retry and idempotent success recording
pub struct UploadPipeline {
    db: Arc<Database>,
    uploader: Arc<dyn VideoUploader>,
    config: UploadConfig,
}

impl UploadPipeline {
    /// Create a pipeline over the shared store and uploader port
    pub fn new(db: Arc<Database>, uploader: Arc<dyn VideoUploader>, config: UploadConfig) -> Self {
        Self {
            db,
            uploader,
            config,
        }
    }

    /// Run the upload stage for a downloaded item.
    ///
    /// On success (including the already-uploaded and skip cases) the local
    /// file is deleted and `local_path` cleared; deletion problems are logged,
    /// never fatal. On final failure the error is appended to `last_error`
    /// and one retry is consumed, leaving the item to cool down.
    pub async fn process_item(
        &self,
        cancel: &CancellationToken,
        item: &WorkItem,
    ) -> Result<UploadOutcome, UploadError> {
        if item.skip_upload {
            self.db
                .mark_processed(&item.channel, &item.external_id)
                .await
                .map_err(|e| UploadError::Transient(format!("failed to mark processed: {e}")))?;
            self.cleanup_local_file(item).await;
            return Ok(UploadOutcome::SkippedUpload);
        }

        // Idempotency re-read: the row may have changed since selection
        let current = self
            .db
            .get_item(&item.channel, &item.external_id)
            .await
            .map_err(|e| UploadError::Transient(format!("failed to re-read item: {e}")))?;
        if let Some(current) = current {
            if !current.destination_url.is_empty() {
                tracing::info!(
                    item = %item.external_id,
                    destination = %current.destination_url,
                    "destination already recorded, skipping upload"
                );
                self.db
                    .mark_processed(&item.channel, &item.external_id)
                    .await
                    .map_err(|e| UploadError::Transient(format!("failed to mark processed: {e}")))?;
                self.cleanup_local_file(item).await;
                return Ok(UploadOutcome::AlreadyUploaded(current.destination_url));
            }
        }

        let request = UploadRequest {
            local_path: item.local_path.clone().into(),
            title: normalize_title(item.recorded_at, &item.title),
            description: build_description(item),
            visibility: self.config.visibility.clone(),
        };

        let mut last_error = String::new();
        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                let delay = backoff_delay(self.config.backoff_base, attempt);
                if !sleep_cancellable(delay, cancel).await {
                    return Err(UploadError::Canceled);
                }
            }
            if cancel.is_cancelled() {
                return Err(UploadError::Canceled);
            }

            match self.uploader.upload(cancel, &request).await {
                Ok(url) => {
                    let recorded = self
                        .db
                        .record_destination(&item.channel, &item.external_id, &url)
                        .await
                        .map_err(|e| {
                            UploadError::Transient(format!("failed to record destination: {e}"))
                        })?;
                    if !recorded {
                        // Another pass won the guarded write; their URL stands
                        tracing::warn!(
                            item = %item.external_id,
                            "destination URL was recorded concurrently"
                        );
                    }
                    self.cleanup_local_file(item).await;
                    return Ok(UploadOutcome::Uploaded(url));
                }
                Err(UploadError::Canceled) => return Err(UploadError::Canceled),
                Err(e @ UploadError::InvalidTitle(_)) => {
                    // Retrying an invalid title cannot succeed
                    self.record_final_failure(item, &e.to_string()).await;
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        item = %item.external_id,
                        attempt = attempt + 1,
                        error = %e,
                        "upload attempt failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        let err = UploadError::Exhausted {
            attempts: self.config.max_attempts,
            last_error: last_error.clone(),
        };
        self.record_final_failure(item, &err.to_string()).await;
        Err(err)
    }

    async fn record_final_failure(&self, item: &WorkItem, message: &str) {
        let combined = if item.last_error.is_empty() {
            format!("upload: {message}")
        } else {
            format!("{}; upload: {message}", item.last_error)
        };
        if let Err(e) = self
            .db
            .record_failure(&item.channel, &item.external_id, &combined)
            .await
        {
            tracing::error!(item = %item.external_id, error = %e, "failed to record upload failure");
        }
    }

    /// Delete the local media file and clear `local_path`. Runs after every
    /// successful pass through the upload stage; a missing file is fine.
    pub async fn cleanup_local_file(&self, item: &WorkItem) {
        if item.local_path.is_empty() {
            return;
        }

        match tokio::fs::remove_file(&item.local_path).await {
            Ok(()) => {
                tracing::info!(item = %item.external_id, path = %item.local_path, "removed local file");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    item = %item.external_id,
                    path = %item.local_path,
                    error = %e,
                    "failed to remove local file"
                );
            }
        }

        if let Err(e) = self
            .db
            .clear_local_path(&item.channel, &item.external_id)
            .await
        {
            tracing::warn!(item = %item.external_id, error = %e, "failed to clear local path");
        }
    }
}

/// Normalize an upstream title for the destination platform.
///
/// Prepends the `YYYY-MM-DD` recording date, strips control characters,
/// substitutes a placeholder for empty titles, and truncates to
/// [`TITLE_MAX_CHARS`] Unicode scalar values with a `…` indicator.
pub fn normalize_title(recorded_at: i64, raw: &str) -> String {
    let date = chrono::DateTime::from_timestamp(recorded_at, 0)
        .unwrap_or_else(chrono::Utc::now)
        .format("%Y-%m-%d");

    let cleaned: String = raw.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    let body = if cleaned.is_empty() {
        TITLE_PLACEHOLDER
    } else {
        cleaned
    };

    let full = format!("{date} {body}");
    if full.chars().count() <= TITLE_MAX_CHARS {
        full
    } else {
        let mut truncated: String = full.chars().take(TITLE_MAX_CHARS - 1).collect();
        truncated.push('…');
        truncated
    }
}

/// Description for the upload: the custom override verbatim, or a default
/// template carrying the recording time in RFC 3339.
pub fn build_description(item: &WorkItem) -> String {
    if !item.custom_description.is_empty() {
        return item.custom_description.clone();
    }

    let recorded = chrono::DateTime::from_timestamp(item.recorded_at, 0)
        .unwrap_or_else(chrono::Utc::now)
        .to_rfc3339();
    format!("Archived broadcast recorded at {recorded}.")
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewWorkItem;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted uploader: fails `failures_before_success` times, then succeeds
    struct MockUploader {
        calls: AtomicU32,
        failures_before_success: u32,
        error: UploadError,
    }

    impl MockUploader {
        fn succeeding() -> Self {
            Self::failing_then_ok(0)
        }

        fn failing_then_ok(failures: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures_before_success: failures,
                error: UploadError::Transient("503 backend unavailable".into()),
            }
        }

        fn always_invalid_title() -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures_before_success: u32::MAX,
                error: UploadError::InvalidTitle("invalidTitle".into()),
            }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl VideoUploader for MockUploader {
        async fn upload(
            &self,
            _cancel: &CancellationToken,
            _request: &UploadRequest,
        ) -> Result<String, UploadError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(match &self.error {
                    UploadError::InvalidTitle(m) => UploadError::InvalidTitle(m.clone()),
                    UploadError::Transient(m) => UploadError::Transient(m.clone()),
                    other => UploadError::Transient(other.to_string()),
                })
            } else {
                Ok("https://dest.example/v/42".to_string())
            }
        }
    }

    async fn seeded_item(db: &Database, local_file: Option<&std::path::Path>) -> WorkItem {
        db.upsert_item(&NewWorkItem {
            channel: String::new(),
            external_id: "v1".into(),
            title: "A Broadcast".into(),
            recorded_at: 1_704_153_600, // 2024-01-02 UTC
            duration_seconds: 60,
            priority: 0,
        })
        .await
        .unwrap();

        if let Some(path) = local_file {
            std::fs::write(path, b"media").unwrap();
            db.mark_download_complete("", "v1", &path.to_string_lossy(), 5)
                .await
                .unwrap();
        }

        db.get_item("", "v1").await.unwrap().unwrap()
    }

    fn pipeline(db: Arc<Database>, uploader: Arc<MockUploader>) -> UploadPipeline {
        let config = UploadConfig {
            max_attempts: 3,
            backoff_base: Duration::ZERO,
            visibility: "private".into(),
        };
        UploadPipeline::new(db, uploader, config)
    }

    #[tokio::test]
    async fn successful_upload_records_destination_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("v1.mp4");
        let db = Arc::new(Database::in_memory().await.unwrap());
        let item = seeded_item(&db, Some(&media)).await;

        let uploader = Arc::new(MockUploader::succeeding());
        let pipeline = pipeline(db.clone(), uploader.clone());

        let outcome = pipeline
            .process_item(&CancellationToken::new(), &item)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            UploadOutcome::Uploaded("https://dest.example/v/42".into())
        );
        assert_eq!(uploader.call_count(), 1);

        let stored = db.get_item("", "v1").await.unwrap().unwrap();
        assert!(stored.processed);
        assert_eq!(stored.destination_url, "https://dest.example/v/42");
        assert!(stored.last_error.is_empty());
        assert!(stored.local_path.is_empty(), "local path cleared");
        assert!(!media.exists(), "local file deleted");
    }

    #[tokio::test]
    async fn existing_destination_skips_the_uploader_entirely() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("v1.mp4");
        let db = Arc::new(Database::in_memory().await.unwrap());
        let item = seeded_item(&db, Some(&media)).await;

        // Destination recorded by an earlier pass, then processed flag lost
        db.record_destination("", "v1", "https://dest.example/v/earlier")
            .await
            .unwrap();
        sqlx::query("UPDATE work_items SET processed = FALSE WHERE external_id = 'v1'")
            .execute(db.pool())
            .await
            .unwrap();

        // An uploader that would fail if it were ever reached
        let uploader = Arc::new(MockUploader::failing_then_ok(u32::MAX));
        let pipeline = pipeline(db.clone(), uploader.clone());

        let outcome = pipeline
            .process_item(&CancellationToken::new(), &item)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            UploadOutcome::AlreadyUploaded("https://dest.example/v/earlier".into())
        );
        assert_eq!(uploader.call_count(), 0, "uploader must not be invoked");

        let stored = db.get_item("", "v1").await.unwrap().unwrap();
        assert!(stored.processed, "processed restored");
        assert_eq!(stored.destination_url, "https://dest.example/v/earlier");
        assert!(!media.exists(), "cleanup still runs");
    }

    #[tokio::test]
    async fn skip_upload_marks_processed_without_uploading() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("v1.mp4");
        let db = Arc::new(Database::in_memory().await.unwrap());
        let mut item = seeded_item(&db, Some(&media)).await;
        db.set_skip_upload("", "v1", true).await.unwrap();
        item.skip_upload = true;

        let uploader = Arc::new(MockUploader::succeeding());
        let pipeline = pipeline(db.clone(), uploader.clone());

        let outcome = pipeline
            .process_item(&CancellationToken::new(), &item)
            .await
            .unwrap();
        assert_eq!(outcome, UploadOutcome::SkippedUpload);
        assert_eq!(uploader.call_count(), 0);

        let stored = db.get_item("", "v1").await.unwrap().unwrap();
        assert!(stored.processed);
        assert!(stored.destination_url.is_empty(), "no URL for skipped uploads");
    }

    #[tokio::test]
    async fn transient_failures_are_retried_to_success() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let item = seeded_item(&db, None).await;

        let uploader = Arc::new(MockUploader::failing_then_ok(2));
        let pipeline = pipeline(db.clone(), uploader.clone());

        let outcome = pipeline
            .process_item(&CancellationToken::new(), &item)
            .await
            .unwrap();
        assert!(matches!(outcome, UploadOutcome::Uploaded(_)));
        assert_eq!(uploader.call_count(), 3, "two failures then success");
    }

    #[tokio::test]
    async fn exhaustion_appends_error_and_consumes_a_retry() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let item = seeded_item(&db, None).await;

        let uploader = Arc::new(MockUploader::failing_then_ok(u32::MAX));
        let pipeline = pipeline(db.clone(), uploader.clone());

        let err = pipeline
            .process_item(&CancellationToken::new(), &item)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Exhausted { attempts: 3, .. }));
        assert_eq!(uploader.call_count(), 3);

        let stored = db.get_item("", "v1").await.unwrap().unwrap();
        assert!(!stored.processed);
        assert!(stored.last_error.contains("upload"));
        assert!(stored.last_error.contains("503"));
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn invalid_title_aborts_without_retrying() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let item = seeded_item(&db, None).await;

        let uploader = Arc::new(MockUploader::always_invalid_title());
        let pipeline = pipeline(db.clone(), uploader.clone());

        let err = pipeline
            .process_item(&CancellationToken::new(), &item)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidTitle(_)));
        assert_eq!(uploader.call_count(), 1, "invalid title is not retried");
    }

    #[tokio::test]
    async fn cancellation_aborts_the_retry_loop() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let item = seeded_item(&db, None).await;

        let uploader = Arc::new(MockUploader::failing_then_ok(u32::MAX));
        let config = UploadConfig {
            max_attempts: 5,
            backoff_base: Duration::from_secs(30),
            visibility: "private".into(),
        };
        let pipeline = UploadPipeline::new(db, uploader, config);

        let cancel = CancellationToken::new();
        let canceler = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceler.cancel();
        });

        let start = std::time::Instant::now();
        let err = pipeline.process_item(&cancel, &item).await.unwrap_err();
        assert!(matches!(err, UploadError::Canceled));
        assert!(start.elapsed() < Duration::from_secs(5), "no 30s backoff served");
    }

    #[test]
    fn title_gets_date_prefix() {
        let title = normalize_title(1_704_153_600, "My Stream");
        assert_eq!(title, "2024-01-02 My Stream");
    }

    #[test]
    fn title_strips_control_characters() {
        let title = normalize_title(1_704_153_600, "bad\x00title\x1fhere\n");
        assert_eq!(title, "2024-01-02 badtitlehere");
    }

    #[test]
    fn empty_title_becomes_placeholder() {
        assert_eq!(normalize_title(1_704_153_600, ""), "2024-01-02 untitled");
        assert_eq!(normalize_title(1_704_153_600, "  \t "), "2024-01-02 untitled");
        assert_eq!(normalize_title(1_704_153_600, "\x07\x08"), "2024-01-02 untitled");
    }

    #[test]
    fn long_title_truncates_to_cap_with_indicator() {
        let long = "x".repeat(300);
        let title = normalize_title(1_704_153_600, &long);
        assert_eq!(title.chars().count(), 100);
        assert!(title.ends_with('…'));
        assert!(title.starts_with("2024-01-02 "));
    }

    #[test]
    fn title_cap_counts_scalar_values_not_bytes() {
        let long = "日".repeat(300);
        let title = normalize_title(1_704_153_600, &long);
        assert_eq!(title.chars().count(), 100);
        assert!(title.ends_with('…'));
    }

    #[test]
    fn title_at_exact_cap_is_untouched() {
        // "YYYY-MM-DD " is 11 chars; 89 more lands exactly on 100
        let body = "y".repeat(89);
        let title = normalize_title(1_704_153_600, &body);
        assert_eq!(title.chars().count(), 100);
        assert!(!title.contains('…'));
    }

    #[tokio::test]
    async fn description_prefers_custom_override() {
        let db = Database::in_memory().await.unwrap();
        let mut item = seeded_item(&db, None).await;

        assert!(build_description(&item).contains("2024-01-02"));
        assert!(build_description(&item).contains("recorded at"));

        item.custom_description = "hand-written notes".into();
        assert_eq!(build_description(&item), "hand-written notes");
    }
}
