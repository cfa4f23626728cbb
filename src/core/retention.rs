//! Retention engine: periodic cleanup of local media files.
//!
//! Retention never touches the store's metadata beyond `local_path`; it only
//! reclaims disk. Three safety interlocks protect files that are still
//! needed:
//!
//! 1. unprocessed items holding a file (awaiting upload),
//! 2. items without a destination URL whose file changed within the last
//!    hour (an upload may be mid-flight),
//! 3. items whose download state says they are actively transferring.
//!
//! A separate pruner removes stale `.part` / `.tmp` / transcode-temp
//! artifacts under the data directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::config::RetentionConfig;
use crate::db::{Database, WorkItem};

/// Grace window for interlock 2: recent writes imply an in-flight upload
const RECENT_ACTIVITY_SECS: i64 = 3_600;

/// Counters reported by one retention sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, utoipa::ToSchema)]
pub struct RetentionReport {
    /// Files deleted (or that would be deleted in dry-run)
    pub cleaned: u64,
    /// Files protected by policy or interlocks
    pub skipped: u64,
    /// Deletion attempts that failed
    pub errors: u64,
    /// Bytes reclaimed
    pub bytes_freed: u64,
}

/// Age- and count-based local file cleanup with safety interlocks
pub struct RetentionEngine {
    db: Arc<Database>,
    channel: String,
    config: RetentionConfig,
    data_dir: PathBuf,
}

impl RetentionEngine {
    /// Create an engine for one channel's files
    pub fn new(
        db: Arc<Database>,
        channel: String,
        config: RetentionConfig,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            db,
            channel,
            config,
            data_dir,
        }
    }

    /// Whether any retention rule is configured
    pub fn enabled(&self) -> bool {
        self.config.keep_days > 0 || self.config.keep_count > 0
    }

    /// Run sweeps on the configured cadence until shutdown
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            keep_days = self.config.keep_days,
            keep_count = self.config.keep_count,
            dry_run = self.config.dry_run,
            "retention task started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }

            if let Err(e) = self
                .db
                .kv_put(
                    &self.channel,
                    "job_retention_last",
                    &chrono::Utc::now().to_rfc3339(),
                )
                .await
            {
                tracing::warn!(error = %e, "failed to stamp retention heartbeat");
            }

            match self.run_once().await {
                Ok(report) => {
                    if report.cleaned > 0 || report.errors > 0 {
                        tracing::info!(
                            cleaned = report.cleaned,
                            skipped = report.skipped,
                            errors = report.errors,
                            bytes_freed = report.bytes_freed,
                            "retention sweep finished"
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "retention sweep failed");
                }
            }

            if let Err(e) =
                prune_temp_files(&self.data_dir, self.config.cleanup_max_age).await
            {
                tracing::warn!(error = %e, "temp file pruning failed");
            }
        }

        tracing::info!("retention task stopped");
    }

    /// One retention sweep over all items that still hold a local file
    pub async fn run_once(&self) -> Result<RetentionReport> {
        let mut report = RetentionReport::default();
        if !self.enabled() {
            return Ok(report);
        }

        let now = chrono::Utc::now().timestamp();
        let items = self.db.items_with_local_files(&self.channel).await?;

        let keep_newest: HashSet<String> = if self.config.keep_count > 0 {
            self.db
                .newest_item_ids(&self.channel, self.config.keep_count)
                .await?
                .into_iter()
                .collect()
        } else {
            HashSet::new()
        };

        let age_cutoff = if self.config.keep_days > 0 {
            Some(now - i64::from(self.config.keep_days) * 86_400)
        } else {
            None
        };

        for item in items {
            let retained_by_age = age_cutoff.is_some_and(|cutoff| item.recorded_at >= cutoff);
            let retained_by_count = keep_newest.contains(&item.external_id);

            if retained_by_age || retained_by_count || is_active(&item, now) {
                report.skipped += 1;
                continue;
            }

            let path = Path::new(&item.local_path);
            let metadata = match tokio::fs::metadata(path).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // File already gone; reconcile the column and move on
                    self.db
                        .clear_local_path(&item.channel, &item.external_id)
                        .await?;
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(item = %item.external_id, error = %e, "failed to stat local file");
                    report.errors += 1;
                    continue;
                }
            };

            if self.config.dry_run {
                tracing::info!(
                    item = %item.external_id,
                    path = %item.local_path,
                    bytes = metadata.len(),
                    "retention dry-run: would delete"
                );
                report.cleaned += 1;
                report.bytes_freed += metadata.len();
                continue;
            }

            match tokio::fs::remove_file(path).await {
                Ok(()) => {
                    self.db
                        .clear_local_path(&item.channel, &item.external_id)
                        .await?;
                    report.cleaned += 1;
                    report.bytes_freed += metadata.len();
                    tracing::info!(
                        item = %item.external_id,
                        path = %item.local_path,
                        bytes = metadata.len(),
                        "retention deleted local file"
                    );
                }
                Err(e) => {
                    tracing::warn!(item = %item.external_id, error = %e, "retention delete failed");
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }
}

/// Whether an item is protected by the activity interlocks
fn is_active(item: &WorkItem, now: i64) -> bool {
    if !item.processed && !item.local_path.is_empty() {
        return true;
    }
    if item.destination_url.is_empty()
        && !item.local_path.is_empty()
        && item.updated_at > now - RECENT_ACTIVITY_SECS
    {
        return true;
    }
    matches!(item.download_state.as_str(), "downloading" | "processing")
}

/// Remove stale partial/temp artifacts under `data_dir`.
///
/// Targets `.part` and `.tmp` suffixes and the transcode-temp `.temp.` infix,
/// older than `max_age`. Returns the number of files removed.
pub async fn prune_temp_files(data_dir: &Path, max_age: Duration) -> Result<u64> {
    let mut removed = 0u64;

    let mut entries = match tokio::fs::read_dir(data_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let now = std::time::SystemTime::now();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !is_temp_artifact(name) {
            continue;
        }

        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }

        let stale = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age >= max_age);
        if !stale {
            continue;
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                removed += 1;
                tracing::info!(path = %path.display(), "pruned stale temp file");
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to prune temp file");
            }
        }
    }

    Ok(removed)
}

/// Filename conventions treated as ephemeral downloader/transcoder output
fn is_temp_artifact(name: &str) -> bool {
    name.ends_with(".part") || name.ends_with(".tmp") || name.contains(".temp.")
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewWorkItem;

    async fn seed_with_file(
        db: &Database,
        external_id: &str,
        recorded_at: i64,
        dir: &Path,
    ) -> PathBuf {
        db.upsert_item(&NewWorkItem {
            channel: String::new(),
            external_id: external_id.to_string(),
            title: external_id.to_string(),
            recorded_at,
            duration_seconds: 0,
            priority: 0,
        })
        .await
        .unwrap();

        let path = dir.join(format!("{external_id}.mp4"));
        std::fs::write(&path, b"0123456789").unwrap();
        db.mark_download_complete("", external_id, &path.to_string_lossy(), 10)
            .await
            .unwrap();
        path
    }

    /// Push an item past every interlock: processed, uploaded, long idle
    async fn make_expendable(db: &Database, external_id: &str) {
        db.record_destination("", external_id, &format!("https://dest/{external_id}"))
            .await
            .unwrap();
        sqlx::query("UPDATE work_items SET updated_at = 0, download_state = 'complete' WHERE external_id = ?")
            .bind(external_id)
            .execute(db.pool())
            .await
            .unwrap();
    }

    fn engine(db: Arc<Database>, config: RetentionConfig, dir: &Path) -> RetentionEngine {
        RetentionEngine::new(db, String::new(), config, dir.to_path_buf())
    }

    #[tokio::test]
    async fn disabled_engine_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::in_memory().await.unwrap());
        let path = seed_with_file(&db, "v1", 0, dir.path()).await;
        make_expendable(&db, "v1").await;

        let config = RetentionConfig::default(); // keep_days = keep_count = 0
        let report = engine(db, config, dir.path()).run_once().await.unwrap();

        assert_eq!(report, RetentionReport::default());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn old_expendable_files_are_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::in_memory().await.unwrap());
        let now = chrono::Utc::now().timestamp();

        let old = seed_with_file(&db, "old", now - 30 * 86_400, dir.path()).await;
        let fresh = seed_with_file(&db, "fresh", now - 86_400, dir.path()).await;
        make_expendable(&db, "old").await;
        make_expendable(&db, "fresh").await;

        let config = RetentionConfig {
            keep_days: 7,
            ..Default::default()
        };
        let report = engine(db.clone(), config, dir.path()).run_once().await.unwrap();

        assert_eq!(report.cleaned, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.errors, 0);
        assert_eq!(report.bytes_freed, 10);
        assert!(!old.exists(), "old file deleted");
        assert!(fresh.exists(), "file inside the age window kept");

        let item = db.get_item("", "old").await.unwrap().unwrap();
        assert!(item.local_path.is_empty(), "local_path cleared after delete");
    }

    #[tokio::test]
    async fn keep_count_protects_newest_recordings() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::in_memory().await.unwrap());

        let oldest = seed_with_file(&db, "a", 1_000, dir.path()).await;
        let middle = seed_with_file(&db, "b", 2_000, dir.path()).await;
        let newest = seed_with_file(&db, "c", 3_000, dir.path()).await;
        for id in ["a", "b", "c"] {
            make_expendable(&db, id).await;
        }

        let config = RetentionConfig {
            keep_count: 2,
            ..Default::default()
        };
        let report = engine(db, config, dir.path()).run_once().await.unwrap();

        assert_eq!(report.cleaned, 1);
        assert_eq!(report.skipped, 2);
        assert!(!oldest.exists());
        assert!(middle.exists());
        assert!(newest.exists());
    }

    #[tokio::test]
    async fn unprocessed_items_are_never_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::in_memory().await.unwrap());

        // Ancient recording, but still awaiting upload
        let path = seed_with_file(&db, "pending", 1_000, dir.path()).await;
        sqlx::query("UPDATE work_items SET updated_at = 0 WHERE external_id = 'pending'")
            .execute(db.pool())
            .await
            .unwrap();

        let config = RetentionConfig {
            keep_days: 1,
            ..Default::default()
        };
        let report = engine(db, config, dir.path()).run_once().await.unwrap();

        assert_eq!(report.cleaned, 0);
        assert_eq!(report.skipped, 1);
        assert!(path.exists(), "active item's file must survive");
    }

    #[tokio::test]
    async fn recently_touched_unuploaded_items_are_protected() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::in_memory().await.unwrap());

        // Processed via skip_upload (no destination), touched just now
        let path = seed_with_file(&db, "v1", 1_000, dir.path()).await;
        db.set_skip_upload("", "v1", true).await.unwrap();
        db.mark_processed("", "v1").await.unwrap();

        let config = RetentionConfig {
            keep_days: 1,
            ..Default::default()
        };
        let report = engine(db, config, dir.path()).run_once().await.unwrap();

        assert_eq!(report.cleaned, 0);
        assert!(path.exists(), "recent activity protects the file");
    }

    #[tokio::test]
    async fn missing_file_clears_local_path() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::in_memory().await.unwrap());

        let path = seed_with_file(&db, "gone", 1_000, dir.path()).await;
        make_expendable(&db, "gone").await;
        std::fs::remove_file(&path).unwrap();

        let config = RetentionConfig {
            keep_days: 1,
            ..Default::default()
        };
        let report = engine(db.clone(), config, dir.path()).run_once().await.unwrap();

        assert_eq!(report.cleaned, 0);
        assert_eq!(report.errors, 0);
        let item = db.get_item("", "gone").await.unwrap().unwrap();
        assert!(item.local_path.is_empty(), "dangling path reconciled");
    }

    #[tokio::test]
    async fn dry_run_reports_without_deleting() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::in_memory().await.unwrap());

        let path = seed_with_file(&db, "v1", 1_000, dir.path()).await;
        make_expendable(&db, "v1").await;

        let config = RetentionConfig {
            keep_days: 1,
            dry_run: true,
            ..Default::default()
        };
        let report = engine(db.clone(), config, dir.path()).run_once().await.unwrap();

        assert_eq!(report.cleaned, 1);
        assert_eq!(report.bytes_freed, 10);
        assert!(path.exists(), "dry run must not delete");

        let item = db.get_item("", "v1").await.unwrap().unwrap();
        assert!(!item.local_path.is_empty(), "dry run keeps local_path");
    }

    #[tokio::test]
    async fn temp_pruner_targets_only_stale_artifacts() {
        let dir = tempfile::tempdir().unwrap();

        for name in ["a.mp4.part", "b.tmp", "c.temp.mp4", "keep.mp4"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        // Zero max age: every artifact counts as stale
        let removed = prune_temp_files(dir.path(), Duration::ZERO).await.unwrap();
        assert_eq!(removed, 3);
        assert!(dir.path().join("keep.mp4").exists(), "media files untouched");

        // Fresh artifacts under a long max age survive
        std::fs::write(dir.path().join("fresh.part"), b"x").unwrap();
        let removed = prune_temp_files(dir.path(), Duration::from_secs(3_600))
            .await
            .unwrap();
        assert_eq!(removed, 0);
        assert!(dir.path().join("fresh.part").exists());
    }

    #[tokio::test]
    async fn temp_pruner_tolerates_missing_directory() {
        let removed = prune_temp_files(Path::new("/nonexistent/dir"), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn temp_artifact_naming_rules() {
        assert!(is_temp_artifact("v1.mp4.part"));
        assert!(is_temp_artifact("v1.tmp"));
        assert!(is_temp_artifact("v1.temp.mp4"));
        assert!(!is_temp_artifact("v1.mp4"));
        assert!(!is_temp_artifact("partial-notes.txt"));
    }
}
