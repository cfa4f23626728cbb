//! Work item CRUD, candidate selection, and lifecycle mutations.
//!
//! Every mutation targets a row by its natural key `(channel, external_id)`
//! and stamps `updated_at`, which makes state transitions for one item
//! linearizable without explicit locking. The one guarded write is
//! [`Database::record_destination`], which only fires while `destination_url`
//! is still empty — the durable anchor that keeps uploads idempotent.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::{Database, NewWorkItem, WorkItem};

/// Columns fetched for every work item query
const ITEM_COLUMNS: &str = r#"
    id, channel, external_id, title, recorded_at, duration_seconds,
    processed, last_error, retry_count, download_state,
    bytes_done, bytes_total, local_path, destination_url,
    priority, skip_upload, custom_description,
    progress_updated_at, updated_at, created_at
"#;

/// Aggregate queue counters for the status endpoint
#[derive(Debug, Clone, Default, serde::Serialize, utoipa::ToSchema)]
pub struct QueueCounts {
    /// Items not yet processed
    pub pending: i64,
    /// Unprocessed items carrying an error
    pub errored: i64,
    /// Items processed successfully
    pub processed: i64,
}

/// One bucket of the pending queue grouped by priority
#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct PriorityBucket {
    /// Priority value
    pub priority: i64,
    /// Number of pending items at this priority
    pub count: i64,
}

impl Database {
    /// Insert a discovered item, or refresh its metadata if it already exists.
    ///
    /// Conflicts on `(channel, external_id)` update only upstream metadata
    /// (title, duration, recorded time); processing state is never touched, so
    /// rediscovery cannot reset retries or cooldowns.
    pub async fn upsert_item(&self, item: &NewWorkItem) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO work_items (
                channel, external_id, title, recorded_at, duration_seconds,
                priority, updated_at, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(channel, external_id) DO UPDATE SET
                title = excluded.title,
                recorded_at = excluded.recorded_at,
                duration_seconds = excluded.duration_seconds
            "#,
        )
        .bind(&item.channel)
        .bind(&item.external_id)
        .bind(&item.title)
        .bind(item.recorded_at)
        .bind(item.duration_seconds)
        .bind(item.priority)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to upsert work item: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Get a work item by its natural key
    pub async fn get_item(&self, channel: &str, external_id: &str) -> Result<Option<WorkItem>> {
        let row = sqlx::query_as::<_, WorkItem>(&format!(
            "SELECT {ITEM_COLUMNS} FROM work_items WHERE channel = ? AND external_id = ?"
        ))
        .bind(channel)
        .bind(external_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get work item: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// List items for a channel, newest recordings first
    pub async fn list_items(
        &self,
        channel: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WorkItem>> {
        let rows = sqlx::query_as::<_, WorkItem>(&format!(
            r#"
            SELECT {ITEM_COLUMNS} FROM work_items
            WHERE channel = ?
            ORDER BY recorded_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#
        ))
        .bind(channel)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list work items: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Select processing candidates for the scheduler.
    ///
    /// Eligible items are unprocessed and either clean or past their retry
    /// cooldown with attempts remaining. Ordered highest priority first, then
    /// oldest recording first; capped at 20 rows — the scheduler walks the
    /// page first-fit and stops at the first acceptable item.
    pub async fn select_candidates(
        &self,
        channel: &str,
        max_attempts: u32,
        cooldown_secs: i64,
    ) -> Result<Vec<WorkItem>> {
        let now = chrono::Utc::now().timestamp();
        let cooled_before = now - cooldown_secs;

        let rows = sqlx::query_as::<_, WorkItem>(&format!(
            r#"
            SELECT {ITEM_COLUMNS} FROM work_items
            WHERE channel = ?
              AND processed = FALSE
              AND (last_error = '' OR (retry_count < ? AND updated_at <= ?))
            ORDER BY priority DESC, recorded_at ASC
            LIMIT 20
            "#
        ))
        .bind(channel)
        .bind(i64::from(max_attempts))
        .bind(cooled_before)
        .fetch_all(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to select candidates: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Count successful backfill uploads completed in the trailing 24 hours.
    ///
    /// A backfill upload is one whose item was recorded before the retain
    /// window. Feeds the scheduler's daily backfill throttle.
    pub async fn backfill_uploads_last_day(
        &self,
        channel: &str,
        retain_newer_than_days: u32,
    ) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let recorded_cutoff = now - i64::from(retain_newer_than_days) * 86_400;
        let window_start = now - 86_400;

        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM work_items
            WHERE channel = ?
              AND destination_url != ''
              AND recorded_at < ?
              AND updated_at >= ?
            "#,
        )
        .bind(channel)
        .bind(recorded_cutoff)
        .bind(window_start)
        .fetch_one(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to count backfill uploads: {}",
                e
            )))
        })?;

        Ok(count)
    }

    /// Update live download progress for an item.
    ///
    /// Stamps `progress_updated_at` only; `updated_at` is reserved for state
    /// transitions so that progress chatter does not reset retry cooldowns.
    pub async fn set_download_progress(
        &self,
        channel: &str,
        external_id: &str,
        state: &str,
        bytes_done: i64,
        bytes_total: i64,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            UPDATE work_items
            SET download_state = ?, bytes_done = ?, bytes_total = ?, progress_updated_at = ?
            WHERE channel = ? AND external_id = ?
            "#,
        )
        .bind(state)
        .bind(bytes_done)
        .bind(bytes_total)
        .bind(now)
        .bind(channel)
        .bind(external_id)
        .execute(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to update download progress: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Record a completed download: final state, true file size, local path.
    pub async fn mark_download_complete(
        &self,
        channel: &str,
        external_id: &str,
        local_path: &str,
        file_size: i64,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            UPDATE work_items
            SET download_state = 'complete', bytes_done = ?, bytes_total = ?,
                local_path = ?, progress_updated_at = ?, updated_at = ?
            WHERE channel = ? AND external_id = ?
            "#,
        )
        .bind(file_size)
        .bind(file_size)
        .bind(local_path)
        .bind(now)
        .bind(now)
        .bind(channel)
        .bind(external_id)
        .execute(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to mark download complete: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Record a cancellation: canceled state, byte counters zeroed.
    pub async fn mark_canceled(&self, channel: &str, external_id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            UPDATE work_items
            SET download_state = 'canceled', bytes_done = 0, bytes_total = 0,
                progress_updated_at = ?, updated_at = ?
            WHERE channel = ? AND external_id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(channel)
        .bind(external_id)
        .execute(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to mark download canceled: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Record a failed attempt: error text plus one consumed retry.
    pub async fn record_failure(
        &self,
        channel: &str,
        external_id: &str,
        error: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            UPDATE work_items
            SET last_error = ?, retry_count = retry_count + 1, updated_at = ?
            WHERE channel = ? AND external_id = ?
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(channel)
        .bind(external_id)
        .execute(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to record failure: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Overwrite the error text without consuming a retry (scheduler-side
    /// bookkeeping after the supervisor already counted its attempts).
    pub async fn set_last_error(
        &self,
        channel: &str,
        external_id: &str,
        error: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            "UPDATE work_items SET last_error = ?, updated_at = ? WHERE channel = ? AND external_id = ?",
        )
        .bind(error)
        .bind(now)
        .bind(channel)
        .bind(external_id)
        .execute(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to set last error: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Record a permanent failure: the retry counter is pinned to the attempt
    /// cap so the scheduler skips the item until a manual reprocess.
    pub async fn record_permanent_failure(
        &self,
        channel: &str,
        external_id: &str,
        error: &str,
        max_attempts: u32,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            UPDATE work_items
            SET last_error = ?, retry_count = MAX(retry_count, ?), updated_at = ?
            WHERE channel = ? AND external_id = ?
            "#,
        )
        .bind(error)
        .bind(i64::from(max_attempts))
        .bind(now)
        .bind(channel)
        .bind(external_id)
        .execute(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to record permanent failure: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Record a successful upload.
    ///
    /// Guarded write-once: fires only while `destination_url` is still empty,
    /// and returns whether this call was the one that set it. A `false` return
    /// with a non-empty stored URL means another pass already uploaded the
    /// item and the caller must not upload again.
    pub async fn record_destination(
        &self,
        channel: &str,
        external_id: &str,
        destination_url: &str,
    ) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET destination_url = ?, processed = TRUE, last_error = '', updated_at = ?
            WHERE channel = ? AND external_id = ? AND destination_url = ''
            "#,
        )
        .bind(destination_url)
        .bind(now)
        .bind(channel)
        .bind(external_id)
        .execute(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to record destination URL: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Mark an item processed without an upload (skip_upload items, or a
    /// scheduler pass that found the destination already recorded).
    pub async fn mark_processed(&self, channel: &str, external_id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            UPDATE work_items
            SET processed = TRUE, last_error = '', updated_at = ?
            WHERE channel = ? AND external_id = ?
            "#,
        )
        .bind(now)
        .bind(channel)
        .bind(external_id)
        .execute(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to mark item processed: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Clear the recorded local path (after deletion, or when the file is gone)
    pub async fn clear_local_path(&self, channel: &str, external_id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            "UPDATE work_items SET local_path = '', updated_at = ? WHERE channel = ? AND external_id = ?",
        )
        .bind(now)
        .bind(channel)
        .bind(external_id)
        .execute(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to clear local path: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Reset an item for manual reprocessing.
    ///
    /// Clears everything the pipeline wrote: success flag, errors, destination
    /// URL, local path, download state, retry counter, and byte counters.
    /// Returns whether the item existed.
    pub async fn reset_item(&self, channel: &str, external_id: &str) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET processed = FALSE, last_error = '', destination_url = '',
                local_path = '', download_state = '', retry_count = 0,
                bytes_done = 0, bytes_total = 0, updated_at = ?
            WHERE channel = ? AND external_id = ?
            "#,
        )
        .bind(now)
        .bind(channel)
        .bind(external_id)
        .execute(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to reset work item: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Update an item's selection priority. Returns whether the item existed.
    pub async fn set_priority(
        &self,
        channel: &str,
        external_id: &str,
        priority: i64,
    ) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            "UPDATE work_items SET priority = ?, updated_at = ? WHERE channel = ? AND external_id = ?",
        )
        .bind(priority)
        .bind(now)
        .bind(channel)
        .bind(external_id)
        .execute(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to set priority: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Toggle the skip-upload flag. Returns whether the item existed.
    pub async fn set_skip_upload(
        &self,
        channel: &str,
        external_id: &str,
        skip_upload: bool,
    ) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            "UPDATE work_items SET skip_upload = ?, updated_at = ? WHERE channel = ? AND external_id = ?",
        )
        .bind(skip_upload)
        .bind(now)
        .bind(channel)
        .bind(external_id)
        .execute(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to set skip_upload: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Aggregate queue counters
    pub async fn queue_counts(&self, channel: &str) -> Result<QueueCounts> {
        let row: (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN processed = FALSE THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN processed = FALSE AND last_error != '' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN processed = TRUE THEN 1 ELSE 0 END), 0)
            FROM work_items
            WHERE channel = ?
            "#,
        )
        .bind(channel)
        .fetch_one(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to compute queue counts: {}",
                e
            )))
        })?;

        Ok(QueueCounts {
            pending: row.0,
            errored: row.1,
            processed: row.2,
        })
    }

    /// Pending queue grouped by priority, highest first
    pub async fn queue_by_priority(&self, channel: &str) -> Result<Vec<PriorityBucket>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT priority, COUNT(*) FROM work_items
            WHERE channel = ? AND processed = FALSE
            GROUP BY priority
            ORDER BY priority DESC
            "#,
        )
        .bind(channel)
        .fetch_all(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to group queue by priority: {}",
                e
            )))
        })?;

        Ok(rows
            .into_iter()
            .map(|(priority, count)| PriorityBucket { priority, count })
            .collect())
    }

    /// Items that still reference a local file (retention sweep input)
    pub async fn items_with_local_files(&self, channel: &str) -> Result<Vec<WorkItem>> {
        let rows = sqlx::query_as::<_, WorkItem>(&format!(
            "SELECT {ITEM_COLUMNS} FROM work_items WHERE channel = ? AND local_path != ''"
        ))
        .bind(channel)
        .fetch_all(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list items with local files: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// External ids of the newest `count` recordings (retention keep-count set)
    pub async fn newest_item_ids(&self, channel: &str, count: u32) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT external_id FROM work_items
            WHERE channel = ?
            ORDER BY recorded_at DESC
            LIMIT ?
            "#,
        )
        .bind(channel)
        .bind(i64::from(count))
        .fetch_all(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list newest items: {}",
                e
            )))
        })?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
