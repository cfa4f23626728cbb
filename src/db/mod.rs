//! Database layer for vod-mirror
//!
//! Handles SQLite persistence for work items, the key-value scratchpad, chat
//! transcripts, OAuth tokens, and rate-limit hits.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] — Database lifecycle, schema migrations
//! - [`items`] — Work item CRUD, candidate selection, lifecycle mutations
//! - [`kv`] — Channel-scoped key-value scratchpad
//! - [`chat`] — Chat transcript append and windowed reads
//! - [`tokens`] — OAuth token store (with optional encryption wrapper)
//! - [`rate_limit`] — Persistent sliding-window hit rows
//!
//! All mutations use parameterized statements with SQLite's native `?`
//! placeholders, and writes to a work item go through its natural key
//! `(channel, external_id)` so state transitions serialize per item.

use sqlx::FromRow;
use sqlx::sqlite::SqlitePool;

pub mod chat;
pub mod items;
pub mod kv;
pub mod migrations;
pub mod rate_limit;
pub mod tokens;

pub use self::tokens::{EncryptingTokenStore, SqliteTokenStore, TokenRecord, TokenStore};

/// New work item to be inserted by discovery
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    /// Channel scoping key (empty string permitted)
    pub channel: String,
    /// Natural key from the upstream archive
    pub external_id: String,
    /// Title as reported upstream
    pub title: String,
    /// Unix timestamp of the original broadcast
    pub recorded_at: i64,
    /// Recording length in seconds
    pub duration_seconds: i64,
    /// Selection priority (higher = earlier)
    pub priority: i64,
}

/// Work item record from the database
///
/// One row per upstream archive entry. See the crate documentation for the
/// field invariants; the important ones are that `destination_url` is
/// write-once (the upload idempotency anchor) and that `processed` implies
/// either a destination URL or `skip_upload`.
#[derive(Debug, Clone, FromRow)]
pub struct WorkItem {
    /// Database row id
    pub id: i64,
    /// Channel scoping key
    pub channel: String,
    /// Natural key from the upstream archive
    pub external_id: String,
    /// Title as reported upstream
    pub title: String,
    /// Unix timestamp of the original broadcast
    pub recorded_at: i64,
    /// Recording length in seconds
    pub duration_seconds: i64,
    /// Terminal success flag
    pub processed: bool,
    /// Last failure message; empty when healthy
    pub last_error: String,
    /// Attempts consumed since the last manual reprocess
    pub retry_count: i64,
    /// Free-form progress tag: "downloading", "complete", "canceled", or a raw
    /// progress line from the downloader
    pub download_state: String,
    /// Bytes downloaded so far
    pub bytes_done: i64,
    /// Total bytes expected (0 when unknown)
    pub bytes_total: i64,
    /// Path of the downloaded file; empty when no file exists locally
    pub local_path: String,
    /// URL on the destination platform; non-empty iff upload succeeded
    pub destination_url: String,
    /// Selection priority (higher = earlier)
    pub priority: i64,
    /// Skip the upload stage for this item
    pub skip_upload: bool,
    /// Optional description override for the upload
    pub custom_description: String,
    /// Unix timestamp of the last progress update
    pub progress_updated_at: i64,
    /// Unix timestamp of the last state mutation
    pub updated_at: i64,
    /// Unix timestamp of row creation
    pub created_at: i64,
}

impl WorkItem {
    /// Whether this item is a backfill candidate: recorded earlier than the
    /// configured retain window.
    pub fn is_backfill(&self, now: i64, retain_newer_than_days: u32) -> bool {
        let cutoff = now - i64::from(retain_newer_than_days) * 86_400;
        self.recorded_at < cutoff
    }
}

/// New chat message to be appended to a work item's transcript
#[derive(Debug, Clone)]
pub struct NewChatMessage {
    /// Work item the message belongs to
    pub external_id: String,
    /// Sender username
    pub username: String,
    /// Message text
    pub body: String,
    /// Absolute Unix timestamp of the message
    pub abs_time: i64,
    /// Offset in seconds from the start of the recording
    pub rel_time: f64,
    /// Badge list as serialized upstream
    pub badges: String,
    /// Emote list as serialized upstream
    pub emotes: String,
    /// Display color
    pub color: String,
}

/// Chat message record from the database
#[derive(Debug, Clone, FromRow, serde::Serialize, utoipa::ToSchema)]
pub struct ChatMessage {
    /// Database row id
    pub id: i64,
    /// Work item the message belongs to
    pub external_id: String,
    /// Sender username
    pub username: String,
    /// Message text
    pub body: String,
    /// Absolute Unix timestamp of the message
    pub abs_time: i64,
    /// Offset in seconds from the start of the recording
    pub rel_time: f64,
    /// Badge list as serialized upstream
    pub badges: String,
    /// Emote list as serialized upstream
    pub emotes: String,
    /// Display color
    pub color: String,
}

/// Database handle for vod-mirror
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Liveness probe: round-trip a trivial query through the pool.
    pub async fn ping(&self) -> crate::Result<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                crate::Error::Database(crate::DatabaseError::QueryFailed(format!(
                    "ping failed: {}",
                    e
                )))
            })?;
        Ok(())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
