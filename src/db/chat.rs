//! Chat transcript append and windowed reads.
//!
//! Messages are append-only and ordered by `rel_time` (seconds from the start
//! of the recording). The replay streamer reads in keyset-paginated pages so
//! no cursor is held open across the pacing sleeps.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::{ChatMessage, Database, NewChatMessage};

impl Database {
    /// Append a batch of chat messages to an item's transcript
    pub async fn insert_chat_messages(&self, messages: &[NewChatMessage]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool().begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin chat insert: {}",
                e
            )))
        })?;

        for message in messages {
            sqlx::query(
                r#"
                INSERT INTO chat_messages (
                    external_id, username, body, abs_time, rel_time, badges, emotes, color
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&message.external_id)
            .bind(&message.username)
            .bind(&message.body)
            .bind(message.abs_time)
            .bind(message.rel_time)
            .bind(&message.badges)
            .bind(&message.emotes)
            .bind(&message.color)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to insert chat message: {}",
                    e
                )))
            })?;
        }

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit chat insert: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Read a bounded window of an item's transcript, ordered by `rel_time`.
    ///
    /// `to = None` means no upper bound. `limit` must already be clamped by
    /// the caller.
    pub async fn chat_window(
        &self,
        external_id: &str,
        from_rel: f64,
        to_rel: Option<f64>,
        limit: i64,
    ) -> Result<Vec<ChatMessage>> {
        let to_rel = to_rel.unwrap_or(f64::MAX);

        let rows = sqlx::query_as::<_, ChatMessage>(
            r#"
            SELECT id, external_id, username, body, abs_time, rel_time, badges, emotes, color
            FROM chat_messages
            WHERE external_id = ? AND rel_time >= ? AND rel_time <= ?
            ORDER BY rel_time ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(external_id)
        .bind(from_rel)
        .bind(to_rel)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to read chat window: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Read one replay page after a keyset position.
    ///
    /// `after` is the `(rel_time, id)` of the last message already emitted;
    /// `None` starts at `from_rel`. Pages are strictly ordered so the streamer
    /// sees every matching row exactly once.
    pub async fn chat_page(
        &self,
        external_id: &str,
        from_rel: f64,
        after: Option<(f64, i64)>,
        page_size: i64,
    ) -> Result<Vec<ChatMessage>> {
        let (after_rel, after_id) = after.unwrap_or((f64::MIN, i64::MIN));

        let rows = sqlx::query_as::<_, ChatMessage>(
            r#"
            SELECT id, external_id, username, body, abs_time, rel_time, badges, emotes, color
            FROM chat_messages
            WHERE external_id = ? AND rel_time >= ?
              AND (rel_time > ? OR (rel_time = ? AND id > ?))
            ORDER BY rel_time ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(external_id)
        .bind(from_rel)
        .bind(after_rel)
        .bind(after_rel)
        .bind(after_id)
        .bind(page_size)
        .fetch_all(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to read chat page: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Number of messages at or after `from_rel` for an item
    pub async fn chat_count_from(&self, external_id: &str, from_rel: f64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chat_messages WHERE external_id = ? AND rel_time >= ?",
        )
        .bind(external_id)
        .bind(from_rel)
        .fetch_one(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to count chat messages: {}",
                e
            )))
        })?;

        Ok(count)
    }
}
