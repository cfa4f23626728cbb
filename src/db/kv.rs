//! Channel-scoped key-value scratchpad.
//!
//! Small durable state that is not part of a work item: circuit breaker
//! fields, pagination cursors, job timestamps, timing averages, and `cfg:*`
//! admin overrides.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::Database;

impl Database {
    /// Read a scratchpad value
    pub async fn kv_get(&self, channel: &str, key: &str) -> Result<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM kv_state WHERE channel = ? AND key = ?")
                .bind(channel)
                .bind(key)
                .fetch_optional(self.pool())
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to read kv '{}': {}",
                        key, e
                    )))
                })?;

        Ok(value)
    }

    /// Write a scratchpad value (upsert)
    pub async fn kv_put(&self, channel: &str, key: &str, value: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO kv_state (channel, key, value, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(channel, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(channel)
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to write kv '{}': {}",
                key, e
            )))
        })?;

        Ok(())
    }

    /// Delete a scratchpad value (missing keys are fine)
    pub async fn kv_delete(&self, channel: &str, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_state WHERE channel = ? AND key = ?")
            .bind(channel)
            .bind(key)
            .execute(self.pool())
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete kv '{}': {}",
                    key, e
                )))
            })?;

        Ok(())
    }

    /// Read a scratchpad value parsed as an integer; unparseable or missing
    /// values yield the default.
    pub async fn kv_get_i64(&self, channel: &str, key: &str, default: i64) -> Result<i64> {
        let value = self.kv_get(channel, key).await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(default))
    }

    /// Read a scratchpad value parsed as a float; unparseable or missing
    /// values yield the default.
    pub async fn kv_get_f64(&self, channel: &str, key: &str, default: f64) -> Result<f64> {
        let value = self.kv_get(channel, key).await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(default))
    }

    /// Fold a new sample into an exponentially weighted moving average stored
    /// under `key` (α = 0.2). A missing average seeds with the sample itself.
    pub async fn kv_update_ema(&self, channel: &str, key: &str, sample_ms: f64) -> Result<f64> {
        const ALPHA: f64 = 0.2;

        let current = self.kv_get(channel, key).await?;
        let updated = match current.and_then(|v| v.parse::<f64>().ok()) {
            Some(prev) => ALPHA * sample_ms + (1.0 - ALPHA) * prev,
            None => sample_ms,
        };

        self.kv_put(channel, key, &format!("{updated:.1}")).await?;
        Ok(updated)
    }
}
