//! Persistent sliding-window rate-limit rows.
//!
//! The persistent backend appends one row per request and counts rows inside
//! the window. Millisecond timestamps keep sub-second windows (used heavily in
//! tests) meaningful.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::Database;

impl Database {
    /// Record one request hit for a client
    pub async fn rate_limit_record(&self, client_key: &str, request_time_ms: i64) -> Result<()> {
        sqlx::query("INSERT INTO rate_limit_hits (client_key, request_time_ms) VALUES (?, ?)")
            .bind(client_key)
            .bind(request_time_ms)
            .execute(self.pool())
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to record rate-limit hit: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Count a client's hits strictly newer than `cutoff_ms`
    pub async fn rate_limit_count_since(&self, client_key: &str, cutoff_ms: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM rate_limit_hits WHERE client_key = ? AND request_time_ms > ?",
        )
        .bind(client_key)
        .bind(cutoff_ms)
        .fetch_one(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to count rate-limit hits: {}",
                e
            )))
        })?;

        Ok(count)
    }

    /// Earliest hit time inside the window, for Retry-After computation
    pub async fn rate_limit_oldest_since(
        &self,
        client_key: &str,
        cutoff_ms: i64,
    ) -> Result<Option<i64>> {
        let oldest: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(request_time_ms) FROM rate_limit_hits WHERE client_key = ? AND request_time_ms > ?",
        )
        .bind(client_key)
        .bind(cutoff_ms)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to read oldest rate-limit hit: {}",
                e
            )))
        })?
        .flatten();

        Ok(oldest)
    }

    /// Drop hits older than `cutoff_ms` (periodic cleanup). Returns the number
    /// of rows removed.
    pub async fn rate_limit_cleanup(&self, cutoff_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limit_hits WHERE request_time_ms <= ?")
            .bind(cutoff_ms)
            .execute(self.pool())
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to clean up rate-limit hits: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected())
    }
}
