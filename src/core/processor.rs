//! Processing scheduler: the tick-driven worker loop.
//!
//! Each tick selects at most one work item and pushes it through the
//! download → upload pipeline. Failures are classified — auth-style permanent
//! failures pin the item's retry counter, transient ones feed the circuit
//! breaker and leave the item in cooldown, and cancellations do neither.
//! Old recordings ("backfill") are throttled to a daily upload quota so a
//! fresh deployment does not flood the destination platform.

use std::sync::Arc;
use std::time::Instant;

use crate::classify::{FailureKind, classify};
use crate::core::VodMirror;
use crate::core::circuit::BreakerDecision;
use crate::core::retention::prune_temp_files;
use crate::core::upload::{UploadOutcome, UploadPipeline};
use crate::db::WorkItem;
use crate::error::{DownloadError, UploadError};
use crate::Result;

/// What one scheduler tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The circuit is open; no work was attempted
    CircuitOpen,
    /// No eligible item was found
    Idle,
    /// An item went through download and the upload stage
    Completed {
        /// The processed item
        external_id: String,
    },
    /// The selected item's download failed
    DownloadFailed {
        /// The failed item
        external_id: String,
    },
    /// The selected item downloaded but its upload failed
    UploadFailed {
        /// The failed item
        external_id: String,
    },
    /// The selected item was canceled mid-flight
    Canceled {
        /// The canceled item
        external_id: String,
    },
}

/// The periodic processing task
pub struct ProcessorTask {
    core: Arc<VodMirror>,
}

impl ProcessorTask {
    /// Create the task over the shared core
    pub fn new(core: Arc<VodMirror>) -> Self {
        Self { core }
    }

    /// Run ticks on the configured cadence until shutdown
    pub async fn run(self) {
        let interval = self.core.config().processing.interval;
        let shutdown = self.core.shutdown_token();
        tracing::info!(interval_secs = interval.as_secs(), "processing scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            match self.tick().await {
                Ok(TickOutcome::Idle) => {}
                Ok(outcome) => {
                    tracing::debug!(?outcome, "tick finished");
                }
                Err(e) => {
                    tracing::error!(error = %e, "tick failed");
                }
            }
        }

        tracing::info!("processing scheduler stopped");
    }

    /// One scheduler pass: breaker check, housekeeping, discovery, selection,
    /// and at most one item through the pipeline.
    pub async fn tick(&self) -> Result<TickOutcome> {
        let config = self.core.config();
        let channel = config.channel.as_str();
        let db = &self.core.db;

        db.kv_put(channel, "job_process_last", &chrono::Utc::now().to_rfc3339())
            .await?;

        let breaker = self.core.circuit_breaker().await;
        let half_open = match breaker.check().await? {
            BreakerDecision::Skip { until } => {
                tracing::info!(until = %until, "circuit open, skipping tick");
                return Ok(TickOutcome::CircuitOpen);
            }
            BreakerDecision::HalfOpen => true,
            BreakerDecision::Proceed => false,
        };

        tokio::fs::create_dir_all(&config.data_dir).await?;
        if let Err(e) = prune_temp_files(&config.data_dir, config.retention.cleanup_max_age).await {
            tracing::warn!(error = %e, "temp pruning failed");
        }

        // Discovery problems never abort a tick; the queue still has work
        if let Err(e) = self.core.run_discovery().await {
            tracing::warn!(error = %e, "discovery failed");
        }

        let processing = self.core.effective_processing().await;
        let counts = db.queue_counts(channel).await?;

        let backfill_done = db
            .backfill_uploads_last_day(channel, processing.retain_newer_than_days)
            .await?;
        let throttled = backfill_done >= i64::from(processing.backfill_daily_limit);
        if throttled {
            tracing::info!(
                backfill_done,
                limit = processing.backfill_daily_limit,
                "backfill quota reached, old items deferred"
            );
        }

        let now = chrono::Utc::now().timestamp();
        let candidates = db
            .select_candidates(
                channel,
                processing.max_attempts,
                processing.retry_cooldown.as_secs() as i64,
            )
            .await?;

        let item = candidates.into_iter().find(|item| {
            !(throttled && item.is_backfill(now, processing.retain_newer_than_days))
        });
        let Some(item) = item else {
            tracing::debug!(pending = counts.pending, "no eligible work this tick");
            return Ok(TickOutcome::Idle);
        };

        if half_open {
            tracing::info!(item = %item.external_id, "half-open probe item");
        }

        self.process_item(item).await
    }

    /// Drive one item through download and upload, with breaker and EMA
    /// bookkeeping.
    async fn process_item(&self, item: WorkItem) -> Result<TickOutcome> {
        let config = self.core.config();
        let channel = config.channel.as_str();
        let db = &self.core.db;
        let breaker = self.core.circuit_breaker().await;
        let shutdown = self.core.shutdown_token();
        let external_id = item.external_id.clone();

        tracing::info!(
            item = %external_id,
            title = %item.title,
            priority = item.priority,
            retry_count = item.retry_count,
            "processing work item"
        );

        let total_start = Instant::now();
        let download_start = Instant::now();
        let download_result = self
            .core
            .downloader()
            .download(&shutdown, &item, &config.data_dir)
            .await;

        let local_path = match download_result {
            Ok(path) => path,
            Err(DownloadError::Canceled) => {
                tracing::info!(item = %external_id, "download canceled; not counted as failure");
                return Ok(TickOutcome::Canceled { external_id });
            }
            Err(e) => {
                let message = e.message();
                if classify(&message) == FailureKind::Fatal {
                    // Permanent failures (auth, gone, DRM, bad input): park
                    // the item until a manual reprocess. Only retryable
                    // failures count toward opening the circuit.
                    let processing = self.core.effective_processing().await;
                    db.record_permanent_failure(
                        channel,
                        &external_id,
                        &message,
                        processing.max_attempts,
                    )
                    .await?;
                } else {
                    db.set_last_error(channel, &external_id, &message).await?;
                    breaker.record_failure().await?;
                }
                tracing::warn!(item = %external_id, error = %message, "download failed");
                return Ok(TickOutcome::DownloadFailed { external_id });
            }
        };

        db.kv_update_ema(
            channel,
            "avg_download_ms",
            download_start.elapsed().as_millis() as f64,
        )
        .await?;

        // Record the artifact even when the downloader port doesn't touch the
        // store (the process supervisor does; mocks and future ports may not)
        let file_size = tokio::fs::metadata(&local_path)
            .await
            .map(|m| m.len() as i64)
            .unwrap_or(0);
        db.mark_download_complete(
            channel,
            &external_id,
            &local_path.to_string_lossy(),
            file_size,
        )
        .await?;

        breaker.record_success().await?;

        let Some(item) = db.get_item(channel, &external_id).await? else {
            return Err(crate::Error::NotFound(format!("work item {external_id}")));
        };

        let pipeline = UploadPipeline::new(
            db.clone(),
            self.core.uploader().clone(),
            config.upload.clone(),
        );

        let upload_start = Instant::now();
        let outcome = match pipeline.process_item(&shutdown, &item).await {
            Ok(outcome) => outcome,
            Err(UploadError::Canceled) => {
                return Ok(TickOutcome::Canceled { external_id });
            }
            Err(e) => {
                tracing::warn!(item = %external_id, error = %e, "upload failed");
                return Ok(TickOutcome::UploadFailed { external_id });
            }
        };

        if matches!(outcome, UploadOutcome::Uploaded(_)) {
            db.kv_update_ema(
                channel,
                "avg_upload_ms",
                upload_start.elapsed().as_millis() as f64,
            )
            .await?;
        }
        db.kv_update_ema(
            channel,
            "avg_total_ms",
            total_start.elapsed().as_millis() as f64,
        )
        .await?;

        tracing::info!(item = %external_id, ?outcome, "work item processed");
        Ok(TickOutcome::Completed { external_id })
    }
}
