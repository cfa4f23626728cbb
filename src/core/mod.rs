//! Processing core split into focused submodules.
//!
//! The [`VodMirror`] struct and its collaborators are organized by domain:
//! - [`gate`] - Download concurrency gate
//! - [`cancel`] - Cancellation registry for in-flight downloads
//! - [`ports`] - Capability traits for discovery, download, and upload
//! - [`supervisor`] - Process-backed downloader with progress streaming
//! - [`progress`] - Downloader output parsing and scrubbing
//! - [`upload`] - Idempotent upload pipeline
//! - [`circuit`] - Persisted circuit breaker
//! - [`retention`] - Local file retention and temp pruning
//! - [`processor`] - The tick-driven processing scheduler

pub mod cancel;
pub mod circuit;
pub mod gate;
pub mod ports;
pub mod processor;
pub mod progress;
pub mod retention;
pub mod supervisor;
pub mod upload;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::config::{CircuitConfig, Config, ProcessingConfig, RateLimitBackendKind};
use crate::db::{Database, EncryptingTokenStore, NewWorkItem, SqliteTokenStore, TokenStore};
use self::cancel::CancelRegistry;
use self::circuit::CircuitBreaker;
use self::gate::DownloadGate;
use self::ports::{CatalogDiscovery, CatalogEntry, MediaDownloader, Ports, VideoUploader};
use self::supervisor::ProcessDownloader;

/// Page size used when walking the upstream catalog for backfill
const CATALOG_PAGE_SIZE: u32 = 50;

/// The processing core: store, configuration, concurrency primitives, and
/// the capability ports, constructed once at startup and threaded through
/// the scheduler and the HTTP layer. There are no process-wide singletons;
/// everything an operation needs hangs off this value.
pub struct VodMirror {
    /// Database handle (public for embedders and integration tests)
    pub db: Arc<Database>,
    config: Arc<Config>,
    gate: Arc<DownloadGate>,
    cancellations: Arc<CancelRegistry>,
    downloader: Arc<dyn MediaDownloader>,
    uploader: Arc<dyn VideoUploader>,
    discovery: Option<Arc<dyn CatalogDiscovery>>,
    tokens: Arc<dyn TokenStore>,
    shutdown: CancellationToken,
}

impl VodMirror {
    /// Create the core: open the database, run migrations, build the gate and
    /// cancellation registry, and wire the ports (defaulting the downloader
    /// to the process-backed supervisor).
    pub async fn new(config: Config, ports: Ports) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.data_dir).await?;

        let db = Arc::new(Database::new(&config.database_path).await?);
        let gate = Arc::new(DownloadGate::new(config.download.max_concurrent_downloads));
        let cancellations = Arc::new(CancelRegistry::new());

        let downloader: Arc<dyn MediaDownloader> = match ports.downloader {
            Some(downloader) => downloader,
            None => Arc::new(ProcessDownloader::new(
                db.clone(),
                config.download.clone(),
                gate.clone(),
                cancellations.clone(),
            )),
        };

        let plain: Arc<dyn TokenStore> = Arc::new(SqliteTokenStore::new(db.clone()));
        let tokens: Arc<dyn TokenStore> = match &config.encryption_key {
            Some(key) => Arc::new(EncryptingTokenStore::from_base64_key(plain, key)?),
            None => plain,
        };

        Ok(Self {
            db,
            config: Arc::new(config),
            gate,
            cancellations,
            downloader,
            uploader: ports.uploader,
            discovery: ports.discovery,
            tokens,
            shutdown: CancellationToken::new(),
        })
    }

    /// The static configuration
    pub fn config(&self) -> Arc<Config> {
        self.config.clone()
    }

    /// The download concurrency gate
    pub fn gate(&self) -> &DownloadGate {
        &self.gate
    }

    /// The cancellation registry
    pub fn cancellations(&self) -> &CancelRegistry {
        &self.cancellations
    }

    /// The credential store (encrypting wrapper when a key is configured)
    pub fn tokens(&self) -> &Arc<dyn TokenStore> {
        &self.tokens
    }

    /// The media downloader port
    pub(crate) fn downloader(&self) -> &Arc<dyn MediaDownloader> {
        &self.downloader
    }

    /// The video uploader port
    pub(crate) fn uploader(&self) -> &Arc<dyn VideoUploader> {
        &self.uploader
    }

    /// The root shutdown token (cloned by background tasks and streams)
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Circuit breaker with the effective (KV-overridable) settings
    pub async fn circuit_breaker(&self) -> CircuitBreaker {
        let cfg = self.effective_circuit().await;
        CircuitBreaker::new(
            self.db.clone(),
            self.config.channel.clone(),
            cfg.failure_threshold,
            cfg.open_cooldown,
        )
    }

    /// Processing settings with `cfg:*` admin overrides applied
    pub async fn effective_processing(&self) -> ProcessingConfig {
        let mut cfg = self.config.processing.clone();
        let channel = &self.config.channel;

        if let Some(secs) = self.kv_override_u64(channel, "PROCESSING_RETRY_COOLDOWN").await {
            cfg.retry_cooldown = Duration::from_secs(secs);
        }
        if let Some(limit) = self.kv_override_u64(channel, "BACKFILL_UPLOAD_DAILY_LIMIT").await {
            cfg.backfill_daily_limit = limit as u32;
        }
        if let Some(days) = self.kv_override_u64(channel, "RETAIN_KEEP_NEWER_THAN_DAYS").await {
            cfg.retain_newer_than_days = days as u32;
        }

        cfg
    }

    /// Circuit settings with `cfg:*` admin overrides applied
    pub async fn effective_circuit(&self) -> CircuitConfig {
        let mut cfg = self.config.circuit.clone();
        let channel = &self.config.channel;

        if let Some(threshold) = self.kv_override_u64(channel, "CIRCUIT_FAILURE_THRESHOLD").await {
            cfg.failure_threshold = threshold as u32;
        }
        if let Some(secs) = self.kv_override_u64(channel, "CIRCUIT_OPEN_COOLDOWN").await {
            cfg.open_cooldown = Duration::from_secs(secs);
        }

        cfg
    }

    async fn kv_override_u64(&self, channel: &str, key: &str) -> Option<u64> {
        let raw = self
            .db
            .kv_get(channel, &format!("cfg:{key}"))
            .await
            .ok()
            .flatten()?;
        raw.parse().ok()
    }

    /// Abort an in-flight download for the item.
    ///
    /// Returns `true` when a running download was aborted (the child process
    /// is killed and the item is marked canceled with zeroed byte counters),
    /// `false` when there was nothing to cancel.
    pub async fn cancel_download(&self, external_id: &str) -> Result<bool> {
        if !self.cancellations.cancel(external_id) {
            return Ok(false);
        }

        self.db
            .mark_canceled(&self.config.channel, external_id)
            .await?;
        tracing::info!(item = %external_id, "download canceled");
        Ok(true)
    }

    /// Pull the most recent upstream archive entries into the store.
    ///
    /// Returns the number of entries upserted. A missing discovery port is
    /// not an error — there is simply nothing to pull.
    pub async fn run_discovery(&self) -> Result<usize> {
        let Some(discovery) = &self.discovery else {
            return Ok(0);
        };

        let entries = discovery.list_recent(&self.config.channel).await?;
        let count = entries.len();
        self.upsert_entries(entries).await?;

        tracing::info!(count, "discovery pass complete");
        Ok(count)
    }

    /// Walk one page of the full upstream catalog, resuming from the stored
    /// pagination cursor. Returns the number of entries upserted.
    pub async fn run_backfill_page(&self) -> Result<usize> {
        let Some(discovery) = &self.discovery else {
            return Ok(0);
        };
        let channel = &self.config.channel;

        let cursor = self.db.kv_get(channel, "catalog_after").await?;
        let page = discovery
            .list(channel, cursor, CATALOG_PAGE_SIZE)
            .await?;

        let count = page.entries.len();
        self.upsert_entries(page.entries).await?;

        match page.next_cursor {
            Some(cursor) => self.db.kv_put(channel, "catalog_after", &cursor).await?,
            None => self.db.kv_delete(channel, "catalog_after").await?,
        }

        tracing::info!(count, "catalog backfill page complete");
        Ok(count)
    }

    async fn upsert_entries(&self, entries: Vec<CatalogEntry>) -> Result<()> {
        for entry in entries {
            self.db
                .upsert_item(&NewWorkItem {
                    channel: self.config.channel.clone(),
                    external_id: entry.external_id,
                    title: entry.title,
                    recorded_at: entry.recorded_at,
                    duration_seconds: entry.duration_seconds,
                    priority: 0,
                })
                .await?;
        }
        Ok(())
    }

    /// Spawn the periodic background services: the processing scheduler, the
    /// retention engine, and (for the persistent backend) rate-limit row
    /// cleanup. All of them stop when [`VodMirror::shutdown`] runs.
    pub fn start_background_tasks(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let processor = processor::ProcessorTask::new(self.clone());
        handles.push(tokio::spawn(processor.run()));

        let retention = retention::RetentionEngine::new(
            self.db.clone(),
            self.config.channel.clone(),
            self.config.retention.clone(),
            self.config.data_dir.clone(),
        );
        handles.push(tokio::spawn(retention.run(self.shutdown.clone())));

        if self.config.rate_limit.enabled
            && self.config.rate_limit.backend == RateLimitBackendKind::Persistent
        {
            let db = self.db.clone();
            let window = self.config.rate_limit.window;
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(window.max(Duration::from_secs(1)) * 2) => {}
                    }
                    let cutoff = chrono::Utc::now().timestamp_millis() - window.as_millis() as i64;
                    if let Err(e) = db.rate_limit_cleanup(cutoff).await {
                        tracing::warn!(error = %e, "rate-limit cleanup failed");
                    }
                }
            }));
        }

        handles
    }

    /// Spawn the REST API server in a background task
    pub fn spawn_api_server(self: &Arc<Self>) -> tokio::task::JoinHandle<Result<()>> {
        let core = self.clone();
        tokio::spawn(async move { crate::api::start_api_server(core).await })
    }

    /// Begin a graceful shutdown: cancels the root token so every background
    /// task, in-flight download, and open stream drains at its next
    /// suspension point.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("shutting down");
        self.shutdown.cancel();
        Ok(())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
