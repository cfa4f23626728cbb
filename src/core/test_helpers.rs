//! Shared test doubles for the processing core and the API tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::ports::{
    CatalogDiscovery, CatalogEntry, CatalogPage, MediaDownloader, Ports, UploadRequest,
    VideoUploader,
};
use crate::core::VodMirror;
use crate::db::WorkItem;
use crate::error::{DownloadError, UploadError};

/// Downloader double: pops scripted failures, then succeeds by writing a
/// small media file at the deterministic output path.
pub(crate) struct MockDownloader {
    failures: Mutex<VecDeque<DownloadError>>,
    calls: AtomicU32,
}

impl MockDownloader {
    pub(crate) fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
        })
    }

    pub(crate) fn scripted(failures: Vec<DownloadError>) -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(failures.into()),
            calls: AtomicU32::new(0),
        })
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDownloader for MockDownloader {
    async fn download(
        &self,
        _cancel: &CancellationToken,
        item: &WorkItem,
        data_dir: &Path,
    ) -> Result<PathBuf, DownloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let scripted = self.failures.lock().unwrap().pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }

        let path = data_dir.join(format!("{}.mp4", item.external_id));
        std::fs::write(&path, b"mock-media").map_err(|e| DownloadError::Spawn(e.to_string()))?;
        Ok(path)
    }
}

/// Uploader double: fails a scripted number of times, then returns a URL
pub(crate) struct MockUploader {
    failures_remaining: AtomicU32,
    calls: AtomicU32,
    url: String,
}

impl MockUploader {
    pub(crate) fn succeeding() -> Arc<Self> {
        Self::failing_then_ok(0)
    }

    pub(crate) fn failing_then_ok(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_remaining: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
            url: "https://dest.example/v/1".to_string(),
        })
    }

    pub(crate) fn calls(&self) -> u32 {
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
        self.calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
            return Err(UploadError::Transient("503 backend unavailable".into()));
        }
        Ok(self.url.clone())
    }
}

/// Discovery double serving a fixed entry list and a two-page catalog
pub(crate) struct MockDiscovery {
    pub(crate) recent: Vec<CatalogEntry>,
}

impl MockDiscovery {
    pub(crate) fn with_entries(recent: Vec<CatalogEntry>) -> Arc<Self> {
        Arc::new(Self { recent })
    }
}

#[async_trait]
impl CatalogDiscovery for MockDiscovery {
    async fn list(
        &self,
        _channel: &str,
        cursor: Option<String>,
        _page_size: u32,
    ) -> crate::Result<CatalogPage> {
        // Two pages: everything, then an empty terminal page
        match cursor {
            None => Ok(CatalogPage {
                entries: self.recent.clone(),
                next_cursor: Some("end".to_string()),
            }),
            Some(_) => Ok(CatalogPage::default()),
        }
    }

    async fn list_recent(&self, _channel: &str) -> crate::Result<Vec<CatalogEntry>> {
        Ok(self.recent.clone())
    }
}

pub(crate) fn entry(external_id: &str, recorded_at: i64) -> CatalogEntry {
    CatalogEntry {
        external_id: external_id.to_string(),
        title: format!("broadcast {external_id}"),
        recorded_at,
        duration_seconds: 3_600,
    }
}

/// Build a core over a temp directory with mock ports and fast timings.
///
/// Returns the core, the tempdir guard, and the two mocks for assertions.
pub(crate) async fn test_core(
    configure: impl FnOnce(&mut Config),
    downloader: Arc<MockDownloader>,
    uploader: Arc<MockUploader>,
    discovery: Option<Arc<MockDiscovery>>,
) -> (Arc<VodMirror>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");

    let mut config = Config {
        data_dir: dir.path().join("data"),
        database_path: dir.path().join("mirror.db"),
        ..Default::default()
    };
    config.download.backoff_base = std::time::Duration::ZERO;
    config.upload.backoff_base = std::time::Duration::ZERO;
    config.processing.retry_cooldown = std::time::Duration::ZERO;
    configure(&mut config);

    let mut ports = Ports::new(uploader).with_downloader(downloader);
    if let Some(discovery) = discovery {
        ports = ports.with_discovery(discovery);
    }

    let core = VodMirror::new(config, ports).await.expect("core");
    (Arc::new(core), dir)
}
