//! Capability ports consumed by the processing core.
//!
//! Discovery, download, and upload are external collaborators reached through
//! narrow trait interfaces. Production wires a process-backed downloader (see
//! [`crate::core::supervisor`]) and platform clients; tests substitute
//! deterministic implementations.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::db::WorkItem;
use crate::error::{DownloadError, UploadError};

/// One archive entry as reported by upstream discovery
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    /// Natural key of the entry
    pub external_id: String,
    /// Title as reported upstream
    pub title: String,
    /// Unix timestamp of the original broadcast
    pub recorded_at: i64,
    /// Recording length in seconds
    pub duration_seconds: i64,
}

/// One page of the upstream archive catalog
#[derive(Debug, Clone, Default)]
pub struct CatalogPage {
    /// Entries on this page
    pub entries: Vec<CatalogEntry>,
    /// Cursor for the next page; `None` when the catalog is exhausted
    pub next_cursor: Option<String>,
}

/// Upstream archive discovery
#[async_trait]
pub trait CatalogDiscovery: Send + Sync {
    /// List one catalog page starting at `cursor`
    async fn list(
        &self,
        channel: &str,
        cursor: Option<String>,
        page_size: u32,
    ) -> crate::Result<CatalogPage>;

    /// List the most recent archive entries
    async fn list_recent(&self, channel: &str) -> crate::Result<Vec<CatalogEntry>>;
}

/// Media download capability.
///
/// The returned path points at a fully downloaded file owned by the caller.
/// Implementations must treat `cancel` as authoritative: when it fires they
/// stop promptly and return [`DownloadError::Canceled`], which the scheduler
/// does not count as a failure.
#[async_trait]
pub trait MediaDownloader: Send + Sync {
    /// Download the item's media into `data_dir` and return the file path
    async fn download(
        &self,
        cancel: &CancellationToken,
        item: &WorkItem,
        data_dir: &Path,
    ) -> Result<PathBuf, DownloadError>;
}

/// A single upload request prepared by the pipeline
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Local media file to upload
    pub local_path: PathBuf,
    /// Normalized title
    pub title: String,
    /// Description text
    pub description: String,
    /// Platform visibility ("private", "unlisted", "public")
    pub visibility: String,
}

/// Video upload capability.
///
/// On success the implementation returns the public URL of the uploaded
/// video. Error messages are classified by the pipeline (see
/// [`UploadError::from_client_message`]); implementations should surface the
/// platform's message text unchanged.
#[async_trait]
pub trait VideoUploader: Send + Sync {
    /// Upload the file and return its destination URL
    async fn upload(
        &self,
        cancel: &CancellationToken,
        request: &UploadRequest,
    ) -> Result<String, UploadError>;
}

/// External collaborators handed to [`crate::VodMirror::new`].
///
/// The uploader is mandatory (there is no meaningful default); the downloader
/// defaults to the process-backed supervisor, and discovery is optional — a
/// deployment without it simply processes whatever is already in the store.
pub struct Ports {
    /// Media downloader; `None` selects the process-backed supervisor
    pub downloader: Option<Arc<dyn MediaDownloader>>,
    /// Video uploader
    pub uploader: Arc<dyn VideoUploader>,
    /// Upstream catalog discovery
    pub discovery: Option<Arc<dyn CatalogDiscovery>>,
}

impl Ports {
    /// Ports with only the mandatory uploader wired
    pub fn new(uploader: Arc<dyn VideoUploader>) -> Self {
        Self {
            downloader: None,
            uploader,
            discovery: None,
        }
    }

    /// Replace the default process-backed downloader
    #[must_use]
    pub fn with_downloader(mut self, downloader: Arc<dyn MediaDownloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    /// Wire upstream catalog discovery
    #[must_use]
    pub fn with_discovery(mut self, discovery: Arc<dyn CatalogDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }
}
