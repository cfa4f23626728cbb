//! # vod-mirror
//!
//! Backend library for self-hosted VOD archiving: continuously discover a
//! broadcaster's recorded archive, download each item with an external
//! downloader, re-upload it to a secondary video platform, and keep a
//! searchable local mirror of the chat transcripts.
//!
//! ## Design Philosophy
//!
//! vod-mirror is designed to be:
//! - **Durable** - every state transition is persisted; the worker resumes
//!   cleanly after a restart
//! - **Idempotent** - an item is uploaded at most once, anchored on its
//!   recorded destination URL
//! - **Library-first** - no CLI or UI, purely a Rust crate for embedding
//! - **Port-driven** - discovery, download, and upload are capability traits
//!   that callers (and tests) implement
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use vod_mirror::{Config, Ports, VodMirror};
//! # use vod_mirror::core::ports::{UploadRequest, VideoUploader};
//! # use vod_mirror::error::UploadError;
//! # struct MyUploader;
//! # #[async_trait::async_trait]
//! # impl VideoUploader for MyUploader {
//! #     async fn upload(
//! #         &self,
//! #         _cancel: &tokio_util::sync::CancellationToken,
//! #         _request: &UploadRequest,
//! #     ) -> Result<String, UploadError> {
//! #         Ok("https://example.com/v/1".into())
//! #     }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let ports = Ports::new(Arc::new(MyUploader));
//!
//!     let core = Arc::new(VodMirror::new(config, ports).await?);
//!     core.start_background_tasks();
//!     let _server = core.spawn_api_server();
//!
//!     vod_mirror::run_with_shutdown(&core).await
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// REST API module
pub mod api;
/// Chat replay streaming
pub mod chat;
/// Error message classification
pub mod classify;
/// Configuration types
pub mod config;
/// Processing core (scheduler, supervisor, upload pipeline, breaker, retention)
pub mod core;
/// Database persistence layer
pub mod db;
/// Error types
pub mod error;
/// Retry backoff helpers
pub mod retry;

// Re-export commonly used types
pub use crate::classify::FailureKind;
pub use crate::config::Config;
pub use crate::core::VodMirror;
pub use crate::core::circuit::CircuitState;
pub use crate::core::ports::{
    CatalogDiscovery, CatalogEntry, CatalogPage, MediaDownloader, Ports, UploadRequest,
    VideoUploader,
};
pub use crate::db::Database;
pub use crate::error::{
    ApiError, DatabaseError, DownloadError, Error, Result, ToHttpStatus, UploadError,
};

/// Helper function to run the service with graceful signal handling.
///
/// Waits for a termination signal and then calls the core's `shutdown()`
/// method, which cancels the root cancellation token and lets every
/// background task drain at its next suspension point.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(
    core: &std::sync::Arc<VodMirror>,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    wait_for_signal().await;
    core.shutdown().await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
