//! Download supervisor: process-backed [`MediaDownloader`].
//!
//! Each download launches the external downloader as a child process, streams
//! its diagnostic output into the store as live progress, and retries
//! transient failures with exponential backoff. The output path is a
//! deterministic function of the external id, so a partial `.part` artifact
//! left by a crash is picked up and resumed by the next attempt or the next
//! process.
//!
//! Cancellation: every attempt registers a child token in the
//! [`CancelRegistry`]; firing it kills the child process, which closes its
//! output streams and unwinds the attempt. A canceled download is not a
//! failure — it consumes no retry and never feeds the circuit breaker.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::classify::{FailureKind, classify};
use crate::config::DownloadConfig;
use crate::core::cancel::CancelRegistry;
use crate::core::gate::DownloadGate;
use crate::core::ports::MediaDownloader;
use crate::core::progress::{OutputTail, parse_progress};
use crate::db::{Database, WorkItem};
use crate::error::DownloadError;
use crate::retry::{backoff_delay, sleep_cancellable};

/// Name of the accelerator binary probed on PATH
const ACCELERATOR_BINARY: &str = "aria2c";

/// Lines of diagnostic tail included in failure messages
const ERROR_TAIL_LINES: usize = 8;

/// Process-backed downloader supervising an external media download tool
pub struct ProcessDownloader {
    db: Arc<Database>,
    config: DownloadConfig,
    gate: Arc<DownloadGate>,
    registry: Arc<CancelRegistry>,
    accelerator: Option<PathBuf>,
}

enum AttemptOutcome {
    /// Final file size in bytes
    Success(i64),
    Canceled,
    Failed(String),
}

impl ProcessDownloader {
    /// Create a supervisor; probes PATH once for the optional accelerator.
    pub fn new(
        db: Arc<Database>,
        config: DownloadConfig,
        gate: Arc<DownloadGate>,
        registry: Arc<CancelRegistry>,
    ) -> Self {
        let accelerator = if config.use_accelerator {
            match which::which(ACCELERATOR_BINARY) {
                Ok(path) => {
                    tracing::info!(accelerator = %path.display(), "external download accelerator found");
                    Some(path)
                }
                Err(_) => None,
            }
        } else {
            None
        };

        Self {
            db,
            config,
            gate,
            registry,
            accelerator,
        }
    }

    /// Deterministic output path for an item. The external tool appends
    /// `.part` while transferring, which is what makes restarts resumable.
    pub fn output_path(data_dir: &Path, external_id: &str) -> PathBuf {
        let stable: String = external_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        data_dir.join(format!("{stable}.mp4"))
    }

    fn build_command(&self, item: &WorkItem, out_path: &Path, cookie_file: Option<&Path>) -> Command {
        let mut command = Command::new(&self.config.downloader_path);

        command
            .arg("-o")
            .arg(out_path)
            .arg("--retries")
            .arg("infinite")
            .arg("--fragment-retries")
            .arg("infinite")
            .arg("--concurrent-fragments")
            .arg(self.config.fragment_concurrency.to_string())
            .arg("--no-cache-dir")
            .arg("--newline");

        if let Some(cookie) = cookie_file {
            command.arg("--cookies").arg(cookie);
        }

        if let Some(accelerator) = &self.accelerator {
            command.arg("--downloader").arg(accelerator);
        }

        let credentials_present = cookie_file.is_some();
        for extra in &self.config.extra_args {
            // Verbose output echoes request headers; never allow it while a
            // credential file is in play.
            if credentials_present && (extra == "-v" || extra == "--verbose") {
                continue;
            }
            command.arg(extra);
        }

        command.arg(self.config.source_url(&item.external_id));
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);
        command
    }

    /// Copy the configured cookie file to a private temp file readable only
    /// by this process. Returns a guard that deletes it on drop.
    async fn stage_cookie_file(&self, data_dir: &Path) -> Result<Option<CookieGuard>, DownloadError> {
        let Some(source) = &self.config.cookie_file else {
            return Ok(None);
        };

        let staged = data_dir.join(format!(".cookies-{}.tmp", std::process::id()));
        let bytes = tokio::fs::read(source)
            .await
            .map_err(|e| DownloadError::Spawn(format!("failed to read cookie file: {e}")))?;
        tokio::fs::write(&staged, bytes)
            .await
            .map_err(|e| DownloadError::Spawn(format!("failed to stage cookie file: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| DownloadError::Spawn(format!("failed to restrict cookie file: {e}")))?;
        }

        Ok(Some(CookieGuard { path: staged }))
    }

    async fn run_attempt(
        &self,
        attempt_token: &CancellationToken,
        item: &WorkItem,
        out_path: &Path,
        cookie_path: Option<&Path>,
    ) -> AttemptOutcome {
        let mut command = self.build_command(item, out_path, cookie_path);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return AttemptOutcome::Failed(format!("failed to spawn downloader: {e}")),
        };

        // Merge both output streams into one line channel; the forwarders end
        // when the child's pipes close (exit or kill).
        let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
        if let Some(stdout) = child.stdout.take() {
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(line_tx);

        let mut tail = OutputTail::new();
        let mut last_total: i64 = item.bytes_total;

        loop {
            tokio::select! {
                _ = attempt_token.cancelled() => {
                    tracing::info!(item = %item.external_id, "killing downloader on cancel");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return AttemptOutcome::Canceled;
                }
                line = line_rx.recv() => {
                    match line {
                        Some(line) => {
                            if let Some(update) = parse_progress(&line) {
                                if let Some(total) = update.bytes_total {
                                    last_total = total as i64;
                                }
                                let done = update
                                    .bytes_done()
                                    .map(|b| b as i64)
                                    .unwrap_or_else(|| {
                                        ((update.percent / 100.0) * last_total as f64) as i64
                                    });
                                if let Err(e) = self
                                    .db
                                    .set_download_progress(
                                        &item.channel,
                                        &item.external_id,
                                        line.trim(),
                                        done,
                                        last_total,
                                    )
                                    .await
                                {
                                    tracing::warn!(item = %item.external_id, error = %e, "failed to persist progress");
                                }
                            } else if !line.trim().is_empty() {
                                tail.push(&line);
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        let status = tokio::select! {
            status = child.wait() => status,
            _ = attempt_token.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return AttemptOutcome::Canceled;
            }
        };

        let status = match status {
            Ok(status) => status,
            Err(e) => return AttemptOutcome::Failed(format!("failed to wait for downloader: {e}")),
        };

        if attempt_token.is_cancelled() {
            return AttemptOutcome::Canceled;
        }

        if !status.success() {
            let mut message = format!("downloader exited with {status}");
            let captured = tail.tail(ERROR_TAIL_LINES);
            if !captured.is_empty() {
                message.push_str(": ");
                message.push_str(&captured);
            }
            // Bound what ends up in last_error; truncate on a char boundary
            if message.chars().count() > 1_000 {
                message = message.chars().take(1_000).collect();
            }
            return AttemptOutcome::Failed(message);
        }

        match tokio::fs::metadata(out_path).await {
            Ok(meta) => AttemptOutcome::Success(meta.len() as i64),
            Err(_) => AttemptOutcome::Failed(
                "downloader exited successfully but the output file is missing".into(),
            ),
        }
    }
}

#[async_trait]
impl MediaDownloader for ProcessDownloader {
    async fn download(
        &self,
        cancel: &CancellationToken,
        item: &WorkItem,
        data_dir: &Path,
    ) -> Result<PathBuf, DownloadError> {
        let out_path = Self::output_path(data_dir, &item.external_id);

        // Scoped acquisition: the permit drops on every exit path below
        let Some(_permit) = self.gate.acquire(cancel).await else {
            return Err(DownloadError::Canceled);
        };

        let cookie_guard = self.stage_cookie_file(data_dir).await?;
        let cookie_path = cookie_guard.as_ref().map(|g| g.path.as_path());

        let mut last_error = String::new();
        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                let delay = backoff_delay(self.config.backoff_base, attempt);
                if !sleep_cancellable(delay, cancel).await {
                    return Err(DownloadError::Canceled);
                }
            }
            if cancel.is_cancelled() {
                return Err(DownloadError::Canceled);
            }

            if let Err(e) = self
                .db
                .set_download_progress(
                    &item.channel,
                    &item.external_id,
                    "downloading",
                    item.bytes_done,
                    item.bytes_total,
                )
                .await
            {
                tracing::warn!(item = %item.external_id, error = %e, "failed to mark item downloading");
            }

            let attempt_token = cancel.child_token();
            self.registry.register(&item.external_id, attempt_token.clone());

            tracing::info!(
                item = %item.external_id,
                attempt = attempt + 1,
                max_attempts = self.config.max_attempts,
                "starting download attempt"
            );
            let outcome = self
                .run_attempt(&attempt_token, item, &out_path, cookie_path)
                .await;
            self.registry.deregister(&item.external_id);

            match outcome {
                AttemptOutcome::Success(file_size) => {
                    let path_str = out_path.to_string_lossy();
                    self.db
                        .mark_download_complete(&item.channel, &item.external_id, &path_str, file_size)
                        .await
                        .map_err(|e| DownloadError::Spawn(format!("failed to record completion: {e}")))?;

                    tracing::info!(
                        item = %item.external_id,
                        bytes = file_size,
                        path = %path_str,
                        "download complete"
                    );
                    return Ok(out_path);
                }
                AttemptOutcome::Canceled => {
                    return Err(DownloadError::Canceled);
                }
                AttemptOutcome::Failed(message) => {
                    tracing::warn!(
                        item = %item.external_id,
                        attempt = attempt + 1,
                        error = %message,
                        "download attempt failed"
                    );
                    if let Err(e) = self
                        .db
                        .record_failure(&item.channel, &item.external_id, &message)
                        .await
                    {
                        tracing::warn!(item = %item.external_id, error = %e, "failed to record attempt failure");
                    }

                    if classify(&message) == FailureKind::Fatal {
                        return Err(DownloadError::Fatal(message));
                    }
                    last_error = message;
                }
            }
        }

        Err(DownloadError::Exhausted {
            attempts: self.config.max_attempts,
            last_error,
        })
    }
}

/// Deletes the staged cookie file when the download finishes
struct CookieGuard {
    path: PathBuf,
}

impl Drop for CookieGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove staged cookie file");
            }
        }
    }
}
