//! Configuration types for vod-mirror
//!
//! Configuration is plain serde data grouped into logical sub-configs, with
//! sensible defaults for every field. [`Config::from_env`] builds a complete
//! configuration from the environment variables listed on each field, which is
//! how deployments are expected to configure the service.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use utoipa::ToSchema;

use crate::error::{Error, Result};

/// Keys that may be read and written through the admin config endpoints.
///
/// Values are persisted in the KV scratchpad under `cfg:<KEY>` and overlay the
/// process configuration at each scheduler tick.
pub const ADMIN_CONFIG_KEYS: &[&str] = &[
    "PROCESSING_RETRY_COOLDOWN",
    "BACKFILL_UPLOAD_DAILY_LIMIT",
    "RETAIN_KEEP_NEWER_THAN_DAYS",
    "CIRCUIT_FAILURE_THRESHOLD",
    "CIRCUIT_OPEN_COOLDOWN",
    "RETENTION_DRY_RUN",
];

/// Download supervision configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct DownloadConfig {
    /// Maximum concurrent downloads (`MAX_CONCURRENT_DOWNLOADS`, default: 1)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,

    /// Attempts per download before giving up (`DOWNLOAD_MAX_ATTEMPTS`, default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff base between attempts (`DOWNLOAD_BACKOFF_BASE`, seconds, default: 2)
    #[serde(default = "default_backoff_base", with = "duration_serde")]
    pub backoff_base: Duration,

    /// Path to the external downloader binary (`DOWNLOADER_PATH`, default: "yt-dlp")
    #[serde(default = "default_downloader_path")]
    pub downloader_path: PathBuf,

    /// Number of fragments the downloader fetches in parallel (default: 4)
    #[serde(default = "default_fragment_concurrency")]
    pub fragment_concurrency: u32,

    /// Browser cookie file forwarded to the downloader (`COOKIE_FILE`)
    ///
    /// Copied to a private 0600 temp file for the lifetime of each attempt.
    #[serde(default)]
    pub cookie_file: Option<PathBuf>,

    /// Extra arguments appended to every downloader invocation
    /// (`DOWNLOADER_EXTRA_ARGS`, whitespace-separated)
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Use an external download accelerator when one is on PATH (default: true)
    #[serde(default = "default_true")]
    pub use_accelerator: bool,

    /// Template for the upstream media URL; `{id}` is replaced with the
    /// item's external id (`SOURCE_URL_TEMPLATE`)
    #[serde(default = "default_source_url_template")]
    pub source_url_template: String,
}

impl DownloadConfig {
    /// Build the upstream media URL for an external id
    pub fn source_url(&self, external_id: &str) -> String {
        self.source_url_template.replace("{id}", external_id)
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: default_max_concurrent(),
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
            downloader_path: default_downloader_path(),
            fragment_concurrency: default_fragment_concurrency(),
            cookie_file: None,
            extra_args: Vec::new(),
            use_accelerator: true,
            source_url_template: default_source_url_template(),
        }
    }
}

/// Upload pipeline configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct UploadConfig {
    /// Attempts per upload before giving up (`UPLOAD_MAX_ATTEMPTS`, default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff base between attempts (`UPLOAD_BACKOFF_BASE`, seconds, default: 2)
    #[serde(default = "default_backoff_base", with = "duration_serde")]
    pub backoff_base: Duration,

    /// Visibility for uploaded videos (default: "private")
    #[serde(default = "default_visibility")]
    pub visibility: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
            visibility: default_visibility(),
        }
    }
}

/// Processing scheduler configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ProcessingConfig {
    /// Tick interval (`VOD_PROCESS_INTERVAL`, seconds, default: 60)
    #[serde(default = "default_process_interval", with = "duration_serde")]
    pub interval: Duration,

    /// Minimum wait before an errored item is reconsidered
    /// (`PROCESSING_RETRY_COOLDOWN`, seconds, default: 3600)
    #[serde(default = "default_retry_cooldown", with = "duration_serde")]
    pub retry_cooldown: Duration,

    /// Per-item attempt cap before the item sits in cooldown permanently
    /// between manual reprocess events (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Items recorded earlier than this many days ago count as backfill
    /// (`RETAIN_KEEP_NEWER_THAN_DAYS`, default: 7)
    #[serde(default = "default_retain_newer_days")]
    pub retain_newer_than_days: u32,

    /// Daily cap on successful backfill uploads (`BACKFILL_UPLOAD_DAILY_LIMIT`,
    /// default: 10)
    #[serde(default = "default_backfill_daily_limit")]
    pub backfill_daily_limit: u32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            interval: default_process_interval(),
            retry_cooldown: default_retry_cooldown(),
            max_attempts: default_max_attempts(),
            retain_newer_than_days: default_retain_newer_days(),
            backfill_daily_limit: default_backfill_daily_limit(),
        }
    }
}

/// Circuit breaker configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct CircuitConfig {
    /// Consecutive failures before the circuit opens
    /// (`CIRCUIT_FAILURE_THRESHOLD`, 0 disables the breaker, default: 5)
    #[serde(default = "default_circuit_threshold")]
    pub failure_threshold: u32,

    /// How long the circuit stays open (`CIRCUIT_OPEN_COOLDOWN`, seconds,
    /// default: 300)
    #[serde(default = "default_circuit_cooldown", with = "duration_serde")]
    pub open_cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_circuit_threshold(),
            open_cooldown: default_circuit_cooldown(),
        }
    }
}

/// Retention engine configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct RetentionConfig {
    /// Keep local files for items recorded within this many days
    /// (`RETENTION_KEEP_DAYS`, 0 disables the age rule, default: 0)
    #[serde(default)]
    pub keep_days: u32,

    /// Always keep the newest N items' local files (`RETENTION_KEEP_COUNT`,
    /// 0 disables the count rule, default: 0)
    #[serde(default)]
    pub keep_count: u32,

    /// Log deletions without performing them (`RETENTION_DRY_RUN`, default: false)
    #[serde(default)]
    pub dry_run: bool,

    /// Interval between retention sweeps (`RETENTION_INTERVAL`, seconds,
    /// default: 3600)
    #[serde(default = "default_retention_interval", with = "duration_serde")]
    pub interval: Duration,

    /// Age threshold for pruning temp/partial files under the data dir
    /// (`DATA_CLEANUP_MAX_AGE`, seconds, default: 86400)
    #[serde(default = "default_cleanup_max_age", with = "duration_serde")]
    pub cleanup_max_age: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_days: 0,
            keep_count: 0,
            dry_run: false,
            interval: default_retention_interval(),
            cleanup_max_age: default_cleanup_max_age(),
        }
    }
}

/// Rate limiter backend selection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitBackendKind {
    /// In-process per-client hit vectors (default)
    #[default]
    Memory,
    /// Store-backed timestamp rows; survives restarts, serializes per key
    Persistent,
}

/// API rate limiting configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enforced (`RATE_LIMIT_ENABLED`, default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Requests allowed per client per window (`RATE_LIMIT_REQUESTS_PER_IP`,
    /// default: 60)
    #[serde(default = "default_rate_limit_requests")]
    pub requests_per_ip: u32,

    /// Sliding window width (`RATE_LIMIT_WINDOW_SECONDS`, default: 60)
    #[serde(default = "default_rate_limit_window", with = "duration_serde")]
    pub window: Duration,

    /// Backend (`RATE_LIMIT_BACKEND`, "memory" or "persistent")
    #[serde(default)]
    pub backend: RateLimitBackendKind,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_ip: default_rate_limit_requests(),
            window: default_rate_limit_window(),
            backend: RateLimitBackendKind::default(),
        }
    }
}

/// Admin endpoint credentials
///
/// Admin routes accept either an `X-Admin-Token` header matching `token`
/// (checked first) or HTTP basic auth matching `username`/`password`. With
/// neither configured, admin routes always answer 401.
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct AdminConfig {
    /// Basic auth username (`ADMIN_USERNAME`)
    #[serde(default)]
    pub username: Option<String>,

    /// Basic auth password (`ADMIN_PASSWORD`)
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Bearer token for `X-Admin-Token` (`ADMIN_TOKEN`)
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
}

impl AdminConfig {
    /// Whether any admin credential is configured
    pub fn any_configured(&self) -> bool {
        self.token.is_some() || (self.username.is_some() && self.password.is_some())
    }
}

/// HTTP server configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiConfig {
    /// Bind address (`BIND_ADDRESS`, default: 127.0.0.1:8080)
    #[serde(default = "default_bind_address")]
    #[schema(value_type = String)]
    pub bind_address: SocketAddr,

    /// Allow any origin (`CORS_PERMISSIVE`, default: false)
    #[serde(default)]
    pub cors_permissive: bool,

    /// Explicit allowed origins (`CORS_ALLOWED_ORIGINS`, comma-separated)
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,

    /// Serve the interactive Swagger UI at /swagger-ui (default: false)
    #[serde(default)]
    pub swagger_ui: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            cors_permissive: false,
            cors_allowed_origins: Vec::new(),
            swagger_ui: false,
        }
    }
}

/// Main configuration for the vod-mirror core
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct Config {
    /// Channel scoping key (`CHANNEL`); the empty string is a valid
    /// single-tenant default
    #[serde(default)]
    pub channel: String,

    /// Directory holding downloaded media and temp files (`DATA_DIR`,
    /// default: "./data")
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// SQLite database path (`DATABASE_PATH`, default: "./data/vod-mirror.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Download supervision settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Upload pipeline settings
    #[serde(default)]
    pub upload: UploadConfig,

    /// Processing scheduler settings
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Circuit breaker settings
    #[serde(default)]
    pub circuit: CircuitConfig,

    /// Retention engine settings
    #[serde(default)]
    pub retention: RetentionConfig,

    /// API rate limiting settings
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Admin endpoint credentials
    #[serde(default)]
    pub admin: AdminConfig,

    /// HTTP server settings
    #[serde(default)]
    pub api: ApiConfig,

    /// Base64-encoded 32-byte key for token encryption at rest
    /// (`ENCRYPTION_KEY`; unset means tokens are stored in plaintext)
    #[serde(default, skip_serializing)]
    pub encryption_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channel: String::new(),
            data_dir: default_data_dir(),
            database_path: default_database_path(),
            download: DownloadConfig::default(),
            upload: UploadConfig::default(),
            processing: ProcessingConfig::default(),
            circuit: CircuitConfig::default(),
            retention: RetentionConfig::default(),
            rate_limit: RateLimitConfig::default(),
            admin: AdminConfig::default(),
            api: ApiConfig::default(),
            encryption_key: None,
        }
    }
}

impl Config {
    /// Build a configuration from environment variables.
    ///
    /// Every field documents its variable name. Unset variables fall back to
    /// the field default; malformed values are reported as [`Error::Config`]
    /// with the offending key.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Some(v) = read_env("CHANNEL") {
            config.channel = v;
        }
        if let Some(v) = read_env("DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Some(v) = read_env("DATABASE_PATH") {
            config.database_path = PathBuf::from(v);
        }

        if let Some(v) = parse_env("MAX_CONCURRENT_DOWNLOADS")? {
            config.download.max_concurrent_downloads = v;
        }
        if let Some(v) = parse_env("DOWNLOAD_MAX_ATTEMPTS")? {
            config.download.max_attempts = v;
        }
        if let Some(v) = parse_env::<u64>("DOWNLOAD_BACKOFF_BASE")? {
            config.download.backoff_base = Duration::from_secs(v);
        }
        if let Some(v) = read_env("DOWNLOADER_PATH") {
            config.download.downloader_path = PathBuf::from(v);
        }
        if let Some(v) = read_env("COOKIE_FILE") {
            config.download.cookie_file = Some(PathBuf::from(v));
        }
        if let Some(v) = read_env("DOWNLOADER_EXTRA_ARGS") {
            config.download.extra_args = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = read_env("SOURCE_URL_TEMPLATE") {
            config.download.source_url_template = v;
        }

        if let Some(v) = parse_env("UPLOAD_MAX_ATTEMPTS")? {
            config.upload.max_attempts = v;
        }
        if let Some(v) = parse_env::<u64>("UPLOAD_BACKOFF_BASE")? {
            config.upload.backoff_base = Duration::from_secs(v);
        }

        if let Some(v) = parse_env::<u64>("VOD_PROCESS_INTERVAL")? {
            config.processing.interval = Duration::from_secs(v);
        }
        if let Some(v) = parse_env::<u64>("PROCESSING_RETRY_COOLDOWN")? {
            config.processing.retry_cooldown = Duration::from_secs(v);
        }
        if let Some(v) = parse_env("RETAIN_KEEP_NEWER_THAN_DAYS")? {
            config.processing.retain_newer_than_days = v;
        }
        if let Some(v) = parse_env("BACKFILL_UPLOAD_DAILY_LIMIT")? {
            config.processing.backfill_daily_limit = v;
        }

        if let Some(v) = parse_env("CIRCUIT_FAILURE_THRESHOLD")? {
            config.circuit.failure_threshold = v;
        }
        if let Some(v) = parse_env::<u64>("CIRCUIT_OPEN_COOLDOWN")? {
            config.circuit.open_cooldown = Duration::from_secs(v);
        }

        if let Some(v) = parse_env("RETENTION_KEEP_DAYS")? {
            config.retention.keep_days = v;
        }
        if let Some(v) = parse_env("RETENTION_KEEP_COUNT")? {
            config.retention.keep_count = v;
        }
        if let Some(v) = parse_env("RETENTION_DRY_RUN")? {
            config.retention.dry_run = v;
        }
        if let Some(v) = parse_env::<u64>("RETENTION_INTERVAL")? {
            config.retention.interval = Duration::from_secs(v);
        }
        if let Some(v) = parse_env::<u64>("DATA_CLEANUP_MAX_AGE")? {
            config.retention.cleanup_max_age = Duration::from_secs(v);
        }

        if let Some(v) = parse_env("RATE_LIMIT_ENABLED")? {
            config.rate_limit.enabled = v;
        }
        if let Some(v) = parse_env("RATE_LIMIT_REQUESTS_PER_IP")? {
            config.rate_limit.requests_per_ip = v;
        }
        if let Some(v) = parse_env::<u64>("RATE_LIMIT_WINDOW_SECONDS")? {
            config.rate_limit.window = Duration::from_secs(v);
        }
        if let Some(v) = read_env("RATE_LIMIT_BACKEND") {
            config.rate_limit.backend = match v.as_str() {
                "memory" => RateLimitBackendKind::Memory,
                "persistent" => RateLimitBackendKind::Persistent,
                other => {
                    return Err(Error::Config {
                        message: format!("unknown rate limit backend '{other}'"),
                        key: Some("RATE_LIMIT_BACKEND".into()),
                    });
                }
            };
        }

        config.admin.username = read_env("ADMIN_USERNAME");
        config.admin.password = read_env("ADMIN_PASSWORD");
        config.admin.token = read_env("ADMIN_TOKEN");

        if let Some(v) = read_env("BIND_ADDRESS") {
            config.api.bind_address = v.parse().map_err(|e| Error::Config {
                message: format!("invalid bind address '{v}': {e}"),
                key: Some("BIND_ADDRESS".into()),
            })?;
        }
        if let Some(v) = parse_env("CORS_PERMISSIVE")? {
            config.api.cors_permissive = v;
        }
        if let Some(v) = read_env("CORS_ALLOWED_ORIGINS") {
            config.api.cors_allowed_origins = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        config.encryption_key = read_env("ENCRYPTION_KEY");
        config.validate()?;

        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.download.max_concurrent_downloads == 0 {
            return Err(Error::Config {
                message: "MAX_CONCURRENT_DOWNLOADS must be at least 1".into(),
                key: Some("MAX_CONCURRENT_DOWNLOADS".into()),
            });
        }
        let probe = self.download.source_url("probe");
        if url::Url::parse(&probe).is_err() {
            return Err(Error::Config {
                message: format!("source URL template produces an invalid URL: {probe}"),
                key: Some("SOURCE_URL_TEMPLATE".into()),
            });
        }
        if let Some(key) = &self.encryption_key {
            use base64::Engine as _;
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(key)
                .map_err(|e| Error::Config {
                    message: format!("ENCRYPTION_KEY is not valid base64: {e}"),
                    key: Some("ENCRYPTION_KEY".into()),
                })?;
            if decoded.len() != 32 {
                return Err(Error::Config {
                    message: format!(
                        "ENCRYPTION_KEY must decode to 32 bytes, got {}",
                        decoded.len()
                    ),
                    key: Some("ENCRYPTION_KEY".into()),
                });
            }
        }
        Ok(())
    }
}

fn read_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_env<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match read_env(key) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|e| Error::Config {
            message: format!("invalid value '{raw}': {e}"),
            key: Some(key.to_string()),
        }),
    }
}

fn default_max_concurrent() -> usize {
    1
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base() -> Duration {
    Duration::from_secs(2)
}

fn default_downloader_path() -> PathBuf {
    PathBuf::from("yt-dlp")
}

fn default_fragment_concurrency() -> u32 {
    4
}

fn default_source_url_template() -> String {
    "https://www.twitch.tv/videos/{id}".to_string()
}

fn default_visibility() -> String {
    "private".to_string()
}

fn default_process_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_retry_cooldown() -> Duration {
    Duration::from_secs(3600)
}

fn default_retain_newer_days() -> u32 {
    7
}

fn default_backfill_daily_limit() -> u32 {
    10
}

fn default_circuit_threshold() -> u32 {
    5
}

fn default_circuit_cooldown() -> Duration {
    Duration::from_secs(300)
}

fn default_retention_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_cleanup_max_age() -> Duration {
    Duration::from_secs(86_400)
}

fn default_rate_limit_requests() -> u32 {
    60
}

fn default_rate_limit_window() -> Duration {
    Duration::from_secs(60)
}

fn default_bind_address() -> SocketAddr {
    #[allow(clippy::unwrap_used)]
    "127.0.0.1:8080".parse().unwrap()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./data/vod-mirror.db")
}

fn default_true() -> bool {
    true
}

/// Serialize durations as whole seconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
