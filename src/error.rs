//! Error types for vod-mirror
//!
//! This module provides comprehensive error handling for the library, including:
//! - Domain-specific error types (Download, Upload, Database, etc.)
//! - HTTP status code mapping for API integration
//! - Structured error responses with machine-readable error codes

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Result type alias for vod-mirror operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for vod-mirror
///
/// This is the primary error type used throughout the library. Each variant
/// includes contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "ENCRYPTION_KEY")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Download-related error
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// Upload-related error
    #[error("upload error: {0}")]
    Upload(#[from] UploadError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Work item not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed request input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Token encryption or decryption failed
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new work")]
    ShuttingDown,

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// API server error
    #[error("API server error: {0}")]
    ApiServer(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),
}

/// Download supervisor errors
///
/// The scheduler treats these three outcomes differently: `Canceled` never
/// counts as a failure, `Fatal` pins the item's retry counter so it is never
/// reattempted, and `Exhausted` leaves the item in cooldown for a later tick.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The download was canceled via the cancellation registry or shutdown
    #[error("download canceled")]
    Canceled,

    /// The downloader reported a permanent failure (auth, gone, DRM, bad input)
    #[error("permanent download failure: {0}")]
    Fatal(String),

    /// All attempts failed with transient errors
    #[error("download failed after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Number of attempts made before giving up
        attempts: u32,
        /// The final error message captured from the downloader
        last_error: String,
    },

    /// The external downloader process could not be started
    #[error("failed to spawn downloader: {0}")]
    Spawn(String),
}

impl DownloadError {
    /// The error text fed into the classifier and persisted as `last_error`
    pub fn message(&self) -> String {
        match self {
            DownloadError::Canceled => "canceled".to_string(),
            DownloadError::Fatal(msg) => msg.clone(),
            DownloadError::Exhausted { last_error, .. } => last_error.clone(),
            DownloadError::Spawn(msg) => msg.clone(),
        }
    }
}

/// Upload pipeline errors
#[derive(Debug, Error)]
pub enum UploadError {
    /// The upload was canceled via shutdown
    #[error("upload canceled")]
    Canceled,

    /// The platform rejected the video title; retrying cannot help
    #[error("invalid video title: {0}")]
    InvalidTitle(String),

    /// All attempts failed with transient errors
    #[error("upload failed after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Number of attempts made before giving up
        attempts: u32,
        /// The final error message from the upload client
        last_error: String,
    },

    /// A single transient upload attempt failed (used inside the retry loop)
    #[error("upload attempt failed: {0}")]
    Transient(String),
}

impl UploadError {
    /// Whether the upload pipeline should retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::Transient(_))
    }

    /// Classify a raw uploader error message into a pipeline error.
    ///
    /// The upload client signals an unusable title with a message containing
    /// `invalidtitle` or `invalid or empty video title`; everything else is
    /// treated as transient.
    pub fn from_client_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();
        if lowered.contains("invalidtitle") || lowered.contains("invalid or empty video title") {
            UploadError::InvalidTitle(message)
        } else {
            UploadError::Transient(message)
        }
    }
}

/// API error response format
///
/// This structure is returned by API endpoints when an error occurs. It
/// follows a standard format with machine-readable error codes,
/// human-readable messages, and optional contextual details.
///
/// # Example JSON Response
///
/// ```json
/// {
///   "error": {
///     "code": "not_found",
///     "message": "work item v123 not found"
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// The error details
    pub error: ErrorDetail,
}

/// Detailed error information for API responses
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g., "not_found", "validation_error")
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Optional additional context about the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    /// Create an API error with additional details
    pub fn with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: Some(details),
            },
        }
    }

    /// Create a "not found" error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new("not_found", format!("{} not found", resource.into()))
    }

    /// Create a "validation error" error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("validation_error", message)
    }

    /// Create an "unauthorized" error
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("unauthorized", message)
    }

    /// Create an "internal server error"
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }

    /// Create a "rate limited" error
    pub fn rate_limited(retry_after_seconds: u64) -> Self {
        Self::with_details(
            "rate_limited",
            "Too many requests",
            serde_json::json!({ "retry_after_seconds": retry_after_seconds }),
        )
    }
}

/// Convert errors to HTTP status codes for API responses
pub trait ToHttpStatus {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> u16;

    /// Get the machine-readable error code
    fn error_code(&self) -> &str;
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - client error
            Error::Config { .. } => 400,
            Error::InvalidInput(_) => 400,

            // 404 Not Found
            Error::NotFound(_) => 404,

            // 500 Internal Server Error - server-side issues
            Error::Database(_) => 500,
            Error::Sqlx(_) => 500,
            Error::Io(_) => 500,
            Error::Crypto(_) => 500,
            Error::Serialization(_) => 500,
            Error::ApiServer(_) => 500,
            Error::Other(_) => 500,

            // 502 Bad Gateway - external collaborator failures
            Error::Download(_) => 502,
            Error::Upload(_) => 502,

            // 503 Service Unavailable
            Error::ShuttingDown => 503,
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Database(_) | Error::Sqlx(_) => "database_error",
            Error::Download(e) => match e {
                DownloadError::Canceled => "download_canceled",
                DownloadError::Fatal(_) => "download_fatal",
                DownloadError::Exhausted { .. } => "download_exhausted",
                DownloadError::Spawn(_) => "downloader_spawn_failed",
            },
            Error::Upload(e) => match e {
                UploadError::Canceled => "upload_canceled",
                UploadError::InvalidTitle(_) => "invalid_title",
                UploadError::Exhausted { .. } => "upload_exhausted",
                UploadError::Transient(_) => "upload_failed",
            },
            Error::Io(_) => "io_error",
            Error::NotFound(_) => "not_found",
            Error::InvalidInput(_) => "validation_error",
            Error::Crypto(_) => "crypto_error",
            Error::ShuttingDown => "shutting_down",
            Error::Serialization(_) => "serialization_error",
            Error::ApiServer(_) => "api_server_error",
            Error::Other(_) => "internal_error",
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let code = error.error_code().to_string();
        let message = error.to_string();

        let details = match &error {
            Error::Download(DownloadError::Exhausted {
                attempts,
                last_error,
            }) => Some(serde_json::json!({
                "attempts": attempts,
                "last_error": last_error,
            })),
            Error::Upload(UploadError::Exhausted {
                attempts,
                last_error,
            }) => Some(serde_json::json!({
                "attempts": attempts,
                "last_error": last_error,
            })),
            _ => None,
        };

        ApiError {
            error: ErrorDetail {
                code,
                message,
                details,
            },
        }
    }
}
