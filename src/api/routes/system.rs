//! System handlers: liveness, readiness, status, OpenAPI.

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde_json::json;
use utoipa::ToSchema;

use crate::api::AppState;
use crate::core::circuit::CircuitState;
use crate::db::items::PriorityBucket;

/// Retry knobs surfaced on the status endpoint
#[derive(Debug, serde::Serialize, ToSchema)]
pub struct RetryInfo {
    /// Download attempts per item
    pub download_max_attempts: u32,
    /// Upload attempts per item
    pub upload_max_attempts: u32,
    /// Per-item attempt cap used by selection
    pub processing_max_attempts: u32,
    /// Retry cooldown in seconds
    pub retry_cooldown_seconds: u64,
}

/// Circuit breaker fields surfaced on the status endpoint
#[derive(Debug, serde::Serialize, ToSchema)]
pub struct CircuitInfo {
    /// Current state
    pub state: CircuitState,
    /// Consecutive failure count
    pub failures: i64,
    /// RFC 3339 open deadline, when open
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_until: Option<String>,
}

/// Timing averages surfaced on the status endpoint (EMA, α = 0.2)
#[derive(Debug, serde::Serialize, ToSchema)]
pub struct TimingInfo {
    /// Average download duration in milliseconds
    pub avg_download_ms: f64,
    /// Average upload duration in milliseconds
    pub avg_upload_ms: f64,
    /// Average total processing duration in milliseconds
    pub avg_total_ms: f64,
}

/// Aggregate status payload
#[derive(Debug, serde::Serialize, ToSchema)]
pub struct StatusResponse {
    /// Items not yet processed
    pub pending: i64,
    /// Unprocessed items carrying an error
    pub errored: i64,
    /// Items processed successfully
    pub processed: i64,
    /// Pending queue grouped by priority, highest first
    pub queue_by_priority: Vec<PriorityBucket>,
    /// Downloads currently holding a gate slot
    pub active_downloads: usize,
    /// Gate capacity
    pub max_concurrent_downloads: usize,
    /// Retry configuration
    pub retry_config: RetryInfo,
    /// Circuit breaker snapshot
    pub circuit: CircuitInfo,
    /// Timing averages
    pub timings: TimingInfo,
}

/// GET /healthz - Liveness: store ping only
#[utoipa::path(
    get,
    path = "/healthz",
    tag = "system",
    responses(
        (status = 200, description = "Store reachable"),
        (status = 500, description = "Store unreachable")
    )
)]
pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    match state.core.db.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")})),
        ),
        Err(e) => {
            tracing::error!(error = %e, "health check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "unhealthy", "error": e.to_string()})),
            )
        }
    }
}

/// GET /readyz - Aggregate readiness.
///
/// Probes run in order: store reachability, circuit not open, at least one
/// stored credential. The first failure names itself in the payload.
#[utoipa::path(
    get,
    path = "/readyz",
    tag = "system",
    responses(
        (status = 200, description = "Ready to process"),
        (status = 503, description = "Not ready; payload names the failed check")
    )
)]
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if let Err(e) = state.core.db.ping().await {
        return not_ready("store", &e.to_string());
    }

    let breaker = state.core.circuit_breaker().await;
    match breaker.state().await {
        Ok(CircuitState::Open) => {
            return not_ready("circuit_breaker", "circuit is open");
        }
        Ok(_) => {}
        Err(e) => return not_ready("circuit_breaker", &e.to_string()),
    }

    let channel = state.core.config().channel.clone();
    match state.core.tokens().any_present(&channel).await {
        Ok(true) => {}
        Ok(false) => return not_ready("credentials", "no credentials stored"),
        Err(e) => return not_ready("credentials", &e.to_string()),
    }

    (StatusCode::OK, Json(json!({"status": "ready"})))
}

fn not_ready(check: &str, error: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "status": "not_ready",
            "failed_check": check,
            "error": error,
        })),
    )
}

/// GET /status - Queue counters, gate occupancy, breaker, and timings
#[utoipa::path(
    get,
    path = "/status",
    tag = "system",
    responses(
        (status = 200, description = "Aggregate processing status", body = StatusResponse),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn status(State(state): State<AppState>) -> axum::response::Response {
    match build_status(&state).await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to build status");
            e.into_response()
        }
    }
}

pub(crate) async fn build_status(state: &AppState) -> crate::Result<StatusResponse> {
    let core = &state.core;
    let config = core.config();
    let channel = config.channel.as_str();
    let db = &core.db;

    let counts = db.queue_counts(channel).await?;
    let queue_by_priority = db.queue_by_priority(channel).await?;

    let processing = core.effective_processing().await;
    let breaker = core.circuit_breaker().await;

    Ok(StatusResponse {
        pending: counts.pending,
        errored: counts.errored,
        processed: counts.processed,
        queue_by_priority,
        active_downloads: core.gate().active(),
        max_concurrent_downloads: core.gate().capacity(),
        retry_config: RetryInfo {
            download_max_attempts: config.download.max_attempts,
            upload_max_attempts: config.upload.max_attempts,
            processing_max_attempts: processing.max_attempts,
            retry_cooldown_seconds: processing.retry_cooldown.as_secs(),
        },
        circuit: CircuitInfo {
            state: breaker.state().await?,
            failures: breaker.failures().await?,
            open_until: breaker.open_until().await?.map(|dt| dt.to_rfc3339()),
        },
        timings: TimingInfo {
            avg_download_ms: db.kv_get_f64(channel, "avg_download_ms", 0.0).await?,
            avg_upload_ms: db.kv_get_f64(channel, "avg_upload_ms", 0.0).await?,
            avg_total_ms: db.kv_get_f64(channel, "avg_total_ms", 0.0).await?,
        },
    })
}

/// GET /openapi.json - OpenAPI specification
#[utoipa::path(
    get,
    path = "/openapi.json",
    tag = "system",
    responses(
        (status = 200, description = "OpenAPI specification in JSON format")
    )
)]
pub async fn openapi_spec() -> impl IntoResponse {
    use crate::api::openapi::ApiDoc;
    use utoipa::OpenApi;

    Json(ApiDoc::openapi())
}
