//! Work item handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use utoipa::ToSchema;

use crate::api::AppState;
use crate::core::progress::parse_percent;
use crate::db::WorkItem;
use crate::error::ApiError;

/// Hard cap on the list page size
const LIST_LIMIT_MAX: i64 = 200;
/// Default list page size
const LIST_LIMIT_DEFAULT: i64 = 50;

/// Serializable view of a work item
#[derive(Debug, serde::Serialize, ToSchema)]
pub struct ItemView {
    /// Natural key from the upstream archive
    pub external_id: String,
    /// Channel scoping key
    pub channel: String,
    /// Title as reported upstream
    pub title: String,
    /// RFC 3339 time of the original broadcast
    pub recorded_at: String,
    /// Recording length in seconds
    pub duration_seconds: i64,
    /// Terminal success flag
    pub processed: bool,
    /// Last failure message; empty when healthy
    pub last_error: String,
    /// Attempts consumed since the last manual reprocess
    pub retry_count: i64,
    /// Download progress tag
    pub download_state: String,
    /// Bytes downloaded so far
    pub bytes_done: i64,
    /// Total bytes expected (0 when unknown)
    pub bytes_total: i64,
    /// Whether a local media file currently exists
    pub has_local_file: bool,
    /// URL on the destination platform; empty until upload succeeds
    pub destination_url: String,
    /// Selection priority
    pub priority: i64,
    /// Skip the upload stage
    pub skip_upload: bool,
    /// RFC 3339 time of the last state mutation
    pub updated_at: String,
}

impl From<WorkItem> for ItemView {
    fn from(item: WorkItem) -> Self {
        Self {
            external_id: item.external_id,
            channel: item.channel,
            title: item.title,
            recorded_at: rfc3339(item.recorded_at),
            duration_seconds: item.duration_seconds,
            processed: item.processed,
            last_error: item.last_error,
            retry_count: item.retry_count,
            download_state: item.download_state,
            bytes_done: item.bytes_done,
            bytes_total: item.bytes_total,
            has_local_file: !item.local_path.is_empty(),
            destination_url: item.destination_url,
            priority: item.priority,
            skip_upload: item.skip_upload,
            updated_at: rfc3339(item.updated_at),
        }
    }
}

fn rfc3339(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .unwrap_or_default()
        .to_rfc3339()
}

/// Download progress derived for one item
#[derive(Debug, serde::Serialize, ToSchema)]
pub struct ProgressView {
    /// Natural key from the upstream archive
    pub external_id: String,
    /// Raw download state tag
    pub download_state: String,
    /// Bytes downloaded so far
    pub bytes_done: i64,
    /// Total bytes expected (0 when unknown)
    pub bytes_total: i64,
    /// Percent complete, 0.0..=100.0
    pub percent: f64,
    /// Terminal success flag
    pub processed: bool,
}

/// Pagination parameters for the item list
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Page size (clamped to 1..=200, default 50)
    pub limit: Option<i64>,
    /// Rows to skip
    pub offset: Option<i64>,
}

/// GET /items - Paginated item list, newest recordings first
#[utoipa::path(
    get,
    path = "/items",
    tag = "items",
    params(
        ("limit" = Option<i64>, Query, description = "Page size (max 200, default 50)"),
        ("offset" = Option<i64>, Query, description = "Rows to skip")
    ),
    responses(
        (status = 200, description = "Page of work items", body = Vec<ItemView>),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn list_items(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(LIST_LIMIT_DEFAULT)
        .clamp(1, LIST_LIMIT_MAX);
    let offset = query.offset.unwrap_or(0).max(0);

    let channel = state.core.config().channel.clone();
    match state.core.db.list_items(&channel, limit, offset).await {
        Ok(items) => {
            let views: Vec<ItemView> = items.into_iter().map(ItemView::from).collect();
            (StatusCode::OK, Json(views)).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to list items");
            e.into_response()
        }
    }
}

/// GET /items/:id - Item detail
#[utoipa::path(
    get,
    path = "/items/{id}",
    tag = "items",
    params(("id" = String, Path, description = "External id")),
    responses(
        (status = 200, description = "Work item", body = ItemView),
        (status = 404, description = "Unknown item"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn get_item(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let channel = state.core.config().channel.clone();
    match state.core.db.get_item(&channel, &id).await {
        Ok(Some(item)) => (StatusCode::OK, Json(ItemView::from(item))).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiError::not_found(format!("work item {id}"))),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(item = %id, error = %e, "failed to get item");
            e.into_response()
        }
    }
}

/// GET /items/:id/progress - Derived download progress
///
/// Percent comes from the stored progress line when one is parseable, else
/// from the byte counters, else 100 for finished items, else 0.
#[utoipa::path(
    get,
    path = "/items/{id}/progress",
    tag = "items",
    params(("id" = String, Path, description = "External id")),
    responses(
        (status = 200, description = "Progress for the item", body = ProgressView),
        (status = 404, description = "Unknown item"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn item_progress(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let channel = state.core.config().channel.clone();
    let item = match state.core.db.get_item(&channel, &id).await {
        Ok(Some(item)) => item,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ApiError::not_found(format!("work item {id}"))),
            )
                .into_response();
        }
        Err(e) => return e.into_response(),
    };

    let percent = derive_percent(&item);
    let view = ProgressView {
        external_id: item.external_id,
        download_state: item.download_state,
        bytes_done: item.bytes_done,
        bytes_total: item.bytes_total,
        percent,
        processed: item.processed,
    };
    (StatusCode::OK, Json(view)).into_response()
}

/// Percent derivation chain for the progress endpoint
fn derive_percent(item: &WorkItem) -> f64 {
    if let Some(percent) = parse_percent(&item.download_state) {
        return percent;
    }
    if item.bytes_total > 0 {
        return (item.bytes_done as f64 / item.bytes_total as f64 * 100.0).clamp(0.0, 100.0);
    }
    if item.processed || item.download_state == "complete" {
        return 100.0;
    }
    0.0
}

/// POST /items/:id/reprocess - Reset an item for another pipeline pass
#[utoipa::path(
    post,
    path = "/items/{id}/reprocess",
    tag = "items",
    params(("id" = String, Path, description = "External id")),
    responses(
        (status = 204, description = "Item reset"),
        (status = 404, description = "Unknown item"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn reprocess_item(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let channel = state.core.config().channel.clone();
    match state.core.db.reset_item(&channel, &id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(ApiError::not_found(format!("work item {id}"))),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(item = %id, error = %e, "failed to reprocess item");
            e.into_response()
        }
    }
}

/// POST /items/:id/cancel - Abort an in-flight download
#[utoipa::path(
    post,
    path = "/items/{id}/cancel",
    tag = "items",
    params(("id" = String, Path, description = "External id")),
    responses(
        (status = 202, description = "A running download was aborted"),
        (status = 204, description = "Nothing to cancel"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn cancel_item(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.core.cancel_download(&id).await {
        Ok(true) => StatusCode::ACCEPTED.into_response(),
        Ok(false) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            tracing::error!(item = %id, error = %e, "failed to cancel item");
            e.into_response()
        }
    }
}
