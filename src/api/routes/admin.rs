//! Credentialed operator endpoints.
//!
//! All routes in this group sit behind the admin auth middleware and the
//! rate limiter. Config writes are restricted to the whitelisted keys in
//! [`crate::config::ADMIN_CONFIG_KEYS`]; values land in the KV scratchpad
//! under `cfg:<KEY>` and overlay the process configuration at the next tick.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use utoipa::ToSchema;

use crate::api::AppState;
use crate::config::ADMIN_CONFIG_KEYS;
use crate::error::ApiError;

/// Body for the priority update
#[derive(Debug, Deserialize, ToSchema)]
pub struct PriorityBody {
    /// New selection priority (higher = earlier)
    pub priority: i64,
}

/// Body for the skip-upload toggle
#[derive(Debug, Deserialize, ToSchema)]
pub struct SkipUploadBody {
    /// Whether to skip the upload stage for this item
    pub skip_upload: bool,
}

/// Body for a config override write
#[derive(Debug, Deserialize, ToSchema)]
pub struct ConfigBody {
    /// Whitelisted configuration key
    pub key: String,
    /// New value; `null` clears the override
    pub value: Option<String>,
}

/// PATCH /admin/items/:id/priority - Update an item's selection priority
#[utoipa::path(
    patch,
    path = "/admin/items/{id}/priority",
    tag = "admin",
    params(("id" = String, Path, description = "External id")),
    request_body = PriorityBody,
    responses(
        (status = 204, description = "Priority updated"),
        (status = 404, description = "Unknown item"),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn set_item_priority(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PriorityBody>,
) -> Response {
    let channel = state.core.config().channel.clone();
    match state.core.db.set_priority(&channel, &id, body.priority).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(ApiError::not_found(format!("work item {id}"))),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// PATCH /admin/items/:id/skip-upload - Toggle the skip-upload flag
#[utoipa::path(
    patch,
    path = "/admin/items/{id}/skip-upload",
    tag = "admin",
    params(("id" = String, Path, description = "External id")),
    request_body = SkipUploadBody,
    responses(
        (status = 204, description = "Flag updated"),
        (status = 404, description = "Unknown item"),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn set_item_skip_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SkipUploadBody>,
) -> Response {
    let channel = state.core.config().channel.clone();
    match state
        .core
        .db
        .set_skip_upload(&channel, &id, body.skip_upload)
        .await
    {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(ApiError::not_found(format!("work item {id}"))),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /admin/config - Read the whitelisted overrides
#[utoipa::path(
    get,
    path = "/admin/config",
    tag = "admin",
    responses(
        (status = 200, description = "Current overrides keyed by config name"),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn get_admin_config(State(state): State<AppState>) -> Response {
    let channel = state.core.config().channel.clone();
    let mut overrides = serde_json::Map::new();

    for key in ADMIN_CONFIG_KEYS {
        let value = match state.core.db.kv_get(&channel, &format!("cfg:{key}")).await {
            Ok(value) => value,
            Err(e) => return e.into_response(),
        };
        overrides.insert(
            (*key).to_string(),
            value.map(serde_json::Value::String).unwrap_or(serde_json::Value::Null),
        );
    }

    (StatusCode::OK, Json(serde_json::Value::Object(overrides))).into_response()
}

/// PUT /admin/config - Write or clear one whitelisted override
#[utoipa::path(
    put,
    path = "/admin/config",
    tag = "admin",
    request_body = ConfigBody,
    responses(
        (status = 204, description = "Override written"),
        (status = 400, description = "Key not whitelisted"),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn update_admin_config(
    State(state): State<AppState>,
    Json(body): Json<ConfigBody>,
) -> Response {
    if !ADMIN_CONFIG_KEYS.contains(&body.key.as_str()) {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiError::validation(format!(
                "'{}' is not a writable configuration key",
                body.key
            ))),
        )
            .into_response();
    }

    let channel = state.core.config().channel.clone();
    let kv_key = format!("cfg:{}", body.key);
    let result = match &body.value {
        Some(value) => state.core.db.kv_put(&channel, &kv_key, value).await,
        None => state.core.db.kv_delete(&channel, &kv_key).await,
    };

    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /admin/discovery/run - Pull recent upstream entries now
#[utoipa::path(
    post,
    path = "/admin/discovery/run",
    tag = "admin",
    responses(
        (status = 200, description = "Discovery pass finished"),
        (status = 401, description = "Unauthorized"),
        (status = 502, description = "Upstream discovery failed")
    )
)]
pub async fn run_discovery(State(state): State<AppState>) -> Response {
    match state.core.run_discovery().await {
        Ok(count) => (StatusCode::OK, Json(json!({"discovered": count}))).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "manual discovery failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(ApiError::new("discovery_failed", e.to_string())),
            )
                .into_response()
        }
    }
}

/// POST /admin/backfill/run - Walk one catalog page from the stored cursor
#[utoipa::path(
    post,
    path = "/admin/backfill/run",
    tag = "admin",
    responses(
        (status = 200, description = "Catalog page ingested"),
        (status = 401, description = "Unauthorized"),
        (status = 502, description = "Upstream catalog walk failed")
    )
)]
pub async fn run_backfill(State(state): State<AppState>) -> Response {
    match state.core.run_backfill_page().await {
        Ok(count) => (StatusCode::OK, Json(json!({"ingested": count}))).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "manual backfill failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(ApiError::new("backfill_failed", e.to_string())),
            )
                .into_response()
        }
    }
}

/// GET /admin/monitor - One-page operational summary
#[utoipa::path(
    get,
    path = "/admin/monitor",
    tag = "admin",
    responses(
        (status = 200, description = "Status snapshot plus job timestamps"),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn monitor_summary(State(state): State<AppState>) -> Response {
    let status = match super::system::build_status(&state).await {
        Ok(status) => status,
        Err(e) => return e.into_response(),
    };

    let channel = state.core.config().channel.clone();
    let db = &state.core.db;

    let job_process_last = db.kv_get(&channel, "job_process_last").await.ok().flatten();
    let job_retention_last = db.kv_get(&channel, "job_retention_last").await.ok().flatten();
    let catalog_cursor = db.kv_get(&channel, "catalog_after").await.ok().flatten();

    (
        StatusCode::OK,
        Json(json!({
            "status": status,
            "job_process_last": job_process_last,
            "job_retention_last": job_retention_last,
            "catalog_cursor": catalog_cursor,
            "active_cancellations": state.core.cancellations().len(),
        })),
    )
        .into_response()
}
