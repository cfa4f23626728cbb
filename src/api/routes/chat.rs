//! Chat transcript handlers: bounded window reads and the paced replay
//! stream.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
};
use serde::Deserialize;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::api::AppState;
use crate::chat::{ChannelSink, ChatStreamer, parse_speed};
use crate::error::ApiError;

/// Hard cap on the window read size
const CHAT_LIMIT_MAX: i64 = 5_000;
/// Default window read size
const CHAT_LIMIT_DEFAULT: i64 = 1_000;

/// Query parameters for the bounded window read
#[derive(Debug, Deserialize)]
pub struct ChatQuery {
    /// Lower bound on rel_time, seconds (default 0)
    pub from: Option<f64>,
    /// Upper bound on rel_time, seconds (unset or 0 = no bound)
    pub to: Option<f64>,
    /// Row cap (clamped to 1..=5000, default 1000)
    pub limit: Option<i64>,
}

/// Query parameters for the replay stream
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Replay start offset in rel_time seconds (default 0)
    pub from: Option<f64>,
    /// Playback speed; invalid values fall back to 1.0
    pub speed: Option<String>,
}

/// GET /items/:id/chat - Bounded JSON window of the transcript
#[utoipa::path(
    get,
    path = "/items/{id}/chat",
    tag = "chat",
    params(
        ("id" = String, Path, description = "External id"),
        ("from" = Option<f64>, Query, description = "Lower rel_time bound in seconds"),
        ("to" = Option<f64>, Query, description = "Upper rel_time bound in seconds"),
        ("limit" = Option<i64>, Query, description = "Row cap (max 5000, default 1000)")
    ),
    responses(
        (status = 200, description = "Chat messages ordered by rel_time", body = Vec<crate::db::ChatMessage>),
        (status = 404, description = "Unknown item"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn chat_window(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ChatQuery>,
) -> Response {
    let channel = state.core.config().channel.clone();
    match state.core.db.get_item(&channel, &id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ApiError::not_found(format!("work item {id}"))),
            )
                .into_response();
        }
        Err(e) => return e.into_response(),
    }

    let from = query.from.unwrap_or(0.0).max(0.0);
    let to = query.to.filter(|&to| to > 0.0);
    let limit = query
        .limit
        .unwrap_or(CHAT_LIMIT_DEFAULT)
        .clamp(1, CHAT_LIMIT_MAX);

    match state.core.db.chat_window(&id, from, to, limit).await {
        Ok(messages) => (StatusCode::OK, Json(messages)).into_response(),
        Err(e) => {
            tracing::error!(item = %id, error = %e, "failed to read chat window");
            e.into_response()
        }
    }
}

/// GET /items/:id/chat/stream - Replay the transcript as an event stream.
///
/// Events are `data: <json>` frames flushed one at a time; pacing follows
/// `(Δrel / speed)`. The producer writes through a capacity-1 channel, so a
/// slow client applies backpressure all the way into the replay loop. The
/// stream ends when the transcript is exhausted, the client disconnects, or
/// the service shuts down.
#[utoipa::path(
    get,
    path = "/items/{id}/chat/stream",
    tag = "chat",
    params(
        ("id" = String, Path, description = "External id"),
        ("from" = Option<f64>, Query, description = "Replay start offset in seconds"),
        ("speed" = Option<String>, Query, description = "Playback speed (default 1.0)")
    ),
    responses(
        (status = 200, description = "Server-sent event stream of chat messages", content_type = "text/event-stream"),
        (status = 404, description = "Unknown item"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn chat_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let channel = state.core.config().channel.clone();
    match state.core.db.get_item(&channel, &id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ApiError::not_found(format!("work item {id}"))),
            )
                .into_response();
        }
        Err(e) => return e.into_response(),
    }

    let from = query.from.unwrap_or(0.0).max(0.0);
    let speed = parse_speed(query.speed.as_deref());

    // Capacity 1: the streamer blocks until the HTTP writer takes each event
    let (tx, rx) = tokio::sync::mpsc::channel(1);
    let streamer = ChatStreamer::new(state.core.db.clone());
    let cancel = state.core.shutdown_token().child_token();

    let stream_id = id.clone();
    tokio::spawn(async move {
        let mut sink = ChannelSink::new(tx);
        match streamer
            .stream(&cancel, &stream_id, from, speed, &mut sink)
            .await
        {
            Ok(summary) => {
                tracing::debug!(
                    item = %stream_id,
                    emitted = summary.emitted,
                    completed = summary.completed,
                    "chat replay finished"
                );
            }
            Err(e) => {
                tracing::error!(item = %stream_id, error = %e, "chat replay failed");
            }
        }
    });

    let sse_stream = ReceiverStream::new(rx).filter_map(|message| {
        match serde_json::to_string(&message) {
            Ok(json) => Some(Ok::<_, std::convert::Infallible>(
                SseEvent::default().data(json),
            )),
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize chat message");
                None
            }
        }
    });

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Sse::new(sse_stream).keep_alive(KeepAlive::default()),
    )
        .into_response()
}
