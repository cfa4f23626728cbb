//! REST API server module
//!
//! Exposes the processing core over HTTP: health and readiness probes,
//! work item inspection and lifecycle actions, chat transcript reads and
//! the paced replay stream, and a credentialed admin surface.

use axum::{
    Router,
    http::HeaderValue,
    middleware,
    routing::{get, patch, post, put},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::Result;
use crate::config::{Config, RateLimitBackendKind};
use crate::core::VodMirror;

pub mod auth;
pub mod error_response;
pub mod openapi;
pub mod rate_limit;
pub mod routes;
pub mod state;

pub use self::openapi::ApiDoc;
pub use self::state::AppState;

/// Create the API router with all route definitions
///
/// # Routes
///
/// ## System
/// - `GET /healthz` - Liveness (store ping only)
/// - `GET /readyz` - Aggregate readiness
/// - `GET /status` - Queue counters, gate occupancy, breaker, timings
/// - `GET /openapi.json` - OpenAPI specification
/// - `GET /swagger-ui` - Interactive documentation (if enabled)
///
/// ## Work items
/// - `GET /items` - Paginated list
/// - `GET /items/:id` - Detail
/// - `GET /items/:id/progress` - Derived download progress
/// - `POST /items/:id/reprocess` - Reset for another pipeline pass
/// - `POST /items/:id/cancel` - Abort an in-flight download
///
/// ## Chat
/// - `GET /items/:id/chat` - Bounded JSON window
/// - `GET /items/:id/chat/stream` - Paced SSE replay
///
/// ## Admin (token or basic auth; rate limited)
/// - `PATCH /admin/items/:id/priority` - Update selection priority
/// - `PATCH /admin/items/:id/skip-upload` - Toggle the upload stage
/// - `GET /admin/config` / `PUT /admin/config` - Whitelisted overrides
/// - `POST /admin/discovery/run` - Pull recent upstream entries
/// - `POST /admin/backfill/run` - Walk one catalog page
/// - `GET /admin/monitor` - Operational summary
pub fn create_router(core: Arc<VodMirror>) -> Router {
    let config = core.config();
    let state = AppState::new(core.clone());

    let admin_routes = Router::new()
        .route("/admin/items/:id/priority", patch(routes::set_item_priority))
        .route(
            "/admin/items/:id/skip-upload",
            patch(routes::set_item_skip_upload),
        )
        .route("/admin/config", get(routes::get_admin_config))
        .route("/admin/config", put(routes::update_admin_config))
        .route("/admin/discovery/run", post(routes::run_discovery))
        .route("/admin/backfill/run", post(routes::run_backfill))
        .route("/admin/monitor", get(routes::monitor_summary))
        .layer(middleware::from_fn_with_state(
            config.admin.clone(),
            auth::require_admin,
        ));

    let router = Router::new()
        // System
        .route("/healthz", get(routes::healthz))
        .route("/readyz", get(routes::readyz))
        .route("/status", get(routes::status))
        .route("/openapi.json", get(routes::openapi_spec))
        // Work items
        .route("/items", get(routes::list_items))
        .route("/items/:id", get(routes::get_item))
        .route("/items/:id/progress", get(routes::item_progress))
        .route("/items/:id/reprocess", post(routes::reprocess_item))
        .route("/items/:id/cancel", post(routes::cancel_item))
        // Chat
        .route("/items/:id/chat", get(routes::chat_window))
        .route("/items/:id/chat/stream", get(routes::chat_stream))
        // Admin
        .merge(admin_routes);

    // Merge Swagger UI routes if enabled (before applying state)
    let router = if config.api.swagger_ui {
        router.merge(SwaggerUi::new("/swagger-ui").url("/openapi.json", ApiDoc::openapi()))
    } else {
        router
    };

    let router = router.with_state(state);

    // Rate limiting wraps everything (liveness probes are exempted inside
    // the middleware); a memory backend gets its idle-client sweeper here
    let router = if config.rate_limit.enabled {
        let limiter = match config.rate_limit.backend {
            RateLimitBackendKind::Memory => {
                let backend = Arc::new(rate_limit::MemoryBackend::new(
                    config.rate_limit.requests_per_ip,
                    config.rate_limit.window,
                ));
                rate_limit::RateLimiter::spawn_sweeper(
                    backend.clone(),
                    config.rate_limit.window,
                    core.shutdown_token(),
                );
                Arc::new(rate_limit::RateLimiter::new(backend, true))
            }
            RateLimitBackendKind::Persistent => Arc::new(rate_limit::RateLimiter::from_config(
                &config.rate_limit,
                core.db.clone(),
            )),
        };
        router.layer(middleware::from_fn_with_state(
            limiter,
            rate_limit::rate_limit_middleware,
        ))
    } else {
        router
    };

    // CORS outermost
    if config.api.cors_permissive || !config.api.cors_allowed_origins.is_empty() {
        router.layer(build_cors_layer(&config))
    } else {
        router
    }
}

/// Build a CORS layer: permissive allows any origin, otherwise only the
/// configured list.
fn build_cors_layer(config: &Config) -> CorsLayer {
    if config.api.cors_permissive {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let allowed: Vec<HeaderValue> = config
            .api
            .cors_allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Start the API server on the configured bind address.
///
/// Creates a TCP listener, binds it, and serves the router until the core's
/// shutdown token fires.
pub async fn start_api_server(core: Arc<VodMirror>) -> Result<()> {
    let bind_address = core.config().api.bind_address;
    let shutdown = core.shutdown_token();

    tracing::info!(address = %bind_address, "starting API server");

    let app = create_router(core);

    let listener = TcpListener::bind(bind_address)
        .await
        .map_err(crate::Error::Io)?;

    tracing::info!(address = %bind_address, "API server listening");

    // ConnectInfo provides the peer address for rate-limit client keys
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .map_err(|e| crate::Error::ApiServer(e.to_string()))?;

    tracing::info!("API server stopped");
    Ok(())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
