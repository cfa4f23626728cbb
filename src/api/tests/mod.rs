use super::*;
use crate::core::test_helpers::{MockDownloader, MockUploader, test_core};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt; // for oneshot

mod system;

/// Router plus core over a temp directory; rate limiting off, admin token set
async fn test_app() -> (Router, Arc<VodMirror>, tempfile::TempDir) {
    let (core, dir) = test_core(
        |config| {
            config.rate_limit.enabled = false;
            config.admin.token = Some("test-admin-token".into());
        },
        MockDownloader::succeeding(),
        MockUploader::succeeding(),
        None,
    )
    .await;

    (create_router(core.clone()), core, dir)
}

/// Seed one work item through the store
async fn seed_item(core: &VodMirror, external_id: &str) {
    core.db
        .upsert_item(&crate::db::NewWorkItem {
            channel: String::new(),
            external_id: external_id.to_string(),
            title: format!("broadcast {external_id}"),
            recorded_at: chrono::Utc::now().timestamp() - 3_600,
            duration_seconds: 60,
            priority: 0,
        })
        .await
        .unwrap();
}

/// Drain a response body into JSON
async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn unknown_route_is_404() {
    let (app, _core, _dir) = test_app().await;
    let response = app.oneshot(get("/nope")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cors_permissive_adds_headers() {
    let (core, _dir) = test_core(
        |config| {
            config.rate_limit.enabled = false;
            config.api.cors_permissive = true;
        },
        MockDownloader::succeeding(),
        MockUploader::succeeding(),
        None,
    )
    .await;
    let app = create_router(core);

    let request = Request::builder()
        .uri("/healthz")
        .header("Origin", "http://localhost:3000")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .contains_key("access-control-allow-origin"),
        "CORS header should be present when permissive CORS is enabled"
    );
}

#[tokio::test]
async fn openapi_document_is_served() {
    let (app, _core, _dir) = test_app().await;
    let response = app.oneshot(get("/openapi.json")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let doc = body_json(response).await;
    assert!(doc["paths"].as_object().unwrap().contains_key("/items"));
}
