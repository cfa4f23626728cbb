use super::*;
use crate::db::tokens::{ENCRYPTION_NONE, TokenRecord};

#[tokio::test]
async fn healthz_reports_ok() {
    let (app, _core, _dir) = test_app().await;
    let response = app.oneshot(get("/healthz")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn readyz_fails_without_credentials() {
    let (app, _core, _dir) = test_app().await;
    let response = app.oneshot(get("/readyz")).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["status"], "not_ready");
    assert_eq!(body["failed_check"], "credentials");
}

#[tokio::test]
async fn readyz_succeeds_with_a_stored_credential() {
    let (app, core, _dir) = test_app().await;

    core.tokens()
        .upsert(&TokenRecord {
            provider: "destination".into(),
            channel: String::new(),
            access_token: "tok".into(),
            refresh_token: String::new(),
            expires_at: 0,
            raw: String::new(),
            scope: String::new(),
            encryption_version: ENCRYPTION_NONE,
            updated_at: 0,
        })
        .await
        .unwrap();

    let response = app.oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn readyz_fails_while_the_circuit_is_open() {
    let (app, core, _dir) = test_app().await;

    // Credential present, but the breaker is open
    core.tokens()
        .upsert(&TokenRecord {
            provider: "destination".into(),
            channel: String::new(),
            access_token: "tok".into(),
            refresh_token: String::new(),
            expires_at: 0,
            raw: String::new(),
            scope: String::new(),
            encryption_version: ENCRYPTION_NONE,
            updated_at: 0,
        })
        .await
        .unwrap();

    let breaker = core.circuit_breaker().await;
    for _ in 0..5 {
        breaker.record_failure().await.unwrap();
    }

    let response = app.oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["failed_check"], "circuit_breaker");
}

#[tokio::test]
async fn status_reports_counts_gate_and_circuit() {
    let (app, core, _dir) = test_app().await;

    seed_item(&core, "a").await;
    seed_item(&core, "b").await;
    core.db.record_failure("", "b", "boom").await.unwrap();
    core.db.kv_put("", "avg_download_ms", "1234.5").await.unwrap();

    let response = app.oneshot(get("/status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["pending"], 2);
    assert_eq!(body["errored"], 1);
    assert_eq!(body["processed"], 0);
    assert_eq!(body["active_downloads"], 0);
    assert_eq!(body["max_concurrent_downloads"], 1);
    assert_eq!(body["circuit"]["state"], "closed");
    assert_eq!(body["circuit"]["failures"], 0);
    assert_eq!(body["retry_config"]["download_max_attempts"], 5);
    assert!((body["timings"]["avg_download_ms"].as_f64().unwrap() - 1234.5).abs() < 0.1);
    assert!(body["queue_by_priority"].is_array());
}
