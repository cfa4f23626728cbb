use super::*;

#[tokio::test]
async fn kv_round_trips() {
    let db = test_db().await;

    assert!(db.kv_get("", "circuit_state").await.unwrap().is_none());

    db.kv_put("", "circuit_state", "open").await.unwrap();
    assert_eq!(
        db.kv_get("", "circuit_state").await.unwrap().as_deref(),
        Some("open")
    );

    db.kv_put("", "circuit_state", "closed").await.unwrap();
    assert_eq!(
        db.kv_get("", "circuit_state").await.unwrap().as_deref(),
        Some("closed")
    );

    db.kv_delete("", "circuit_state").await.unwrap();
    assert!(db.kv_get("", "circuit_state").await.unwrap().is_none());
}

#[tokio::test]
async fn kv_is_channel_scoped() {
    let db = test_db().await;

    db.kv_put("alpha", "catalog_after", "cursor-a").await.unwrap();
    db.kv_put("beta", "catalog_after", "cursor-b").await.unwrap();

    assert_eq!(
        db.kv_get("alpha", "catalog_after").await.unwrap().as_deref(),
        Some("cursor-a")
    );
    assert_eq!(
        db.kv_get("beta", "catalog_after").await.unwrap().as_deref(),
        Some("cursor-b")
    );
}

#[tokio::test]
async fn kv_delete_of_missing_key_is_ok() {
    let db = test_db().await;
    db.kv_delete("", "never-written").await.unwrap();
}

#[tokio::test]
async fn kv_numeric_helpers_fall_back_to_defaults() {
    let db = test_db().await;

    assert_eq!(db.kv_get_i64("", "circuit_failures", 0).await.unwrap(), 0);

    db.kv_put("", "circuit_failures", "3").await.unwrap();
    assert_eq!(db.kv_get_i64("", "circuit_failures", 0).await.unwrap(), 3);

    db.kv_put("", "circuit_failures", "not a number").await.unwrap();
    assert_eq!(db.kv_get_i64("", "circuit_failures", 7).await.unwrap(), 7);

    assert_eq!(db.kv_get_f64("", "avg_total_ms", 1.5).await.unwrap(), 1.5);
}

#[tokio::test]
async fn ema_seeds_then_converges() {
    let db = test_db().await;

    // First sample seeds the average
    let v1 = db.kv_update_ema("", "avg_download_ms", 1_000.0).await.unwrap();
    assert!((v1 - 1_000.0).abs() < f64::EPSILON);

    // alpha = 0.2: next = 0.2 * 2000 + 0.8 * 1000 = 1200
    let v2 = db.kv_update_ema("", "avg_download_ms", 2_000.0).await.unwrap();
    assert!((v2 - 1_200.0).abs() < 1.0, "expected ~1200, got {v2}");

    let stored = db.kv_get_f64("", "avg_download_ms", 0.0).await.unwrap();
    assert!((stored - v2).abs() < 1.0);
}
