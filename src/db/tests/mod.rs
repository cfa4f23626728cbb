use super::*;
use crate::db::items::QueueCounts;

mod chat;
mod kv;

/// Fresh in-memory database for a test
async fn test_db() -> Database {
    Database::in_memory().await.expect("in-memory database")
}

/// Insert a minimal work item and return its external id
async fn seed_item(db: &Database, channel: &str, external_id: &str) -> String {
    db.upsert_item(&NewWorkItem {
        channel: channel.to_string(),
        external_id: external_id.to_string(),
        title: format!("broadcast {external_id}"),
        recorded_at: chrono::Utc::now().timestamp() - 3_600,
        duration_seconds: 7_200,
        priority: 0,
    })
    .await
    .expect("insert item");
    external_id.to_string()
}

#[tokio::test]
async fn ping_succeeds_on_fresh_database() {
    let db = test_db().await;
    db.ping().await.expect("ping should succeed");
}

#[tokio::test]
async fn queue_counts_start_at_zero() {
    let db = test_db().await;
    let counts: QueueCounts = db.queue_counts("").await.unwrap();
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.errored, 0);
    assert_eq!(counts.processed, 0);
}
