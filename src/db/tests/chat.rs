use super::*;

fn message(external_id: &str, rel_time: f64, body: &str) -> NewChatMessage {
    NewChatMessage {
        external_id: external_id.to_string(),
        username: "viewer".to_string(),
        body: body.to_string(),
        abs_time: 1_700_000_000 + rel_time as i64,
        rel_time,
        badges: "subscriber/12".to_string(),
        emotes: String::new(),
        color: "#FF0000".to_string(),
    }
}

#[tokio::test]
async fn insert_and_window_ordered_by_rel_time() {
    let db = test_db().await;

    // Insert out of order; reads must come back sorted
    db.insert_chat_messages(&[
        message("v1", 2.0, "second"),
        message("v1", 0.5, "first"),
        message("v1", 3.5, "third"),
    ])
    .await
    .unwrap();

    let window = db.chat_window("v1", 0.0, None, 100).await.unwrap();
    let bodies: Vec<&str> = window.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn window_respects_bounds_and_limit() {
    let db = test_db().await;
    let messages: Vec<NewChatMessage> = (0..10)
        .map(|i| message("v1", i as f64, &format!("m{i}")))
        .collect();
    db.insert_chat_messages(&messages).await.unwrap();

    let window = db.chat_window("v1", 2.0, Some(5.0), 100).await.unwrap();
    assert_eq!(window.len(), 4); // rel 2, 3, 4, 5

    let window = db.chat_window("v1", 0.0, None, 3).await.unwrap();
    assert_eq!(window.len(), 3);
    assert_eq!(window[2].body, "m2");
}

#[tokio::test]
async fn window_is_scoped_to_item() {
    let db = test_db().await;
    db.insert_chat_messages(&[message("v1", 0.0, "for v1"), message("v2", 0.0, "for v2")])
        .await
        .unwrap();

    let window = db.chat_window("v1", 0.0, None, 100).await.unwrap();
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].body, "for v1");
}

#[tokio::test]
async fn empty_batch_insert_is_ok() {
    let db = test_db().await;
    db.insert_chat_messages(&[]).await.unwrap();
}

#[tokio::test]
async fn chat_page_walks_every_row_exactly_once() {
    let db = test_db().await;
    // Duplicate rel_times exercise the (rel_time, id) keyset tiebreak
    let messages: Vec<NewChatMessage> = (0..25)
        .map(|i| message("v1", (i / 5) as f64, &format!("m{i}")))
        .collect();
    db.insert_chat_messages(&messages).await.unwrap();

    let mut seen = Vec::new();
    let mut after: Option<(f64, i64)> = None;
    loop {
        let page = db.chat_page("v1", 0.0, after, 7).await.unwrap();
        if page.is_empty() {
            break;
        }
        let last = page.last().unwrap();
        after = Some((last.rel_time, last.id));
        seen.extend(page.into_iter().map(|m| m.body));
    }

    assert_eq!(seen.len(), 25, "every message seen exactly once");
    let expected: Vec<String> = (0..25).map(|i| format!("m{i}")).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn chat_page_honors_from_offset() {
    let db = test_db().await;
    let messages: Vec<NewChatMessage> = (0..10)
        .map(|i| message("v1", i as f64, &format!("m{i}")))
        .collect();
    db.insert_chat_messages(&messages).await.unwrap();

    let page = db.chat_page("v1", 6.0, None, 100).await.unwrap();
    assert_eq!(page.len(), 4);
    assert_eq!(page[0].body, "m6");
}

#[tokio::test]
async fn chat_count_from_matches_window() {
    let db = test_db().await;
    let messages: Vec<NewChatMessage> = (0..10)
        .map(|i| message("v1", i as f64 / 10.0, &format!("m{i}")))
        .collect();
    db.insert_chat_messages(&messages).await.unwrap();

    assert_eq!(db.chat_count_from("v1", 0.0).await.unwrap(), 10);
    assert_eq!(db.chat_count_from("v1", 0.55).await.unwrap(), 4);
    assert_eq!(db.chat_count_from("v2", 0.0).await.unwrap(), 0);
}

#[tokio::test]
async fn message_fields_round_trip() {
    let db = test_db().await;
    db.insert_chat_messages(&[message("v1", 1.25, "hello")]).await.unwrap();

    let window = db.chat_window("v1", 0.0, None, 1).await.unwrap();
    let m = &window[0];
    assert_eq!(m.username, "viewer");
    assert_eq!(m.body, "hello");
    assert!((m.rel_time - 1.25).abs() < f64::EPSILON);
    assert_eq!(m.badges, "subscriber/12");
    assert_eq!(m.color, "#FF0000");
}
