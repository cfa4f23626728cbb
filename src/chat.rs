//! Chat replay streaming.
//!
//! Replays a work item's chat transcript in real time, scaled by a playback
//! speed: the gap between consecutive messages is `(Δrel / speed)` wall-clock
//! seconds. Delivery is synchronous through a [`ChatSink`] — a slow consumer
//! slows the producer, so there is no intermediate queue that could overflow.
//! Cancellation is honored between events and inside every pacing sleep.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::db::{ChatMessage, Database};
use crate::retry::sleep_cancellable;

/// Rows fetched per page while replaying. Pages keep the read cursors
/// strictly scoped: no statement stays open across a pacing sleep.
const REPLAY_PAGE_SIZE: i64 = 256;

/// The consumer is gone; stop the replay cleanly
#[derive(Debug)]
pub struct SinkClosed;

/// Synchronous message consumer for a replay
#[async_trait]
pub trait ChatSink: Send {
    /// Deliver one message. An `Err` means the consumer disconnected and the
    /// replay should end without error.
    async fn send(&mut self, message: ChatMessage) -> std::result::Result<(), SinkClosed>;
}

/// How a replay ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Messages delivered to the sink
    pub emitted: u64,
    /// `true` when the cursor was exhausted; `false` on cancellation or a
    /// closed sink
    pub completed: bool,
}

/// Replace invalid speeds (non-positive, NaN, infinite) with 1.0
pub fn sanitize_speed(speed: f64) -> f64 {
    if speed.is_finite() && speed > 0.0 {
        speed
    } else {
        1.0
    }
}

/// Parse a user-supplied speed parameter; anything unusable means 1.0
pub fn parse_speed(raw: Option<&str>) -> f64 {
    match raw {
        None => 1.0,
        Some(text) => sanitize_speed(text.trim().parse().unwrap_or(1.0)),
    }
}

/// Paced replay over the durable chat log
pub struct ChatStreamer {
    db: Arc<Database>,
}

impl ChatStreamer {
    /// Create a streamer over the shared store
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Stream messages with `rel_time >= from_rel` into `sink`, pacing each
    /// gap by `(Δrel / speed)`.
    ///
    /// Returns cleanly on cancellation and on a closed sink; the summary says
    /// how many events went out and whether the transcript was exhausted.
    pub async fn stream(
        &self,
        cancel: &CancellationToken,
        external_id: &str,
        from_rel: f64,
        speed: f64,
        sink: &mut dyn ChatSink,
    ) -> Result<ReplaySummary> {
        let speed = sanitize_speed(speed);
        let mut prev_rel = from_rel;
        let mut emitted = 0u64;
        let mut after: Option<(f64, i64)> = None;

        loop {
            if cancel.is_cancelled() {
                return Ok(ReplaySummary {
                    emitted,
                    completed: false,
                });
            }

            let page = self
                .db
                .chat_page(external_id, from_rel, after, REPLAY_PAGE_SIZE)
                .await?;
            if page.is_empty() {
                return Ok(ReplaySummary {
                    emitted,
                    completed: true,
                });
            }

            for message in page {
                if message.rel_time > prev_rel {
                    let delay = Duration::from_secs_f64((message.rel_time - prev_rel) / speed);
                    if !sleep_cancellable(delay, cancel).await {
                        return Ok(ReplaySummary {
                            emitted,
                            completed: false,
                        });
                    }
                }

                prev_rel = message.rel_time;
                after = Some((message.rel_time, message.id));

                if sink.send(message).await.is_err() {
                    tracing::debug!(item = %external_id, emitted, "chat sink closed");
                    return Ok(ReplaySummary {
                        emitted,
                        completed: false,
                    });
                }
                emitted += 1;
            }
        }
    }
}

/// Sink that forwards into a bounded channel (the SSE adapter). Capacity 1
/// keeps backpressure end-to-end: a send awaits until the HTTP writer has
/// taken the previous event.
pub struct ChannelSink {
    tx: tokio::sync::mpsc::Sender<ChatMessage>,
}

impl ChannelSink {
    /// Wrap a channel sender
    pub fn new(tx: tokio::sync::mpsc::Sender<ChatMessage>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ChatSink for ChannelSink {
    async fn send(&mut self, message: ChatMessage) -> std::result::Result<(), SinkClosed> {
        self.tx.send(message).await.map_err(|_| SinkClosed)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewChatMessage;
    use std::time::Instant;

    async fn db_with_messages(rel_times: &[f64]) -> Arc<Database> {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let messages: Vec<NewChatMessage> = rel_times
            .iter()
            .enumerate()
            .map(|(i, &rel_time)| NewChatMessage {
                external_id: "v1".to_string(),
                username: format!("user{i}"),
                body: format!("message {i}"),
                abs_time: 1_700_000_000,
                rel_time,
                badges: String::new(),
                emotes: String::new(),
                color: String::new(),
            })
            .collect();
        db.insert_chat_messages(&messages).await.unwrap();
        db
    }

    /// Collects messages; optionally delays each delivery, optionally fires
    /// a cancellation token after N messages.
    struct CollectSink {
        received: Vec<ChatMessage>,
        delay: Duration,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl CollectSink {
        fn new() -> Self {
            Self {
                received: Vec::new(),
                delay: Duration::ZERO,
                cancel_after: None,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new()
            }
        }

        fn canceling_after(count: usize, token: CancellationToken) -> Self {
            Self {
                cancel_after: Some((count, token)),
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl ChatSink for CollectSink {
        async fn send(&mut self, message: ChatMessage) -> std::result::Result<(), SinkClosed> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.received.push(message);
            if let Some((count, token)) = &self.cancel_after {
                if self.received.len() >= *count {
                    token.cancel();
                }
            }
            Ok(())
        }
    }

    /// Pacing tolerance from the replay contract:
    /// `max(100ms, 10% of expected)`, doubled here for CI scheduling slack.
    fn within_tolerance(actual: Duration, expected: Duration) -> bool {
        let tolerance = Duration::from_millis(100).max(expected / 10) * 2;
        let low = expected.saturating_sub(tolerance);
        let high = expected + tolerance;
        actual >= low && actual <= high
    }

    #[tokio::test]
    async fn speed_one_paces_at_real_time() {
        let db = db_with_messages(&[0.0, 0.1, 0.2, 0.3]).await;
        let streamer = ChatStreamer::new(db);
        let mut sink = CollectSink::new();

        let start = Instant::now();
        let summary = streamer
            .stream(&CancellationToken::new(), "v1", 0.0, 1.0, &mut sink)
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert_eq!(summary.emitted, 4);
        assert!(summary.completed);
        assert!(
            within_tolerance(elapsed, Duration::from_millis(300)),
            "expected ~300ms at speed 1, took {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn speed_two_halves_the_schedule() {
        let db = db_with_messages(&[0.0, 0.1, 0.2, 0.3]).await;
        let streamer = ChatStreamer::new(db);
        let mut sink = CollectSink::new();

        let start = Instant::now();
        streamer
            .stream(&CancellationToken::new(), "v1", 0.0, 2.0, &mut sink)
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert!(
            within_tolerance(elapsed, Duration::from_millis(150)),
            "expected ~150ms at speed 2, took {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn speed_half_doubles_the_schedule() {
        let db = db_with_messages(&[0.0, 0.1, 0.2, 0.3]).await;
        let streamer = ChatStreamer::new(db);
        let mut sink = CollectSink::new();

        let start = Instant::now();
        streamer
            .stream(&CancellationToken::new(), "v1", 0.0, 0.5, &mut sink)
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert!(
            within_tolerance(elapsed, Duration::from_millis(600)),
            "expected ~600ms at speed 0.5, took {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn messages_arrive_in_rel_time_order() {
        let db = db_with_messages(&[0.3, 0.0, 0.2, 0.1]).await;
        let streamer = ChatStreamer::new(db);
        let mut sink = CollectSink::new();

        streamer
            .stream(&CancellationToken::new(), "v1", 0.0, 100.0, &mut sink)
            .await
            .unwrap();

        let rels: Vec<f64> = sink.received.iter().map(|m| m.rel_time).collect();
        assert_eq!(rels, vec![0.0, 0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn from_offset_skips_earlier_messages() {
        let db = db_with_messages(&[0.0, 1.0, 2.0, 3.0]).await;
        let streamer = ChatStreamer::new(db.clone());
        let mut sink = CollectSink::new();

        let summary = streamer
            .stream(&CancellationToken::new(), "v1", 2.0, 1_000.0, &mut sink)
            .await
            .unwrap();

        assert_eq!(summary.emitted, 2);
        assert_eq!(sink.received[0].rel_time, 2.0);
        // No wait is served for the first emitted message at rel == from
        assert_eq!(
            summary.emitted,
            db.chat_count_from("v1", 2.0).await.unwrap() as u64
        );
    }

    #[tokio::test]
    async fn backpressure_thousand_messages_in_a_bounded_window() {
        // 1000 messages clustered inside the first second of rel time,
        // replayed at 100x: total pacing is ~10ms of wall clock
        let rels: Vec<f64> = (0..1_000).map(|i| i as f64 / 1_000.0).collect();
        let db = db_with_messages(&rels).await;
        let streamer = ChatStreamer::new(db);
        let mut sink = CollectSink::new();

        let summary = tokio::time::timeout(
            Duration::from_secs(5),
            streamer.stream(&CancellationToken::new(), "v1", 0.0, 100.0, &mut sink),
        )
        .await
        .expect("must finish well inside 5s")
        .unwrap();

        assert!(summary.completed);
        assert_eq!(summary.emitted, 1_000);
        assert!(sink.received.len() <= 1_000);
    }

    #[tokio::test]
    async fn cancellation_stops_between_events() {
        // 10 messages at 0.0..0.9; cancel fires after the 2nd emit. The
        // replay must stop promptly: at least the 2 pre-cancel events, and
        // only a small number more.
        let rels: Vec<f64> = (0..10).map(|i| i as f64 / 10.0).collect();
        let db = db_with_messages(&rels).await;
        let streamer = ChatStreamer::new(db.clone());

        let cancel = CancellationToken::new();
        let mut sink = CollectSink::canceling_after(2, cancel.clone());

        let summary = streamer
            .stream(&cancel, "v1", 0.0, 1.0, &mut sink)
            .await
            .unwrap();

        assert!(!summary.completed);
        assert!(
            (2..=5).contains(&summary.emitted),
            "expected 2..=5 events after cancel, got {}",
            summary.emitted
        );
        // Canceled replays emit strictly fewer events than match the query
        let matching = db.chat_count_from("v1", 0.0).await.unwrap() as u64;
        assert!(summary.emitted < matching);
    }

    #[tokio::test]
    async fn empty_transcript_completes_immediately() {
        let db = db_with_messages(&[]).await;
        let streamer = ChatStreamer::new(db);
        let mut sink = CollectSink::new();

        let start = Instant::now();
        let summary = streamer
            .stream(&CancellationToken::new(), "v1", 0.0, 1.0, &mut sink)
            .await
            .unwrap();

        assert_eq!(summary.emitted, 0);
        assert!(summary.completed);
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn slow_sink_slows_the_producer() {
        // All messages at rel 0: no pacing sleeps, so elapsed time comes
        // entirely from the sink taking delivery one at a time
        let db = db_with_messages(&[0.0, 0.0, 0.0, 0.0, 0.0]).await;
        let streamer = ChatStreamer::new(db);
        let mut sink = CollectSink::slow(Duration::from_millis(20));

        let start = Instant::now();
        let summary = streamer
            .stream(&CancellationToken::new(), "v1", 0.0, 1.0, &mut sink)
            .await
            .unwrap();

        assert_eq!(summary.emitted, 5);
        assert!(
            start.elapsed() >= Duration::from_millis(90),
            "five 20ms deliveries must take at least ~100ms"
        );
    }

    #[tokio::test]
    async fn closed_sink_ends_the_replay_cleanly() {
        struct ClosedSink;

        #[async_trait]
        impl ChatSink for ClosedSink {
            async fn send(&mut self, _message: ChatMessage) -> std::result::Result<(), SinkClosed> {
                Err(SinkClosed)
            }
        }

        let db = db_with_messages(&[0.0, 0.1]).await;
        let streamer = ChatStreamer::new(db);
        let mut sink = ClosedSink;

        let summary = streamer
            .stream(&CancellationToken::new(), "v1", 0.0, 1.0, &mut sink)
            .await
            .unwrap();
        assert_eq!(summary.emitted, 0);
        assert!(!summary.completed);
    }

    #[test]
    fn invalid_speeds_normalize_to_one() {
        assert_eq!(sanitize_speed(0.0), 1.0);
        assert_eq!(sanitize_speed(-2.0), 1.0);
        assert_eq!(sanitize_speed(f64::NAN), 1.0);
        assert_eq!(sanitize_speed(f64::INFINITY), 1.0);
        assert_eq!(sanitize_speed(2.5), 2.5);

        assert_eq!(parse_speed(None), 1.0);
        assert_eq!(parse_speed(Some("not a number")), 1.0);
        assert_eq!(parse_speed(Some("0")), 1.0);
        assert_eq!(parse_speed(Some("-1")), 1.0);
        assert_eq!(parse_speed(Some("2")), 2.0);
        assert_eq!(parse_speed(Some(" 0.5 ")), 0.5);
    }

    #[tokio::test]
    async fn channel_sink_reports_closed_receiver() {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        drop(rx);
        let mut sink = ChannelSink::new(tx);

        let message = ChatMessage {
            id: 1,
            external_id: "v1".into(),
            username: "u".into(),
            body: "b".into(),
            abs_time: 0,
            rel_time: 0.0,
            badges: String::new(),
            emotes: String::new(),
            color: String::new(),
        };
        assert!(sink.send(message).await.is_err());
    }
}
