//! Pipeline invariants that hold without a database or network: limiter
//! pacing, dedupe key laws, escape idempotence, and the prewarm ordering.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};

use botgate::config::LimiterSettings;
use botgate::media::{MediaKind, MemoryObjectStore, ObjectStore, PrewarmJob, PrewarmQueue};
use botgate::sender::types::dedupe;
use botgate::sender::{PriorityClass, SendLimiter};
use botgate::telegram::escape_markdown_v2;

#[tokio::test(start_paused = true)]
async fn burst_of_seventy_chats_is_paced_by_the_global_bucket() {
    // Defaults: global burst 10, refill 30/s, per-chat 1 cap / 5 per sec.
    let limiter = SendLimiter::new(LimiterSettings::default());
    let _dispatcher = limiter.spawn_dispatcher();

    let t0 = tokio::time::Instant::now();
    let stamps: Arc<Mutex<Vec<tokio::time::Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for i in 0..70 {
        let limiter = limiter.clone();
        let stamps = Arc::clone(&stamps);
        handles.push(tokio::spawn(async move {
            limiter
                .admit("acme", &format!("chat-{}", i), PriorityClass::Start, None)
                .await
                .unwrap();
            stamps.lock().unwrap().push(tokio::time::Instant::now());
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stamps = stamps.lock().unwrap();
    assert_eq!(stamps.len(), 70, "every request is eventually admitted");

    // 60 post-burst admissions at 30/s keep the tail ~2 s out.
    let total = t0.elapsed();
    assert!(
        total >= Duration::from_millis(1900),
        "70 sends finished too fast: {:?}",
        total
    );

    // The 40th admission had to wait in the limiter.
    let mut sorted: Vec<_> = stamps.iter().map(|t| *t - t0).collect();
    sorted.sort();
    assert!(
        sorted[39] >= Duration::from_millis(300),
        "40th admission was not delayed: {:?}",
        sorted[39]
    );

    // No rolling one-second window exceeds burst + refill.
    for (i, &start) in stamps.iter().enumerate() {
        let in_window = stamps
            .iter()
            .filter(|&&t| t >= start && t < start + Duration::from_secs(1))
            .count();
        assert!(
            in_window <= 40,
            "window starting at admission {} saw {} sends",
            i,
            in_window
        );
    }
}

#[tokio::test(start_paused = true)]
async fn overflowing_the_buffer_fails_fast_with_queue_full() {
    let settings = LimiterSettings {
        global_capacity: 0.0,
        global_refill_per_sec: 0.0,
        max_waiters: 5,
        ..LimiterSettings::default()
    };
    let limiter = SendLimiter::new(settings);

    let mut handles = Vec::new();
    for i in 0..5 {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move {
            let _ = limiter
                .admit("acme", &i.to_string(), PriorityClass::Shot, None)
                .await;
        }));
    }
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert_eq!(limiter.waiting_count(), 5);

    let start = tokio::time::Instant::now();
    let err = limiter
        .admit("acme", "one-too-many", PriorityClass::Shot, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "QUEUE_FULL");
    assert!(
        start.elapsed() < Duration::from_millis(10),
        "QUEUE_FULL must not block the caller"
    );

    for handle in handles {
        handle.abort();
    }
}

#[test]
fn markdown_escape_is_idempotent_on_real_payloads() {
    let samples = [
        "Oferta especial! 50% OFF até hoje às 23:59.",
        "Use o cupom *PROMO10* (válido 24h)",
        "line1\nline2_with_underscores_",
        "already \\* escaped \\. text",
        "",
    ];
    for sample in samples {
        let once = escape_markdown_v2(sample);
        assert_eq!(once, escape_markdown_v2(&once), "sample {:?}", sample);
    }
}

#[test]
fn dedupe_keys_collapse_repeats_within_their_scope() {
    // Same test body in the same minute: one key.
    let a = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 3).unwrap();
    let b = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 55).unwrap();
    assert_eq!(
        dedupe::send_test("acme", "123", "Hi", a),
        dedupe::send_test("acme", "123", "Hi", b)
    );
    // Different text hashes to a different key.
    assert_ne!(
        dedupe::send_test("acme", "123", "Hi", a),
        dedupe::send_test("acme", "123", "Hello", a)
    );

    // Re-entrant /start in the same minute shares the session id.
    assert_eq!(
        dedupe::start_session_id("999", a),
        dedupe::start_session_id("999", b)
    );

    // Queue-scoped keys are stable per entity.
    assert_eq!(dedupe::downsell(42), "downsell:42");
    assert_eq!(dedupe::shot(7, "100"), "shot:7:100");
}

#[tokio::test]
async fn prewarm_queue_prefers_audio_over_video_over_photo() {
    let queue = PrewarmQueue::new();
    queue.enqueue(PrewarmJob::new("acme".into(), "p".into(), MediaKind::Photo));
    queue.enqueue(PrewarmJob::new("acme".into(), "v".into(), MediaKind::Video));
    queue.enqueue(PrewarmJob::new("acme".into(), "a".into(), MediaKind::Audio));

    let mut order = Vec::new();
    for _ in 0..3 {
        order.push(queue.pop().await.sha256);
    }
    assert_eq!(order, ["a", "v", "p"]);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn object_store_round_trips_content_addressed_keys() {
    let store = MemoryObjectStore::new();
    let key = "acme/audio/0123abcd.mp3";
    store.put(key, b"voice note").await.unwrap();
    assert_eq!(store.get(key).await.unwrap(), b"voice note");
    assert!(store.get("acme/audio/other.mp3").await.is_err());
}
