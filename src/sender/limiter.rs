use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::LimiterSettings;
use crate::sender::types::PriorityClass;
use crate::utils::errors::GatewayError;

const COOLDOWN_DEFAULT: Duration = Duration::from_secs(1);
const COOLDOWN_CAP: Duration = Duration::from_secs(15);
const CHAT_STATE_HIGH_WATER: usize = 8192;

/// Classic token bucket with fractional refill.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_sec: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn has_token(&self) -> bool {
        self.tokens >= 1.0
    }

    fn take(&mut self) {
        self.tokens -= 1.0;
    }
}

#[derive(Debug)]
struct ChatState {
    bucket: TokenBucket,
    cooldown_until: Option<Instant>,
    /// Last applied 429 penalty; doubles on repeat, reset on success.
    penalty: Duration,
    last_touched: Instant,
}

impl ChatState {
    fn new(capacity: f64, refill_per_sec: f64, now: Instant) -> Self {
        Self {
            bucket: TokenBucket::new(capacity, refill_per_sec, now),
            cooldown_until: None,
            penalty: Duration::ZERO,
            last_touched: now,
        }
    }

    fn cooled_down(&self, now: Instant) -> bool {
        self.cooldown_until.map_or(true, |until| now >= until)
    }
}

struct Waiter {
    chat_key: String,
    chat_refill_override: Option<f64>,
    tx: oneshot::Sender<()>,
}

struct LimiterState {
    global: TokenBucket,
    chats: HashMap<String, ChatState>,
    queues: [VecDeque<Waiter>; PriorityClass::COUNT],
    waiting: usize,
}

/// The single shared send scheduler: global + per-chat token buckets, three
/// strict priority classes (FIFO within a class), a bounded waiting buffer,
/// and per-chat 429 cooldowns.
///
/// Not a process global — construct one and pass the handle around so tests
/// can run isolated instances.
#[derive(Clone)]
pub struct SendLimiter {
    state: Arc<Mutex<LimiterState>>,
    settings: LimiterSettings,
}

fn chat_key(slug: &str, chat_id: &str) -> String {
    format!("{}:{}", slug, chat_id)
}

impl SendLimiter {
    pub fn new(settings: LimiterSettings) -> Self {
        let now = Instant::now();
        Self {
            state: Arc::new(Mutex::new(LimiterState {
                global: TokenBucket::new(
                    settings.global_capacity,
                    settings.global_refill_per_sec,
                    now,
                ),
                chats: HashMap::new(),
                queues: std::array::from_fn(|_| VecDeque::new()),
                waiting: 0,
            })),
            settings,
        }
    }

    /// Block until this request is admitted. Returns `QUEUE_FULL` when the
    /// waiting buffer is at capacity and `CANCELED` when the limiter shuts
    /// down underneath the waiter. Dropping the returned future removes the
    /// waiter on the next dispatch tick.
    pub async fn admit(
        &self,
        slug: &str,
        chat_id: &str,
        class: PriorityClass,
        chat_refill_override: Option<f64>,
    ) -> Result<(), GatewayError> {
        let key = chat_key(slug, chat_id);
        let rx = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();

            // Fast path: nothing queued ahead and both buckets pass.
            if state.waiting == 0 {
                state.global.refill(now);
                let global_ready = state.global.has_token();
                let settings = &self.settings;
                let chat = state.chats.entry(key.clone()).or_insert_with(|| {
                    ChatState::new(
                        settings.chat_capacity,
                        chat_refill_override.unwrap_or(settings.chat_refill_per_sec),
                        now,
                    )
                });
                chat.bucket.refill(now);
                chat.last_touched = now;
                if global_ready && chat.cooled_down(now) && chat.bucket.has_token() {
                    chat.bucket.take();
                    state.global.take();
                    return Ok(());
                }
            }

            if state.waiting >= self.settings.max_waiters {
                warn!(chat = %key, waiting = state.waiting, "send buffer full");
                return Err(GatewayError::QueueFull);
            }

            let (tx, rx) = oneshot::channel();
            state.queues[class.index()].push_back(Waiter {
                chat_key: key,
                chat_refill_override,
                tx,
            });
            state.waiting += 1;
            rx
        };

        rx.await.map_err(|_| GatewayError::Canceled)
    }

    /// Record a 429 for a chat: hold its sends until the deadline. Repeat
    /// offenders double the penalty, capped at 15 s.
    pub fn report_rate_limit(&self, slug: &str, chat_id: &str, retry_after: Option<Duration>) {
        let key = chat_key(slug, chat_id);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let settings = &self.settings;
        let chat = state.chats.entry(key.clone()).or_insert_with(|| {
            ChatState::new(settings.chat_capacity, settings.chat_refill_per_sec, now)
        });

        let base = retry_after.unwrap_or(COOLDOWN_DEFAULT);
        let doubled = chat.penalty.saturating_mul(2);
        let penalty = base.max(doubled).min(COOLDOWN_CAP);
        chat.penalty = penalty;
        chat.cooldown_until = Some(now + penalty);
        chat.last_touched = now;
        debug!(chat = %key, ?penalty, "429 cooldown armed");
    }

    /// A successful send resets the chat's penalty ladder.
    pub fn report_success(&self, slug: &str, chat_id: &str) {
        let key = chat_key(slug, chat_id);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(chat) = state.chats.get_mut(&key) {
            chat.penalty = Duration::ZERO;
        }
    }

    /// Remaining cooldown for a chat, if any.
    pub fn cooldown_remaining(&self, slug: &str, chat_id: &str) -> Option<Duration> {
        let key = chat_key(slug, chat_id);
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        state
            .chats
            .get(&key)
            .and_then(|c| c.cooldown_until)
            .and_then(|until| until.checked_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    pub fn waiting_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .waiting
    }

    /// Run the dispatch loop until aborted.
    pub fn spawn_dispatcher(&self) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        info!(tick_ms = limiter.settings.tick_ms, "send limiter dispatcher started");
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(limiter.settings.tick_ms.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                limiter.dispatch_tick();
            }
        })
    }

    /// One dispatch pass: scan waiters in priority order, FIFO within a
    /// class, releasing each whose chat cooldown and both buckets pass.
    /// Canceled waiters (dropped receivers) are pruned here.
    fn dispatch_tick(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let settings = &self.settings;
        let LimiterState {
            global,
            chats,
            queues,
            waiting,
        } = &mut *state;

        global.refill(now);

        'classes: for queue in queues.iter_mut() {
            let mut kept = VecDeque::with_capacity(queue.len());
            while let Some(waiter) = queue.pop_front() {
                if waiter.tx.is_closed() {
                    // Caller went away; its provisional event is finalized
                    // by the send service's cancel guard.
                    *waiting -= 1;
                    continue;
                }

                if !global.has_token() {
                    kept.push_back(waiter);
                    kept.extend(queue.drain(..));
                    *queue = kept;
                    break 'classes;
                }

                let chat = chats.entry(waiter.chat_key.clone()).or_insert_with(|| {
                    ChatState::new(
                        settings.chat_capacity,
                        waiter
                            .chat_refill_override
                            .unwrap_or(settings.chat_refill_per_sec),
                        now,
                    )
                });
                chat.bucket.refill(now);
                chat.last_touched = now;

                if chat.cooled_down(now) && chat.bucket.has_token() {
                    chat.bucket.take();
                    global.take();
                    *waiting -= 1;
                    let _ = waiter.tx.send(());
                } else {
                    kept.push_back(waiter);
                }
            }
            *queue = kept;
        }

        // Keep the chat map from growing without bound under churn.
        if chats.len() > CHAT_STATE_HIGH_WATER {
            let horizon = now - Duration::from_secs(300);
            chats.retain(|_, c| c.last_touched > horizon || !c.cooled_down(now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(
        global_capacity: f64,
        global_refill: f64,
        chat_capacity: f64,
        chat_refill: f64,
        max_waiters: usize,
    ) -> LimiterSettings {
        LimiterSettings {
            global_capacity,
            global_refill_per_sec: global_refill,
            chat_capacity,
            chat_refill_per_sec: chat_refill,
            max_waiters,
            tick_ms: 50,
        }
    }

    /// Spawn an admit call and count it once admitted.
    fn spawn_admit(
        limiter: &SendLimiter,
        slug: &str,
        chat: &str,
        class: PriorityClass,
        admitted: &Arc<AtomicUsize>,
    ) -> tokio::task::JoinHandle<()> {
        let limiter = limiter.clone();
        let slug = slug.to_string();
        let chat = chat.to_string();
        let admitted = Arc::clone(admitted);
        tokio::spawn(async move {
            if limiter.admit(&slug, &chat, class, None).await.is_ok() {
                admitted.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn fast_path_consumes_tokens() {
        let limiter = SendLimiter::new(settings(10.0, 30.0, 1.0, 5.0, 100));
        assert!(limiter
            .admit("acme", "1", PriorityClass::Start, None)
            .await
            .is_ok());
        // Same chat again: chat bucket empty, so this would queue; a second
        // chat passes immediately.
        assert!(limiter
            .admit("acme", "2", PriorityClass::Start, None)
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn queue_full_beyond_max_waiters() {
        let limiter = SendLimiter::new(settings(0.0, 0.0, 1.0, 5.0, 3));
        let admitted = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            spawn_admit(&limiter, "acme", &i.to_string(), PriorityClass::Shot, &admitted);
        }
        settle().await;
        assert_eq!(limiter.waiting_count(), 3);

        let err = limiter
            .admit("acme", "overflow", PriorityClass::Shot, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "QUEUE_FULL");
    }

    #[tokio::test(start_paused = true)]
    async fn strict_priority_order_across_classes() {
        // No tokens at first, so everything queues in arrival order:
        // downsell, shot, start.
        let limiter = SendLimiter::new(settings(1.0, 0.0, 5.0, 0.0, 100));
        {
            // Drain the single global token so admits queue.
            let mut st = limiter.state.lock().unwrap();
            st.global.tokens = 0.0;
        }
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        for (name, class) in [
            ("downsell", PriorityClass::Downsell),
            ("shot", PriorityClass::Shot),
            ("start", PriorityClass::Start),
        ] {
            let limiter = limiter.clone();
            let order = Arc::clone(&order);
            let chat = name.to_string();
            tokio::spawn(async move {
                limiter.admit("acme", &chat, class, None).await.unwrap();
                order.lock().unwrap().push(name);
            });
        }
        settle().await;
        assert_eq!(limiter.waiting_count(), 3);

        // Release one token per tick: classes drain in priority order even
        // though arrival order was reversed.
        for _ in 0..3 {
            {
                let mut st = limiter.state.lock().unwrap();
                st.global.tokens = 1.0;
            }
            limiter.dispatch_tick();
            settle().await;
        }
        assert_eq!(*order.lock().unwrap(), vec!["start", "shot", "downsell"]);
    }

    #[tokio::test(start_paused = true)]
    async fn per_chat_bucket_blocks_second_send() {
        let limiter = SendLimiter::new(settings(10.0, 30.0, 1.0, 0.0, 100));
        let admitted = Arc::new(AtomicUsize::new(0));

        assert!(limiter
            .admit("acme", "55", PriorityClass::Start, None)
            .await
            .is_ok());
        spawn_admit(&limiter, "acme", "55", PriorityClass::Start, &admitted);
        settle().await;
        limiter.dispatch_tick();
        settle().await;
        // Chat bucket has no refill: still waiting.
        assert_eq!(admitted.load(Ordering::SeqCst), 0);
        assert_eq!(limiter.waiting_count(), 1);

        // A different chat is not affected.
        assert!(limiter
            .admit("acme", "56", PriorityClass::Start, None)
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn global_rate_is_capped_per_second() {
        // Burst capacity 10, refill 30/s, 70 distinct chats waiting.
        let limiter = SendLimiter::new(settings(10.0, 30.0, 5.0, 100.0, 100));
        let admitted = Arc::new(AtomicUsize::new(0));
        // Drain the global bucket first so every admit queues.
        {
            let mut st = limiter.state.lock().unwrap();
            st.global.tokens = 0.0;
        }
        for i in 0..70 {
            spawn_admit(&limiter, "acme", &format!("chat-{}", i), PriorityClass::Start, &admitted);
        }
        settle().await;
        assert_eq!(limiter.waiting_count(), 70);

        // Let the bucket fully recover its burst, then tick once: at most
        // capacity (10) admitted in one instant.
        tokio::time::advance(Duration::from_secs(1)).await;
        limiter.dispatch_tick();
        settle().await;
        assert_eq!(admitted.load(Ordering::SeqCst), 10);

        // Each subsequent 100 ms tick releases at most 3 more (30/s).
        for _ in 0..10 {
            tokio::time::advance(Duration::from_millis(100)).await;
            limiter.dispatch_tick();
            settle().await;
        }
        assert_eq!(admitted.load(Ordering::SeqCst), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_holds_chat_until_retry_after() {
        let limiter = SendLimiter::new(settings(10.0, 30.0, 5.0, 5.0, 100));
        limiter.report_rate_limit("acme", "9", Some(Duration::from_secs(2)));

        let admitted = Arc::new(AtomicUsize::new(0));
        spawn_admit(&limiter, "acme", "9", PriorityClass::Start, &admitted);
        settle().await;

        limiter.dispatch_tick();
        settle().await;
        assert_eq!(admitted.load(Ordering::SeqCst), 0, "held during cooldown");

        tokio::time::advance(Duration::from_millis(2100)).await;
        limiter.dispatch_tick();
        settle().await;
        assert_eq!(admitted.load(Ordering::SeqCst), 1, "released after retry_after");
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_429_doubles_penalty_up_to_cap() {
        let limiter = SendLimiter::new(settings(10.0, 30.0, 5.0, 5.0, 100));
        limiter.report_rate_limit("acme", "9", Some(Duration::from_secs(4)));
        assert!(limiter.cooldown_remaining("acme", "9").unwrap() <= Duration::from_secs(4));

        limiter.report_rate_limit("acme", "9", None);
        let second = limiter.cooldown_remaining("acme", "9").unwrap();
        assert!(second > Duration::from_secs(7), "doubled: {:?}", second);

        limiter.report_rate_limit("acme", "9", None);
        let third = limiter.cooldown_remaining("acme", "9").unwrap();
        assert!(third <= Duration::from_secs(15), "capped: {:?}", third);

        limiter.report_success("acme", "9");
        limiter.report_rate_limit("acme", "9", None);
        // After a success the ladder restarts from the base penalty.
        let fresh = limiter.cooldown_remaining("acme", "9").unwrap();
        assert!(fresh <= Duration::from_secs(1), "reset: {:?}", fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn canceled_waiters_are_pruned_on_tick() {
        let limiter = SendLimiter::new(settings(0.0, 0.0, 1.0, 5.0, 100));
        let admitted = Arc::new(AtomicUsize::new(0));
        let handle = spawn_admit(&limiter, "acme", "1", PriorityClass::Downsell, &admitted);
        settle().await;
        assert_eq!(limiter.waiting_count(), 1);

        handle.abort();
        settle().await;
        limiter.dispatch_tick();
        assert_eq!(limiter.waiting_count(), 0);
        assert_eq!(admitted.load(Ordering::SeqCst), 0);
    }
}
