use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

use crate::db::{bots, media as media_db};
use crate::media::object_store::{ObjectStore, ObjectStoreError};
use crate::media::MediaKind;
use crate::telegram::{MediaPayload, TelegramClient, TelegramOutcome, ADMIN_TIMEOUT};
use crate::utils::crypto::TokenCipher;

const NO_WARMUP_REASON: &str = "no warmup chat configured";
const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// One cache row waiting to be warmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrewarmJob {
    pub bot_slug: String,
    pub sha256: String,
    pub kind: MediaKind,
    pub attempts: u32,
    seq: u64,
}

impl PrewarmJob {
    pub fn new(bot_slug: String, sha256: String, kind: MediaKind) -> Self {
        Self {
            bot_slug,
            sha256,
            kind,
            attempts: 0,
            seq: 0,
        }
    }
}

// Max-heap: "greater" means more urgent. Audio outranks video outranks
// photo; within a kind, lower sequence number (earlier enqueue) wins.
impl Ord for PrewarmJob {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .kind
            .send_rank()
            .cmp(&self.kind.send_rank())
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PrewarmJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueInner {
    jobs: Mutex<BinaryHeap<PrewarmJob>>,
    notify: Notify,
    seq: AtomicU64,
}

/// In-memory priority queue feeding the prewarm worker. Cloneable handle;
/// one instance per process, passed explicitly so tests can isolate it.
#[derive(Clone, Default)]
pub struct PrewarmQueue {
    inner: Arc<QueueInner>,
}

impl PrewarmQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, mut job: PrewarmJob) {
        job.seq = self.inner.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(job);
        self.inner.notify.notify_one();
    }

    /// Wait for the most urgent job.
    pub async fn pop(&self) -> PrewarmJob {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(job) = self
                .inner
                .jobs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop()
            {
                return job;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-seed from cache rows still warming (startup, or after a tenant
    /// gains a warmup chat).
    pub async fn seed_from_db(&self, pool: &PgPool) -> anyhow::Result<usize> {
        let rows = media_db::list_warming(pool).await?;
        let mut seeded = 0;
        for row in rows {
            let Some(kind) = row.media_kind() else {
                warn!(sha256 = %row.sha256, kind = %row.kind, "skipping cache row with unknown kind");
                continue;
            };
            let mut job = PrewarmJob::new(row.bot_slug, row.sha256, kind);
            job.attempts = row.attempts.max(0) as u32;
            self.enqueue(job);
            seeded += 1;
        }
        Ok(seeded)
    }
}

/// Exponential backoff for transient warmup failures, capped at 60 s.
fn backoff_delay(attempts: u32) -> Duration {
    let exp = BACKOFF_BASE.as_secs().saturating_mul(1u64 << attempts.min(6));
    Duration::from_secs(exp).min(BACKOFF_CAP)
}

/// Long-running worker draining the prewarm queue with bounded concurrency.
/// Uploads each blob to the tenant's warmup chat and captures the resulting
/// `file_id`, flipping the cache row `warming → ready`.
pub struct PrewarmWorker {
    pool: PgPool,
    objects: Arc<dyn ObjectStore>,
    client: Arc<TelegramClient>,
    cipher: Arc<TokenCipher>,
    queue: PrewarmQueue,
    permits: Arc<Semaphore>,
    max_attempts: u32,
}

impl PrewarmWorker {
    pub fn new(
        pool: PgPool,
        objects: Arc<dyn ObjectStore>,
        client: Arc<TelegramClient>,
        cipher: Arc<TokenCipher>,
        queue: PrewarmQueue,
        concurrency: usize,
        max_attempts: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            objects,
            client,
            cipher,
            queue,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            max_attempts,
        })
    }

    /// Drain jobs forever. Spawn this once per process.
    pub async fn run(self: Arc<Self>) {
        info!(
            permits = self.permits.available_permits(),
            "prewarm worker started"
        );
        loop {
            let job = self.queue.pop().await;
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                worker.process(job).await;
                drop(permit);
            });
        }
    }

    async fn process(&self, job: PrewarmJob) {
        let slug = job.bot_slug.as_str();
        debug!(slug, sha256 = %job.sha256, kind = job.kind.as_str(), attempts = job.attempts, "warming media");

        let bot = match bots::fetch_live(&self.pool, slug).await {
            Ok(bot) => bot,
            Err(e) if e.is_transient() => {
                self.retry_transient(job, e.code()).await;
                return;
            }
            Err(e) => {
                self.mark_error(&job, &format!("tenant unavailable: {}", e.code()))
                    .await;
                return;
            }
        };

        // A tenant without a warmup chat cannot warm media. The row stays
        // `warming` with the reason surfaced; setting the chat re-enqueues.
        let Some(warmup_chat) = bot.warmup_chat_id.as_deref() else {
            if let Err(e) =
                media_db::record_warm_attempt(&self.pool, slug, &job.sha256, job.kind, Some(NO_WARMUP_REASON))
                    .await
            {
                warn!(slug, error = %e, "failed to record no-warmup-chat reason");
            }
            return;
        };

        let Some(cipher_text) = bot.token_cipher.as_deref() else {
            if let Err(e) = media_db::record_warm_attempt(
                &self.pool,
                slug,
                &job.sha256,
                job.kind,
                Some("bot token not set"),
            )
            .await
            {
                warn!(slug, error = %e, "failed to record missing-token reason");
            }
            return;
        };
        let token = match self.cipher.decrypt(cipher_text) {
            Ok(t) => t,
            Err(_) => {
                self.mark_error(&job, "token decryption failed").await;
                return;
            }
        };

        let store_row = match media_db::fetch_store(&self.pool, slug, &job.sha256, job.kind).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                self.mark_error(&job, "media store row missing").await;
                return;
            }
            Err(e) => {
                self.retry_transient(job, &e.to_string()).await;
                return;
            }
        };

        let blob = match self.objects.get(&store_row.r2_key).await {
            Ok(data) => data,
            Err(ObjectStoreError::NotFound(_)) => {
                self.mark_error(&job, "blob missing from object store").await;
                return;
            }
            Err(e) => {
                self.retry_transient(job, &e.to_string()).await;
                return;
            }
        };

        let name = store_row
            .r2_key
            .rsplit('/')
            .next()
            .unwrap_or("blob")
            .to_string();
        let outcome = self
            .client
            .send_media(
                &token,
                warmup_chat,
                job.kind,
                MediaPayload::Bytes {
                    name,
                    mime: store_row.mime.clone(),
                    data: blob,
                },
                None,
                None,
                ADMIN_TIMEOUT,
            )
            .await;

        match outcome {
            TelegramOutcome::Ok {
                file_id: Some(file_id),
                ..
            } => {
                if let Err(e) =
                    media_db::mark_ready(&self.pool, slug, &job.sha256, job.kind, &file_id).await
                {
                    warn!(slug, error = %e, "failed to persist ready transition");
                    return;
                }
                info!(slug, sha256 = %job.sha256, kind = job.kind.as_str(), "media warmed");
            }
            TelegramOutcome::Ok { file_id: None, .. } => {
                self.mark_error(&job, "upload succeeded but response had no file_id")
                    .await;
            }
            TelegramOutcome::Permanent { error } => {
                self.mark_error(&job, error.description().unwrap_or(error.code()))
                    .await;
            }
            TelegramOutcome::Transient { description, .. } => {
                self.retry_transient(job, &description).await;
            }
        }
    }

    async fn mark_error(&self, job: &PrewarmJob, reason: &str) {
        warn!(slug = %job.bot_slug, sha256 = %job.sha256, reason, "media warmup failed permanently");
        if let Err(e) =
            media_db::mark_error(&self.pool, &job.bot_slug, &job.sha256, job.kind, reason).await
        {
            warn!(error = %e, "failed to persist error transition");
        }
    }

    async fn retry_transient(&self, mut job: PrewarmJob, reason: &str) {
        if let Err(e) = media_db::record_warm_attempt(
            &self.pool,
            &job.bot_slug,
            &job.sha256,
            job.kind,
            Some(reason),
        )
        .await
        {
            warn!(error = %e, "failed to record warm attempt");
        }

        job.attempts += 1;
        if job.attempts >= self.max_attempts {
            self.mark_error(&job, &format!("gave up after {} attempts: {}", job.attempts, reason))
                .await;
            return;
        }

        let delay = backoff_delay(job.attempts);
        debug!(slug = %job.bot_slug, sha256 = %job.sha256, attempts = job.attempts, ?delay, "requeueing warmup");
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(job);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_pops_audio_before_video_before_photo() {
        let queue = PrewarmQueue::new();
        queue.enqueue(PrewarmJob::new("a".into(), "p1".into(), MediaKind::Photo));
        queue.enqueue(PrewarmJob::new("a".into(), "v1".into(), MediaKind::Video));
        queue.enqueue(PrewarmJob::new("a".into(), "a1".into(), MediaKind::Audio));

        let order: Vec<String> = (0..3)
            .map(|_| {
                queue
                    .inner
                    .jobs
                    .lock()
                    .unwrap()
                    .pop()
                    .map(|j| j.sha256)
                    .unwrap()
            })
            .collect();
        assert_eq!(order, ["a1", "v1", "p1"]);
    }

    #[test]
    fn queue_is_fifo_within_a_kind() {
        let queue = PrewarmQueue::new();
        for i in 0..5 {
            queue.enqueue(PrewarmJob::new(
                "a".into(),
                format!("photo-{}", i),
                MediaKind::Photo,
            ));
        }
        let order: Vec<String> = (0..5)
            .map(|_| queue.inner.jobs.lock().unwrap().pop().map(|j| j.sha256).unwrap())
            .collect();
        assert_eq!(order, ["photo-0", "photo-1", "photo-2", "photo-3", "photo-4"]);
    }

    #[tokio::test]
    async fn pop_waits_for_enqueue() {
        let queue = PrewarmQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(PrewarmJob::new("a".into(), "x".into(), MediaKind::Audio));
        let job = waiter.await.unwrap();
        assert_eq!(job.sha256, "x");
    }

    #[test]
    fn backoff_doubles_and_caps_at_sixty_seconds() {
        assert_eq!(backoff_delay(0), Duration::from_secs(2));
        assert_eq!(backoff_delay(1), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(16));
        assert_eq!(backoff_delay(5), Duration::from_secs(60));
        assert_eq!(backoff_delay(20), Duration::from_secs(60));
    }
}
