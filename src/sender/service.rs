use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::db::{bots, gateway_events};
use crate::db::gateway_events::BeginOutcome;
use crate::media::{sort_refs_for_dispatch, CachedLookup, MediaKind, MediaRef, MediaService};
use crate::sender::limiter::SendLimiter;
use crate::sender::types::{Purpose, SendBody, SendErr, SendOk, SendRequest};
use crate::telegram::{
    escape_markdown_v2, MediaPayload, TelegramClient, TelegramOutcome, ADMIN_TIMEOUT,
    HOT_PATH_TIMEOUT,
};
use crate::utils::crypto::TokenCipher;
use crate::utils::errors::GatewayError;
use crate::utils::monitoring::SendMetrics;

/// Transient retry ladder: 1.5 s → 3 s → 6 s, capped at 15 s once a
/// `retry_after` stretches it.
const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(1500),
    Duration::from_millis(3000),
    Duration::from_millis(6000),
];
const RETRY_CAP: Duration = Duration::from_secs(15);

/// How long an in-flight duplicate is given to finish before we give up.
const DUPLICATE_WAIT: Duration = Duration::from_millis(200);

/// One-shot grace for a cold media ref on conversational sends.
const MEDIA_WAIT_GRACE: Duration = Duration::from_millis(300);

const PARSE_MODE_MARKDOWN_V2: &str = "MarkdownV2";

/// The sole exit for outbound messages. Every send is idempotent via the
/// gateway event dedupe key, rate-admitted through the shared limiter, and
/// finalized into exactly one event row.
pub struct SendService {
    pool: PgPool,
    client: Arc<TelegramClient>,
    cipher: Arc<TokenCipher>,
    limiter: SendLimiter,
    media: Arc<MediaService>,
    metrics: Arc<SendMetrics>,
}

/// Finalizes the provisional event row with CANCELED if the send future is
/// dropped mid-flight (e.g. a canceled limiter waiter).
struct PendingGuard {
    pool: PgPool,
    event_id: i64,
    started: Instant,
    armed: bool,
}

impl PendingGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let pool = self.pool.clone();
        let event_id = self.event_id;
        let latency_ms = self.started.elapsed().as_millis() as i64;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = gateway_events::finalize_err(&pool, event_id, "CANCELED", latency_ms, None)
                    .await;
            });
        }
    }
}

/// A media ref resolved into something the Telegram client can send.
struct PreparedMedia {
    kind: MediaKind,
    payload: MediaPayload,
}

impl SendService {
    pub fn new(
        pool: PgPool,
        client: Arc<TelegramClient>,
        cipher: Arc<TokenCipher>,
        limiter: SendLimiter,
        media: Arc<MediaService>,
        metrics: Arc<SendMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            client,
            cipher,
            limiter,
            media,
            metrics,
        })
    }

    pub fn limiter(&self) -> &SendLimiter {
        &self.limiter
    }

    /// Deliver one message (text and/or media) for a tenant to a chat.
    pub async fn send(&self, request: SendRequest) -> Result<SendOk, SendErr> {
        let started = Instant::now();
        let slug = request.slug.clone();
        let purpose = request.purpose;

        if let Err(error) = request.validate() {
            return Err(SendErr {
                error,
                latency_ms: started.elapsed().as_millis() as u64,
            });
        }

        // Dedupe: claim the key or defer to whoever already holds it.
        let event_id = match gateway_events::begin(
            &self.pool,
            request.request_id,
            &request.slug,
            &request.chat_id,
            purpose.as_str(),
            &request.dedupe_key,
        )
        .await
        {
            Ok(BeginOutcome::Started(id)) => id,
            Ok(BeginOutcome::Duplicate(row)) => {
                return self.resolve_duplicate(row, started).await;
            }
            Err(error) => {
                return Err(SendErr {
                    error,
                    latency_ms: started.elapsed().as_millis() as u64,
                });
            }
        };

        let mut guard = PendingGuard {
            pool: self.pool.clone(),
            event_id,
            started,
            armed: true,
        };

        let result = self.execute(&request).await;
        guard.disarm();

        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok((message_id, telegram_ms, extra)) => {
                let mut metadata = request.metadata.clone();
                if let (Some(obj), Some(extra)) = (metadata.as_object_mut(), extra) {
                    obj.insert("extra_media".to_string(), extra);
                }
                if let Err(e) = gateway_events::finalize_ok(
                    &self.pool,
                    event_id,
                    message_id,
                    latency_ms as i64,
                    telegram_ms.map(|ms| ms as i64),
                    metadata,
                )
                .await
                {
                    warn!(slug = %slug, error = %e, "failed to finalize gateway event");
                }
                self.metrics
                    .record_send(&slug, purpose.as_str(), None, latency_ms, telegram_ms);
                self.limiter.report_success(&slug, &request.chat_id);
                info!(
                    slug = %slug,
                    purpose = purpose.as_str(),
                    message_id,
                    latency_ms,
                    "send ok"
                );
                Ok(SendOk {
                    message_id,
                    latency_ms,
                    telegram_latency_ms: telegram_ms,
                    dedupe_applied: false,
                })
            }
            Err((error, telegram_ms)) => {
                if let Err(e) = gateway_events::finalize_err(
                    &self.pool,
                    event_id,
                    error.code(),
                    latency_ms as i64,
                    telegram_ms.map(|ms| ms as i64),
                )
                .await
                {
                    warn!(slug = %slug, error = %e, "failed to finalize gateway event");
                }
                self.metrics.record_send(
                    &slug,
                    purpose.as_str(),
                    Some(error.code()),
                    latency_ms,
                    telegram_ms,
                );
                warn!(
                    slug = %slug,
                    purpose = purpose.as_str(),
                    code = error.code(),
                    latency_ms,
                    "send failed"
                );
                Err(SendErr { error, latency_ms })
            }
        }
    }

    /// Someone else owns this dedupe key. Finished with a message_id means
    /// we replay their answer; in-flight gets a short grace then bounces.
    async fn resolve_duplicate(
        &self,
        row: gateway_events::GatewayEventRow,
        started: Instant,
    ) -> Result<SendOk, SendErr> {
        if let Some(message_id) = row.message_id {
            debug!(dedupe_key = %row.dedupe_key, "dedupe hit, replaying message_id");
            return Ok(SendOk {
                message_id,
                latency_ms: started.elapsed().as_millis() as u64,
                telegram_latency_ms: None,
                dedupe_applied: true,
            });
        }

        tokio::time::sleep(DUPLICATE_WAIT).await;
        if let Ok(Some(fresh)) = gateway_events::fetch_by_key(&self.pool, &row.dedupe_key).await {
            if let Some(message_id) = fresh.message_id {
                return Ok(SendOk {
                    message_id,
                    latency_ms: started.elapsed().as_millis() as u64,
                    telegram_latency_ms: None,
                    dedupe_applied: true,
                });
            }
        }
        Err(SendErr {
            error: GatewayError::DuplicateInflight(row.dedupe_key),
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Steps 2–7: token, escape, media resolution, admission, send, retry.
    /// Returns `(first_message_id, telegram_latency_ms, extra_media_meta)`.
    async fn execute(
        &self,
        request: &SendRequest,
    ) -> Result<(i64, Option<u64>, Option<serde_json::Value>), (GatewayError, Option<u64>)> {
        let bot = bots::fetch_live(&self.pool, &request.slug)
            .await
            .map_err(|e| (e, None))?;
        let cipher_text = bot
            .token_cipher
            .as_deref()
            .ok_or_else(|| (GatewayError::BotTokenNotSet(request.slug.clone()), None))?;
        let token = self.cipher.decrypt(cipher_text).map_err(|e| (e, None))?;

        let timeout = match request.purpose {
            Purpose::SendTest => ADMIN_TIMEOUT,
            _ => HOT_PATH_TIMEOUT,
        };

        // Prepare the outbound payloads before touching the limiter so the
        // admission token is spent on an immediately sendable request.
        let prepared = self.prepare(request).await.map_err(|e| (e, None))?;

        self.limiter
            .admit(
                &request.slug,
                &request.chat_id,
                request.purpose.priority_class(),
                bot.per_chat_rate_override,
            )
            .await
            .map_err(|e| (e, None))?;

        match prepared {
            Prepared::Text {
                text,
                parse_mode,
                disable_preview,
            } => {
                let (message_id, tg_ms) = self
                    .send_with_retry(request, || {
                        self.client.send_text(
                            &token,
                            &request.chat_id,
                            &text,
                            parse_mode,
                            disable_preview,
                            timeout,
                        )
                    })
                    .await?;
                Ok((message_id, Some(tg_ms), None))
            }
            Prepared::Media {
                items,
                caption,
                parse_mode,
            } => {
                let mut items = items.into_iter();
                let Some(first) = items.next() else {
                    return Err((
                        GatewayError::BadRequest {
                            description: Some("media body needs at least one ref".to_string()),
                        },
                        None,
                    ));
                };

                let (message_id, tg_ms) = self
                    .send_with_retry(request, || {
                        self.client.send_media(
                            &token,
                            &request.chat_id,
                            first.kind,
                            first.payload.clone(),
                            caption.as_deref(),
                            parse_mode,
                            timeout,
                        )
                    })
                    .await?;

                // Remaining refs ride behind the first message; their
                // failures are recorded but do not unwind the operation.
                let mut extra = Vec::new();
                for item in items {
                    let outcome = self
                        .client
                        .send_media(
                            &token,
                            &request.chat_id,
                            item.kind,
                            item.payload,
                            None,
                            parse_mode,
                            timeout,
                        )
                        .await;
                    self.metrics
                        .record_attempt(&request.slug, request.purpose.as_str());
                    match outcome {
                        TelegramOutcome::Ok {
                            message_id: extra_id,
                            ..
                        } => extra.push(json!({
                            "kind": item.kind.as_str(),
                            "ok": true,
                            "message_id": extra_id,
                        })),
                        TelegramOutcome::Permanent { error } => {
                            warn!(
                                slug = %request.slug,
                                kind = item.kind.as_str(),
                                code = error.code(),
                                "follow-up media message failed"
                            );
                            extra.push(json!({
                                "kind": item.kind.as_str(),
                                "ok": false,
                                "code": error.code(),
                            }));
                        }
                        TelegramOutcome::Transient { description, .. } => {
                            warn!(
                                slug = %request.slug,
                                kind = item.kind.as_str(),
                                "follow-up media message failed transiently"
                            );
                            extra.push(json!({
                                "kind": item.kind.as_str(),
                                "ok": false,
                                "code": "TELEGRAM_ERROR",
                                "description": description,
                            }));
                        }
                    }
                }

                let extra_meta = (!extra.is_empty()).then(|| json!(extra));
                Ok((message_id, Some(tg_ms), extra_meta))
            }
        }
    }

    /// Escape text and resolve media refs into sendable payloads.
    async fn prepare(&self, request: &SendRequest) -> Result<Prepared, GatewayError> {
        match &request.body {
            SendBody::Text {
                text,
                disable_preview,
                raw,
            } => {
                let rendered = if *raw {
                    text.clone()
                } else {
                    escape_markdown_v2(text)
                };
                Ok(Prepared::Text {
                    text: rendered,
                    parse_mode: Some(PARSE_MODE_MARKDOWN_V2),
                    disable_preview: *disable_preview,
                })
            }
            SendBody::Media { refs, caption, raw } => {
                let mut refs = refs.clone();
                sort_refs_for_dispatch(&mut refs);

                let mut items = Vec::with_capacity(refs.len());
                for media_ref in &refs {
                    items.push(self.resolve_ref(request, media_ref).await?);
                }

                let caption = caption.as_ref().map(|c| {
                    if *raw {
                        c.clone()
                    } else {
                        escape_markdown_v2(c)
                    }
                });
                Ok(Prepared::Media {
                    items,
                    caption,
                    parse_mode: Some(PARSE_MODE_MARKDOWN_V2),
                })
            }
        }
    }

    /// Resolve one ref: cached file_id when warm; otherwise, on
    /// conversational sends, wait one 300 ms grace and re-look; finally fall
    /// back to uploading the blob in-band.
    async fn resolve_ref(
        &self,
        request: &SendRequest,
        media_ref: &MediaRef,
    ) -> Result<PreparedMedia, GatewayError> {
        let lookup = self
            .media
            .cached_file_id(&request.slug, &media_ref.sha256, media_ref.kind)
            .await?;

        if let CachedLookup::Ready(file_id) = lookup {
            self.metrics.record_cache_hit(&request.slug);
            return Ok(PreparedMedia {
                kind: media_ref.kind,
                payload: MediaPayload::FileId(file_id),
            });
        }

        if request.purpose.has_media_wait_budget() {
            tokio::time::sleep(MEDIA_WAIT_GRACE).await;
            if let CachedLookup::Ready(file_id) = self
                .media
                .cached_file_id(&request.slug, &media_ref.sha256, media_ref.kind)
                .await?
            {
                self.metrics.record_cache_hit(&request.slug);
                return Ok(PreparedMedia {
                    kind: media_ref.kind,
                    payload: MediaPayload::FileId(file_id),
                });
            }
        }

        let (data, store_row) = self
            .media
            .load_blob(&request.slug, &media_ref.sha256, media_ref.kind)
            .await?;
        self.metrics.record_cache_miss(&request.slug);
        debug!(
            slug = %request.slug,
            sha256 = %media_ref.sha256,
            "cold media ref, uploading in-band"
        );
        let name = store_row
            .r2_key
            .rsplit('/')
            .next()
            .unwrap_or("blob")
            .to_string();
        Ok(PreparedMedia {
            kind: media_ref.kind,
            payload: MediaPayload::Bytes {
                name,
                mime: store_row.mime,
                data,
            },
        })
    }

    /// Retry transient outcomes up to 3 times with the backoff ladder,
    /// honoring `retry_after` and feeding 429s back into the limiter.
    async fn send_with_retry<F, Fut>(
        &self,
        request: &SendRequest,
        mut attempt: F,
    ) -> Result<(i64, u64), (GatewayError, Option<u64>)>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = TelegramOutcome>,
    {
        let mut last_error: Option<GatewayError> = None;
        let mut last_tg_ms: Option<u64> = None;

        for attempt_no in 0..=RETRY_BACKOFF.len() {
            self.metrics
                .record_attempt(&request.slug, request.purpose.as_str());
            let call_started = Instant::now();
            let outcome = attempt().await;
            let tg_ms = call_started.elapsed().as_millis() as u64;
            last_tg_ms = Some(tg_ms);

            match outcome {
                TelegramOutcome::Ok { message_id, .. } => return Ok((message_id, tg_ms)),
                TelegramOutcome::Permanent { error } => return Err((error, Some(tg_ms))),
                TelegramOutcome::Transient {
                    retry_after_ms,
                    description,
                } => {
                    let error = match retry_after_ms {
                        Some(_) => {
                            self.metrics
                                .record_rate_limited(&request.slug, request.purpose.as_str());
                            self.limiter.report_rate_limit(
                                &request.slug,
                                &request.chat_id,
                                retry_after_ms.map(Duration::from_millis),
                            );
                            GatewayError::RateLimitExceeded { retry_after_ms }
                        }
                        None => GatewayError::Telegram(description),
                    };

                    if attempt_no == RETRY_BACKOFF.len() {
                        return Err((error, last_tg_ms));
                    }

                    let mut delay = RETRY_BACKOFF[attempt_no];
                    if let Some(retry_after) = error.retry_after() {
                        delay = delay.max(retry_after);
                    }
                    delay = delay.min(RETRY_CAP);
                    debug!(
                        slug = %request.slug,
                        attempt = attempt_no + 1,
                        ?delay,
                        "transient send failure, backing off"
                    );
                    last_error = Some(error);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        // The loop always returns from its last iteration.
        Err((
            last_error.unwrap_or_else(|| GatewayError::Telegram("retry loop exhausted".into())),
            last_tg_ms,
        ))
    }
}

enum Prepared {
    Text {
        text: String,
        parse_mode: Option<&'static str>,
        disable_preview: bool,
    },
    Media {
        items: Vec<PreparedMedia>,
        caption: Option<String>,
        parse_mode: Option<&'static str>,
    },
}
