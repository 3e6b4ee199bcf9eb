use std::time::Instant;

use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use futures::future;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::{downsells, funnel};
use crate::scheduler::downsell as downsell_scheduler;
use crate::sender::{dedupe, Purpose, SendBody, SendRequest};
use crate::server::AppState;

/// `POST /tg/{slug}/webhook` — the hot path. The handler does tenant lookup
/// (cached), a JSON parse and `/start` detection, then ACKs; everything else
/// runs in a spawned continuation that the response never waits on.
pub async fn handle(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Bytes,
) -> HttpResponse {
    let t0 = Instant::now();
    let arrived_at = Utc::now();
    let slug = path.into_inner();

    match state.lookup_bot(&slug).await {
        Ok(Some(bot)) if bot.deleted_at.is_some() => {
            return HttpResponse::Gone().finish();
        }
        Ok(Some(_)) => {}
        Ok(None) => {
            return HttpResponse::NotFound().finish();
        }
        Err(e) => {
            // Degraded database: Telegram still gets its ACK so it does not
            // hammer the endpoint with retries.
            warn!(slug = %slug, error = %e, "webhook tenant lookup degraded, acking anyway");
            return HttpResponse::Ok().finish();
        }
    }

    // Malformed JSON is ACKed with an empty 200: Telegram requires the ACK
    // and we suppress its retries.
    if let Ok(update) = serde_json::from_slice::<Value>(&body) {
        if let Some(chat_id) = start_chat_id(&update) {
            let state = state.clone();
            let slug_task = slug.clone();
            tokio::spawn(async move {
                start_continuation(state, slug_task, chat_id, arrived_at, t0).await;
            });
        }
    }

    state
        .metrics
        .record_webhook_ack(t0.elapsed().as_secs_f64() * 1000.0);
    HttpResponse::Ok().finish()
}

/// Extract the chat id when the update is a `/start` command.
fn start_chat_id(update: &Value) -> Option<String> {
    let message = update.get("message")?;
    let text = message.get("text")?.as_str()?;
    if text != "/start" && !text.starts_with("/start ") {
        return None;
    }
    let chat_id = message.get("chat")?.get("id")?;
    match chat_id {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

/// The async `/start` continuation: welcome send, downsell fan-out, funnel
/// record. Failures here are logged and metered; the ACK already went out.
async fn start_continuation(
    state: web::Data<AppState>,
    slug: String,
    chat_id: String,
    arrived_at: DateTime<Utc>,
    t0: Instant,
) {
    let session = dedupe::start_session_id(&chat_id, arrived_at);
    let request_uuid = Uuid::new_v4();

    match state.lookup_start_message(&slug).await {
        Ok(Some(start)) if start.active => {
            let body = if !start.media_refs.is_empty() {
                SendBody::Media {
                    refs: start.media_refs.clone(),
                    caption: (!start.text.is_empty()).then(|| start.text.clone()),
                    raw: start.raw_mode,
                }
            } else {
                SendBody::Text {
                    text: start.text.clone(),
                    disable_preview: start.disable_web_page_preview,
                    raw: start.raw_mode,
                }
            };

            let mut request = SendRequest::new(
                slug.clone(),
                chat_id.clone(),
                Purpose::Start,
                dedupe::start(&slug, &chat_id, &session),
                body,
            );
            request.request_id = request_uuid;
            request.metadata = serde_json::json!({
                "start_session_id": session,
                "request_uuid": request_uuid,
            });

            match state.sender.send(request).await {
                Ok(ok) => {
                    let first_send_ms = t0.elapsed().as_secs_f64() * 1000.0;
                    state.metrics.record_start_first_send(first_send_ms);
                    debug!(
                        slug = %slug,
                        chat_id = %chat_id,
                        message_id = ok.message_id,
                        dedupe_applied = ok.dedupe_applied,
                        first_send_ms,
                        "start welcome delivered"
                    );
                }
                Err(err) => {
                    warn!(
                        slug = %slug,
                        chat_id = %chat_id,
                        code = err.error.code(),
                        "start welcome failed"
                    );
                }
            }
        }
        Ok(_) => debug!(slug = %slug, "no active start message configured"),
        Err(e) => warn!(slug = %slug, error = %e, "start message lookup failed"),
    }

    // Downsells triggered by /start, anchored at webhook arrival. The
    // inserts are independent, so they go out concurrently.
    match downsells::active_after_start(&state.pool, &slug).await {
        Ok(list) => {
            let results = future::join_all(list.iter().map(|downsell| {
                downsell_scheduler::schedule(&state.pool, downsell, &chat_id, arrived_at)
            }))
            .await;
            for (downsell, result) in list.iter().zip(results) {
                if let Err(e) = result {
                    warn!(
                        slug = %slug,
                        downsell_id = downsell.id,
                        error = %e,
                        "downsell scheduling failed"
                    );
                }
            }
        }
        Err(e) => warn!(slug = %slug, error = %e, "downsell fan-out failed"),
    }

    if let Err(e) = funnel::record(
        &state.pool,
        &slug,
        &chat_id,
        "start",
        serde_json::json!({ "start_session_id": session }),
    )
    .await
    {
        warn!(slug = %slug, error = %e, "funnel record failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_bare_start_command() {
        let update = json!({"message": {"text": "/start", "chat": {"id": 999}}});
        assert_eq!(start_chat_id(&update).as_deref(), Some("999"));
    }

    #[test]
    fn detects_start_with_payload() {
        let update = json!({"message": {"text": "/start ref_abc", "chat": {"id": -100123}}});
        assert_eq!(start_chat_id(&update).as_deref(), Some("-100123"));
    }

    #[test]
    fn ignores_other_messages() {
        for text in ["hello", "/started", "/stop", ""] {
            let update = json!({"message": {"text": text, "chat": {"id": 1}}});
            assert!(start_chat_id(&update).is_none(), "text {:?}", text);
        }
    }

    #[test]
    fn ignores_updates_without_message_or_chat() {
        assert!(start_chat_id(&json!({})).is_none());
        assert!(start_chat_id(&json!({"message": {"text": "/start"}})).is_none());
        assert!(start_chat_id(&json!({"edited_message": {"text": "/start"}})).is_none());
    }
}
