use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::utils::errors::GatewayError;

pub mod event_status {
    pub const PENDING: &str = "pending";
    pub const OK: &str = "ok";
    pub const ERR: &str = "err";
}

/// One row of the send dedupe log. The unique `dedupe_key` index is the
/// idempotency mechanism: whoever inserts first owns the send.
#[derive(Debug, Clone, FromRow)]
pub struct GatewayEventRow {
    pub id: i64,
    pub request_id: Uuid,
    pub bot_slug: String,
    pub chat_id: String,
    pub purpose: String,
    pub dedupe_key: String,
    pub message_id: Option<i64>,
    pub status: String,
    pub error_code: Option<String>,
    pub latency_ms: Option<i64>,
    pub telegram_latency_ms: Option<i64>,
    pub metadata: Value,
    pub occurred_at: DateTime<Utc>,
}

impl GatewayEventRow {
    pub fn is_finished(&self) -> bool {
        self.status != event_status::PENDING
    }
}

/// Result of trying to claim a dedupe key.
#[derive(Debug)]
pub enum BeginOutcome {
    /// This call owns the send; finalize against the returned row id.
    Started(i64),
    /// Someone inserted the key first; here is their row as it stands.
    Duplicate(GatewayEventRow),
}

const COLUMNS: &str = "id, request_id, bot_slug, chat_id, purpose, dedupe_key, message_id, \
     status, error_code, latency_ms, telegram_latency_ms, metadata, occurred_at";

/// Claim the dedupe key with a provisional pending row. On conflict the
/// existing row is returned instead; the caller decides whether it is a
/// finished send (replay the message_id) or an in-flight one.
pub async fn begin(
    pool: &PgPool,
    request_id: Uuid,
    slug: &str,
    chat_id: &str,
    purpose: &str,
    dedupe_key: &str,
) -> Result<BeginOutcome, GatewayError> {
    let inserted: Option<(i64,)> = sqlx::query_as(
        "INSERT INTO gateway_events (request_id, bot_slug, chat_id, purpose, dedupe_key)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (dedupe_key) DO NOTHING
         RETURNING id",
    )
    .bind(request_id)
    .bind(slug)
    .bind(chat_id)
    .bind(purpose)
    .bind(dedupe_key)
    .fetch_optional(pool)
    .await?;

    if let Some((id,)) = inserted {
        return Ok(BeginOutcome::Started(id));
    }

    let existing = fetch_by_key(pool, dedupe_key)
        .await?
        .ok_or_else(|| GatewayError::DatabaseNotAvailable("dedupe row vanished".to_string()))?;
    Ok(BeginOutcome::Duplicate(existing))
}

pub async fn fetch_by_key(
    pool: &PgPool,
    dedupe_key: &str,
) -> Result<Option<GatewayEventRow>, GatewayError> {
    let row = sqlx::query_as::<_, GatewayEventRow>(&format!(
        "SELECT {} FROM gateway_events WHERE dedupe_key = $1",
        COLUMNS
    ))
    .bind(dedupe_key)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn finalize_ok(
    pool: &PgPool,
    id: i64,
    message_id: i64,
    latency_ms: i64,
    telegram_latency_ms: Option<i64>,
    metadata: Value,
) -> Result<(), GatewayError> {
    sqlx::query(
        "UPDATE gateway_events
         SET status = 'ok', message_id = $2, latency_ms = $3, telegram_latency_ms = $4,
             metadata = $5
         WHERE id = $1",
    )
    .bind(id)
    .bind(message_id)
    .bind(latency_ms)
    .bind(telegram_latency_ms)
    .bind(metadata)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn finalize_err(
    pool: &PgPool,
    id: i64,
    error_code: &str,
    latency_ms: i64,
    telegram_latency_ms: Option<i64>,
) -> Result<(), GatewayError> {
    sqlx::query(
        "UPDATE gateway_events
         SET status = 'err', error_code = $2, latency_ms = $3, telegram_latency_ms = $4
         WHERE id = $1",
    )
    .bind(id)
    .bind(error_code)
    .bind(latency_ms)
    .bind(telegram_latency_ms)
    .execute(pool)
    .await?;
    Ok(())
}
