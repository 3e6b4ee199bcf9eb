use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres, Transaction};

use crate::media::MediaRef;
use crate::utils::errors::GatewayError;

/// Delayed follow-up config for one tenant.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DownsellRow {
    pub id: i64,
    pub bot_slug: String,
    pub name: String,
    pub text: String,
    #[sqlx(json)]
    pub media_refs: Vec<MediaRef>,
    pub delay_seconds: i64,
    pub after_start: bool,
    pub after_pix: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// One scheduled firing of a downsell at a chat.
#[derive(Debug, Clone, FromRow)]
pub struct DownsellQueueRow {
    pub id: i64,
    pub downsell_id: i64,
    pub bot_slug: String,
    pub chat_id: String,
    pub schedule_at: DateTime<Utc>,
    pub status: String,
    pub attempts: i32,
}

const COLUMNS: &str =
    "id, bot_slug, name, text, media_refs, delay_seconds, after_start, after_pix, active, created_at";
const QUEUE_COLUMNS: &str = "id, downsell_id, bot_slug, chat_id, schedule_at, status, attempts";

/// An active downsell must have at least one trigger selected.
pub fn validate(active: bool, after_start: bool, after_pix: bool) -> Result<(), GatewayError> {
    if active && !after_start && !after_pix {
        return Err(GatewayError::BadRequest {
            description: Some("active downsell needs at least one trigger".to_string()),
        });
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn create(
    pool: &PgPool,
    slug: &str,
    name: &str,
    text: &str,
    media_refs: &[MediaRef],
    delay_seconds: i64,
    after_start: bool,
    after_pix: bool,
    active: bool,
) -> Result<DownsellRow, GatewayError> {
    let refs_json = serde_json::to_value(media_refs)
        .map_err(|e| GatewayError::DatabaseNotAvailable(e.to_string()))?;
    let row = sqlx::query_as::<_, DownsellRow>(&format!(
        "INSERT INTO bot_downsells
            (bot_slug, name, text, media_refs, delay_seconds, after_start, after_pix, active)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         RETURNING {}",
        COLUMNS
    ))
    .bind(slug)
    .bind(name)
    .bind(text)
    .bind(refs_json)
    .bind(delay_seconds)
    .bind(after_start)
    .bind(after_pix)
    .bind(active)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

#[allow(clippy::too_many_arguments)]
pub async fn update(
    pool: &PgPool,
    slug: &str,
    id: i64,
    name: &str,
    text: &str,
    media_refs: &[MediaRef],
    delay_seconds: i64,
    after_start: bool,
    after_pix: bool,
    active: bool,
) -> Result<Option<DownsellRow>, GatewayError> {
    let refs_json = serde_json::to_value(media_refs)
        .map_err(|e| GatewayError::DatabaseNotAvailable(e.to_string()))?;
    let row = sqlx::query_as::<_, DownsellRow>(&format!(
        "UPDATE bot_downsells SET
            name = $3, text = $4, media_refs = $5, delay_seconds = $6,
            after_start = $7, after_pix = $8, active = $9
         WHERE id = $2 AND bot_slug = $1
         RETURNING {}",
        COLUMNS
    ))
    .bind(slug)
    .bind(id)
    .bind(name)
    .bind(text)
    .bind(refs_json)
    .bind(delay_seconds)
    .bind(after_start)
    .bind(after_pix)
    .bind(active)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn list(pool: &PgPool, slug: &str) -> Result<Vec<DownsellRow>, GatewayError> {
    let rows = sqlx::query_as::<_, DownsellRow>(&format!(
        "SELECT {} FROM bot_downsells WHERE bot_slug = $1 ORDER BY id",
        COLUMNS
    ))
    .bind(slug)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn fetch(pool: &PgPool, id: i64) -> Result<Option<DownsellRow>, GatewayError> {
    let row = sqlx::query_as::<_, DownsellRow>(&format!(
        "SELECT {} FROM bot_downsells WHERE id = $1",
        COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn delete(pool: &PgPool, slug: &str, id: i64) -> Result<bool, GatewayError> {
    let result = sqlx::query("DELETE FROM bot_downsells WHERE id = $2 AND bot_slug = $1")
        .bind(slug)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Downsells the `/start` continuation fans out to.
pub async fn active_after_start(
    pool: &PgPool,
    slug: &str,
) -> Result<Vec<DownsellRow>, GatewayError> {
    let rows = sqlx::query_as::<_, DownsellRow>(&format!(
        "SELECT {} FROM bot_downsells
         WHERE bot_slug = $1 AND active AND after_start
         ORDER BY id",
        COLUMNS
    ))
    .bind(slug)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Insert a pending queue entry. The unique minute-truncated index makes
/// repeat schedules of the same `(downsell, chat, minute)` a no-op; returns
/// whether a new entry was created.
pub async fn schedule(
    pool: &PgPool,
    downsell_id: i64,
    slug: &str,
    chat_id: &str,
    schedule_at: DateTime<Utc>,
) -> Result<bool, GatewayError> {
    let result = sqlx::query(
        "INSERT INTO downsells_queue (downsell_id, bot_slug, chat_id, schedule_at)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (downsell_id, chat_id, date_trunc('minute', schedule_at)) DO NOTHING",
    )
    .bind(downsell_id)
    .bind(slug)
    .bind(chat_id)
    .bind(schedule_at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Claim a batch of due entries under row locks. Other workers skip locked
/// rows, so replicas can drain the same queue concurrently.
pub async fn claim_due(
    tx: &mut Transaction<'_, Postgres>,
    batch: i64,
) -> Result<Vec<DownsellQueueRow>, GatewayError> {
    let rows = sqlx::query_as::<_, DownsellQueueRow>(&format!(
        "SELECT {} FROM downsells_queue
         WHERE status = 'pending' AND schedule_at <= now()
         ORDER BY schedule_at
         LIMIT $1
         FOR UPDATE SKIP LOCKED",
        QUEUE_COLUMNS
    ))
    .bind(batch)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows)
}

pub async fn mark(
    tx: &mut Transaction<'_, Postgres>,
    id: i64,
    status: &str,
) -> Result<(), GatewayError> {
    sqlx::query("UPDATE downsells_queue SET status = $2 WHERE id = $1")
        .bind(id)
        .bind(status)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Keep a transiently failed entry pending with a bumped attempt count and a
/// pushed-out schedule.
pub async fn reschedule_attempt(
    tx: &mut Transaction<'_, Postgres>,
    id: i64,
    next_at: DateTime<Utc>,
) -> Result<(), GatewayError> {
    sqlx::query(
        "UPDATE downsells_queue SET attempts = attempts + 1, schedule_at = $2 WHERE id = $1",
    )
    .bind(id)
    .bind(next_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_requires_a_trigger() {
        assert!(validate(true, true, false).is_ok());
        assert!(validate(true, false, true).is_ok());
        assert!(validate(false, false, false).is_ok());
        let err = validate(true, false, false).unwrap_err();
        assert_eq!(err.code(), "BAD_REQUEST");
    }
}
