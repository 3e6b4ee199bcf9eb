use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres, Transaction};

use crate::media::MediaRef;
use crate::utils::errors::GatewayError;

pub mod status {
    pub const DRAFT: &str = "draft";
    pub const QUEUED: &str = "queued";
    pub const SENDING: &str = "sending";
    pub const PAUSED: &str = "paused";
    pub const COMPLETED: &str = "completed";
    pub const CANCELED: &str = "canceled";
}

pub mod entry_status {
    pub const PENDING: &str = "pending";
    pub const SENT: &str = "sent";
    pub const FAILED: &str = "failed";
    pub const SKIPPED: &str = "skipped";
}

/// Broadcast campaign row with lifecycle status and progress counters.
/// Counters are eventually consistent with the queue; the worker rolls them
/// up per batch.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ShotRow {
    pub id: i64,
    pub bot_slug: String,
    pub title: String,
    pub text: String,
    #[sqlx(json)]
    pub media_refs: Vec<MediaRef>,
    pub filter: String,
    pub trigger_kind: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub status: String,
    pub total_targets: i64,
    pub sent_count: i64,
    pub failed_count: i64,
    pub skipped_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ShotQueueRow {
    pub id: i64,
    pub shot_id: i64,
    pub bot_slug: String,
    pub chat_id: String,
    pub status: String,
    pub attempts: i32,
}

const COLUMNS: &str = "id, bot_slug, title, text, media_refs, filter, trigger_kind, scheduled_at, \
     status, total_targets, sent_count, failed_count, skipped_count, created_at";

#[allow(clippy::too_many_arguments)]
pub async fn create(
    pool: &PgPool,
    slug: &str,
    title: &str,
    text: &str,
    media_refs: &[MediaRef],
    filter: &str,
    trigger_kind: &str,
    scheduled_at: Option<DateTime<Utc>>,
) -> Result<ShotRow, GatewayError> {
    let refs_json = serde_json::to_value(media_refs)
        .map_err(|e| GatewayError::DatabaseNotAvailable(e.to_string()))?;
    let row = sqlx::query_as::<_, ShotRow>(&format!(
        "INSERT INTO shots (bot_slug, title, text, media_refs, filter, trigger_kind, scheduled_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         RETURNING {}",
        COLUMNS
    ))
    .bind(slug)
    .bind(title)
    .bind(text)
    .bind(refs_json)
    .bind(filter)
    .bind(trigger_kind)
    .bind(scheduled_at)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn list(pool: &PgPool, slug: &str) -> Result<Vec<ShotRow>, GatewayError> {
    let rows = sqlx::query_as::<_, ShotRow>(&format!(
        "SELECT {} FROM shots WHERE bot_slug = $1 ORDER BY id DESC",
        COLUMNS
    ))
    .bind(slug)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn fetch(pool: &PgPool, slug: &str, id: i64) -> Result<Option<ShotRow>, GatewayError> {
    let row = sqlx::query_as::<_, ShotRow>(&format!(
        "SELECT {} FROM shots WHERE id = $2 AND bot_slug = $1",
        COLUMNS
    ))
    .bind(slug)
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Guarded lifecycle transition: the row moves `from_status → to_status`
/// only if it still is in `from_status`. Returns the updated row, or `None`
/// when the precondition failed (caller reports the conflict).
pub async fn transition(
    pool: &PgPool,
    slug: &str,
    id: i64,
    from_status: &str,
    to_status: &str,
) -> Result<Option<ShotRow>, GatewayError> {
    let row = sqlx::query_as::<_, ShotRow>(&format!(
        "UPDATE shots SET status = $4
         WHERE id = $2 AND bot_slug = $1 AND status = $3
         RETURNING {}",
        COLUMNS
    ))
    .bind(slug)
    .bind(id)
    .bind(from_status)
    .bind(to_status)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Populate the target queue and move `draft → queued` atomically. Rejected
/// when the shot is not in draft (re-populating a completed shot included).
pub async fn populate(
    pool: &PgPool,
    slug: &str,
    id: i64,
    chat_ids: &[String],
) -> Result<Option<ShotRow>, GatewayError> {
    let mut tx = pool.begin().await?;

    let claimed: Option<(i64,)> = sqlx::query_as(
        "SELECT id FROM shots
         WHERE id = $2 AND bot_slug = $1 AND status = 'draft'
         FOR UPDATE",
    )
    .bind(slug)
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?;
    if claimed.is_none() {
        tx.rollback().await?;
        return Ok(None);
    }

    for chat_id in chat_ids {
        sqlx::query(
            "INSERT INTO shots_queue (shot_id, bot_slug, chat_id)
             VALUES ($1, $2, $3)
             ON CONFLICT (shot_id, chat_id) DO NOTHING",
        )
        .bind(id)
        .bind(slug)
        .bind(chat_id)
        .execute(&mut *tx)
        .await?;
    }

    let row = sqlx::query_as::<_, ShotRow>(&format!(
        "UPDATE shots SET status = 'queued', total_targets =
            (SELECT count(*) FROM shots_queue WHERE shot_id = $2)
         WHERE id = $2 AND bot_slug = $1
         RETURNING {}",
        COLUMNS
    ))
    .bind(slug)
    .bind(id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(row))
}

/// Cancel from any non-terminal state; remaining pending targets become
/// `skipped` and are folded into the counter.
pub async fn cancel(pool: &PgPool, slug: &str, id: i64) -> Result<Option<ShotRow>, GatewayError> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query_as::<_, ShotRow>(&format!(
        "UPDATE shots SET status = 'canceled'
         WHERE id = $2 AND bot_slug = $1
           AND status IN ('draft', 'queued', 'sending', 'paused')
         RETURNING {}",
        COLUMNS
    ))
    .bind(slug)
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(_) = row else {
        tx.rollback().await?;
        return Ok(None);
    };

    let skipped = sqlx::query(
        "UPDATE shots_queue SET status = 'skipped' WHERE shot_id = $1 AND status = 'pending'",
    )
    .bind(id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let row = sqlx::query_as::<_, ShotRow>(&format!(
        "UPDATE shots SET skipped_count = skipped_count + $2
         WHERE id = $1
         RETURNING {}",
        COLUMNS
    ))
    .bind(id)
    .bind(skipped as i64)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(row))
}

/// Shots the worker should currently drain.
pub async fn sending(pool: &PgPool) -> Result<Vec<ShotRow>, GatewayError> {
    let rows = sqlx::query_as::<_, ShotRow>(&format!(
        "SELECT {} FROM shots WHERE status = 'sending' ORDER BY id",
        COLUMNS
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Scheduled shots whose start time has passed; the worker flips them to
/// `sending` itself.
pub async fn due_scheduled(pool: &PgPool) -> Result<Vec<ShotRow>, GatewayError> {
    let rows = sqlx::query_as::<_, ShotRow>(&format!(
        "SELECT {} FROM shots
         WHERE status = 'queued' AND trigger_kind = 'schedule' AND scheduled_at <= now()
         ORDER BY scheduled_at",
        COLUMNS
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Claim a batch of pending targets for one shot under skip-locked rows.
pub async fn claim_pending(
    tx: &mut Transaction<'_, Postgres>,
    shot_id: i64,
    batch: i64,
) -> Result<Vec<ShotQueueRow>, GatewayError> {
    let rows = sqlx::query_as::<_, ShotQueueRow>(
        "SELECT id, shot_id, bot_slug, chat_id, status, attempts
         FROM shots_queue
         WHERE shot_id = $1 AND status = 'pending'
         ORDER BY id
         LIMIT $2
         FOR UPDATE SKIP LOCKED",
    )
    .bind(shot_id)
    .bind(batch)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows)
}

pub async fn mark_entry(
    tx: &mut Transaction<'_, Postgres>,
    id: i64,
    status: &str,
) -> Result<(), GatewayError> {
    sqlx::query("UPDATE shots_queue SET status = $2 WHERE id = $1")
        .bind(id)
        .bind(status)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn bump_entry_attempts(
    tx: &mut Transaction<'_, Postgres>,
    id: i64,
) -> Result<(), GatewayError> {
    sqlx::query("UPDATE shots_queue SET attempts = attempts + 1 WHERE id = $1")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Roll a finished batch into the shot counters and complete the shot when
/// every target is accounted for.
pub async fn apply_batch_counts(
    tx: &mut Transaction<'_, Postgres>,
    shot_id: i64,
    sent_delta: i64,
    failed_delta: i64,
) -> Result<(), GatewayError> {
    sqlx::query(
        "UPDATE shots SET sent_count = sent_count + $2, failed_count = failed_count + $3
         WHERE id = $1",
    )
    .bind(shot_id)
    .bind(sent_delta)
    .bind(failed_delta)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        "UPDATE shots SET status = 'completed'
         WHERE id = $1 AND status = 'sending'
           AND sent_count + failed_count + skipped_count >= total_targets",
    )
    .bind(shot_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
