use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use crate::media::MediaKind;
use crate::utils::errors::GatewayError;

pub mod cache_status {
    pub const WARMING: &str = "warming";
    pub const READY: &str = "ready";
    pub const ERROR: &str = "error";
}

/// Immutable content-addressed blob record.
#[derive(Debug, Clone, FromRow)]
pub struct MediaStoreRow {
    pub bot_slug: String,
    pub sha256: String,
    pub kind: String,
    pub r2_key: String,
    pub bytes: i64,
    pub mime: String,
    pub created_at: DateTime<Utc>,
}

/// Per-tenant warmth state for one blob. Only the prewarm worker moves the
/// status; the send path reads it.
#[derive(Debug, Clone, FromRow)]
pub struct MediaCacheRow {
    pub bot_slug: String,
    pub sha256: String,
    pub kind: String,
    pub status: String,
    pub file_id: Option<String>,
    pub error_reason: Option<String>,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub warmup_at: Option<DateTime<Utc>>,
}

impl MediaCacheRow {
    pub fn media_kind(&self) -> Option<MediaKind> {
        MediaKind::parse(&self.kind)
    }
}

/// Upsert the immutable store row. Re-saving identical content is a no-op.
pub async fn upsert_store(
    pool: &PgPool,
    slug: &str,
    sha256: &str,
    kind: MediaKind,
    r2_key: &str,
    bytes: i64,
    mime: &str,
) -> Result<(), GatewayError> {
    sqlx::query(
        "INSERT INTO media_store (bot_slug, sha256, kind, r2_key, bytes, mime)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (bot_slug, sha256, kind) DO NOTHING",
    )
    .bind(slug)
    .bind(sha256)
    .bind(kind.as_str())
    .bind(r2_key)
    .bind(bytes)
    .bind(mime)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_store(
    pool: &PgPool,
    slug: &str,
    sha256: &str,
    kind: MediaKind,
) -> Result<Option<MediaStoreRow>, GatewayError> {
    let row = sqlx::query_as::<_, MediaStoreRow>(
        "SELECT bot_slug, sha256, kind, r2_key, bytes, mime, created_at
         FROM media_store WHERE bot_slug = $1 AND sha256 = $2 AND kind = $3",
    )
    .bind(slug)
    .bind(sha256)
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Create the warming cache row if none exists. Returns true when this call
/// created it (and the blob should be enqueued for prewarming).
pub async fn insert_cache_warming(
    pool: &PgPool,
    slug: &str,
    sha256: &str,
    kind: MediaKind,
) -> Result<bool, GatewayError> {
    let result = sqlx::query(
        "INSERT INTO media_cache (bot_slug, sha256, kind, status)
         VALUES ($1, $2, $3, 'warming')
         ON CONFLICT (bot_slug, sha256, kind) DO NOTHING",
    )
    .bind(slug)
    .bind(sha256)
    .bind(kind.as_str())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn fetch_cache(
    pool: &PgPool,
    slug: &str,
    sha256: &str,
    kind: MediaKind,
) -> Result<Option<MediaCacheRow>, GatewayError> {
    let row = sqlx::query_as::<_, MediaCacheRow>(
        "SELECT bot_slug, sha256, kind, status, file_id, error_reason, attempts, created_at, warmup_at
         FROM media_cache WHERE bot_slug = $1 AND sha256 = $2 AND kind = $3",
    )
    .bind(slug)
    .bind(sha256)
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// `warming → ready` with the captured file_id.
pub async fn mark_ready(
    pool: &PgPool,
    slug: &str,
    sha256: &str,
    kind: MediaKind,
    file_id: &str,
) -> Result<(), GatewayError> {
    sqlx::query(
        "UPDATE media_cache
         SET status = 'ready', file_id = $4, error_reason = NULL, warmup_at = now()
         WHERE bot_slug = $1 AND sha256 = $2 AND kind = $3",
    )
    .bind(slug)
    .bind(sha256)
    .bind(kind.as_str())
    .bind(file_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Terminal failure: `warming → error` with the reason recorded.
pub async fn mark_error(
    pool: &PgPool,
    slug: &str,
    sha256: &str,
    kind: MediaKind,
    reason: &str,
) -> Result<(), GatewayError> {
    sqlx::query(
        "UPDATE media_cache SET status = 'error', error_reason = $4
         WHERE bot_slug = $1 AND sha256 = $2 AND kind = $3",
    )
    .bind(slug)
    .bind(sha256)
    .bind(kind.as_str())
    .bind(reason)
    .execute(pool)
    .await?;
    Ok(())
}

/// Transient failure: stays `warming`, attempt count and reason updated.
pub async fn record_warm_attempt(
    pool: &PgPool,
    slug: &str,
    sha256: &str,
    kind: MediaKind,
    reason: Option<&str>,
) -> Result<(), GatewayError> {
    sqlx::query(
        "UPDATE media_cache SET attempts = attempts + 1, error_reason = $4
         WHERE bot_slug = $1 AND sha256 = $2 AND kind = $3",
    )
    .bind(slug)
    .bind(sha256)
    .bind(kind.as_str())
    .bind(reason)
    .execute(pool)
    .await?;
    Ok(())
}

/// Operator invalidation: `ready → warming`, file_id dropped, attempts reset.
/// Returns whether a ready row was actually flipped.
pub async fn invalidate(
    pool: &PgPool,
    slug: &str,
    sha256: &str,
    kind: MediaKind,
) -> Result<bool, GatewayError> {
    let result = sqlx::query(
        "UPDATE media_cache
         SET status = 'warming', file_id = NULL, error_reason = NULL, attempts = 0
         WHERE bot_slug = $1 AND sha256 = $2 AND kind = $3 AND status = 'ready'",
    )
    .bind(slug)
    .bind(sha256)
    .bind(kind.as_str())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Rows still warming, used to re-seed the prewarm queue after a restart.
pub async fn list_warming(pool: &PgPool) -> Result<Vec<MediaCacheRow>, GatewayError> {
    let rows = sqlx::query_as::<_, MediaCacheRow>(
        "SELECT bot_slug, sha256, kind, status, file_id, error_reason, attempts, created_at, warmup_at
         FROM media_cache WHERE status = 'warming'
         ORDER BY created_at",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
