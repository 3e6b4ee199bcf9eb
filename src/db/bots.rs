use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use crate::utils::errors::GatewayError;

/// One tenant row. `token_cipher` is the AES-GCM envelope; the plaintext
/// token never touches this type.
#[derive(Debug, Clone, FromRow)]
pub struct BotRow {
    pub slug: String,
    pub name: String,
    pub token_cipher: Option<String>,
    pub token_updated_at: Option<DateTime<Utc>>,
    pub warmup_chat_id: Option<String>,
    pub global_rate_override: Option<f64>,
    pub per_chat_rate_override: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl BotRow {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

const COLUMNS: &str = "slug, name, token_cipher, token_updated_at, warmup_chat_id, \
     global_rate_override, per_chat_rate_override, created_at, deleted_at";

/// Insert a tenant; re-running with the same slug is a no-op.
pub async fn create(pool: &PgPool, slug: &str, name: &str) -> Result<BotRow, GatewayError> {
    sqlx::query(
        "INSERT INTO bots (slug, name) VALUES ($1, $2)
         ON CONFLICT (slug) DO NOTHING",
    )
    .bind(slug)
    .bind(name)
    .execute(pool)
    .await?;
    fetch_any(pool, slug)
        .await?
        .ok_or_else(|| GatewayError::BotNotFound(slug.to_string()))
}

/// Fetch a tenant regardless of soft-delete state (admin use).
pub async fn fetch_any(pool: &PgPool, slug: &str) -> Result<Option<BotRow>, GatewayError> {
    let row = sqlx::query_as::<_, BotRow>(&format!(
        "SELECT {} FROM bots WHERE slug = $1",
        COLUMNS
    ))
    .bind(slug)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Fetch a live tenant. Missing maps to `BOT_NOT_FOUND`, soft-deleted to
/// `BOT_DELETED` — the only two answers non-admin paths may observe.
pub async fn fetch_live(pool: &PgPool, slug: &str) -> Result<BotRow, GatewayError> {
    let row = fetch_any(pool, slug)
        .await?
        .ok_or_else(|| GatewayError::BotNotFound(slug.to_string()))?;
    if row.is_deleted() {
        return Err(GatewayError::BotDeleted(slug.to_string()));
    }
    Ok(row)
}

pub async fn list(pool: &PgPool) -> Result<Vec<BotRow>, GatewayError> {
    let rows = sqlx::query_as::<_, BotRow>(&format!(
        "SELECT {} FROM bots ORDER BY created_at",
        COLUMNS
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Store a freshly encrypted token envelope.
pub async fn set_token(pool: &PgPool, slug: &str, cipher: &str) -> Result<DateTime<Utc>, GatewayError> {
    let updated: Option<(DateTime<Utc>,)> = sqlx::query_as(
        "UPDATE bots SET token_cipher = $2, token_updated_at = now()
         WHERE slug = $1 AND deleted_at IS NULL
         RETURNING token_updated_at",
    )
    .bind(slug)
    .bind(cipher)
    .fetch_optional(pool)
    .await?;
    updated
        .map(|(t,)| t)
        .ok_or_else(|| GatewayError::BotNotFound(slug.to_string()))
}

pub async fn set_warmup_chat(
    pool: &PgPool,
    slug: &str,
    warmup_chat_id: &str,
) -> Result<(), GatewayError> {
    let result = sqlx::query(
        "UPDATE bots SET warmup_chat_id = $2 WHERE slug = $1 AND deleted_at IS NULL",
    )
    .bind(slug)
    .bind(warmup_chat_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(GatewayError::BotNotFound(slug.to_string()));
    }
    Ok(())
}

/// Soft delete: the tenant becomes invisible to ingress and scheduling.
pub async fn soft_delete(pool: &PgPool, slug: &str) -> Result<(), GatewayError> {
    let result = sqlx::query(
        "UPDATE bots SET deleted_at = now() WHERE slug = $1 AND deleted_at IS NULL",
    )
    .bind(slug)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(GatewayError::BotNotFound(slug.to_string()));
    }
    Ok(())
}
