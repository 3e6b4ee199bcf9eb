use serde_json::Value;
use sqlx::PgPool;

use crate::utils::errors::GatewayError;

/// Append a funnel record. The gateway only emits these; downstream
/// analytics consume them elsewhere.
pub async fn record(
    pool: &PgPool,
    slug: &str,
    chat_id: &str,
    event_type: &str,
    metadata: Value,
) -> Result<(), GatewayError> {
    sqlx::query(
        "INSERT INTO funnel_events (bot_slug, chat_id, event_type, metadata)
         VALUES ($1, $2, $3, $4)",
    )
    .bind(slug)
    .bind(chat_id)
    .bind(event_type)
    .bind(metadata)
    .execute(pool)
    .await?;
    Ok(())
}

/// Distinct chats that ever sent `/start` to this tenant. Backs the
/// `all_started` shot filter.
pub async fn distinct_start_chats(pool: &PgPool, slug: &str) -> Result<Vec<String>, GatewayError> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT DISTINCT chat_id FROM funnel_events
         WHERE bot_slug = $1 AND event_type = 'start'
         ORDER BY chat_id",
    )
    .bind(slug)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(c,)| c).collect())
}
