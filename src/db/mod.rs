pub mod bots;
pub mod downsells;
pub mod funnel;
pub mod gateway_events;
pub mod media;
pub mod shots;
pub mod start_messages;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Idempotent migrations, applied in order on every startup.
const MIGRATIONS: &[(&str, &str)] = &[("001_schema", include_str!("../../migrations/001_schema.sql"))];

/// Open the shared connection pool. Startup fails here when the database is
/// unreachable; transient loss after startup is handled per query.
pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(std::time::Duration::from_secs(10))
        .connect(database_url)
        .await
        .context("failed to connect to postgres")?;
    Ok(pool)
}

/// Apply all migrations. Each file is replay-safe (`IF NOT EXISTS` / `DO $$`
/// guards) and sets its own lock and statement timeouts.
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    for (name, sql) in MIGRATIONS {
        sqlx::raw_sql(sql)
            .execute(pool)
            .await
            .with_context(|| format!("failed to apply migration {}", name))?;
        info!("Applied migration: {}", name);
    }
    Ok(())
}
