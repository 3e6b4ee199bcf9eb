use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod config;
mod db;
mod media;
mod scheduler;
mod sender;
mod server;
mod telegram;
mod utils;

use config::Config;
use media::{FsObjectStore, MediaService, PrewarmQueue, PrewarmWorker};
use scheduler::{DownsellScheduler, FunnelTargetSource, ShotScheduler};
use sender::{SendLimiter, SendService};
use server::AppState;
use telegram::TelegramClient;
use utils::crypto::TokenCipher;
use utils::monitoring::SendMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if it exists
    if let Err(e) = dotenv::dotenv() {
        if !e.to_string().contains("No such file or directory") {
            eprintln!("Failed to load .env file: {}", e);
        }
    }

    utils::setup_logging()?;

    info!("Starting botgate v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Build info: {} ({})",
        env!("GIT_HASH_SHORT"),
        env!("BUILD_TIME")
    );

    #[cfg(debug_assertions)]
    warn!("Running in DEBUG mode - rebuild with --release for production");

    // Configuration refuses to load without DATABASE_URL, ADMIN_API_TOKEN
    // and a well-formed ENCRYPTION_KEY.
    let config = Config::load()?;
    info!("Configuration loaded successfully");

    let cipher = Arc::new(
        TokenCipher::from_hex_key(&config.encryption_key)
            .map_err(|_| anyhow::anyhow!("ENCRYPTION_KEY must be 64 hex chars"))?,
    );

    // Startup aborts when the database is unreachable; transient loss later
    // degrades the schedulers while the webhook keeps ACKing.
    let pool = db::connect(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    info!("Database ready");

    let client = Arc::new(TelegramClient::new().context("failed to build telegram client")?);
    let metrics = Arc::new(SendMetrics::new()?);

    let objects = Arc::new(FsObjectStore::new(config.media_root.clone()));
    let prewarm_queue = PrewarmQueue::new();
    let media_service = Arc::new(MediaService::new(
        pool.clone(),
        objects.clone(),
        prewarm_queue.clone(),
    ));

    // Re-seed cache rows that were still warming when the last process died.
    match prewarm_queue.seed_from_db(&pool).await {
        Ok(0) => {}
        Ok(n) => info!("Re-seeded {} warming media rows", n),
        Err(e) => warn!("Failed to seed prewarm queue: {}", e),
    }

    let prewarm_worker = PrewarmWorker::new(
        pool.clone(),
        objects,
        client.clone(),
        cipher.clone(),
        prewarm_queue,
        config.workers.prewarm_concurrency,
        config.workers.prewarm_max_attempts,
    );
    tokio::spawn(prewarm_worker.run());

    let limiter = SendLimiter::new(config.workers.limiter.clone());
    let limiter_handle = limiter.spawn_dispatcher();

    let send_service = SendService::new(
        pool.clone(),
        client.clone(),
        cipher.clone(),
        limiter,
        media_service.clone(),
        metrics.clone(),
    );

    let downsell_scheduler = DownsellScheduler::new(
        pool.clone(),
        send_service.clone(),
        config.workers.downsell_tick_secs,
        config.workers.downsell_batch_size,
        config.workers.downsell_max_attempts,
    );
    tokio::spawn(downsell_scheduler.run());

    let shot_scheduler = ShotScheduler::new(
        pool.clone(),
        send_service.clone(),
        config.workers.shot_tick_secs,
        config.workers.shot_batch_size,
        config.workers.shot_max_attempts,
    );
    tokio::spawn(shot_scheduler.run());

    let targets = Arc::new(FunnelTargetSource::new(pool.clone()));
    let state = AppState::new(
        pool,
        config,
        client,
        cipher,
        send_service,
        media_service,
        metrics,
        targets,
    );

    info!("botgate is running. Press Ctrl+C to stop.");
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server::run(state) => {
            if let Err(e) = result {
                error!("HTTP server error: {}", e);
            }
        }
    }

    limiter_handle.abort();
    info!("botgate stopped");
    Ok(())
}
