pub mod admin;
pub mod auth;
pub mod cache;
pub mod webhook;

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use sqlx::PgPool;
use tracing::info;

use crate::config::Config;
use crate::db::bots::{self, BotRow};
use crate::db::start_messages::{self, StartMessageRow};
use crate::media::MediaService;
use crate::scheduler::ShotTargetSource;
use crate::sender::SendService;
use crate::server::cache::TtlCache;
use crate::telegram::TelegramClient;
use crate::utils::crypto::TokenCipher;
use crate::utils::errors::GatewayError;
use crate::utils::monitoring::SendMetrics;

/// Process-level cache TTL for tenant config on the hot path.
const CONFIG_CACHE_TTL: Duration = Duration::from_secs(5);

/// Shared state behind every HTTP handler.
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub client: Arc<TelegramClient>,
    pub cipher: Arc<TokenCipher>,
    pub sender: Arc<SendService>,
    pub media: Arc<MediaService>,
    pub metrics: Arc<SendMetrics>,
    pub targets: Arc<dyn ShotTargetSource>,
    bot_cache: TtlCache<BotRow>,
    start_cache: TtlCache<StartMessageRow>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        config: Config,
        client: Arc<TelegramClient>,
        cipher: Arc<TokenCipher>,
        sender: Arc<SendService>,
        media: Arc<MediaService>,
        metrics: Arc<SendMetrics>,
        targets: Arc<dyn ShotTargetSource>,
    ) -> Self {
        Self {
            pool,
            config,
            client,
            cipher,
            sender,
            media,
            metrics,
            targets,
            bot_cache: TtlCache::new(CONFIG_CACHE_TTL),
            start_cache: TtlCache::new(CONFIG_CACHE_TTL),
        }
    }

    /// Tenant lookup through the short-TTL cache. Soft-deleted tenants are
    /// cached as present; callers decide how to answer them.
    pub async fn lookup_bot(&self, slug: &str) -> Result<Option<BotRow>, GatewayError> {
        if let Some(cached) = self.bot_cache.get(slug) {
            return Ok(cached);
        }
        let row = bots::fetch_any(&self.pool, slug).await?;
        self.bot_cache.put(slug, row.clone());
        Ok(row)
    }

    pub async fn lookup_start_message(
        &self,
        slug: &str,
    ) -> Result<Option<StartMessageRow>, GatewayError> {
        if let Some(cached) = self.start_cache.get(slug) {
            return Ok(cached);
        }
        let row = start_messages::fetch(&self.pool, slug).await?;
        self.start_cache.put(slug, row.clone());
        Ok(row)
    }

    pub fn invalidate_bot_cache(&self, slug: &str) {
        self.bot_cache.invalidate(slug);
    }

    pub fn invalidate_start_cache(&self, slug: &str) {
        self.start_cache.invalidate(slug);
    }
}

/// Run the HTTP server hosting the webhook ingress and the admin API.
pub async fn run(state: AppState) -> anyhow::Result<()> {
    let bind_addr = state.config.bind_addr.clone();
    let data = web::Data::new(state);

    info!(bind = %bind_addr, "http server starting");
    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .app_data(web::PayloadConfig::new(32 * 1024 * 1024))
            .app_data(web::JsonConfig::default().limit(32 * 1024 * 1024))
            .route("/tg/{slug}/webhook", web::post().to(webhook::handle))
            .service(admin::scope())
    })
    .bind(bind_addr)?
    .run()
    .await?;
    Ok(())
}
