use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::info;

/// Process configuration. Required values come from the environment;
/// worker tunables may be overridden by an optional TOML file pointed at by
/// `BOTGATE_CONFIG`.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub admin_api_token: String,
    /// 64 hex chars = 32-byte AES-256-GCM key. Validated at startup; the
    /// process refuses to start without it.
    pub encryption_key: String,
    /// Public origin used when registering tenant webhooks with Telegram.
    pub public_base_url: Option<String>,
    pub bind_addr: String,
    /// Root directory of the filesystem object store.
    pub media_root: PathBuf,
    pub workers: WorkerConfig,
}

/// Tunables for the background workers and the send limiter.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub prewarm_concurrency: usize,
    pub prewarm_max_attempts: u32,
    pub downsell_tick_secs: u64,
    pub downsell_batch_size: i64,
    pub downsell_max_attempts: i32,
    pub shot_tick_secs: u64,
    pub shot_batch_size: i64,
    pub shot_max_attempts: i32,
    pub limiter: LimiterSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimiterSettings {
    /// Global token bucket: burst capacity and steady refill per second.
    pub global_capacity: f64,
    pub global_refill_per_sec: f64,
    /// Per-chat bucket: burst capacity and steady refill per second.
    pub chat_capacity: f64,
    pub chat_refill_per_sec: f64,
    /// Waiting requests beyond this are rejected with QUEUE_FULL.
    pub max_waiters: usize,
    /// Dispatch tick interval.
    pub tick_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            prewarm_concurrency: 5,
            prewarm_max_attempts: 8,
            downsell_tick_secs: 10,
            downsell_batch_size: 200,
            downsell_max_attempts: 5,
            shot_tick_secs: 5,
            shot_batch_size: 30,
            shot_max_attempts: 3,
            limiter: LimiterSettings::default(),
        }
    }
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            global_capacity: 10.0,
            global_refill_per_sec: 30.0,
            chat_capacity: 1.0,
            chat_refill_per_sec: 5.0,
            max_waiters: 100,
            tick_ms: 50,
        }
    }
}

impl Config {
    /// Load configuration from the environment (plus the optional TOML
    /// overrides file) and validate it.
    pub fn load() -> Result<Self> {
        let mut config = Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or_default(),
            admin_api_token: std::env::var("ADMIN_API_TOKEN").unwrap_or_default(),
            encryption_key: std::env::var("ENCRYPTION_KEY").unwrap_or_default(),
            public_base_url: std::env::var("PUBLIC_BASE_URL")
                .ok()
                .filter(|s| !s.is_empty()),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            media_root: std::env::var("MEDIA_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./media")),
            workers: WorkerConfig::default(),
        };

        if let Ok(path) = std::env::var("BOTGATE_CONFIG") {
            if !path.is_empty() {
                info!("Loading worker overrides from: {}", path);
                let content = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file: {}", path))?;
                config.workers = toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file: {}", path))?;
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            anyhow::bail!("DATABASE_URL is required");
        }

        if self.admin_api_token.is_empty() {
            anyhow::bail!("ADMIN_API_TOKEN is required");
        }

        if self.encryption_key.len() != 64
            || !self.encryption_key.chars().all(|c| c.is_ascii_hexdigit())
        {
            anyhow::bail!(
                "ENCRYPTION_KEY must be exactly 64 hex characters (32 bytes); refusing to start"
            );
        }

        if self.workers.limiter.max_waiters == 0 {
            anyhow::bail!("limiter.max_waiters must be at least 1");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            database_url: "postgres://localhost/botgate".into(),
            admin_api_token: "secret".into(),
            encryption_key: "ab".repeat(32),
            public_base_url: None,
            bind_addr: "127.0.0.1:8080".into(),
            media_root: PathBuf::from("/tmp/media"),
            workers: WorkerConfig::default(),
        }
    }

    #[test]
    fn accepts_valid_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn rejects_missing_database_url() {
        let mut config = valid_config();
        config.database_url.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_short_or_non_hex_key() {
        let mut config = valid_config();
        config.encryption_key = "deadbeef".into();
        assert!(config.validate().is_err());

        config.encryption_key = "zz".repeat(32);
        assert!(config.validate().is_err());
    }

    #[test]
    fn worker_defaults_match_pipeline_tuning() {
        let workers = WorkerConfig::default();
        assert_eq!(workers.prewarm_concurrency, 5);
        assert_eq!(workers.downsell_tick_secs, 10);
        assert_eq!(workers.shot_batch_size, 30);
        assert_eq!(workers.limiter.global_refill_per_sec, 30.0);
        assert_eq!(workers.limiter.max_waiters, 100);
    }

    #[test]
    fn worker_overrides_parse_from_toml() {
        let parsed: WorkerConfig = toml::from_str(
            r#"
            prewarm_concurrency = 2
            shot_batch_size = 10

            [limiter]
            max_waiters = 50
            "#,
        )
        .unwrap();
        assert_eq!(parsed.prewarm_concurrency, 2);
        assert_eq!(parsed.shot_batch_size, 10);
        assert_eq!(parsed.limiter.max_waiters, 50);
        // untouched fields keep defaults
        assert_eq!(parsed.downsell_batch_size, 200);
        assert_eq!(parsed.limiter.global_capacity, 10.0);
    }
}
