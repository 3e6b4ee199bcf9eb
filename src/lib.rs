pub mod config;
pub mod db;
pub mod media;
pub mod scheduler;
pub mod sender;
pub mod server;
pub mod telegram;
pub mod utils;

pub use config::Config;
pub use media::{FsObjectStore, MediaService, ObjectStore, PrewarmQueue, PrewarmWorker};
pub use scheduler::{DownsellScheduler, FunnelTargetSource, ShotScheduler};
pub use sender::{SendLimiter, SendService};
pub use server::AppState;
pub use telegram::TelegramClient;
pub use utils::errors::GatewayError;
pub use utils::{setup_logging, SendMetrics, TokenCipher};
