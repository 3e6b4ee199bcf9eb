pub mod client;
pub mod escape;

pub use client::{
    BotIdentity, MediaPayload, TelegramClient, TelegramOutcome, ADMIN_TIMEOUT, HOT_PATH_TIMEOUT,
};
pub use escape::escape_markdown_v2;
