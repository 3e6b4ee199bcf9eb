use thiserror::Error;

/// Closed error taxonomy for the gateway. Every user-visible failure maps to
/// exactly one wire code (`GatewayError::code`), and every error is either
/// transient (worth retrying) or permanent.
#[derive(Debug, Error)]
pub enum GatewayError {
    // Configuration
    #[error("bot not found: {0}")]
    BotNotFound(String),

    #[error("bot is deleted: {0}")]
    BotDeleted(String),

    #[error("bot token not set for: {0}")]
    BotTokenNotSet(String),

    #[error("no warmup chat configured for: {0}")]
    NoWarmupChat(String),

    #[error("ENCRYPTION_KEY is missing or malformed")]
    EncryptionKeyMissing,

    // Input
    #[error("token is required")]
    MissingToken,

    #[error("invalid chat id: {0}")]
    InvalidChatId(String),

    #[error("at most 3 media refs allowed, got {0}")]
    StartMediaRefsMax3(usize),

    #[error("invalid media sha256: {0}")]
    InvalidMediaSha256(String),

    #[error("text too long: {0} chars (max 4096)")]
    TextTooLong(usize),

    // Telegram, permanent
    #[error("chat not found")]
    ChatNotFound { description: Option<String> },

    #[error("bot was blocked by the user")]
    BotBlockedByUser { description: Option<String> },

    #[error("user is deactivated")]
    UserDeactivated { description: Option<String> },

    #[error("forbidden")]
    Forbidden { description: Option<String> },

    #[error("bad request")]
    BadRequest { description: Option<String> },

    #[error("media rejected by telegram")]
    MediaInvalid { description: Option<String> },

    // Telegram, transient
    #[error("telegram rate limit exceeded")]
    RateLimitExceeded { retry_after_ms: Option<u64> },

    #[error("telegram error: {0}")]
    Telegram(String),

    // Local
    #[error("send queue is full")]
    QueueFull,

    #[error("media cache miss: {0}")]
    CacheMiss(String),

    #[error("operation canceled")]
    Canceled,

    #[error("duplicate send in flight: {0}")]
    DuplicateInflight(String),

    #[error("database not available: {0}")]
    DatabaseNotAvailable(String),

    // Admin boundary
    #[error("unauthorized")]
    Unauthorized,
}

impl GatewayError {
    /// Stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BotNotFound(_) => "BOT_NOT_FOUND",
            Self::BotDeleted(_) => "BOT_DELETED",
            Self::BotTokenNotSet(_) => "BOT_TOKEN_NOT_SET",
            Self::NoWarmupChat(_) => "NO_WARMUP_CHAT",
            Self::EncryptionKeyMissing => "ENCRYPTION_KEY_MISSING",
            Self::MissingToken => "MISSING_TOKEN",
            Self::InvalidChatId(_) => "INVALID_CHAT_ID",
            Self::StartMediaRefsMax3(_) => "START_MEDIA_REFS_MAX_3",
            Self::InvalidMediaSha256(_) => "INVALID_MEDIA_SHA256",
            Self::TextTooLong(_) => "TEXT_TOO_LONG",
            Self::ChatNotFound { .. } => "CHAT_NOT_FOUND",
            Self::BotBlockedByUser { .. } => "BOT_BLOCKED_BY_USER",
            Self::UserDeactivated { .. } => "USER_DEACTIVATED",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::BadRequest { .. } => "BAD_REQUEST",
            Self::MediaInvalid { .. } => "MEDIA_INVALID",
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::Telegram(_) => "TELEGRAM_ERROR",
            Self::QueueFull => "QUEUE_FULL",
            Self::CacheMiss(_) => "CACHE_MISS",
            Self::Canceled => "CANCELED",
            Self::DuplicateInflight(_) => "DUPLICATE_INFLIGHT",
            Self::DatabaseNotAvailable(_) => "DATABASE_NOT_AVAILABLE",
            Self::Unauthorized => "UNAUTHORIZED",
        }
    }

    /// Whether a retry may succeed without operator intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded { .. }
                | Self::Telegram(_)
                | Self::QueueFull
                | Self::DuplicateInflight(_)
                | Self::DatabaseNotAvailable(_)
        )
    }

    /// Telegram description, if the API reported one.
    pub fn description(&self) -> Option<&str> {
        match self {
            Self::ChatNotFound { description }
            | Self::BotBlockedByUser { description }
            | Self::UserDeactivated { description }
            | Self::Forbidden { description }
            | Self::BadRequest { description }
            | Self::MediaInvalid { description } => description.as_deref(),
            Self::Telegram(description) => Some(description.as_str()),
            _ => None,
        }
    }

    /// HTTP status for the admin surface. Send outcomes are reported inside
    /// the `{ok: false, ...}` envelope instead and never reach this mapping.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::BotNotFound(_) => 404,
            Self::BotDeleted(_) => 410,
            Self::MissingToken
            | Self::InvalidChatId(_)
            | Self::StartMediaRefsMax3(_)
            | Self::InvalidMediaSha256(_)
            | Self::TextTooLong(_)
            | Self::BadRequest { .. } => 400,
            Self::BotTokenNotSet(_) | Self::NoWarmupChat(_) => 409,
            Self::RateLimitExceeded { .. } => 429,
            Self::QueueFull | Self::DatabaseNotAvailable(_) => 503,
            _ => 500,
        }
    }

    /// Suggested delay before the next attempt, when the upstream told us.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            Self::RateLimitExceeded {
                retry_after_ms: Some(ms),
            } => Some(std::time::Duration::from_millis(*ms)),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        Self::DatabaseNotAvailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(GatewayError::QueueFull.code(), "QUEUE_FULL");
        assert_eq!(
            GatewayError::BotNotFound("acme".into()).code(),
            "BOT_NOT_FOUND"
        );
        assert_eq!(
            GatewayError::RateLimitExceeded {
                retry_after_ms: None
            }
            .code(),
            "RATE_LIMIT_EXCEEDED"
        );
    }

    #[test]
    fn transient_split() {
        assert!(GatewayError::Telegram("bad gateway".into()).is_transient());
        assert!(GatewayError::RateLimitExceeded {
            retry_after_ms: Some(1000)
        }
        .is_transient());
        assert!(!GatewayError::ChatNotFound { description: None }.is_transient());
        assert!(!GatewayError::BotBlockedByUser { description: None }.is_transient());
    }

    #[test]
    fn retry_after_passthrough() {
        let err = GatewayError::RateLimitExceeded {
            retry_after_ms: Some(2500),
        };
        assert_eq!(
            err.retry_after(),
            Some(std::time::Duration::from_millis(2500))
        );
        assert_eq!(GatewayError::QueueFull.retry_after(), None);
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(GatewayError::Unauthorized.http_status(), 401);
        assert_eq!(GatewayError::BotDeleted("x".into()).http_status(), 410);
        assert_eq!(GatewayError::TextTooLong(5000).http_status(), 400);
        assert_eq!(GatewayError::QueueFull.http_status(), 503);
    }
}
