use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::media::MediaRef;
use crate::utils::errors::GatewayError;

/// Why a send is happening. Determines the dedupe key shape and the
/// priority class inside the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Purpose {
    SendTest,
    Start,
    Downsell,
    Shot,
}

/// Priority classes inside the limiter. Lower value dispatches first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PriorityClass {
    Start = 0,
    Shot = 1,
    Downsell = 2,
}

impl PriorityClass {
    pub const COUNT: usize = 3;

    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::SendTest => "send-test",
            Purpose::Start => "start",
            Purpose::Downsell => "downsell",
            Purpose::Shot => "shot",
        }
    }

    /// START outranks SHOT outranks DOWNSELL. Admin test sends ride the
    /// START class: they are interactive and low-volume.
    pub fn priority_class(&self) -> PriorityClass {
        match self {
            Purpose::Start | Purpose::SendTest => PriorityClass::Start,
            Purpose::Shot => PriorityClass::Shot,
            Purpose::Downsell => PriorityClass::Downsell,
        }
    }

    /// Whether the caller is conversational enough to spend a short wait on
    /// a cold media cache before falling back to in-band upload.
    pub fn has_media_wait_budget(&self) -> bool {
        matches!(self, Purpose::Start | Purpose::SendTest)
    }
}

/// Message payload: text-only, or 1..=3 media refs with an optional caption.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SendBody {
    Text {
        text: String,
        disable_preview: bool,
        /// Pass the text through untouched instead of MarkdownV2-escaping.
        raw: bool,
    },
    Media {
        refs: Vec<MediaRef>,
        caption: Option<String>,
        raw: bool,
    },
}

impl SendBody {
    pub fn validate(&self) -> Result<(), GatewayError> {
        match self {
            SendBody::Text { text, .. } => {
                if text.is_empty() {
                    return Err(GatewayError::BadRequest {
                        description: Some("text must not be empty".to_string()),
                    });
                }
                if text.chars().count() > 4096 {
                    return Err(GatewayError::TextTooLong(text.chars().count()));
                }
            }
            SendBody::Media { refs, caption, .. } => {
                if refs.is_empty() {
                    return Err(GatewayError::BadRequest {
                        description: Some("media body needs at least one ref".to_string()),
                    });
                }
                if refs.len() > 3 {
                    return Err(GatewayError::StartMediaRefsMax3(refs.len()));
                }
                for r in refs {
                    if !r.is_valid_sha256() {
                        return Err(GatewayError::InvalidMediaSha256(r.sha256.clone()));
                    }
                }
                if let Some(caption) = caption {
                    if caption.chars().count() > 1024 {
                        return Err(GatewayError::TextTooLong(caption.chars().count()));
                    }
                }
            }
        }
        Ok(())
    }
}

/// One send operation handed to the send service.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub request_id: Uuid,
    pub slug: String,
    pub chat_id: String,
    pub purpose: Purpose,
    pub dedupe_key: String,
    pub body: SendBody,
    /// Purpose-specific metadata persisted onto the gateway event.
    pub metadata: serde_json::Value,
}

impl SendRequest {
    pub fn new(
        slug: impl Into<String>,
        chat_id: impl Into<String>,
        purpose: Purpose,
        dedupe_key: impl Into<String>,
        body: SendBody,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            slug: slug.into(),
            chat_id: chat_id.into(),
            purpose,
            dedupe_key: dedupe_key.into(),
            body,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }
}

impl SendRequest {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.chat_id.is_empty()
            || !self
                .chat_id
                .chars()
                .all(|c| c.is_ascii_digit() || c == '-' || c == '@' || c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(GatewayError::InvalidChatId(self.chat_id.clone()));
        }
        self.body.validate()
    }
}

/// Successful send result.
#[derive(Debug, Clone, Serialize)]
pub struct SendOk {
    pub message_id: i64,
    pub latency_ms: u64,
    pub telegram_latency_ms: Option<u64>,
    pub dedupe_applied: bool,
}

/// Failed send result, carrying the taxonomy code and timing.
#[derive(Debug)]
pub struct SendErr {
    pub error: GatewayError,
    pub latency_ms: u64,
}

/// Dedupe key constructors. These shapes are load-bearing: they are what
/// makes repeated deliveries collapse into one send.
pub mod dedupe {
    use super::*;

    fn short_hash(text: &str) -> String {
        let digest = Sha256::digest(text.as_bytes());
        hex::encode(&digest[..8])
    }

    /// Minute bucket `YYYYmmddHHMM`; repeat test sends inside the minute
    /// dedupe to the first.
    pub fn minute_bucket(at: DateTime<Utc>) -> String {
        at.format("%Y%m%d%H%M").to_string()
    }

    pub fn send_test(slug: &str, chat_id: &str, text: &str, at: DateTime<Utc>) -> String {
        format!(
            "test:{}:{}:{}:{}",
            slug,
            chat_id,
            short_hash(text),
            minute_bucket(at)
        )
    }

    pub fn start(slug: &str, chat_id: &str, start_session_id: &str) -> String {
        format!("start:{}:{}:{}", slug, chat_id, start_session_id)
    }

    pub fn downsell(queue_id: i64) -> String {
        format!("downsell:{}", queue_id)
    }

    pub fn shot(shot_id: i64, chat_id: &str) -> String {
        format!("shot:{}:{}", shot_id, chat_id)
    }

    /// Session id for a `/start`: stable within the chat's minute bucket so
    /// a re-entrant `/start` is absorbed by the dedupe key.
    pub fn start_session_id(chat_id: &str, at: DateTime<Utc>) -> String {
        format!("{}-{}", chat_id, minute_bucket(at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;
    use chrono::TimeZone;

    #[test]
    fn purpose_priority_classes() {
        assert!(Purpose::Start.priority_class() < Purpose::Shot.priority_class());
        assert!(Purpose::Shot.priority_class() < Purpose::Downsell.priority_class());
        assert_eq!(Purpose::SendTest.priority_class(), PriorityClass::Start);
    }

    #[test]
    fn wait_budget_only_for_conversational_sends() {
        assert!(Purpose::Start.has_media_wait_budget());
        assert!(Purpose::SendTest.has_media_wait_budget());
        assert!(!Purpose::Shot.has_media_wait_budget());
        assert!(!Purpose::Downsell.has_media_wait_budget());
    }

    #[test]
    fn dedupe_keys_have_documented_shapes() {
        let at = Utc.with_ymd_and_hms(2025, 3, 14, 15, 9, 26).unwrap();
        assert_eq!(dedupe::downsell(42), "downsell:42");
        assert_eq!(dedupe::shot(7, "123"), "shot:7:123");
        assert_eq!(
            dedupe::start("acme", "999", "999-202503141509"),
            "start:acme:999:999-202503141509"
        );
        let test_key = dedupe::send_test("acme", "123", "Hi", at);
        assert!(test_key.starts_with("test:acme:123:"));
        assert!(test_key.ends_with(":202503141509"));
    }

    #[test]
    fn same_minute_same_test_key() {
        let a = Utc.with_ymd_and_hms(2025, 1, 1, 10, 30, 1).unwrap();
        let b = Utc.with_ymd_and_hms(2025, 1, 1, 10, 30, 58).unwrap();
        let c = Utc.with_ymd_and_hms(2025, 1, 1, 10, 31, 0).unwrap();
        assert_eq!(
            dedupe::send_test("s", "1", "x", a),
            dedupe::send_test("s", "1", "x", b)
        );
        assert_ne!(
            dedupe::send_test("s", "1", "x", a),
            dedupe::send_test("s", "1", "x", c)
        );
    }

    #[test]
    fn start_session_absorbs_reentry_within_minute() {
        let a = Utc.with_ymd_and_hms(2025, 1, 1, 10, 30, 1).unwrap();
        let b = Utc.with_ymd_and_hms(2025, 1, 1, 10, 30, 59).unwrap();
        assert_eq!(
            dedupe::start_session_id("999", a),
            dedupe::start_session_id("999", b)
        );
    }

    #[test]
    fn body_validation() {
        assert!(SendBody::Text {
            text: "hi".into(),
            disable_preview: false,
            raw: false
        }
        .validate()
        .is_ok());

        let err = SendBody::Text {
            text: String::new(),
            disable_preview: false,
            raw: false,
        }
        .validate()
        .unwrap_err();
        assert_eq!(err.code(), "BAD_REQUEST");

        let err = SendBody::Media {
            refs: vec![
                MediaRef { sha256: "ab".repeat(32), kind: MediaKind::Photo };
                4
            ],
            caption: None,
            raw: false,
        }
        .validate()
        .unwrap_err();
        assert_eq!(err.code(), "START_MEDIA_REFS_MAX_3");
    }

    #[test]
    fn chat_id_validation() {
        let mut req = SendRequest::new(
            "acme",
            "123",
            Purpose::SendTest,
            "k",
            SendBody::Text {
                text: "hi".into(),
                disable_preview: false,
                raw: false,
            },
        );
        assert!(req.validate().is_ok());

        req.chat_id = "-100123".into();
        assert!(req.validate().is_ok());

        req.chat_id = "bad id".into();
        assert_eq!(req.validate().unwrap_err().code(), "INVALID_CHAT_ID");

        req.chat_id = String::new();
        assert_eq!(req.validate().unwrap_err().code(), "INVALID_CHAT_ID");
    }
}
