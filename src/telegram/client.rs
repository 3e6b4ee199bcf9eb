use std::time::Duration;

use reqwest::multipart;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::media::MediaKind;
use crate::utils::errors::GatewayError;

/// Hot-path timeout (webhook-triggered sends).
pub const HOT_PATH_TIMEOUT: Duration = Duration::from_secs(5);
/// Admin/test timeout (send-test, getMe, webhook management).
pub const ADMIN_TIMEOUT: Duration = Duration::from_secs(8);

/// Outcome of one Telegram Bot API call, collapsed into the gateway's
/// closed taxonomy. `Transient` is worth retrying; `Permanent` is not.
#[derive(Debug)]
pub enum TelegramOutcome {
    Ok {
        message_id: i64,
        /// `file_id` of uploaded media, when the response carried one.
        file_id: Option<String>,
    },
    Transient {
        retry_after_ms: Option<u64>,
        description: String,
    },
    Permanent {
        error: GatewayError,
    },
}

/// Media payload for a send: a cached Telegram `file_id` (one round-trip) or
/// raw bytes uploaded in-band via multipart.
#[derive(Debug, Clone)]
pub enum MediaPayload {
    FileId(String),
    Bytes {
        name: String,
        mime: String,
        data: Vec<u8>,
    },
}

/// Identity returned by `getMe`.
#[derive(Debug, Clone, Deserialize)]
pub struct BotIdentity {
    pub id: i64,
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    result: Option<Value>,
    description: Option<String>,
    error_code: Option<i64>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

/// Substring patterns mapping Telegram `description` strings to permanent
/// codes. Checked case-insensitively, first match wins.
const PERMANENT_PATTERNS: &[(&str, PermanentKind)] = &[
    ("chat not found", PermanentKind::ChatNotFound),
    ("chat_id is empty", PermanentKind::ChatNotFound),
    ("bot was blocked", PermanentKind::BotBlocked),
    ("user is deactivated", PermanentKind::UserDeactivated),
    ("bot can't initiate conversation", PermanentKind::Forbidden),
    ("bot is not a member", PermanentKind::Forbidden),
    ("not enough rights", PermanentKind::Forbidden),
    ("have no rights", PermanentKind::Forbidden),
    ("kicked from", PermanentKind::Forbidden),
    ("wrong file identifier", PermanentKind::MediaInvalid),
    ("wrong remote file identifier", PermanentKind::MediaInvalid),
    ("failed to get http url content", PermanentKind::MediaInvalid),
    ("wrong type of the web page content", PermanentKind::MediaInvalid),
    ("file is too big", PermanentKind::MediaInvalid),
    ("image_process_failed", PermanentKind::MediaInvalid),
];

#[derive(Debug, Clone, Copy)]
enum PermanentKind {
    ChatNotFound,
    BotBlocked,
    UserDeactivated,
    Forbidden,
    MediaInvalid,
}

impl PermanentKind {
    fn into_error(self, description: Option<String>) -> GatewayError {
        match self {
            PermanentKind::ChatNotFound => GatewayError::ChatNotFound { description },
            PermanentKind::BotBlocked => GatewayError::BotBlockedByUser { description },
            PermanentKind::UserDeactivated => GatewayError::UserDeactivated { description },
            PermanentKind::Forbidden => GatewayError::Forbidden { description },
            PermanentKind::MediaInvalid => GatewayError::MediaInvalid { description },
        }
    }
}

/// One HTTPS client for the Telegram Bot API, shared across all tenants.
/// The underlying reqwest pool keeps connections alive between calls; the
/// per-tenant token only appears in the request path and is never logged.
pub struct TelegramClient {
    http: reqwest::Client,
    base_url: String,
}

impl TelegramClient {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_base_url("https://api.telegram.org")
    }

    /// Override the API origin; used by tests pointing at a local stub.
    pub fn with_base_url(base_url: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn method_url(&self, token: &str, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, token, method)
    }

    /// Low-level JSON call. All higher-level sends funnel through the same
    /// response classification.
    pub async fn call(
        &self,
        token: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> TelegramOutcome {
        let request = self
            .http
            .post(self.method_url(token, method))
            .json(&params)
            .timeout(timeout);

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return transport_outcome(e),
        };
        self.classify(method, response).await
    }

    /// Multipart upload call, for in-band media bytes.
    async fn call_multipart(
        &self,
        token: &str,
        method: &str,
        form: multipart::Form,
        timeout: Duration,
    ) -> TelegramOutcome {
        let request = self
            .http
            .post(self.method_url(token, method))
            .multipart(form)
            .timeout(timeout);

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return transport_outcome(e),
        };
        self.classify(method, response).await
    }

    async fn classify(&self, method: &str, response: reqwest::Response) -> TelegramOutcome {
        let status = response.status();
        let body: ApiResponse = match response.json().await {
            Ok(b) => b,
            Err(_) if status.is_server_error() => {
                return TelegramOutcome::Transient {
                    retry_after_ms: None,
                    description: format!("telegram http {}", status.as_u16()),
                }
            }
            Err(e) => {
                return TelegramOutcome::Transient {
                    retry_after_ms: None,
                    description: format!("unparseable telegram response: {}", e.without_url()),
                }
            }
        };
        let outcome = classify_api_response(status.as_u16(), body);
        match &outcome {
            TelegramOutcome::Ok { message_id, .. } => {
                debug!(method, message_id, "telegram call ok");
            }
            TelegramOutcome::Transient { retry_after_ms, .. } if retry_after_ms.is_some() => {
                warn!(method, ?retry_after_ms, "telegram rate limited");
            }
            _ => {}
        }
        outcome
    }

    /// `sendMessage`.
    pub async fn send_text(
        &self,
        token: &str,
        chat_id: &str,
        text: &str,
        parse_mode: Option<&str>,
        disable_preview: bool,
        timeout: Duration,
    ) -> TelegramOutcome {
        let mut params = json!({
            "chat_id": chat_id,
            "text": text,
        });
        if let Some(mode) = parse_mode {
            params["parse_mode"] = json!(mode);
        }
        if disable_preview {
            params["link_preview_options"] = json!({ "is_disabled": true });
        }
        self.call(token, "sendMessage", params, timeout).await
    }

    /// `sendPhoto` / `sendVideo` / `sendAudio`, by kind and payload form.
    pub async fn send_media(
        &self,
        token: &str,
        chat_id: &str,
        kind: MediaKind,
        payload: MediaPayload,
        caption: Option<&str>,
        parse_mode: Option<&str>,
        timeout: Duration,
    ) -> TelegramOutcome {
        match payload {
            MediaPayload::FileId(file_id) => {
                let mut params = json!({ "chat_id": chat_id });
                params[kind.payload_field()] = json!(file_id);
                if let Some(caption) = caption {
                    params["caption"] = json!(caption);
                }
                if let Some(mode) = parse_mode {
                    params["parse_mode"] = json!(mode);
                }
                self.call(token, kind.telegram_method(), params, timeout)
                    .await
            }
            MediaPayload::Bytes { name, mime, data } => {
                let part = match multipart::Part::bytes(data)
                    .file_name(name)
                    .mime_str(&mime)
                {
                    Ok(p) => p,
                    Err(_) => {
                        return TelegramOutcome::Permanent {
                            error: GatewayError::MediaInvalid {
                                description: Some(format!("unsupported mime: {}", mime)),
                            },
                        }
                    }
                };
                let mut form = multipart::Form::new()
                    .text("chat_id", chat_id.to_string())
                    .part(kind.payload_field().to_string(), part);
                if let Some(caption) = caption {
                    form = form.text("caption", caption.to_string());
                }
                if let Some(mode) = parse_mode {
                    form = form.text("parse_mode", mode.to_string());
                }
                self.call_multipart(token, kind.telegram_method(), form, timeout)
                    .await
            }
        }
    }

    /// `getMe`, mapped to a typed identity.
    pub async fn get_me(&self, token: &str) -> Result<BotIdentity, GatewayError> {
        let url = self.method_url(token, "getMe");
        let response = self
            .http
            .get(url)
            .timeout(ADMIN_TIMEOUT)
            .send()
            .await
            .map_err(|e| GatewayError::Telegram(e.without_url().to_string()))?;
        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Telegram(e.without_url().to_string()))?;
        if !body.ok {
            return Err(GatewayError::Telegram(
                body.description.unwrap_or_else(|| "getMe failed".into()),
            ));
        }
        let result = body.result.unwrap_or(Value::Null);
        serde_json::from_value(result)
            .map_err(|e| GatewayError::Telegram(format!("unexpected getMe shape: {}", e)))
    }

    /// `setWebhook` for a tenant's ingress URL.
    pub async fn set_webhook(&self, token: &str, url: &str) -> Result<(), GatewayError> {
        self.expect_true(token, "setWebhook", json!({ "url": url }))
            .await
    }

    /// `deleteWebhook`.
    pub async fn delete_webhook(&self, token: &str) -> Result<(), GatewayError> {
        self.expect_true(token, "deleteWebhook", json!({})).await
    }

    /// `getWebhookInfo`, returned as raw JSON for the admin surface.
    pub async fn webhook_info(&self, token: &str) -> Result<Value, GatewayError> {
        let url = self.method_url(token, "getWebhookInfo");
        let response = self
            .http
            .get(url)
            .timeout(ADMIN_TIMEOUT)
            .send()
            .await
            .map_err(|e| GatewayError::Telegram(e.without_url().to_string()))?;
        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Telegram(e.without_url().to_string()))?;
        if !body.ok {
            return Err(GatewayError::Telegram(
                body.description
                    .unwrap_or_else(|| "getWebhookInfo failed".into()),
            ));
        }
        Ok(body.result.unwrap_or(Value::Null))
    }

    async fn expect_true(
        &self,
        token: &str,
        method: &str,
        params: Value,
    ) -> Result<(), GatewayError> {
        match self.call(token, method, params, ADMIN_TIMEOUT).await {
            TelegramOutcome::Ok { .. } => Ok(()),
            TelegramOutcome::Transient { description, .. } => {
                Err(GatewayError::Telegram(description))
            }
            TelegramOutcome::Permanent { error } => Err(error),
        }
    }
}

/// Collapse a decoded Bot API response into the outcome taxonomy. Pure so
/// the mapping table is testable without HTTP.
fn classify_api_response(http_status: u16, body: ApiResponse) -> TelegramOutcome {
    if body.ok {
        let result = body.result.unwrap_or(Value::Null);
        let message_id = result
            .get("message_id")
            .and_then(Value::as_i64)
            .unwrap_or_default();
        let file_id = extract_file_id(&result);
        return TelegramOutcome::Ok { message_id, file_id };
    }

    let description = body.description.unwrap_or_default();
    let error_code = body.error_code.unwrap_or(http_status as i64);

    // 429 carries retry_after (seconds) in response parameters.
    if error_code == 429 {
        let retry_after_ms = body
            .parameters
            .and_then(|p| p.retry_after)
            .map(|secs| secs * 1000);
        return TelegramOutcome::Transient {
            retry_after_ms,
            description,
        };
    }

    if (500..600).contains(&error_code) {
        return TelegramOutcome::Transient {
            retry_after_ms: None,
            description,
        };
    }

    let lowered = description.to_lowercase();
    for (pattern, kind) in PERMANENT_PATTERNS {
        if lowered.contains(pattern) {
            return TelegramOutcome::Permanent {
                error: kind.into_error(Some(description)),
            };
        }
    }

    match error_code {
        403 => TelegramOutcome::Permanent {
            error: GatewayError::Forbidden {
                description: Some(description),
            },
        },
        400 => TelegramOutcome::Permanent {
            error: GatewayError::BadRequest {
                description: Some(description),
            },
        },
        // Unknown shape: treat as the generic telegram error (transient).
        _ => TelegramOutcome::Transient {
            retry_after_ms: None,
            description,
        },
    }
}

/// Pull the reusable `file_id` out of a sent-message result. Photos come as
/// an array of sizes; the largest (last) is the one worth caching.
fn extract_file_id(result: &Value) -> Option<String> {
    if let Some(sizes) = result.get("photo").and_then(Value::as_array) {
        return sizes
            .last()
            .and_then(|s| s.get("file_id"))
            .and_then(Value::as_str)
            .map(str::to_string);
    }
    for field in ["video", "audio", "document", "voice"] {
        if let Some(file_id) = result
            .get(field)
            .and_then(|m| m.get("file_id"))
            .and_then(Value::as_str)
        {
            return Some(file_id.to_string());
        }
    }
    None
}

/// Transport-level failures (connect, timeout) are always transient. The
/// reqwest error is stripped of its URL so the bot token cannot leak.
fn transport_outcome(err: reqwest::Error) -> TelegramOutcome {
    let description = if err.is_timeout() {
        "telegram request timed out".to_string()
    } else {
        format!("telegram transport error: {}", err.without_url())
    };
    TelegramOutcome::Transient {
        retry_after_ms: None,
        description,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify_body(body: &str, status: u16) -> TelegramOutcome {
        classify_api_response(status, serde_json::from_str(body).unwrap())
    }

    #[test]
    fn ok_response_extracts_message_id() {
        let out = classify_body(r#"{"ok":true,"result":{"message_id":42}}"#, 200);
        match out {
            TelegramOutcome::Ok { message_id, file_id } => {
                assert_eq!(message_id, 42);
                assert!(file_id.is_none());
            }
            other => panic!("expected ok, got {:?}", other),
        }
    }

    #[test]
    fn photo_file_id_takes_largest_size() {
        let body = r#"{"ok":true,"result":{"message_id":7,"photo":[
            {"file_id":"small","width":90},
            {"file_id":"large","width":800}]}}"#;
        match classify_body(body, 200) {
            TelegramOutcome::Ok { file_id, .. } => assert_eq!(file_id.as_deref(), Some("large")),
            other => panic!("expected ok, got {:?}", other),
        }
    }

    #[test]
    fn audio_file_id_is_captured() {
        let body = r#"{"ok":true,"result":{"message_id":8,"audio":{"file_id":"aud1"}}}"#;
        match classify_body(body, 200) {
            TelegramOutcome::Ok { file_id, .. } => assert_eq!(file_id.as_deref(), Some("aud1")),
            other => panic!("expected ok, got {:?}", other),
        }
    }

    #[test]
    fn rate_limit_maps_to_transient_with_delay() {
        let body = r#"{"ok":false,"error_code":429,
            "description":"Too Many Requests: retry after 14",
            "parameters":{"retry_after":14}}"#;
        match classify_body(body, 429) {
            TelegramOutcome::Transient { retry_after_ms, .. } => {
                assert_eq!(retry_after_ms, Some(14_000));
            }
            other => panic!("expected transient, got {:?}", other),
        }
    }

    #[test]
    fn description_table_maps_permanent_codes() {
        let cases = [
            ("Bad Request: chat not found", "CHAT_NOT_FOUND"),
            ("Forbidden: bot was blocked by the user", "BOT_BLOCKED_BY_USER"),
            ("Forbidden: user is deactivated", "USER_DEACTIVATED"),
            ("Bad Request: wrong file identifier/HTTP URL specified", "MEDIA_INVALID"),
            ("Forbidden: bot can't initiate conversation with a user", "FORBIDDEN"),
        ];
        for (description, expected_code) in cases {
            let body = format!(
                r#"{{"ok":false,"error_code":400,"description":"{}"}}"#,
                description
            );
            match classify_body(&body, 400) {
                TelegramOutcome::Permanent { error } => {
                    assert_eq!(error.code(), expected_code, "for {:?}", description)
                }
                other => panic!("expected permanent for {:?}, got {:?}", description, other),
            }
        }
    }

    #[test]
    fn unknown_400_falls_back_to_bad_request() {
        let body = r#"{"ok":false,"error_code":400,"description":"Bad Request: message text is empty"}"#;
        match classify_body(body, 400) {
            TelegramOutcome::Permanent { error } => assert_eq!(error.code(), "BAD_REQUEST"),
            other => panic!("expected permanent, got {:?}", other),
        }
    }

    #[test]
    fn server_errors_are_transient() {
        let body = r#"{"ok":false,"error_code":502,"description":"Bad Gateway"}"#;
        assert!(matches!(
            classify_body(body, 502),
            TelegramOutcome::Transient { .. }
        ));
    }
}
