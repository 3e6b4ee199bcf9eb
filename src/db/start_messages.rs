use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

use crate::media::MediaRef;
use crate::utils::errors::GatewayError;

pub const TEXT_MAX_CHARS: usize = 4096;
pub const MEDIA_REFS_MAX: usize = 3;

/// Per-tenant `/start` welcome payload. Singleton per bot; MarkdownV2 is
/// assumed unless `raw_mode` is set.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StartMessageRow {
    pub bot_slug: String,
    pub active: bool,
    pub text: String,
    pub raw_mode: bool,
    pub disable_web_page_preview: bool,
    #[sqlx(json)]
    pub media_refs: Vec<MediaRef>,
    pub updated_at: DateTime<Utc>,
}

/// Validate the StartMessage invariants before accepting a write:
/// active implies non-empty text or at least one media ref, text fits the
/// Telegram limit, at most 3 refs, each with a plausible sha256.
pub fn validate(
    active: bool,
    text: &str,
    media_refs: &[MediaRef],
) -> Result<(), GatewayError> {
    if text.chars().count() > TEXT_MAX_CHARS {
        return Err(GatewayError::TextTooLong(text.chars().count()));
    }
    if media_refs.len() > MEDIA_REFS_MAX {
        return Err(GatewayError::StartMediaRefsMax3(media_refs.len()));
    }
    for media_ref in media_refs {
        if !media_ref.is_valid_sha256() {
            return Err(GatewayError::InvalidMediaSha256(media_ref.sha256.clone()));
        }
    }
    if active && text.is_empty() && media_refs.is_empty() {
        return Err(GatewayError::BadRequest {
            description: Some(
                "active start message needs text or at least one media ref".to_string(),
            ),
        });
    }
    Ok(())
}

pub async fn fetch(pool: &PgPool, slug: &str) -> Result<Option<StartMessageRow>, GatewayError> {
    let row = sqlx::query_as::<_, StartMessageRow>(
        "SELECT bot_slug, active, text, raw_mode, disable_web_page_preview, media_refs, updated_at
         FROM start_messages WHERE bot_slug = $1",
    )
    .bind(slug)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Upsert the singleton. Callers must run `validate` first; the write keeps
/// ref order exactly as configured.
pub async fn upsert(
    pool: &PgPool,
    slug: &str,
    active: bool,
    text: &str,
    raw_mode: bool,
    disable_preview: bool,
    media_refs: &[MediaRef],
) -> Result<StartMessageRow, GatewayError> {
    let refs_json = serde_json::to_value(media_refs)
        .map_err(|e| GatewayError::DatabaseNotAvailable(e.to_string()))?;
    let row = sqlx::query_as::<_, StartMessageRow>(
        "INSERT INTO start_messages
            (bot_slug, active, text, raw_mode, disable_web_page_preview, media_refs, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, now())
         ON CONFLICT (bot_slug) DO UPDATE SET
            active = EXCLUDED.active,
            text = EXCLUDED.text,
            raw_mode = EXCLUDED.raw_mode,
            disable_web_page_preview = EXCLUDED.disable_web_page_preview,
            media_refs = EXCLUDED.media_refs,
            updated_at = now()
         RETURNING bot_slug, active, text, raw_mode, disable_web_page_preview, media_refs, updated_at",
    )
    .bind(slug)
    .bind(active)
    .bind(text)
    .bind(raw_mode)
    .bind(disable_preview)
    .bind(refs_json)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;

    fn ref_of(kind: MediaKind) -> MediaRef {
        MediaRef {
            sha256: "ab".repeat(32),
            kind,
        }
    }

    #[test]
    fn accepts_text_only_and_media_only() {
        assert!(validate(true, "welcome", &[]).is_ok());
        assert!(validate(true, "", &[ref_of(MediaKind::Photo)]).is_ok());
        assert!(validate(false, "", &[]).is_ok());
    }

    #[test]
    fn rejects_active_empty_payload() {
        let err = validate(true, "", &[]).unwrap_err();
        assert_eq!(err.code(), "BAD_REQUEST");
    }

    #[test]
    fn rejects_too_long_text() {
        let text = "x".repeat(TEXT_MAX_CHARS + 1);
        let err = validate(true, &text, &[]).unwrap_err();
        assert_eq!(err.code(), "TEXT_TOO_LONG");
    }

    #[test]
    fn rejects_more_than_three_refs() {
        let refs = vec![
            ref_of(MediaKind::Photo),
            ref_of(MediaKind::Video),
            ref_of(MediaKind::Audio),
            ref_of(MediaKind::Photo),
        ];
        let err = validate(true, "", &refs).unwrap_err();
        assert_eq!(err.code(), "START_MEDIA_REFS_MAX_3");
    }

    #[test]
    fn rejects_malformed_sha256() {
        let refs = vec![MediaRef {
            sha256: "not-a-digest".into(),
            kind: MediaKind::Photo,
        }];
        let err = validate(true, "", &refs).unwrap_err();
        assert_eq!(err.code(), "INVALID_MEDIA_SHA256");
    }

    #[test]
    fn boundary_text_length_accepts() {
        let text = "x".repeat(TEXT_MAX_CHARS);
        assert!(validate(true, &text, &[]).is_ok());
    }
}
