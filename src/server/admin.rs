use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse, Scope};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::db::shots::status as shot_status;
use crate::db::{bots, downsells, shots, start_messages};
use crate::media::{MediaKind, MediaRef};
use crate::scheduler::shot::is_known_filter;
use crate::sender::{dedupe, Purpose, SendBody, SendRequest};
use crate::server::auth::require_admin;
use crate::server::AppState;
use crate::utils::crypto::mask_token;
use crate::utils::errors::GatewayError;

/// Authenticated admin surface under `/api/admin`.
pub fn scope() -> Scope {
    web::scope("/api/admin")
        .route("/bots", web::get().to(list_bots))
        .route("/bots", web::post().to(create_bot))
        .route("/bots/{slug}", web::delete().to(delete_bot))
        .route("/bots/{slug}/token", web::put().to(put_token))
        .route("/bots/{slug}/token/status", web::get().to(token_status))
        .route("/bots/{slug}/warmup-chat", web::put().to(put_warmup_chat))
        .route("/bots/{slug}/webhook/set", web::post().to(webhook_set))
        .route("/bots/{slug}/webhook/delete", web::post().to(webhook_delete))
        .route("/bots/{slug}/webhook/status", web::post().to(webhook_status))
        .route("/bots/{slug}/send-test", web::post().to(send_test))
        .route("/bots/{slug}/start-message", web::get().to(get_start_message))
        .route("/bots/{slug}/start-message", web::put().to(put_start_message))
        .route("/bots/{slug}/downsells", web::get().to(list_downsells))
        .route("/bots/{slug}/downsells", web::post().to(create_downsell))
        .route("/bots/{slug}/downsells/{id}", web::put().to(update_downsell))
        .route("/bots/{slug}/downsells/{id}", web::delete().to(delete_downsell))
        .route("/bots/{slug}/shots", web::get().to(list_shots))
        .route("/bots/{slug}/shots", web::post().to(create_shot))
        .route("/bots/{slug}/shots/{id}", web::get().to(get_shot))
        .route("/bots/{slug}/shots/{id}/populate", web::post().to(populate_shot))
        .route("/bots/{slug}/shots/{id}/start", web::post().to(start_shot))
        .route("/bots/{slug}/shots/{id}/pause", web::post().to(pause_shot))
        .route("/bots/{slug}/shots/{id}/resume", web::post().to(resume_shot))
        .route("/bots/{slug}/shots/{id}/cancel", web::post().to(cancel_shot))
        .route("/bots/{slug}/media", web::post().to(upload_media))
        .route(
            "/bots/{slug}/media/{sha256}/{kind}/invalidate",
            web::post().to(invalidate_media),
        )
        .route("/metrics/all", web::get().to(metrics_all))
        .route("/metrics/send", web::get().to(metrics_send))
        .route("/metrics/prometheus", web::get().to(metrics_prometheus))
}

/// Error envelope: `{ok: false, error: CODE, description?}` with the
/// taxonomy's HTTP status.
fn fail(error: &GatewayError) -> HttpResponse {
    let mut body = json!({ "ok": false, "error": error.code() });
    if let Some(description) = error.description() {
        body["description"] = json!(description);
    }
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(body)
}

fn bad_request(description: &str) -> HttpResponse {
    fail(&GatewayError::BadRequest {
        description: Some(description.to_string()),
    })
}

macro_rules! guard_admin {
    ($req:expr, $state:expr) => {
        if let Err(e) = require_admin($req, &$state.config.admin_api_token) {
            return fail(&e);
        }
    };
}

/// Shared content validation for downsell and shot payloads.
fn validate_content(text: &str, media_refs: &[MediaRef]) -> Result<(), GatewayError> {
    if text.chars().count() > start_messages::TEXT_MAX_CHARS {
        return Err(GatewayError::TextTooLong(text.chars().count()));
    }
    if media_refs.len() > start_messages::MEDIA_REFS_MAX {
        return Err(GatewayError::StartMediaRefsMax3(media_refs.len()));
    }
    for media_ref in media_refs {
        if !media_ref.is_valid_sha256() {
            return Err(GatewayError::InvalidMediaSha256(media_ref.sha256.clone()));
        }
    }
    Ok(())
}

fn valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= 64
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

// ---- bots ----------------------------------------------------------------

#[derive(Deserialize)]
struct BotCreatePayload {
    slug: String,
    #[serde(default)]
    name: String,
}

fn bot_summary(bot: &bots::BotRow) -> serde_json::Value {
    json!({
        "slug": bot.slug,
        "name": bot.name,
        "token_set": bot.token_cipher.is_some(),
        "token_updated_at": bot.token_updated_at,
        "warmup_chat_id": bot.warmup_chat_id,
        "created_at": bot.created_at,
        "deleted_at": bot.deleted_at,
    })
}

async fn list_bots(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    guard_admin!(&req, state);
    match bots::list(&state.pool).await {
        Ok(rows) => HttpResponse::Ok().json(json!({
            "ok": true,
            "bots": rows.iter().map(bot_summary).collect::<Vec<_>>(),
        })),
        Err(e) => fail(&e),
    }
}

async fn create_bot(
    req: HttpRequest,
    state: web::Data<AppState>,
    payload: web::Json<BotCreatePayload>,
) -> HttpResponse {
    guard_admin!(&req, state);
    if !valid_slug(&payload.slug) {
        return bad_request("slug must be 1-64 chars of [a-z0-9-_]");
    }
    match bots::create(&state.pool, &payload.slug, &payload.name).await {
        Ok(bot) => {
            info!(slug = %bot.slug, "bot created");
            HttpResponse::Ok().json(json!({ "ok": true, "bot": bot_summary(&bot) }))
        }
        Err(e) => fail(&e),
    }
}

async fn delete_bot(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    guard_admin!(&req, state);
    let slug = path.into_inner();
    match bots::soft_delete(&state.pool, &slug).await {
        Ok(()) => {
            state.invalidate_bot_cache(&slug);
            info!(slug = %slug, "bot soft-deleted");
            HttpResponse::Ok().json(json!({ "ok": true }))
        }
        Err(e) => fail(&e),
    }
}

// ---- token & warmup chat -------------------------------------------------

#[derive(Deserialize)]
struct TokenPayload {
    #[serde(default)]
    token: String,
}

async fn put_token(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<TokenPayload>,
) -> HttpResponse {
    guard_admin!(&req, state);
    let slug = path.into_inner();
    let token = payload.token.trim();
    if token.is_empty() {
        return fail(&GatewayError::MissingToken);
    }

    let cipher_text = match state.cipher.encrypt(token) {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };
    match bots::set_token(&state.pool, &slug, &cipher_text).await {
        Ok(updated_at) => {
            state.invalidate_bot_cache(&slug);
            info!(slug = %slug, "bot token updated");
            HttpResponse::Ok().json(json!({
                "ok": true,
                "token_masked": mask_token(token),
                "token_updated_at": updated_at,
            }))
        }
        Err(e) => fail(&e),
    }
}

async fn token_status(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    guard_admin!(&req, state);
    let slug = path.into_inner();
    let token = match load_token(&state, &slug).await {
        Ok(t) => t,
        Err(e) => return fail(&e),
    };
    match state.client.get_me(&token).await {
        Ok(me) => HttpResponse::Ok().json(json!({
            "ok": true,
            "bot_id": me.id,
            "username": me.username,
        })),
        Err(e) => HttpResponse::Ok().json(json!({
            "ok": false,
            "error": e.code(),
            "description": e.description(),
        })),
    }
}

#[derive(Deserialize)]
struct WarmupPayload {
    warmup_chat_id: String,
}

async fn put_warmup_chat(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<WarmupPayload>,
) -> HttpResponse {
    guard_admin!(&req, state);
    let slug = path.into_inner();
    if payload.warmup_chat_id.is_empty() {
        return fail(&GatewayError::InvalidChatId(String::new()));
    }
    match bots::set_warmup_chat(&state.pool, &slug, &payload.warmup_chat_id).await {
        Ok(()) => {
            state.invalidate_bot_cache(&slug);
            // Media uploaded before the chat existed can warm now.
            let requeued = state
                .media
                .requeue_warming_for_bot(&slug)
                .await
                .unwrap_or(0);
            info!(slug = %slug, requeued, "warmup chat configured");
            HttpResponse::Ok().json(json!({ "ok": true, "requeued": requeued }))
        }
        Err(e) => fail(&e),
    }
}

// ---- telegram webhook management ----------------------------------------

async fn load_token(state: &AppState, slug: &str) -> Result<String, GatewayError> {
    let bot = bots::fetch_live(&state.pool, slug).await?;
    let cipher_text = bot
        .token_cipher
        .as_deref()
        .ok_or_else(|| GatewayError::BotTokenNotSet(slug.to_string()))?;
    state.cipher.decrypt(cipher_text)
}

async fn webhook_set(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    guard_admin!(&req, state);
    let slug = path.into_inner();
    let Some(base) = state.config.public_base_url.as_deref() else {
        return bad_request("PUBLIC_BASE_URL is not configured");
    };
    let token = match load_token(&state, &slug).await {
        Ok(t) => t,
        Err(e) => return fail(&e),
    };
    let url = format!("{}/tg/{}/webhook", base.trim_end_matches('/'), slug);
    match state.client.set_webhook(&token, &url).await {
        Ok(()) => HttpResponse::Ok().json(json!({ "ok": true, "url": url })),
        Err(e) => fail(&e),
    }
}

async fn webhook_delete(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    guard_admin!(&req, state);
    let slug = path.into_inner();
    let token = match load_token(&state, &slug).await {
        Ok(t) => t,
        Err(e) => return fail(&e),
    };
    match state.client.delete_webhook(&token).await {
        Ok(()) => HttpResponse::Ok().json(json!({ "ok": true })),
        Err(e) => fail(&e),
    }
}

async fn webhook_status(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    guard_admin!(&req, state);
    let slug = path.into_inner();
    let token = match load_token(&state, &slug).await {
        Ok(t) => t,
        Err(e) => return fail(&e),
    };
    match state.client.webhook_info(&token).await {
        Ok(info) => HttpResponse::Ok().json(json!({ "ok": true, "info": info })),
        Err(e) => fail(&e),
    }
}

// ---- send-test -----------------------------------------------------------

#[derive(Deserialize)]
struct SendTestPayload {
    chat_id: String,
    text: String,
}

async fn send_test(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<SendTestPayload>,
) -> HttpResponse {
    guard_admin!(&req, state);
    let slug = path.into_inner();

    let request = SendRequest::new(
        slug.clone(),
        payload.chat_id.clone(),
        Purpose::SendTest,
        dedupe::send_test(&slug, &payload.chat_id, &payload.text, Utc::now()),
        SendBody::Text {
            text: payload.text.clone(),
            disable_preview: false,
            raw: false,
        },
    );

    // Send outcomes ride in the envelope, not the HTTP status: the request
    // itself was well-formed and handled.
    match state.sender.send(request).await {
        Ok(ok) => HttpResponse::Ok().json(json!({
            "ok": true,
            "message_id": ok.message_id,
            "lat_ms": ok.latency_ms,
            "telegram_lat_ms": ok.telegram_latency_ms,
            "dedupe_applied": ok.dedupe_applied,
        })),
        Err(err) => HttpResponse::Ok().json(json!({
            "ok": false,
            "error": err.error.code(),
            "description": err.error.description(),
            "lat_ms": err.latency_ms,
        })),
    }
}

// ---- start message -------------------------------------------------------

#[derive(Deserialize)]
struct StartMessagePayload {
    active: bool,
    #[serde(default)]
    text: String,
    #[serde(default)]
    raw: bool,
    #[serde(default)]
    disable_web_page_preview: bool,
    #[serde(default)]
    media_refs: Vec<MediaRef>,
    /// Accepted for admin-UI compatibility; sends are always separate
    /// messages in priority order.
    #[serde(default)]
    #[allow(dead_code)]
    use_album: Option<bool>,
}

async fn get_start_message(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    guard_admin!(&req, state);
    let slug = path.into_inner();
    if let Err(e) = bots::fetch_live(&state.pool, &slug).await {
        return fail(&e);
    }
    match start_messages::fetch(&state.pool, &slug).await {
        Ok(Some(row)) => HttpResponse::Ok().json(json!({ "ok": true, "start_message": row })),
        Ok(None) => HttpResponse::Ok().json(json!({
            "ok": true,
            "start_message": {
                "bot_slug": slug,
                "active": false,
                "text": "",
                "raw_mode": false,
                "disable_web_page_preview": false,
                "media_refs": [],
            }
        })),
        Err(e) => fail(&e),
    }
}

async fn put_start_message(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<StartMessagePayload>,
) -> HttpResponse {
    guard_admin!(&req, state);
    let slug = path.into_inner();
    if let Err(e) = bots::fetch_live(&state.pool, &slug).await {
        return fail(&e);
    }
    if let Err(e) = start_messages::validate(payload.active, &payload.text, &payload.media_refs) {
        return fail(&e);
    }
    match start_messages::upsert(
        &state.pool,
        &slug,
        payload.active,
        &payload.text,
        payload.raw,
        payload.disable_web_page_preview,
        &payload.media_refs,
    )
    .await
    {
        Ok(row) => {
            state.invalidate_start_cache(&slug);
            info!(slug = %slug, active = row.active, "start message updated");
            HttpResponse::Ok().json(json!({ "ok": true, "start_message": row }))
        }
        Err(e) => fail(&e),
    }
}

// ---- downsells -----------------------------------------------------------

#[derive(Deserialize)]
struct DownsellPayload {
    name: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    media_refs: Vec<MediaRef>,
    delay_seconds: i64,
    #[serde(default)]
    after_start: bool,
    #[serde(default)]
    after_pix: bool,
    #[serde(default = "default_true")]
    active: bool,
}

fn default_true() -> bool {
    true
}

impl DownsellPayload {
    fn validate(&self) -> Result<(), GatewayError> {
        downsells::validate(self.active, self.after_start, self.after_pix)?;
        validate_content(&self.text, &self.media_refs)?;
        if self.delay_seconds < 0 {
            return Err(GatewayError::BadRequest {
                description: Some("delay_seconds must be non-negative".to_string()),
            });
        }
        Ok(())
    }
}

async fn list_downsells(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    guard_admin!(&req, state);
    let slug = path.into_inner();
    if let Err(e) = bots::fetch_live(&state.pool, &slug).await {
        return fail(&e);
    }
    match downsells::list(&state.pool, &slug).await {
        Ok(rows) => HttpResponse::Ok().json(json!({ "ok": true, "downsells": rows })),
        Err(e) => fail(&e),
    }
}

async fn create_downsell(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<DownsellPayload>,
) -> HttpResponse {
    guard_admin!(&req, state);
    let slug = path.into_inner();
    if let Err(e) = bots::fetch_live(&state.pool, &slug).await {
        return fail(&e);
    }
    if let Err(e) = payload.validate() {
        return fail(&e);
    }
    match downsells::create(
        &state.pool,
        &slug,
        &payload.name,
        &payload.text,
        &payload.media_refs,
        payload.delay_seconds,
        payload.after_start,
        payload.after_pix,
        payload.active,
    )
    .await
    {
        Ok(row) => {
            info!(slug = %slug, downsell_id = row.id, "downsell created");
            HttpResponse::Ok().json(json!({ "ok": true, "downsell": row }))
        }
        Err(e) => fail(&e),
    }
}

async fn update_downsell(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, i64)>,
    payload: web::Json<DownsellPayload>,
) -> HttpResponse {
    guard_admin!(&req, state);
    let (slug, id) = path.into_inner();
    if let Err(e) = payload.validate() {
        return fail(&e);
    }
    match downsells::update(
        &state.pool,
        &slug,
        id,
        &payload.name,
        &payload.text,
        &payload.media_refs,
        payload.delay_seconds,
        payload.after_start,
        payload.after_pix,
        payload.active,
    )
    .await
    {
        Ok(Some(row)) => HttpResponse::Ok().json(json!({ "ok": true, "downsell": row })),
        Ok(None) => bad_request("downsell not found"),
        Err(e) => fail(&e),
    }
}

async fn delete_downsell(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, i64)>,
) -> HttpResponse {
    guard_admin!(&req, state);
    let (slug, id) = path.into_inner();
    match downsells::delete(&state.pool, &slug, id).await {
        Ok(deleted) => HttpResponse::Ok().json(json!({ "ok": true, "deleted": deleted })),
        Err(e) => fail(&e),
    }
}

// ---- shots ---------------------------------------------------------------

#[derive(Deserialize)]
struct ShotCreatePayload {
    title: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    media_refs: Vec<MediaRef>,
    #[serde(default = "default_filter")]
    filter: String,
    #[serde(default = "default_trigger")]
    trigger: String,
    scheduled_at: Option<DateTime<Utc>>,
}

fn default_filter() -> String {
    "all_started".to_string()
}

fn default_trigger() -> String {
    "now".to_string()
}

async fn list_shots(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    guard_admin!(&req, state);
    let slug = path.into_inner();
    match shots::list(&state.pool, &slug).await {
        Ok(rows) => HttpResponse::Ok().json(json!({ "ok": true, "shots": rows })),
        Err(e) => fail(&e),
    }
}

async fn create_shot(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<ShotCreatePayload>,
) -> HttpResponse {
    guard_admin!(&req, state);
    let slug = path.into_inner();
    if let Err(e) = bots::fetch_live(&state.pool, &slug).await {
        return fail(&e);
    }
    if payload.title.is_empty() {
        return bad_request("title must not be empty");
    }
    if let Err(e) = validate_content(&payload.text, &payload.media_refs) {
        return fail(&e);
    }
    if payload.text.is_empty() && payload.media_refs.is_empty() {
        return bad_request("shot needs text or media");
    }
    if !is_known_filter(&payload.filter) {
        return bad_request(&format!("unknown filter '{}'", payload.filter));
    }
    match payload.trigger.as_str() {
        "now" => {}
        "schedule" if payload.scheduled_at.is_some() => {}
        "schedule" => return bad_request("trigger 'schedule' requires scheduled_at"),
        other => return bad_request(&format!("unknown trigger '{}'", other)),
    }

    match shots::create(
        &state.pool,
        &slug,
        &payload.title,
        &payload.text,
        &payload.media_refs,
        &payload.filter,
        &payload.trigger,
        payload.scheduled_at,
    )
    .await
    {
        Ok(row) => {
            info!(slug = %slug, shot_id = row.id, "shot created");
            HttpResponse::Ok().json(json!({ "ok": true, "shot": row }))
        }
        Err(e) => fail(&e),
    }
}

async fn get_shot(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, i64)>,
) -> HttpResponse {
    guard_admin!(&req, state);
    let (slug, id) = path.into_inner();
    match shots::fetch(&state.pool, &slug, id).await {
        Ok(Some(row)) => HttpResponse::Ok().json(json!({ "ok": true, "shot": row })),
        Ok(None) => bad_request("shot not found"),
        Err(e) => fail(&e),
    }
}

async fn populate_shot(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, i64)>,
) -> HttpResponse {
    guard_admin!(&req, state);
    let (slug, id) = path.into_inner();
    let shot = match shots::fetch(&state.pool, &slug, id).await {
        Ok(Some(row)) => row,
        Ok(None) => return bad_request("shot not found"),
        Err(e) => return fail(&e),
    };

    let targets = match state.targets.resolve(&slug, &shot.filter).await {
        Ok(t) => t,
        Err(e) => return fail(&e),
    };

    match shots::populate(&state.pool, &slug, id, &targets).await {
        Ok(Some(row)) => {
            info!(slug = %slug, shot_id = id, targets = row.total_targets, "shot populated");
            HttpResponse::Ok().json(json!({ "ok": true, "shot": row }))
        }
        Ok(None) => bad_request("populate is only allowed from draft"),
        Err(e) => fail(&e),
    }
}

async fn transition_shot(
    state: &AppState,
    slug: &str,
    id: i64,
    from_status: &str,
    to_status: &str,
) -> HttpResponse {
    match shots::transition(&state.pool, slug, id, from_status, to_status).await {
        Ok(Some(row)) => {
            info!(slug = %slug, shot_id = id, status = %row.status, "shot transitioned");
            HttpResponse::Ok().json(json!({ "ok": true, "shot": row }))
        }
        Ok(None) => bad_request(&format!(
            "transition to '{}' requires status '{}'",
            to_status, from_status
        )),
        Err(e) => fail(&e),
    }
}

async fn start_shot(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, i64)>,
) -> HttpResponse {
    guard_admin!(&req, state);
    let (slug, id) = path.into_inner();
    transition_shot(&state, &slug, id, shot_status::QUEUED, shot_status::SENDING).await
}

async fn pause_shot(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, i64)>,
) -> HttpResponse {
    guard_admin!(&req, state);
    let (slug, id) = path.into_inner();
    transition_shot(&state, &slug, id, shot_status::SENDING, shot_status::PAUSED).await
}

async fn resume_shot(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, i64)>,
) -> HttpResponse {
    guard_admin!(&req, state);
    let (slug, id) = path.into_inner();
    transition_shot(&state, &slug, id, shot_status::PAUSED, shot_status::SENDING).await
}

async fn cancel_shot(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, i64)>,
) -> HttpResponse {
    guard_admin!(&req, state);
    let (slug, id) = path.into_inner();
    match shots::cancel(&state.pool, &slug, id).await {
        Ok(Some(row)) => {
            info!(slug = %slug, shot_id = id, "shot canceled");
            HttpResponse::Ok().json(json!({ "ok": true, "shot": row }))
        }
        Ok(None) => bad_request("shot is already terminal"),
        Err(e) => fail(&e),
    }
}

// ---- media ---------------------------------------------------------------

#[derive(Deserialize)]
struct MediaUploadPayload {
    kind: String,
    data_base64: String,
    mime: String,
    ext: String,
}

async fn upload_media(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<MediaUploadPayload>,
) -> HttpResponse {
    guard_admin!(&req, state);
    let slug = path.into_inner();
    if let Err(e) = bots::fetch_live(&state.pool, &slug).await {
        return fail(&e);
    }
    let Some(kind) = MediaKind::parse(&payload.kind) else {
        return bad_request(&format!("unknown media kind '{}'", payload.kind));
    };
    let data = match general_purpose::STANDARD.decode(&payload.data_base64) {
        Ok(d) if !d.is_empty() => d,
        Ok(_) => return bad_request("data_base64 decodes to an empty payload"),
        Err(_) => return bad_request("data_base64 is not valid base64"),
    };

    match state
        .media
        .save_media(&slug, kind, &data, &payload.mime, &payload.ext)
        .await
    {
        Ok(saved) => HttpResponse::Ok().json(json!({
            "ok": true,
            "media_id": saved.media_id,
            "sha256": saved.sha256,
            "r2_key": saved.r2_key,
            "status": saved.status,
        })),
        Err(e) => fail(&e),
    }
}

async fn invalidate_media(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, String, String)>,
) -> HttpResponse {
    guard_admin!(&req, state);
    let (slug, sha256, kind) = path.into_inner();
    let Some(kind) = MediaKind::parse(&kind) else {
        return bad_request("unknown media kind");
    };
    match state.media.invalidate(&slug, &sha256, kind).await {
        Ok(flipped) => HttpResponse::Ok().json(json!({ "ok": true, "invalidated": flipped })),
        Err(e) => fail(&e),
    }
}

// ---- metrics -------------------------------------------------------------

async fn metrics_all(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    guard_admin!(&req, state);
    HttpResponse::Ok().json(state.metrics.full_summary())
}

async fn metrics_send(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    guard_admin!(&req, state);
    HttpResponse::Ok().json(state.metrics.send_summary())
}

async fn metrics_prometheus(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    guard_admin!(&req, state);
    match state.metrics.export_prometheus() {
        Ok(text) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(text),
        Err(_) => HttpResponse::InternalServerError().finish(),
    }
}
