use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::aiban::{verdict, AiBanSettings, OpenAiChat};
use crate::error::SentinelError;
use crate::server::envelope::{ok, ok_message, ApiError, ApiResult};
use crate::server::routes::AppState;

use super::parse_window;

pub async fn get_config(State(state): State<AppState>) -> ApiResult {
    let settings = state.aiban.settings().await;
    Ok(ok(json!({
        "settings": settings.public(),
        "api_health": state.aiban.api_health_status(),
    })))
}

pub async fn set_config(
    State(state): State<AppState>,
    Json(body): Json<AiBanSettings>,
) -> ApiResult {
    if crate::analytics::window_seconds(&body.window).is_none() {
        return Err(ApiError(SentinelError::InvalidParam(format!(
            "unknown window: {}",
            body.window
        ))));
    }
    state.aiban.update_settings(body).await?;
    Ok(ok_message("settings saved"))
}

pub async fn reset_api_health(State(state): State<AppState>) -> ApiResult {
    state.aiban.reset_api_health();
    Ok(ok_message("api health reset"))
}

#[derive(Deserialize)]
pub struct AuditQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub status: Option<String>,
}

pub async fn audit_logs(State(state): State<AppState>, Query(q): Query<AuditQuery>) -> ApiResult {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let offset = q.offset.unwrap_or(0);
    let action = q.status.as_deref().filter(|s| !s.is_empty());
    let (entries, total) = state.local.audit_list(limit, offset, action, None).await?;
    Ok(ok(json!({ "logs": entries, "total": total })))
}

pub async fn clear_audit_logs(State(state): State<AppState>) -> ApiResult {
    let removed = state.local.audit_clear().await?;
    Ok(ok(json!({ "removed": removed })))
}

#[derive(Deserialize)]
pub struct SuspiciousQuery {
    pub window: Option<String>,
    pub limit: Option<usize>,
}

pub async fn suspicious(
    State(state): State<AppState>,
    Query(q): Query<SuspiciousQuery>,
) -> ApiResult {
    let window = parse_window(q.window.as_deref(), "1h")?;
    let secs = crate::analytics::window_seconds(&window).unwrap_or(3_600);
    let limit = q.limit.unwrap_or(50).clamp(1, 200);
    Ok(ok(state.analytics.suspicious_users(secs, limit).await?))
}

#[derive(Deserialize)]
pub struct AssessBody {
    pub user_id: i64,
    pub window: Option<String>,
}

pub async fn assess(State(state): State<AppState>, Json(body): Json<AssessBody>) -> ApiResult {
    Ok(ok(state.aiban.assess(body.user_id, body.window.as_deref()).await?))
}

#[derive(Deserialize)]
pub struct ScanQuery {
    pub window: Option<String>,
    pub limit: Option<usize>,
}

pub async fn scan(State(state): State<AppState>, Query(q): Query<ScanQuery>) -> ApiResult {
    Ok(ok(state
        .aiban
        .scan(q.window.as_deref(), q.limit, "manual")
        .await?))
}

pub async fn test_connection(State(state): State<AppState>) -> ApiResult {
    Ok(ok(state.aiban.test_connection().await?))
}

#[derive(Deserialize)]
pub struct ModelsBody {
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub force_refresh: bool,
}

pub async fn list_models(State(state): State<AppState>, Json(body): Json<ModelsBody>) -> ApiResult {
    let cache_key = format!("ai_ban:models:{}", body.base_url);
    if !body.force_refresh {
        if let Some(hit) = state.cache.get_json::<Vec<String>>(&cache_key).await {
            return Ok(ok(json!({ "models": hit, "cached": true })));
        }
    }
    let models = verdict::list_models(&body.base_url, &body.api_key).await?;
    state.cache.set_json(&cache_key, &models, 600).await;
    Ok(ok(json!({ "models": models, "cached": false })))
}

#[derive(Deserialize)]
pub struct TestModelBody {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

pub async fn test_model(
    State(_state): State<AppState>,
    Json(body): Json<TestModelBody>,
) -> ApiResult {
    use crate::aiban::ChatApi;
    let client = OpenAiChat::new(&body.base_url, &body.api_key, &body.model, 30)?;
    let started = std::time::Instant::now();
    let reply = client
        .chat("You are a health check. Reply with the single word: ok", "ping")
        .await?;
    Ok(ok(json!({
        "ok": true,
        "model": body.model,
        "reply": reply.chars().take(100).collect::<String>(),
        "latency_ms": started.elapsed().as_millis() as u64,
    })))
}

// -- whitelist -----------------------------------------------------------

#[derive(Deserialize)]
pub struct WhitelistQuery {
    pub q: Option<String>,
}

pub async fn whitelist(State(state): State<AppState>, Query(q): Query<WhitelistQuery>) -> ApiResult {
    let entries = match q.q.as_deref().filter(|s| !s.is_empty()) {
        Some(keyword) => state.local.whitelist_search(keyword).await?,
        None => state.local.whitelist_list().await?,
    };
    Ok(ok(json!({ "whitelist": entries })))
}

#[derive(Deserialize)]
pub struct WhitelistBody {
    pub user_id: i64,
    #[serde(default)]
    pub reason: String,
    pub expires_at: Option<i64>,
}

pub async fn whitelist_add(
    State(state): State<AppState>,
    Json(body): Json<WhitelistBody>,
) -> ApiResult {
    let added = state
        .local
        .whitelist_add(body.user_id, &body.reason, "admin", body.expires_at)
        .await?;
    if added {
        Ok(ok_message("added to whitelist"))
    } else {
        // Already present; report the state rather than failing.
        Ok(ok_message("already whitelisted"))
    }
}

pub async fn whitelist_remove(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> ApiResult {
    if state.local.whitelist_remove(user_id).await? {
        Ok(ok_message("removed from whitelist"))
    } else {
        Err(ApiError(SentinelError::NotFound(format!(
            "user {user_id} is not whitelisted"
        ))))
    }
}
