use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::SentinelError;
use crate::server::envelope::{ok, ApiError, ApiResult};
use crate::server::routes::AppState;

use super::parse_window;

const GEO_BATCH_CAP: usize = 1_000;

#[derive(Deserialize)]
pub struct MonitorQuery {
    pub window: Option<String>,
    pub min_tokens: Option<i64>,
    pub min_ips: Option<i64>,
    pub limit: Option<usize>,
}

pub async fn stats(State(state): State<AppState>) -> ApiResult {
    Ok(ok(state.analytics.ip_stats().await?))
}

pub async fn shared(State(state): State<AppState>, Query(q): Query<MonitorQuery>) -> ApiResult {
    let window = parse_window(q.window.as_deref(), "24h")?;
    let min_tokens = q.min_tokens.unwrap_or(3).max(2);
    let limit = q.limit.unwrap_or(50).clamp(1, 200);
    Ok(ok(state.analytics.shared_ips(&window, min_tokens, limit).await?))
}

pub async fn multi_ip_tokens(
    State(state): State<AppState>,
    Query(q): Query<MonitorQuery>,
) -> ApiResult {
    let window = parse_window(q.window.as_deref(), "24h")?;
    let min_ips = q.min_ips.unwrap_or(3).max(2);
    let limit = q.limit.unwrap_or(50).clamp(1, 200);
    Ok(ok(state.analytics.multi_ip_tokens(&window, min_ips, limit).await?))
}

pub async fn multi_ip_users(
    State(state): State<AppState>,
    Query(q): Query<MonitorQuery>,
) -> ApiResult {
    let window = parse_window(q.window.as_deref(), "24h")?;
    let min_ips = q.min_ips.unwrap_or(3).max(2);
    let limit = q.limit.unwrap_or(50).clamp(1, 200);
    Ok(ok(state.analytics.multi_ip_users(&window, min_ips, limit).await?))
}

/// GET /ip/lookup/:ip — accounts seen behind one address.
pub async fn lookup(State(state): State<AppState>, Path(ip): Path<String>) -> ApiResult {
    Ok(ok(state.analytics.ip_users(&ip).await?))
}

#[derive(Deserialize)]
pub struct UserIpsQuery {
    pub window: Option<String>,
}

pub async fn user_ips(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(q): Query<UserIpsQuery>,
) -> ApiResult {
    let window = parse_window(q.window.as_deref(), "7d")?;
    Ok(ok(state.analytics.user_ips(user_id, &window).await?))
}

/// GET /ip/geo/:ip — raw GeoIP lookup.
pub async fn geo(State(state): State<AppState>, Path(ip): Path<String>) -> ApiResult {
    Ok(ok(serde_json::to_value(state.geoip.lookup(&ip))?))
}

#[derive(Deserialize)]
pub struct GeoBatchBody {
    pub ips: Vec<String>,
}

pub async fn geo_batch(
    State(state): State<AppState>,
    Json(body): Json<GeoBatchBody>,
) -> ApiResult {
    if body.ips.is_empty() {
        return Err(ApiError(SentinelError::InvalidParam("ips is empty".into())));
    }
    if body.ips.len() > GEO_BATCH_CAP {
        return Err(ApiError(SentinelError::InvalidParam(format!(
            "at most {GEO_BATCH_CAP} ips per batch"
        ))));
    }
    let results = state.geoip.lookup_batch(&body.ips);
    let map: serde_json::Map<String, Value> = results
        .into_iter()
        .map(|(ip, res)| (ip, serde_json::to_value(res).unwrap_or(Value::Null)))
        .collect();
    Ok(ok(Value::Object(map)))
}

/// POST /ip/enable-all-recording — flip `record_ip_log` on for every
/// user that has it off.
pub async fn enable_all_recording(State(state): State<AppState>) -> ApiResult {
    let affected = state.db.enable_ip_recording_all().await?;
    Ok(ok(json!({ "updated": affected })))
}
