use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::server::envelope::{ok, ok_message, ApiResult};
use crate::server::routes::AppState;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// GET /api/health — unauthenticated liveness.
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "version": VERSION }))
}

/// GET /api/health/db — unauthenticated gateway-DB probe.
pub async fn health_db(State(state): State<AppState>) -> Response {
    match state.db.ping().await {
        Ok(()) => Json(json!({
            "success": true,
            "status": "connected",
            "engine": state.db.engine().as_str(),
        }))
        .into_response(),
        Err(e) => {
            tracing::error!(err = %e, "gateway database unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "success": false,
                    "status": "disconnected",
                    "engine": state.db.engine().as_str(),
                    "message": "database connection failed",
                })),
            )
                .into_response()
        }
    }
}

pub async fn scale(State(state): State<AppState>) -> ApiResult {
    Ok(ok(state.analytics.system_scale(false).await?))
}

pub async fn scale_refresh(State(state): State<AppState>) -> ApiResult {
    Ok(ok(state.analytics.system_scale(true).await?))
}

pub async fn warmup_status(State(state): State<AppState>) -> ApiResult {
    Ok(ok(serde_json::to_value(state.warmup.state.snapshot())?))
}

pub async fn indexes(State(state): State<AppState>) -> ApiResult {
    let status = state.db.index_status().await?;
    let list: Vec<serde_json::Value> = status
        .into_iter()
        .map(|(name, present)| json!({ "name": name, "present": present }))
        .collect();
    Ok(ok(json!({ "indexes": list })))
}

/// POST /system/indexes/ensure — runs in the background; index builds
/// on a big log table can take minutes.
pub async fn indexes_ensure(State(state): State<AppState>) -> ApiResult {
    let db = state.db.clone();
    tokio::spawn(async move {
        match db.ensure_indexes(Duration::from_secs(2)).await {
            Ok(n) => tracing::info!(ensured = n, "manual index ensure finished"),
            Err(e) => tracing::error!(err = %e, "manual index ensure failed"),
        }
    });
    Ok(ok_message("index creation started"))
}

pub async fn tasks(State(state): State<AppState>) -> ApiResult {
    Ok(ok(serde_json::to_value(state.tasks.get_status())?))
}

pub async fn cache_stats(State(state): State<AppState>) -> ApiResult {
    Ok(ok(serde_json::to_value(state.cache.stats())?))
}
