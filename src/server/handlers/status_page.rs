use axum::extract::{Path, State};
use axum::Json;
use serde_json::Value;

use crate::server::envelope::ApiError;
use crate::server::routes::AppState;

/// The uptime-kuma endpoints return the kuma wire shape directly, not
/// the sentinel envelope, so kuma-compatible frontends can consume
/// them unchanged.
type KumaResult = std::result::Result<Json<Value>, ApiError>;

pub async fn status_page(State(state): State<AppState>, Path(slug): Path<String>) -> KumaResult {
    Ok(Json(state.model_status.kuma_status_page(&slug).await?))
}

pub async fn heartbeat(State(state): State<AppState>, Path(slug): Path<String>) -> KumaResult {
    Ok(Json(state.model_status.kuma_heartbeats(&slug).await?))
}

pub async fn badge(State(state): State<AppState>, Path(slug): Path<String>) -> KumaResult {
    Ok(Json(state.model_status.kuma_badge(&slug).await?))
}

pub async fn summary(State(state): State<AppState>, Path(slug): Path<String>) -> KumaResult {
    Ok(Json(state.model_status.kuma_summary(&slug).await?))
}
