use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::error::SentinelError;
use crate::server::envelope::{ok, ok_message, ApiError, ApiResult};
use crate::server::routes::AppState;

#[derive(Deserialize)]
pub struct StatusQuery {
    pub window: Option<String>,
}

pub async fn time_windows(State(state): State<AppState>) -> ApiResult {
    Ok(ok(state.model_status.time_windows()))
}

pub async fn models(State(state): State<AppState>) -> ApiResult {
    Ok(ok(state.model_status.available_models(false).await?))
}

pub async fn status_single(
    State(state): State<AppState>,
    Path(model_name): Path<String>,
    Query(q): Query<StatusQuery>,
) -> ApiResult {
    let window = q.window.as_deref().unwrap_or("1h");
    Ok(ok(state.model_status.model_history(&model_name, window).await?))
}

#[derive(Deserialize)]
pub struct MultipleBody {
    pub models: Vec<String>,
    pub window: Option<String>,
}

pub async fn status_multiple(
    State(state): State<AppState>,
    Json(body): Json<MultipleBody>,
) -> ApiResult {
    if body.models.is_empty() {
        return Err(ApiError(SentinelError::InvalidParam("models is empty".into())));
    }
    let window = body.window.as_deref().unwrap_or("1h");
    Ok(ok(state.model_status.multi_history(&body.models, window).await?))
}

pub async fn status_all(State(state): State<AppState>, Query(q): Query<StatusQuery>) -> ApiResult {
    let window = q.window.as_deref().unwrap_or("24h");
    Ok(ok(state.model_status.all_history(window).await?))
}

// -- display config ------------------------------------------------------

pub async fn get_config(State(state): State<AppState>, Path(key): Path<String>) -> ApiResult {
    Ok(ok(state.model_status.get_config(&key).await?))
}

#[derive(Deserialize)]
pub struct ConfigBody {
    pub value: String,
}

pub async fn set_config(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<ConfigBody>,
) -> ApiResult {
    state.model_status.set_config(&key, &body.value).await?;
    Ok(ok_message("saved"))
}
