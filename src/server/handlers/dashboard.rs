use axum::extract::{Query, State};
use serde::Deserialize;
use serde_json::json;

use crate::error::SentinelError;
use crate::server::envelope::{ok, ApiError, ApiResult};
use crate::server::routes::AppState;

use super::parse_window;

#[derive(Deserialize)]
pub struct PeriodQuery {
    pub period: Option<String>,
    pub limit: Option<usize>,
    pub no_cache: Option<bool>,
}

#[derive(Deserialize)]
pub struct DaysQuery {
    pub days: Option<u32>,
}

#[derive(Deserialize)]
pub struct HoursQuery {
    pub hours: Option<u32>,
}

#[derive(Deserialize)]
pub struct WindowQuery {
    pub window: Option<String>,
}

fn period_or_default(q: &PeriodQuery) -> Result<String, ApiError> {
    let period = q.period.as_deref().unwrap_or("24h");
    if crate::analytics::period_seconds(period).is_none() {
        return Err(ApiError(SentinelError::InvalidParam(format!(
            "unknown period: {period}"
        ))));
    }
    Ok(period.to_string())
}

pub async fn overview(State(state): State<AppState>, Query(q): Query<PeriodQuery>) -> ApiResult {
    let period = period_or_default(&q)?;
    let data = state
        .analytics
        .overview(&period, q.no_cache.unwrap_or(false))
        .await?;
    Ok(ok(data))
}

pub async fn usage(State(state): State<AppState>, Query(q): Query<PeriodQuery>) -> ApiResult {
    let period = period_or_default(&q)?;
    Ok(ok(state.analytics.usage(&period).await?))
}

pub async fn models(State(state): State<AppState>, Query(q): Query<PeriodQuery>) -> ApiResult {
    let period = period_or_default(&q)?;
    let limit = q.limit.unwrap_or(10).clamp(1, 100);
    Ok(ok(state.analytics.model_usage(&period, limit).await?))
}

pub async fn trends_daily(State(state): State<AppState>, Query(q): Query<DaysQuery>) -> ApiResult {
    Ok(ok(state.analytics.daily_trends(q.days.unwrap_or(7)).await?))
}

pub async fn trends_hourly(
    State(state): State<AppState>,
    Query(q): Query<HoursQuery>,
) -> ApiResult {
    Ok(ok(state.analytics.hourly_trends(q.hours.unwrap_or(24)).await?))
}

pub async fn top_users(State(state): State<AppState>, Query(q): Query<PeriodQuery>) -> ApiResult {
    let period = period_or_default(&q)?;
    let limit = q.limit.unwrap_or(10).clamp(1, 100);
    Ok(ok(state.analytics.top_users(&period, limit).await?))
}

pub async fn channels(State(state): State<AppState>) -> ApiResult {
    Ok(ok(state.analytics.channels().await?))
}

pub async fn ip_distribution(
    State(state): State<AppState>,
    Query(q): Query<WindowQuery>,
) -> ApiResult {
    let window = parse_window(q.window.as_deref(), "24h")?;
    Ok(ok(state.analytics.ip_distribution(&window).await?))
}

/// POST /dashboard/cache/invalidate — drop every ephemeral analytics
/// entry so the next reads recompute.
pub async fn cache_invalidate(State(state): State<AppState>) -> ApiResult {
    let mut removed = 0;
    for prefix in ["dashboard:", "analytics:", "risk:", "ip:", "model_history:"] {
        removed += state.cache.delete_by_prefix(prefix).await;
    }
    Ok(ok(json!({ "invalidated": removed })))
}
