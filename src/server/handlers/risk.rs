use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::json;

use crate::error::SentinelError;
use crate::server::envelope::{ok, ApiError, ApiResult};
use crate::server::routes::AppState;

use super::{parse_window, parse_window_secs};

#[derive(Deserialize)]
pub struct LeaderboardQuery {
    pub windows: Option<String>,
    pub limit: Option<usize>,
    pub sort_by: Option<String>,
}

pub async fn leaderboards(
    State(state): State<AppState>,
    Query(q): Query<LeaderboardQuery>,
) -> ApiResult {
    let windows: Vec<String> = q
        .windows
        .as_deref()
        .unwrap_or("1h,3h,6h,24h")
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if windows.is_empty() {
        return Err(ApiError(SentinelError::InvalidParam("windows is empty".into())));
    }
    let limit = q.limit.unwrap_or(20).clamp(1, 100);
    let sort_by = q.sort_by.as_deref().unwrap_or("requests");
    Ok(ok(state.analytics.leaderboards(&windows, limit, sort_by).await?))
}

#[derive(Deserialize)]
pub struct AnalysisQuery {
    pub window: Option<String>,
    pub end_time: Option<i64>,
}

pub async fn user_analysis(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(q): Query<AnalysisQuery>,
) -> ApiResult {
    let secs = parse_window_secs(q.window.as_deref(), "24h")?;
    Ok(ok(state.analytics.user_analysis(user_id, secs, q.end_time).await?))
}

#[derive(Deserialize)]
pub struct BanRecordsQuery {
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    pub action: Option<String>,
    pub user_id: Option<i64>,
}

pub async fn ban_records(
    State(state): State<AppState>,
    Query(q): Query<BanRecordsQuery>,
) -> ApiResult {
    let page = q.page.unwrap_or(1).max(1);
    let page_size = q.page_size.unwrap_or(20).clamp(1, 100);
    let action = match q.action.as_deref() {
        None | Some("") => None,
        Some("ban") => Some("banned"),
        Some("unban") => Some("unbanned"),
        Some("would_ban") => Some("would_ban"),
        Some(other) => {
            return Err(ApiError(SentinelError::InvalidParam(format!(
                "unknown action filter: {other}"
            ))))
        }
    };
    let (records, total) = state
        .local
        .audit_list(page_size, (page - 1) * page_size, action, q.user_id)
        .await?;
    Ok(ok(json!({
        "records": records,
        "total": total,
        "page": page,
        "page_size": page_size,
    })))
}

#[derive(Deserialize)]
pub struct RotationQuery {
    pub window: Option<String>,
    pub min_tokens: Option<i64>,
    pub max_requests_per_token: Option<f64>,
    pub limit: Option<usize>,
}

pub async fn token_rotation(
    State(state): State<AppState>,
    Query(q): Query<RotationQuery>,
) -> ApiResult {
    let secs = parse_window_secs(q.window.as_deref(), "24h")?;
    let min_tokens = q.min_tokens.unwrap_or(3).max(1);
    let max_per_token = q.max_requests_per_token.unwrap_or(5.0).max(0.1);
    let limit = q.limit.unwrap_or(50).clamp(1, 200);
    Ok(ok(state
        .analytics
        .token_rotation(secs, min_tokens, max_per_token, limit)
        .await?))
}

#[derive(Deserialize)]
pub struct AffiliatedQuery {
    pub min_invited: Option<i64>,
    pub limit: Option<usize>,
}

pub async fn affiliated_accounts(
    State(state): State<AppState>,
    Query(q): Query<AffiliatedQuery>,
) -> ApiResult {
    let min_invited = q.min_invited.unwrap_or(5).max(1);
    let limit = q.limit.unwrap_or(50).clamp(1, 200);
    Ok(ok(state.analytics.affiliated_accounts(min_invited, limit).await?))
}

#[derive(Deserialize)]
pub struct SameIpQuery {
    pub window: Option<String>,
    pub min_users: Option<i64>,
    pub limit: Option<usize>,
}

pub async fn same_ip_registrations(
    State(state): State<AppState>,
    Query(q): Query<SameIpQuery>,
) -> ApiResult {
    let window = parse_window(q.window.as_deref(), "7d")?;
    let secs = parse_window_secs(Some(window.as_str()), "7d")?;
    let min_users = q.min_users.unwrap_or(3).max(2);
    let limit = q.limit.unwrap_or(50).clamp(1, 200);
    Ok(ok(state
        .analytics
        .same_ip_registrations(secs, min_users, limit)
        .await?))
}
