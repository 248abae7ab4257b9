use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::server::envelope::{ok, ok_message, ApiResult};
use crate::server::routes::AppState;

#[derive(Deserialize)]
pub struct PageQuery {
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    pub search: Option<String>,
    pub sort: Option<String>,
    pub status: Option<String>,
    pub user_id: Option<i64>,
}

fn paging(q: &PageQuery) -> (usize, usize) {
    (q.page.unwrap_or(1), q.page_size.unwrap_or(20))
}

// -- users ---------------------------------------------------------------

pub async fn list_users(State(state): State<AppState>, Query(q): Query<PageQuery>) -> ApiResult {
    let (page, page_size) = paging(&q);
    Ok(ok(state
        .admin
        .list_users(page, page_size, q.search.as_deref(), q.sort.as_deref().unwrap_or("id"))
        .await?))
}

#[derive(Deserialize)]
pub struct BanBody {
    #[serde(default)]
    pub reason: String,
}

pub async fn ban_user(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Json(body): Json<BanBody>,
) -> ApiResult {
    let applied = state.aiban.ban_user(user_id, &body.reason, "admin").await?;
    if applied {
        Ok(ok_message("user banned"))
    } else {
        Ok(ok_message("user already banned"))
    }
}

pub async fn unban_user(State(state): State<AppState>, Path(user_id): Path<i64>) -> ApiResult {
    let applied = state.aiban.unban_user(user_id, "admin").await?;
    if applied {
        Ok(ok_message("user unbanned"))
    } else {
        Ok(ok_message("user was not banned"))
    }
}

// -- tokens --------------------------------------------------------------

pub async fn list_tokens(State(state): State<AppState>, Query(q): Query<PageQuery>) -> ApiResult {
    let (page, page_size) = paging(&q);
    Ok(ok(state.admin.list_tokens(page, page_size, q.user_id).await?))
}

pub async fn delete_token(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    state.admin.delete_token(id).await?;
    Ok(ok_message("token deleted"))
}

// -- top-ups -------------------------------------------------------------

pub async fn list_topups(State(state): State<AppState>, Query(q): Query<PageQuery>) -> ApiResult {
    let (page, page_size) = paging(&q);
    Ok(ok(state
        .admin
        .list_topups(page, page_size, q.status.as_deref(), q.user_id)
        .await?))
}

pub async fn topup_stats(State(state): State<AppState>) -> ApiResult {
    Ok(ok(state.admin.topup_stats().await?))
}

pub async fn refund_topup(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let result = state.admin.refund_topup(id).await?;
    let refunded = result["refunded"].as_bool().unwrap_or(false);
    Ok(Json(json!({
        "success": true,
        "data": result,
        "message": if refunded { "refunded" } else { "already refunded" },
    })))
}

// -- redemptions ---------------------------------------------------------

pub async fn list_redemptions(
    State(state): State<AppState>,
    Query(q): Query<PageQuery>,
) -> ApiResult {
    let (page, page_size) = paging(&q);
    let status = q.status.as_deref().and_then(|s| s.parse::<i64>().ok());
    Ok(ok(state.admin.list_redemptions(page, page_size, status).await?))
}

#[derive(Deserialize)]
pub struct GenerateBody {
    pub count: usize,
    #[serde(default)]
    pub prefix: String,
    pub quota: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub expired_time: i64,
}

pub async fn generate_redemptions(
    State(state): State<AppState>,
    Json(body): Json<GenerateBody>,
) -> ApiResult {
    Ok(ok(state
        .redemptions
        .generate_batch(body.count, &body.prefix, body.quota, &body.name, body.expired_time)
        .await?))
}

pub async fn delete_redemption(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    state.admin.delete_redemption(id).await?;
    Ok(ok_message("redemption deleted"))
}
