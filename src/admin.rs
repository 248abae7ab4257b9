use std::sync::Arc;

use serde_json::{json, Value};
use tracing::info;

use crate::db::{row_i64, row_string, GatewayDb, SqlValue};
use crate::error::{Result, SentinelError};

/// Top-up states a refund may transition out of.
const REFUNDABLE_STATES: &[&str] = &["success", "completed", "1"];

const MAX_PAGE_SIZE: usize = 100;

fn validate_paging(page: usize, page_size: usize) -> Result<(i64, i64)> {
    if page == 0 {
        return Err(SentinelError::InvalidParam("page starts at 1".into()));
    }
    if page_size == 0 || page_size > MAX_PAGE_SIZE {
        return Err(SentinelError::InvalidParam(format!(
            "page_size must be within 1..={MAX_PAGE_SIZE}"
        )));
    }
    let offset = ((page - 1) * page_size) as i64;
    Ok((page_size as i64, offset))
}

/// User listing sort keys. Anything else falls back to id.
fn user_order(sort: &str) -> &'static str {
    match sort {
        "quota" => "quota DESC",
        "used_quota" => "used_quota DESC",
        "request_count" => "request_count DESC",
        _ => "id ASC",
    }
}

/// Listing, refund and moderation operations on the gateway tables.
/// Refund and ban are the only writes besides IP-recording toggles and
/// redemption inserts.
pub struct AdminOps {
    db: Arc<GatewayDb>,
}

impl AdminOps {
    pub fn new(db: Arc<GatewayDb>) -> Self {
        Self { db }
    }

    // -- users -----------------------------------------------------------

    pub async fn list_users(
        &self,
        page: usize,
        page_size: usize,
        search: Option<&str>,
        sort: &str,
    ) -> Result<Value> {
        let (limit, offset) = validate_paging(page, page_size)?;
        let order = user_order(sort);

        let mut where_sql = String::from("deleted_at IS NULL");
        let mut params: Vec<SqlValue> = Vec::new();
        if let Some(q) = search.filter(|q| !q.is_empty()) {
            where_sql.push_str(" AND (username LIKE ? OR email LIKE ?)");
            let pattern = format!("%{q}%");
            params.push(SqlValue::from(pattern.clone()));
            params.push(SqlValue::from(pattern));
        }

        let total = self
            .db
            .query_one(&format!("SELECT COUNT(*) AS n FROM users WHERE {where_sql}"), &params)
            .await?
            .map(|r| row_i64(&r, "n"))
            .unwrap_or(0);

        let sql = format!(
            "SELECT id, username, display_name, email, status, quota, used_quota, \
                    request_count, inviter_id \
             FROM users WHERE {where_sql} ORDER BY {order} LIMIT ? OFFSET ?"
        );
        params.push(SqlValue::Int(limit));
        params.push(SqlValue::Int(offset));
        let rows = self.db.query(&sql, &params).await?;

        let users: Vec<Value> = rows
            .iter()
            .map(|r| {
                json!({
                    "id": row_i64(r, "id"),
                    "username": row_string(r, "username"),
                    "display_name": row_string(r, "display_name"),
                    "email": row_string(r, "email"),
                    "status": row_i64(r, "status"),
                    "quota": row_i64(r, "quota"),
                    "used_quota": row_i64(r, "used_quota"),
                    "request_count": row_i64(r, "request_count"),
                    "inviter_id": row_i64(r, "inviter_id"),
                })
            })
            .collect();
        Ok(json!({ "users": users, "total": total, "page": page, "page_size": page_size }))
    }

    // -- tokens ----------------------------------------------------------

    pub async fn list_tokens(
        &self,
        page: usize,
        page_size: usize,
        user_id: Option<i64>,
    ) -> Result<Value> {
        let (limit, offset) = validate_paging(page, page_size)?;
        let mut where_sql = String::from("deleted_at IS NULL");
        let mut params: Vec<SqlValue> = Vec::new();
        if let Some(uid) = user_id {
            where_sql.push_str(" AND user_id = ?");
            params.push(SqlValue::Int(uid));
        }

        let total = self
            .db
            .query_one(&format!("SELECT COUNT(*) AS n FROM tokens WHERE {where_sql}"), &params)
            .await?
            .map(|r| row_i64(&r, "n"))
            .unwrap_or(0);

        let sql = format!(
            "SELECT id, user_id, name, status, remain_quota, unlimited_quota, \
                    created_time, expired_time \
             FROM tokens WHERE {where_sql} ORDER BY id DESC LIMIT ? OFFSET ?"
        );
        params.push(SqlValue::Int(limit));
        params.push(SqlValue::Int(offset));
        let rows = self.db.query(&sql, &params).await?;

        let tokens: Vec<Value> = rows
            .iter()
            .map(|r| {
                json!({
                    "id": row_i64(r, "id"),
                    "user_id": row_i64(r, "user_id"),
                    "name": row_string(r, "name"),
                    "status": row_i64(r, "status"),
                    "remain_quota": row_i64(r, "remain_quota"),
                    "unlimited_quota": row_i64(r, "unlimited_quota"),
                    "created_time": row_i64(r, "created_time"),
                    "expired_time": row_i64(r, "expired_time"),
                })
            })
            .collect();
        Ok(json!({ "tokens": tokens, "total": total, "page": page, "page_size": page_size }))
    }

    pub async fn delete_token(&self, id: i64) -> Result<()> {
        let affected = self
            .db
            .execute(
                "UPDATE tokens SET deleted_at = CURRENT_TIMESTAMP \
                 WHERE id = ? AND deleted_at IS NULL",
                &[SqlValue::Int(id)],
            )
            .await?;
        if affected == 0 {
            return Err(SentinelError::NotFound(format!("token {id}")));
        }
        Ok(())
    }

    // -- top-ups ---------------------------------------------------------

    pub async fn list_topups(
        &self,
        page: usize,
        page_size: usize,
        status: Option<&str>,
        user_id: Option<i64>,
    ) -> Result<Value> {
        let (limit, offset) = validate_paging(page, page_size)?;
        let mut where_sql = String::from("1=1");
        let mut params: Vec<SqlValue> = Vec::new();
        if let Some(s) = status.filter(|s| !s.is_empty()) {
            where_sql.push_str(" AND status = ?");
            params.push(SqlValue::from(s));
        }
        if let Some(uid) = user_id {
            where_sql.push_str(" AND user_id = ?");
            params.push(SqlValue::Int(uid));
        }

        let total = self
            .db
            .query_one(&format!("SELECT COUNT(*) AS n FROM top_ups WHERE {where_sql}"), &params)
            .await?
            .map(|r| row_i64(&r, "n"))
            .unwrap_or(0);

        let sql = format!(
            "SELECT id, user_id, amount, money, trade_no, payment_method, status, \
                    create_time, complete_time \
             FROM top_ups WHERE {where_sql} ORDER BY id DESC LIMIT ? OFFSET ?"
        );
        params.push(SqlValue::Int(limit));
        params.push(SqlValue::Int(offset));
        let rows = self.db.query(&sql, &params).await?;

        let topups: Vec<Value> = rows
            .iter()
            .map(|r| {
                json!({
                    "id": row_i64(r, "id"),
                    "user_id": row_i64(r, "user_id"),
                    "amount": row_i64(r, "amount"),
                    "money": crate::db::row_f64(r, "money"),
                    "trade_no": row_string(r, "trade_no"),
                    "payment_method": row_string(r, "payment_method"),
                    "status": row_string(r, "status"),
                    "create_time": row_i64(r, "create_time"),
                    "complete_time": row_i64(r, "complete_time"),
                })
            })
            .collect();
        Ok(json!({ "topups": topups, "total": total, "page": page, "page_size": page_size }))
    }

    pub async fn topup_stats(&self) -> Result<Value> {
        let rows = self
            .db
            .query(
                "SELECT status, COUNT(*) AS n, COALESCE(SUM(amount), 0) AS amount, \
                        COALESCE(SUM(money), 0) AS money \
                 FROM top_ups GROUP BY status",
                &[],
            )
            .await?;
        let by_status: Vec<Value> = rows
            .iter()
            .map(|r| {
                json!({
                    "status": row_string(r, "status"),
                    "count": row_i64(r, "n"),
                    "amount": row_i64(r, "amount"),
                    "money": crate::db::row_f64(r, "money"),
                })
            })
            .collect();
        Ok(json!({ "by_status": by_status }))
    }

    /// Refund a completed top-up and claw the quota back, in one
    /// transaction. The `status` predicate makes a double refund a
    /// no-op observable as `already_refunded`.
    pub async fn refund_topup(&self, id: i64) -> Result<Value> {
        let topup = self
            .db
            .query_one(
                "SELECT id, user_id, amount, status FROM top_ups WHERE id = ?",
                &[SqlValue::Int(id)],
            )
            .await?
            .ok_or_else(|| SentinelError::NotFound(format!("top-up {id}")))?;

        let user_id = row_i64(&topup, "user_id");
        let amount = row_i64(&topup, "amount");

        let states = REFUNDABLE_STATES
            .iter()
            .map(|s| format!("'{s}'"))
            .collect::<Vec<_>>()
            .join(",");

        let mut tx = self.db.begin().await?;
        let affected = tx
            .execute(
                &format!(
                    "UPDATE top_ups SET status = 'REFUNDED' \
                     WHERE id = ? AND status IN ({states})"
                ),
                &[SqlValue::Int(id)],
            )
            .await?;

        if affected == 0 {
            // Already refunded, failed or pending; nothing to undo.
            drop(tx);
            return Ok(json!({
                "refunded": false,
                "message": "already refunded or not refundable",
                "status": row_string(&topup, "status"),
            }));
        }

        tx.execute(
            "UPDATE users SET quota = GREATEST(quota - ?, 0) WHERE id = ?",
            &[SqlValue::Int(amount), SqlValue::Int(user_id)],
        )
        .await?;
        tx.commit().await?;

        info!(topup_id = id, user_id, amount, "top-up refunded");
        Ok(json!({
            "refunded": true,
            "user_id": user_id,
            "amount": amount,
        }))
    }

    // -- redemptions -----------------------------------------------------

    pub async fn list_redemptions(
        &self,
        page: usize,
        page_size: usize,
        status: Option<i64>,
    ) -> Result<Value> {
        let (limit, offset) = validate_paging(page, page_size)?;
        let key_col = self.db.quote_ident("key");
        let mut where_sql = String::from("deleted_at IS NULL");
        let mut params: Vec<SqlValue> = Vec::new();
        if let Some(s) = status {
            where_sql.push_str(" AND status = ?");
            params.push(SqlValue::Int(s));
        }

        let total = self
            .db
            .query_one(
                &format!("SELECT COUNT(*) AS n FROM redemptions WHERE {where_sql}"),
                &params,
            )
            .await?
            .map(|r| row_i64(&r, "n"))
            .unwrap_or(0);

        let sql = format!(
            "SELECT id, {key_col} AS redemption_key, name, quota, status, \
                    created_time, expired_time \
             FROM redemptions WHERE {where_sql} ORDER BY id DESC LIMIT ? OFFSET ?"
        );
        params.push(SqlValue::Int(limit));
        params.push(SqlValue::Int(offset));
        let rows = self.db.query(&sql, &params).await?;

        let redemptions: Vec<Value> = rows
            .iter()
            .map(|r| {
                json!({
                    "id": row_i64(r, "id"),
                    "key": row_string(r, "redemption_key"),
                    "name": row_string(r, "name"),
                    "quota": row_i64(r, "quota"),
                    "status": row_i64(r, "status"),
                    "created_time": row_i64(r, "created_time"),
                    "expired_time": row_i64(r, "expired_time"),
                })
            })
            .collect();
        Ok(json!({
            "redemptions": redemptions,
            "total": total,
            "page": page,
            "page_size": page_size,
        }))
    }

    pub async fn delete_redemption(&self, id: i64) -> Result<()> {
        let affected = self
            .db
            .execute(
                "UPDATE redemptions SET deleted_at = CURRENT_TIMESTAMP \
                 WHERE id = ? AND deleted_at IS NULL",
                &[SqlValue::Int(id)],
            )
            .await?;
        if affected == 0 {
            return Err(SentinelError::NotFound(format!("redemption {id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paging_validation() {
        assert!(validate_paging(0, 10).is_err());
        assert!(validate_paging(1, 0).is_err());
        assert!(validate_paging(1, 101).is_err());
        assert_eq!(validate_paging(1, 20).unwrap(), (20, 0));
        assert_eq!(validate_paging(3, 25).unwrap(), (25, 50));
    }

    #[test]
    fn user_sort_whitelist() {
        assert_eq!(user_order("quota"), "quota DESC");
        assert_eq!(user_order("used_quota"), "used_quota DESC");
        assert_eq!(user_order("request_count"), "request_count DESC");
        assert_eq!(user_order("id; DROP TABLE users"), "id ASC");
    }

    #[test]
    fn refundable_states_match_gateway_vocabulary() {
        for s in ["success", "completed", "1"] {
            assert!(REFUNDABLE_STATES.contains(&s));
        }
        assert!(!REFUNDABLE_STATES.contains(&"REFUNDED"));
        assert!(!REFUNDABLE_STATES.contains(&"pending"));
        assert!(!REFUNDABLE_STATES.contains(&"failed"));
    }
}
