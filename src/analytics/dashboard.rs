use serde_json::{json, Value};
use tracing::warn;

use crate::db::{row_f64, row_i64, row_string, SqlValue};
use crate::error::{Result, SentinelError};

use super::{now_ts, period_seconds, Analytics, TTL_CHANNELS, TTL_MODELS, TTL_OVERVIEW, TTL_TOP_USERS, TTL_USAGE};

impl Analytics {
    fn period_start(&self, period: &str) -> Result<i64> {
        let secs = period_seconds(period)
            .ok_or_else(|| SentinelError::InvalidParam(format!("unknown period: {period}")))?;
        Ok(now_ts() - secs)
    }

    /// Entity totals for the dashboard header cards.
    pub async fn overview(&self, period: &str, no_cache: bool) -> Result<Value> {
        self.period_start(period)?;
        let key = format!("dashboard:overview:{period}");
        self.with_cache(&key, TTL_OVERVIEW, no_cache, async {
            let users = self
                .db
                .query_one(
                    "SELECT COUNT(*) AS total, \
                            COALESCE(SUM(CASE WHEN status = 1 THEN 1 ELSE 0 END), 0) AS active \
                     FROM users WHERE deleted_at IS NULL",
                    &[],
                )
                .await?
                .unwrap_or_default();
            let tokens = self
                .db
                .query_one(
                    "SELECT COUNT(*) AS total, \
                            COALESCE(SUM(CASE WHEN status = 1 THEN 1 ELSE 0 END), 0) AS active \
                     FROM tokens WHERE deleted_at IS NULL",
                    &[],
                )
                .await?
                .unwrap_or_default();
            let channels = self
                .db
                .query_one(
                    "SELECT COUNT(*) AS total, \
                            COALESCE(SUM(CASE WHEN status = 1 THEN 1 ELSE 0 END), 0) AS active \
                     FROM channels WHERE deleted_at IS NULL",
                    &[],
                )
                .await?
                .unwrap_or_default();
            let redemptions = self
                .db
                .query_one(
                    "SELECT COUNT(*) AS total, \
                            COALESCE(SUM(CASE WHEN status = 1 THEN 1 ELSE 0 END), 0) AS unused \
                     FROM redemptions WHERE deleted_at IS NULL",
                    &[],
                )
                .await?
                .unwrap_or_default();

            // Distinct models served by enabled channels; some gateway
            // versions lack `abilities`, which leaves a `models` table.
            let total_models = match self
                .db
                .query_one(
                    "SELECT COUNT(DISTINCT a.model) AS n \
                     FROM abilities a JOIN channels c ON c.id = a.channel_id \
                     WHERE c.status = 1",
                    &[],
                )
                .await
            {
                Ok(Some(row)) => row_i64(&row, "n"),
                Ok(None) => 0,
                Err(e) => {
                    warn!(err = %e, "abilities query failed; falling back to models table");
                    self.db
                        .query_one("SELECT COUNT(*) AS n FROM models", &[])
                        .await?
                        .map(|r| row_i64(&r, "n"))
                        .unwrap_or(0)
                }
            };

            Ok(json!({
                "total_users": row_i64(&users, "total"),
                "active_users": row_i64(&users, "active"),
                "total_tokens": row_i64(&tokens, "total"),
                "active_tokens": row_i64(&tokens, "active"),
                "total_channels": row_i64(&channels, "total"),
                "active_channels": row_i64(&channels, "active"),
                "total_models": total_models,
                "total_redemptions": row_i64(&redemptions, "total"),
                "unused_redemptions": row_i64(&redemptions, "unused"),
                "period": period,
            }))
        })
        .await
    }

    /// Traffic sums over successful requests in the period.
    pub async fn usage(&self, period: &str) -> Result<Value> {
        let start = self.period_start(period)?;
        let key = format!("dashboard:usage:{period}");
        self.with_cache(&key, TTL_USAGE, false, async {
            let row = self
                .db
                .query_one(
                    "SELECT COUNT(*) AS total_requests, \
                            COALESCE(SUM(quota), 0) AS total_quota, \
                            COALESCE(SUM(prompt_tokens), 0) AS prompt_tokens, \
                            COALESCE(SUM(completion_tokens), 0) AS completion_tokens, \
                            COALESCE(AVG(use_time), 0) AS avg_use_time \
                     FROM logs WHERE type = 2 AND created_at >= ?",
                    &[SqlValue::Int(start)],
                )
                .await?
                .unwrap_or_default();
            Ok(json!({
                "total_requests": row_i64(&row, "total_requests"),
                "total_quota_used": row_i64(&row, "total_quota"),
                "total_prompt_tokens": row_i64(&row, "prompt_tokens"),
                "total_completion_tokens": row_i64(&row, "completion_tokens"),
                "average_response_time": row_f64(&row, "avg_use_time"),
                "period": period,
            }))
        })
        .await
    }

    /// Per-model breakdown, busiest first.
    pub async fn model_usage(&self, period: &str, limit: usize) -> Result<Value> {
        let start = self.period_start(period)?;
        let key = format!("dashboard:models:{period}:{limit}");
        self.with_cache(&key, TTL_MODELS, false, async {
            let rows = self
                .db
                .query(
                    "SELECT model_name, COUNT(*) AS request_count, \
                            COALESCE(SUM(quota), 0) AS quota_used, \
                            COALESCE(SUM(prompt_tokens), 0) AS prompt_tokens, \
                            COALESCE(SUM(completion_tokens), 0) AS completion_tokens, \
                            COALESCE(AVG(use_time), 0) AS avg_use_time \
                     FROM logs WHERE type = 2 AND created_at >= ? \
                     GROUP BY model_name ORDER BY request_count DESC LIMIT ?",
                    &[SqlValue::Int(start), SqlValue::Int(limit as i64)],
                )
                .await?;
            let models: Vec<Value> = rows
                .iter()
                .map(|r| {
                    json!({
                        "model_name": row_string(r, "model_name"),
                        "request_count": row_i64(r, "request_count"),
                        "quota_used": row_i64(r, "quota_used"),
                        "prompt_tokens": row_i64(r, "prompt_tokens"),
                        "completion_tokens": row_i64(r, "completion_tokens"),
                        "average_response_time": row_f64(r, "avg_use_time"),
                    })
                })
                .collect();
            Ok(json!({ "models": models, "period": period }))
        })
        .await
    }

    /// Heaviest users by quota. The GROUP BY runs in a subquery so the
    /// users join only touches the winning rows.
    pub async fn top_users(&self, period: &str, limit: usize) -> Result<Value> {
        let start = self.period_start(period)?;
        let key = format!("dashboard:top_users:{period}:{limit}");
        self.with_cache(&key, TTL_TOP_USERS, false, async {
            let sql = if self.has_quota_data().await {
                "SELECT t.user_id, t.request_count, t.quota_used, u.username, u.display_name \
                 FROM (SELECT user_id, COALESCE(SUM(count), 0) AS request_count, \
                              COALESCE(SUM(quota), 0) AS quota_used \
                       FROM quota_data WHERE created_at >= ? \
                       GROUP BY user_id ORDER BY quota_used DESC LIMIT ?) t \
                 LEFT JOIN users u ON u.id = t.user_id \
                 ORDER BY t.quota_used DESC"
            } else {
                "SELECT t.user_id, t.request_count, t.quota_used, u.username, u.display_name \
                 FROM (SELECT user_id, COUNT(*) AS request_count, \
                              COALESCE(SUM(quota), 0) AS quota_used \
                       FROM logs WHERE type = 2 AND created_at >= ? \
                       GROUP BY user_id ORDER BY quota_used DESC LIMIT ?) t \
                 LEFT JOIN users u ON u.id = t.user_id \
                 ORDER BY t.quota_used DESC"
            };
            let rows = self
                .db
                .query(sql, &[SqlValue::Int(start), SqlValue::Int(limit as i64)])
                .await?;
            let ranking: Vec<Value> = rows
                .iter()
                .map(|r| {
                    let user_id = row_i64(r, "user_id");
                    let mut username = row_string(r, "username");
                    if username.is_empty() {
                        username = user_id.to_string();
                    }
                    json!({
                        "user_id": user_id,
                        "username": username,
                        "display_name": row_string(r, "display_name"),
                        "request_count": row_i64(r, "request_count"),
                        "quota_used": row_i64(r, "quota_used"),
                    })
                })
                .collect();
            Ok(json!({ "ranking": ranking, "period": period }))
        })
        .await
    }

    /// Per-channel traffic over the last 24 hours joined to channel
    /// metadata.
    pub async fn channels(&self) -> Result<Value> {
        let start = now_ts() - 86_400;
        self.with_cache("dashboard:channels", TTL_CHANNELS, false, async {
            let rows = self
                .db
                .query(
                    "SELECT t.channel_id, t.request_count, t.quota_used, t.avg_use_time, \
                            c.name, c.type, c.status, c.priority, c.used_quota \
                     FROM (SELECT channel_id, COUNT(*) AS request_count, \
                                  COALESCE(SUM(quota), 0) AS quota_used, \
                                  COALESCE(AVG(use_time), 0) AS avg_use_time \
                           FROM logs WHERE type = 2 AND created_at >= ? \
                           GROUP BY channel_id) t \
                     LEFT JOIN channels c ON c.id = t.channel_id \
                     ORDER BY t.request_count DESC",
                    &[SqlValue::Int(start)],
                )
                .await?;
            let channels: Vec<Value> = rows
                .iter()
                .map(|r| {
                    json!({
                        "channel_id": row_i64(r, "channel_id"),
                        "name": row_string(r, "name"),
                        "type": row_i64(r, "type"),
                        "status": row_i64(r, "status"),
                        "priority": row_i64(r, "priority"),
                        "used_quota": row_i64(r, "used_quota"),
                        "request_count": row_i64(r, "request_count"),
                        "quota_used": row_i64(r, "quota_used"),
                        "average_response_time": row_f64(r, "avg_use_time"),
                    })
                })
                .collect();
            Ok(json!({ "channels": channels }))
        })
        .await
    }
}
