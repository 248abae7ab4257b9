use serde_json::{json, Map, Value};

use crate::db::{row_i64, row_string, SqlValue};
use crate::error::{Result, SentinelError};

use super::{now_ts, window_seconds, Analytics, TTL_LEADERBOARD};

/// Whitelisted sort keys mapped to full ORDER BY expressions. The
/// expression is repeated rather than aliased because Postgres rejects
/// alias arithmetic in ORDER BY.
fn order_expr(sort_by: &str) -> Option<&'static str> {
    match sort_by {
        "requests" => Some("COUNT(*)"),
        "quota" => Some("COALESCE(SUM(CASE WHEN type = 2 THEN quota ELSE 0 END), 0)"),
        "failure_rate" => {
            Some("(SUM(CASE WHEN type = 5 THEN 1 ELSE 0 END) * 1.0 / COUNT(*))")
        }
        _ => None,
    }
}

impl Analytics {
    /// Per-user activity leaderboards across one or more windows.
    pub async fn leaderboards(
        &self,
        windows: &[String],
        limit: usize,
        sort_by: &str,
    ) -> Result<Value> {
        let order = order_expr(sort_by).ok_or_else(|| {
            SentinelError::InvalidParam(format!("unknown sort_by: {sort_by}"))
        })?;
        for w in windows {
            if window_seconds(w).is_none() {
                return Err(SentinelError::InvalidParam(format!("unknown window: {w}")));
            }
        }

        let key = format!("risk:leaderboard:{}:{limit}:{sort_by}", windows.join(","));
        self.with_cache(&key, TTL_LEADERBOARD, false, async {
            let mut boards = Map::new();
            for w in windows {
                let secs = window_seconds(w).unwrap_or(3_600);
                boards.insert(w.clone(), self.leaderboard_window(secs, limit, order).await?);
            }
            Ok(json!({
                "leaderboards": Value::Object(boards),
                "limit": limit,
                "sort_by": sort_by,
                "generated_at": now_ts(),
            }))
        })
        .await
    }

    pub(crate) async fn leaderboard_window(
        &self,
        window_secs: i64,
        limit: usize,
        order: &str,
    ) -> Result<Value> {
        let start = now_ts() - window_secs;
        let sql = format!(
            "SELECT t.user_id, t.request_count, t.failure_requests, t.quota_used, \
                    t.prompt_tokens, t.completion_tokens, t.unique_ips, \
                    u.username, u.display_name \
             FROM (SELECT user_id, COUNT(*) AS request_count, \
                          SUM(CASE WHEN type = 5 THEN 1 ELSE 0 END) AS failure_requests, \
                          COALESCE(SUM(CASE WHEN type = 2 THEN quota ELSE 0 END), 0) AS quota_used, \
                          COALESCE(SUM(prompt_tokens), 0) AS prompt_tokens, \
                          COALESCE(SUM(completion_tokens), 0) AS completion_tokens, \
                          COUNT(DISTINCT ip) AS unique_ips \
                   FROM logs WHERE created_at >= ? AND type IN (2, 5) \
                   GROUP BY user_id \
                   ORDER BY {order} DESC LIMIT ?) t \
             LEFT JOIN users u ON u.id = t.user_id"
        );
        let rows = self
            .db
            .query(&sql, &[SqlValue::Int(start), SqlValue::Int(limit as i64)])
            .await?;

        let entries: Vec<Value> = rows
            .iter()
            .map(|r| {
                let user_id = row_i64(r, "user_id");
                let total = row_i64(r, "request_count");
                let failures = row_i64(r, "failure_requests");
                let failure_rate = if total > 0 {
                    failures as f64 / total as f64
                } else {
                    0.0
                };
                let mut username = row_string(r, "username");
                if username.is_empty() {
                    username = user_id.to_string();
                }
                json!({
                    "user_id": user_id,
                    "username": username,
                    "display_name": row_string(r, "display_name"),
                    "request_count": total,
                    "failure_requests": failures,
                    "failure_rate": failure_rate,
                    "quota_used": row_i64(r, "quota_used"),
                    "prompt_tokens": row_i64(r, "prompt_tokens"),
                    "completion_tokens": row_i64(r, "completion_tokens"),
                    "unique_ips": row_i64(r, "unique_ips"),
                })
            })
            .collect();
        Ok(Value::Array(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_whitelist_rejects_injection() {
        assert!(order_expr("requests").is_some());
        assert!(order_expr("quota").is_some());
        assert!(order_expr("failure_rate").is_some());
        assert!(order_expr("quota; DROP TABLE logs").is_none());
        assert!(order_expr("").is_none());
    }
}
