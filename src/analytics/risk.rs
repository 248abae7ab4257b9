use serde::Serialize;
use serde_json::{json, Value};

use crate::db::{build_placeholders, row_f64, row_i64, row_string, SqlValue};
use crate::error::{Result, SentinelError};

use super::ipswitch::{analyze_checkins, analyze_ip_switches, derive_flags, FlagInputs};
use super::{now_ts, Analytics};

/// Cap on the raw log events fed to the IP-switch analyzer.
const IP_EVENT_CAP: i64 = 5_000;

/// Log-derived features for one user over a window. Shared between the
/// risk-analysis endpoint and the AI-ban pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct UserFeatures {
    pub user_id: i64,
    pub username: String,
    pub window_seconds: i64,
    pub total_requests: i64,
    pub success_requests: i64,
    pub failure_requests: i64,
    pub failure_rate: f64,
    pub empty_rate: f64,
    pub requests_per_minute: f64,
    pub avg_quota_per_request: f64,
    pub avg_use_time: f64,
    pub quota_used: i64,
    pub unique_ips: i64,
    pub unique_tokens: i64,
    pub flags: Vec<String>,
    pub whitelisted: bool,
    pub checkin_count: i64,
}

impl Analytics {
    async fn user_row(&self, user_id: i64) -> Result<crate::db::Row> {
        self.db
            .query_one(
                "SELECT id, username, display_name, email, status, quota, used_quota, \
                        inviter_id, request_count, linux_do_id \
                 FROM users WHERE id = ?",
                &[SqlValue::Int(user_id)],
            )
            .await?
            .ok_or_else(|| SentinelError::NotFound(format!("user {user_id}")))
    }

    async fn ip_events(&self, user_id: i64, start: i64, end: i64) -> Result<Vec<(i64, String)>> {
        let rows = self
            .db
            .query(
                "SELECT created_at, ip FROM logs \
                 WHERE user_id = ? AND created_at >= ? AND created_at <= ? AND ip <> '' \
                 ORDER BY created_at ASC LIMIT ?",
                &[
                    SqlValue::Int(user_id),
                    SqlValue::Int(start),
                    SqlValue::Int(end),
                    SqlValue::Int(IP_EVENT_CAP),
                ],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|r| (row_i64(r, "created_at"), row_string(r, "ip")))
            .collect())
    }

    /// Feature extraction shared with the AI-ban pipeline.
    pub async fn user_features(&self, user_id: i64, window_secs: i64) -> Result<UserFeatures> {
        let end = now_ts();
        let start = end - window_secs;
        let user = self.user_row(user_id).await?;

        let summary = self
            .db
            .query_one(
                "SELECT COUNT(*) AS total, \
                        SUM(CASE WHEN type = 2 THEN 1 ELSE 0 END) AS success, \
                        SUM(CASE WHEN type = 5 THEN 1 ELSE 0 END) AS failures, \
                        SUM(CASE WHEN type = 2 AND completion_tokens = 0 THEN 1 ELSE 0 END) AS empty_completions, \
                        COALESCE(SUM(CASE WHEN type = 2 THEN quota ELSE 0 END), 0) AS quota_used, \
                        COALESCE(AVG(use_time), 0) AS avg_use_time, \
                        COUNT(DISTINCT ip) AS unique_ips, \
                        COUNT(DISTINCT token_id) AS unique_tokens \
                 FROM logs WHERE user_id = ? AND created_at >= ? AND created_at <= ? \
                   AND type IN (2, 5)",
                &[SqlValue::Int(user_id), SqlValue::Int(start), SqlValue::Int(end)],
            )
            .await?
            .unwrap_or_default();

        let total = row_i64(&summary, "total");
        let success = row_i64(&summary, "success");
        let failures = row_i64(&summary, "failures");
        let empty = row_i64(&summary, "empty_completions");
        let quota_used = row_i64(&summary, "quota_used");
        let failure_rate = if total > 0 { failures as f64 / total as f64 } else { 0.0 };
        let empty_rate = if success > 0 { empty as f64 / success as f64 } else { 0.0 };
        let rpm = total as f64 / (window_secs as f64 / 60.0);
        let avg_quota = if total > 0 { quota_used as f64 / total as f64 } else { 0.0 };

        let events = self.ip_events(user_id, start, end).await?;
        let switches = analyze_ip_switches(&events);

        let checkin_count = if self.has_checkins().await {
            self.db
                .query_one(
                    "SELECT COUNT(*) AS n FROM checkins WHERE user_id = ? AND created_at >= ?",
                    &[SqlValue::Int(user_id), SqlValue::Int(start)],
                )
                .await?
                .map(|r| row_i64(&r, "n"))
                .unwrap_or(0)
        } else {
            0
        };
        let checkin = analyze_checkins(checkin_count, total);

        let inputs = FlagInputs {
            requests_per_minute: rpm,
            unique_ips: row_i64(&summary, "unique_ips") as usize,
            total_requests: total,
            failure_rate,
        };
        let flags = derive_flags(&switches, &inputs, Some(&checkin));

        let whitelisted = self.local.whitelist_contains(user_id, end).await?;

        Ok(UserFeatures {
            user_id,
            username: row_string(&user, "username"),
            window_seconds: window_secs,
            total_requests: total,
            success_requests: success,
            failure_requests: failures,
            failure_rate,
            empty_rate,
            requests_per_minute: rpm,
            avg_quota_per_request: avg_quota,
            avg_use_time: row_f64(&summary, "avg_use_time"),
            quota_used,
            unique_ips: row_i64(&summary, "unique_ips"),
            unique_tokens: row_i64(&summary, "unique_tokens"),
            flags,
            whitelisted,
            checkin_count,
        })
    }

    /// Full risk report for one user: profile, traffic summary, risk
    /// indicators, breakdowns and recent raw logs.
    pub async fn user_analysis(
        &self,
        user_id: i64,
        window_secs: i64,
        end_time: Option<i64>,
    ) -> Result<Value> {
        let end = end_time.unwrap_or_else(now_ts);
        let start = end - window_secs;
        let user = self.user_row(user_id).await?;

        let features = self.user_features(user_id, window_secs).await?;
        let events = self.ip_events(user_id, start, end).await?;
        let switches = analyze_ip_switches(&events);
        let checkin = analyze_checkins(features.checkin_count, features.total_requests);

        let window_params = [
            SqlValue::Int(user_id),
            SqlValue::Int(start),
            SqlValue::Int(end),
        ];

        let top_models = self
            .db
            .query(
                "SELECT model_name, COUNT(*) AS request_count, \
                        COALESCE(SUM(quota), 0) AS quota_used \
                 FROM logs WHERE user_id = ? AND created_at >= ? AND created_at <= ? \
                   AND type = 2 \
                 GROUP BY model_name ORDER BY request_count DESC LIMIT 10",
                &window_params,
            )
            .await?;
        let top_channels = self
            .db
            .query(
                "SELECT channel_id, channel_name, COUNT(*) AS request_count, \
                        COALESCE(SUM(quota), 0) AS quota_used \
                 FROM logs WHERE user_id = ? AND created_at >= ? AND created_at <= ? \
                   AND type = 2 \
                 GROUP BY channel_id, channel_name ORDER BY request_count DESC LIMIT 10",
                &window_params,
            )
            .await?;
        let top_ips = self
            .db
            .query(
                "SELECT ip, COUNT(*) AS request_count \
                 FROM logs WHERE user_id = ? AND created_at >= ? AND created_at <= ? \
                   AND ip <> '' \
                 GROUP BY ip ORDER BY request_count DESC LIMIT 10",
                &window_params,
            )
            .await?;
        let recent = self
            .db
            .query(
                "SELECT id, model_name, type, quota, prompt_tokens, completion_tokens, \
                        use_time, ip, created_at \
                 FROM logs WHERE user_id = ? AND created_at >= ? AND created_at <= ? \
                 ORDER BY created_at DESC LIMIT 20",
                &window_params,
            )
            .await?;

        let top_ips_json: Vec<Value> = top_ips
            .iter()
            .map(|r| {
                let ip = row_string(r, "ip");
                json!({
                    "ip": ip,
                    "request_count": row_i64(r, "request_count"),
                    "location": self.geoip.lookup(&ip),
                })
            })
            .collect();

        Ok(json!({
            "user": {
                "id": row_i64(&user, "id"),
                "username": row_string(&user, "username"),
                "display_name": row_string(&user, "display_name"),
                "email": row_string(&user, "email"),
                "status": row_i64(&user, "status"),
                "quota": row_i64(&user, "quota"),
                "used_quota": row_i64(&user, "used_quota"),
                "inviter_id": row_i64(&user, "inviter_id"),
                "linux_do_id": row_string(&user, "linux_do_id"),
            },
            "summary": {
                "total_requests": features.total_requests,
                "success_requests": features.success_requests,
                "failure_requests": features.failure_requests,
                "failure_rate": features.failure_rate,
                "empty_rate": features.empty_rate,
                "avg_use_time": features.avg_use_time,
                "quota_used": features.quota_used,
                "unique_ips": features.unique_ips,
                "unique_tokens": features.unique_tokens,
            },
            "risk": {
                "requests_per_minute": features.requests_per_minute,
                "avg_quota_per_request": features.avg_quota_per_request,
                "risk_flags": features.flags,
                "whitelisted": features.whitelisted,
                "ip_switch_analysis": switches,
                "checkin_analysis": if self.has_checkins().await {
                    serde_json::to_value(&checkin)?
                } else {
                    Value::Null
                },
            },
            "top_models": top_models.iter().map(|r| json!({
                "model_name": row_string(r, "model_name"),
                "request_count": row_i64(r, "request_count"),
                "quota_used": row_i64(r, "quota_used"),
            })).collect::<Vec<_>>(),
            "top_channels": top_channels.iter().map(|r| json!({
                "channel_id": row_i64(r, "channel_id"),
                "channel_name": row_string(r, "channel_name"),
                "request_count": row_i64(r, "request_count"),
                "quota_used": row_i64(r, "quota_used"),
            })).collect::<Vec<_>>(),
            "top_ips": top_ips_json,
            "recent_logs": recent.iter().map(|r| json!({
                "id": row_i64(r, "id"),
                "model_name": row_string(r, "model_name"),
                "type": row_i64(r, "type"),
                "quota": row_i64(r, "quota"),
                "prompt_tokens": row_i64(r, "prompt_tokens"),
                "completion_tokens": row_i64(r, "completion_tokens"),
                "use_time": row_i64(r, "use_time"),
                "ip": row_string(r, "ip"),
                "created_at": row_i64(r, "created_at"),
            })).collect::<Vec<_>>(),
            "range": { "start": start, "end": end, "window_seconds": window_secs },
        }))
    }

    /// Users spreading their traffic thinly across many tokens.
    pub async fn token_rotation(
        &self,
        window_secs: i64,
        min_tokens: i64,
        max_per_token: f64,
        limit: usize,
    ) -> Result<Value> {
        let start = now_ts() - window_secs;
        let rows = self
            .db
            .query(
                "SELECT t.user_id, t.token_count, t.total_requests, u.username \
                 FROM (SELECT user_id, COUNT(DISTINCT token_id) AS token_count, \
                              COUNT(*) AS total_requests \
                       FROM logs WHERE created_at >= ? \
                       GROUP BY user_id \
                       HAVING COUNT(DISTINCT token_id) >= ? \
                          AND (COUNT(*) * 1.0 / COUNT(DISTINCT token_id)) <= ? \
                       ORDER BY token_count DESC LIMIT ?) t \
                 LEFT JOIN users u ON u.id = t.user_id",
                &[
                    SqlValue::Int(start),
                    SqlValue::Int(min_tokens),
                    SqlValue::Float(max_per_token),
                    SqlValue::Int(limit as i64),
                ],
            )
            .await?;
        let users: Vec<Value> = rows
            .iter()
            .map(|r| {
                let token_count = row_i64(r, "token_count");
                let total = row_i64(r, "total_requests");
                let user_id = row_i64(r, "user_id");
                let mut username = row_string(r, "username");
                if username.is_empty() {
                    username = user_id.to_string();
                }
                json!({
                    "user_id": user_id,
                    "username": username,
                    "token_count": token_count,
                    "total_requests": total,
                    "avg_requests_per_token": if token_count > 0 {
                        total as f64 / token_count as f64
                    } else {
                        0.0
                    },
                })
            })
            .collect();
        Ok(json!({
            "users": users,
            "min_tokens": min_tokens,
            "max_requests_per_token": max_per_token,
        }))
    }

    /// Inviters whose referral trees exceed `min_invited` accounts.
    pub async fn affiliated_accounts(&self, min_invited: i64, limit: usize) -> Result<Value> {
        let inviters = self
            .db
            .query(
                "SELECT t.inviter_id, t.invited_count, u.username \
                 FROM (SELECT inviter_id, COUNT(*) AS invited_count \
                       FROM users WHERE inviter_id IS NOT NULL AND inviter_id <> 0 \
                         AND deleted_at IS NULL \
                       GROUP BY inviter_id HAVING COUNT(*) >= ? \
                       ORDER BY invited_count DESC LIMIT ?) t \
                 LEFT JOIN users u ON u.id = t.inviter_id",
                &[SqlValue::Int(min_invited), SqlValue::Int(limit as i64)],
            )
            .await?;

        if inviters.is_empty() {
            return Ok(json!({ "inviters": [], "min_invited": min_invited }));
        }

        let ids: Vec<i64> = inviters.iter().map(|r| row_i64(r, "inviter_id")).collect();
        let placeholders = build_placeholders(self.db.is_pg(), ids.len(), 1);
        let sql = format!(
            "SELECT id, username, status, inviter_id FROM users \
             WHERE inviter_id IN ({placeholders}) AND deleted_at IS NULL"
        );
        let params: Vec<SqlValue> = ids.iter().map(|id| SqlValue::Int(*id)).collect();
        let invited = self.db.query(&sql, &params).await?;

        let mut per_inviter: std::collections::HashMap<i64, Vec<Value>> =
            std::collections::HashMap::new();
        for row in &invited {
            per_inviter
                .entry(row_i64(row, "inviter_id"))
                .or_default()
                .push(json!({
                    "user_id": row_i64(row, "id"),
                    "username": row_string(row, "username"),
                    "status": row_i64(row, "status"),
                }));
        }

        let out: Vec<Value> = inviters
            .iter()
            .map(|r| {
                let inviter_id = row_i64(r, "inviter_id");
                let mut invited = per_inviter.remove(&inviter_id).unwrap_or_default();
                invited.truncate(20);
                json!({
                    "inviter_id": inviter_id,
                    "inviter_username": row_string(r, "username"),
                    "invited_count": row_i64(r, "invited_count"),
                    "invited": invited,
                })
            })
            .collect();
        Ok(json!({ "inviters": out, "min_invited": min_invited }))
    }

    /// IPs from which at least `min_users` accounts made their first
    /// request inside the window.
    pub async fn same_ip_registrations(
        &self,
        window_secs: i64,
        min_users: i64,
        limit: usize,
    ) -> Result<Value> {
        let start = now_ts() - window_secs;
        let rows = self
            .db
            .query(
                "SELECT ip, COUNT(DISTINCT user_id) AS user_count FROM ( \
                     SELECT l.user_id, MIN(l.ip) AS ip \
                     FROM logs l \
                     JOIN (SELECT user_id, MIN(created_at) AS first_ts FROM logs \
                           WHERE created_at >= ? AND ip <> '' GROUP BY user_id) f \
                       ON f.user_id = l.user_id AND f.first_ts = l.created_at \
                     WHERE l.created_at >= ? AND l.ip <> '' \
                     GROUP BY l.user_id \
                 ) firsts \
                 GROUP BY ip HAVING COUNT(DISTINCT user_id) >= ? \
                 ORDER BY user_count DESC LIMIT ?",
                &[
                    SqlValue::Int(start),
                    SqlValue::Int(start),
                    SqlValue::Int(min_users),
                    SqlValue::Int(limit as i64),
                ],
            )
            .await?;
        let groups: Vec<Value> = rows
            .iter()
            .map(|r| {
                let ip = row_string(r, "ip");
                json!({
                    "ip": ip,
                    "user_count": row_i64(r, "user_count"),
                    "location": self.geoip.lookup(&ip),
                })
            })
            .collect();
        Ok(json!({ "groups": groups, "min_users": min_users }))
    }

    /// Scan candidates for the AI-ban pipeline: heaviest users in the
    /// window, busiest first.
    pub async fn suspicious_users(&self, window_secs: i64, limit: usize) -> Result<Value> {
        self.leaderboard_window(window_secs, limit, "COUNT(*)").await
    }
}
