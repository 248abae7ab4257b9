use std::collections::HashMap;

use serde_json::{json, Value};

use crate::db::{build_placeholders, row_i64, row_string, SqlValue};
use crate::error::{Result, SentinelError};

use super::{now_ts, window_seconds, Analytics, TTL_IP_DISTRIBUTION, TTL_IP_MONITOR};

/// Per-IP aggregation cap for the distribution snapshot.
const DISTRIBUTION_IP_CAP: i64 = 3_000;

/// Detail truncation per candidate.
const TOKENS_PER_IP: usize = 20;
const IPS_PER_TOKEN: usize = 20;
const IPS_PER_USER: usize = 10;

/// Country codes counted as domestic traffic.
const DOMESTIC_CODES: &[&str] = &["CN"];

fn parse_window(window: &str) -> Result<i64> {
    window_seconds(window)
        .ok_or_else(|| SentinelError::InvalidParam(format!("unknown window: {window}")))
}

impl Analytics {
    /// Geographic distribution of request traffic: top IPs resolved
    /// through GeoIP and aggregated by country, mainland province and
    /// city.
    pub async fn ip_distribution(&self, window: &str) -> Result<Value> {
        let secs = parse_window(window)?;
        let key = format!("ip:distribution:{window}");
        self.with_cache(&key, TTL_IP_DISTRIBUTION, false, async {
            let start = now_ts() - secs;
            let rows = self
                .db
                .query(
                    "SELECT ip, COUNT(*) AS request_count, COUNT(DISTINCT user_id) AS user_count \
                     FROM logs WHERE created_at >= ? AND ip <> '' AND type IN (2, 5) \
                     GROUP BY ip ORDER BY request_count DESC LIMIT ?",
                    &[SqlValue::Int(start), SqlValue::Int(DISTRIBUTION_IP_CAP)],
                )
                .await?;

            let ips: Vec<String> = rows.iter().map(|r| row_string(r, "ip")).collect();
            let geo = self.geoip.lookup_batch(&ips);

            #[derive(Default)]
            struct Agg {
                requests: i64,
                ips: i64,
                users: i64,
            }
            let mut by_country: HashMap<(String, String), Agg> = HashMap::new();
            let mut by_province: HashMap<String, Agg> = HashMap::new();
            let mut by_city: HashMap<String, Agg> = HashMap::new();
            let mut domestic = 0i64;
            let mut total = 0i64;

            for row in &rows {
                let ip = row_string(row, "ip");
                let requests = row_i64(row, "request_count");
                let users = row_i64(row, "user_count");
                total += requests;
                let Some(res) = geo.get(&ip) else { continue };
                if !res.success {
                    continue;
                }
                if DOMESTIC_CODES.contains(&res.country_code.as_str()) {
                    domestic += requests;
                }
                let entry = by_country
                    .entry((res.country.clone(), res.country_code.clone()))
                    .or_default();
                entry.requests += requests;
                entry.ips += 1;
                entry.users += users;

                if res.country_code == "CN" {
                    if !res.region.is_empty() {
                        let e = by_province.entry(res.region.clone()).or_default();
                        e.requests += requests;
                        e.ips += 1;
                        e.users += users;
                    }
                    if !res.city.is_empty() {
                        let e = by_city.entry(res.city.clone()).or_default();
                        e.requests += requests;
                        e.ips += 1;
                        e.users += users;
                    }
                }
            }

            fn sorted(map: HashMap<String, Agg>, key: &str) -> Vec<Value> {
                let mut list: Vec<_> = map.into_iter().collect();
                list.sort_by(|a, b| b.1.requests.cmp(&a.1.requests));
                list.into_iter()
                    .map(|(name, agg)| {
                        json!({
                            key: name,
                            "request_count": agg.requests,
                            "ip_count": agg.ips,
                            "user_count": agg.users,
                        })
                    })
                    .collect()
            }

            let mut countries: Vec<_> = by_country.into_iter().collect();
            countries.sort_by(|a, b| b.1.requests.cmp(&a.1.requests));
            let countries: Vec<Value> = countries
                .into_iter()
                .map(|((name, code), agg)| {
                    json!({
                        "country": name,
                        "country_code": code,
                        "request_count": agg.requests,
                        "ip_count": agg.ips,
                        "user_count": agg.users,
                    })
                })
                .collect();

            let domestic_pct = if total > 0 {
                domestic as f64 * 100.0 / total as f64
            } else {
                0.0
            };

            Ok(json!({
                "window": window,
                "total_requests": total,
                "ip_count": ips.len(),
                "domestic_percent": domestic_pct,
                "overseas_percent": 100.0 - domestic_pct,
                "countries": countries,
                "provinces": sorted(by_province, "province"),
                "cities": sorted(by_city, "city"),
                "snapshot_at": now_ts(),
            }))
        })
        .await
    }

    /// IPs shared by at least `min_tokens` distinct tokens.
    pub async fn shared_ips(&self, window: &str, min_tokens: i64, limit: usize) -> Result<Value> {
        let secs = parse_window(window)?;
        let key = format!("ip:shared:{window}:{min_tokens}:{limit}");
        self.with_cache(&key, TTL_IP_MONITOR, false, async {
            let start = now_ts() - secs;
            let candidates = self
                .db
                .query(
                    "SELECT ip, COUNT(DISTINCT token_id) AS token_count, \
                            COUNT(DISTINCT user_id) AS user_count, COUNT(*) AS request_count \
                     FROM logs WHERE created_at >= ? AND ip <> '' \
                     GROUP BY ip HAVING COUNT(DISTINCT token_id) >= ? \
                     ORDER BY token_count DESC LIMIT ?",
                    &[
                        SqlValue::Int(start),
                        SqlValue::Int(min_tokens),
                        SqlValue::Int(limit as i64),
                    ],
                )
                .await?;

            if candidates.is_empty() {
                return Ok(json!({ "window": window, "shared_ips": [] }));
            }

            let ips: Vec<String> = candidates.iter().map(|r| row_string(r, "ip")).collect();
            let placeholders = build_placeholders(self.db.is_pg(), ips.len(), 2);
            let sql = format!(
                "SELECT ip, token_id, token_name, user_id, username, COUNT(*) AS request_count \
                 FROM logs WHERE created_at >= ? AND ip IN ({placeholders}) \
                 GROUP BY ip, token_id, token_name, user_id, username"
            );
            let mut params = vec![SqlValue::Int(start)];
            params.extend(ips.iter().map(|ip| SqlValue::from(ip.clone())));
            let details = self.db.query(&sql, &params).await?;

            let mut per_ip: HashMap<String, Vec<Value>> = HashMap::new();
            for row in &details {
                per_ip.entry(row_string(row, "ip")).or_default().push(json!({
                    "token_id": row_i64(row, "token_id"),
                    "token_name": row_string(row, "token_name"),
                    "user_id": row_i64(row, "user_id"),
                    "username": row_string(row, "username"),
                    "request_count": row_i64(row, "request_count"),
                }));
            }

            let shared: Vec<Value> = candidates
                .iter()
                .map(|r| {
                    let ip = row_string(r, "ip");
                    let mut tokens = per_ip.remove(&ip).unwrap_or_default();
                    tokens.sort_by_key(|v| -v["request_count"].as_i64().unwrap_or(0));
                    tokens.truncate(TOKENS_PER_IP);
                    let geo = self.geoip.lookup(&ip);
                    json!({
                        "ip": ip,
                        "token_count": row_i64(r, "token_count"),
                        "user_count": row_i64(r, "user_count"),
                        "request_count": row_i64(r, "request_count"),
                        "location": geo,
                        "tokens": tokens,
                    })
                })
                .collect();
            Ok(json!({ "window": window, "shared_ips": shared }))
        })
        .await
    }

    /// Tokens observed from at least `min_ips` distinct IPs.
    pub async fn multi_ip_tokens(&self, window: &str, min_ips: i64, limit: usize) -> Result<Value> {
        let secs = parse_window(window)?;
        let key = format!("ip:multi_tokens:{window}:{min_ips}:{limit}");
        self.with_cache(&key, TTL_IP_MONITOR, false, async {
            let start = now_ts() - secs;
            let candidates = self
                .db
                .query(
                    "SELECT token_id, token_name, user_id, username, \
                            COUNT(DISTINCT ip) AS ip_count, COUNT(*) AS request_count \
                     FROM logs WHERE created_at >= ? AND ip <> '' \
                     GROUP BY token_id, token_name, user_id, username \
                     HAVING COUNT(DISTINCT ip) >= ? \
                     ORDER BY ip_count DESC LIMIT ?",
                    &[
                        SqlValue::Int(start),
                        SqlValue::Int(min_ips),
                        SqlValue::Int(limit as i64),
                    ],
                )
                .await?;

            if candidates.is_empty() {
                return Ok(json!({ "window": window, "tokens": [] }));
            }

            let ids: Vec<i64> = candidates.iter().map(|r| row_i64(r, "token_id")).collect();
            let placeholders = build_placeholders(self.db.is_pg(), ids.len(), 2);
            let sql = format!(
                "SELECT token_id, ip, COUNT(*) AS request_count, MAX(created_at) AS last_seen \
                 FROM logs WHERE created_at >= ? AND token_id IN ({placeholders}) AND ip <> '' \
                 GROUP BY token_id, ip"
            );
            let mut params = vec![SqlValue::Int(start)];
            params.extend(ids.iter().map(|id| SqlValue::Int(*id)));
            let details = self.db.query(&sql, &params).await?;

            let mut per_token: HashMap<i64, Vec<Value>> = HashMap::new();
            for row in &details {
                per_token.entry(row_i64(row, "token_id")).or_default().push(json!({
                    "ip": row_string(row, "ip"),
                    "request_count": row_i64(row, "request_count"),
                    "last_seen": row_i64(row, "last_seen"),
                }));
            }

            let tokens: Vec<Value> = candidates
                .iter()
                .map(|r| {
                    let token_id = row_i64(r, "token_id");
                    let mut ips = per_token.remove(&token_id).unwrap_or_default();
                    ips.sort_by_key(|v| -v["request_count"].as_i64().unwrap_or(0));
                    ips.truncate(IPS_PER_TOKEN);
                    json!({
                        "token_id": token_id,
                        "token_name": row_string(r, "token_name"),
                        "user_id": row_i64(r, "user_id"),
                        "username": row_string(r, "username"),
                        "ip_count": row_i64(r, "ip_count"),
                        "request_count": row_i64(r, "request_count"),
                        "ips": ips,
                    })
                })
                .collect();
            Ok(json!({ "window": window, "tokens": tokens }))
        })
        .await
    }

    /// Users observed from at least `min_ips` distinct IPs.
    pub async fn multi_ip_users(&self, window: &str, min_ips: i64, limit: usize) -> Result<Value> {
        let secs = parse_window(window)?;
        let key = format!("ip:multi_users:{window}:{min_ips}:{limit}");
        self.with_cache(&key, TTL_IP_MONITOR, false, async {
            let start = now_ts() - secs;
            let candidates = self
                .db
                .query(
                    "SELECT user_id, username, COUNT(DISTINCT ip) AS ip_count, \
                            COUNT(*) AS request_count \
                     FROM logs WHERE created_at >= ? AND ip <> '' \
                     GROUP BY user_id, username \
                     HAVING COUNT(DISTINCT ip) >= ? \
                     ORDER BY ip_count DESC LIMIT ?",
                    &[
                        SqlValue::Int(start),
                        SqlValue::Int(min_ips),
                        SqlValue::Int(limit as i64),
                    ],
                )
                .await?;

            if candidates.is_empty() {
                return Ok(json!({ "window": window, "users": [] }));
            }

            let ids: Vec<i64> = candidates.iter().map(|r| row_i64(r, "user_id")).collect();
            let placeholders = build_placeholders(self.db.is_pg(), ids.len(), 2);
            let sql = format!(
                "SELECT user_id, ip, COUNT(*) AS request_count, MAX(created_at) AS last_seen \
                 FROM logs WHERE created_at >= ? AND user_id IN ({placeholders}) AND ip <> '' \
                 GROUP BY user_id, ip"
            );
            let mut params = vec![SqlValue::Int(start)];
            params.extend(ids.iter().map(|id| SqlValue::Int(*id)));
            let details = self.db.query(&sql, &params).await?;

            let mut per_user: HashMap<i64, Vec<Value>> = HashMap::new();
            for row in &details {
                per_user.entry(row_i64(row, "user_id")).or_default().push(json!({
                    "ip": row_string(row, "ip"),
                    "request_count": row_i64(row, "request_count"),
                    "last_seen": row_i64(row, "last_seen"),
                }));
            }

            let users: Vec<Value> = candidates
                .iter()
                .map(|r| {
                    let user_id = row_i64(r, "user_id");
                    let mut ips = per_user.remove(&user_id).unwrap_or_default();
                    ips.sort_by_key(|v| -v["request_count"].as_i64().unwrap_or(0));
                    ips.truncate(IPS_PER_USER);
                    json!({
                        "user_id": user_id,
                        "username": row_string(r, "username"),
                        "ip_count": row_i64(r, "ip_count"),
                        "request_count": row_i64(r, "request_count"),
                        "ips": ips,
                    })
                })
                .collect();
            Ok(json!({ "window": window, "users": users }))
        })
        .await
    }

    /// Every IP a user was seen from in the window, geo-enriched.
    pub async fn user_ips(&self, user_id: i64, window: &str) -> Result<Value> {
        let secs = parse_window(window)?;
        let start = now_ts() - secs;
        let rows = self
            .db
            .query(
                "SELECT ip, COUNT(*) AS request_count, \
                        MIN(created_at) AS first_seen, MAX(created_at) AS last_seen \
                 FROM logs WHERE user_id = ? AND created_at >= ? AND ip <> '' \
                 GROUP BY ip ORDER BY request_count DESC",
                &[SqlValue::Int(user_id), SqlValue::Int(start)],
            )
            .await?;
        let ips: Vec<Value> = rows
            .iter()
            .map(|r| {
                let ip = row_string(r, "ip");
                let geo = self.geoip.lookup(&ip);
                json!({
                    "ip": ip,
                    "request_count": row_i64(r, "request_count"),
                    "first_seen": row_i64(r, "first_seen"),
                    "last_seen": row_i64(r, "last_seen"),
                    "location": geo,
                })
            })
            .collect();
        Ok(json!({ "user_id": user_id, "window": window, "ips": ips }))
    }

    /// Who is behind a given IP (last 24 hours).
    pub async fn ip_users(&self, ip: &str) -> Result<Value> {
        let start = now_ts() - 86_400;
        let rows = self
            .db
            .query(
                "SELECT user_id, username, COUNT(*) AS request_count, \
                        MIN(created_at) AS first_seen, MAX(created_at) AS last_seen \
                 FROM logs WHERE ip = ? AND created_at >= ? \
                 GROUP BY user_id, username ORDER BY request_count DESC",
                &[SqlValue::from(ip), SqlValue::Int(start)],
            )
            .await?;
        let users: Vec<Value> = rows
            .iter()
            .map(|r| {
                json!({
                    "user_id": row_i64(r, "user_id"),
                    "username": row_string(r, "username"),
                    "request_count": row_i64(r, "request_count"),
                    "first_seen": row_i64(r, "first_seen"),
                    "last_seen": row_i64(r, "last_seen"),
                })
            })
            .collect();
        Ok(json!({
            "ip": ip,
            "location": self.geoip.lookup(ip),
            "users": users,
        }))
    }

    /// Headline numbers for the IP monitoring page.
    pub async fn ip_stats(&self) -> Result<Value> {
        let start = now_ts() - 86_400;
        let traffic = self
            .db
            .query_one(
                "SELECT COUNT(DISTINCT ip) AS distinct_ips, COUNT(*) AS logs_with_ip \
                 FROM logs WHERE created_at >= ? AND ip <> ''",
                &[SqlValue::Int(start)],
            )
            .await?
            .unwrap_or_default();

        let recording = self
            .db
            .query_one(
                &format!(
                    "SELECT COALESCE(SUM(CASE WHEN COALESCE({extract}, 'false') = 'true' \
                                          THEN 1 ELSE 0 END), 0) AS enabled, \
                            COALESCE(SUM(CASE WHEN request_count < 0 THEN 1 ELSE 0 END), 0) AS disabled \
                     FROM users WHERE deleted_at IS NULL",
                    extract = self.db.record_ip_extract_sql()
                ),
                &[],
            )
            .await?
            .unwrap_or_default();

        Ok(json!({
            "distinct_ips_24h": row_i64(&traffic, "distinct_ips"),
            "logs_with_ip_24h": row_i64(&traffic, "logs_with_ip"),
            "recording_enabled_users": row_i64(&recording, "enabled"),
            "recording_disabled_users": row_i64(&recording, "disabled"),
            "geoip_available": self.geoip.is_available(),
        }))
    }
}
