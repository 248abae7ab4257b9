use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::cache::CacheManager;
use crate::db::{row_i64, row_string, GatewayDb, SqlValue};
use crate::error::{Result, SentinelError};

/// Slot layout per window: (slot seconds, slot count).
const SLOT_SPECS: &[(&str, i64, i64)] = &[
    ("1h", 60, 60),
    ("6h", 900, 24),
    ("12h", 1800, 24),
    ("24h", 3600, 24),
];

const TTL_HISTORY: u64 = 30;
const TTL_MODELS: u64 = 300;

/// Display options the dashboard persists. Anything else is rejected.
const CONFIG_KEYS: &[&str] = &[
    "selected",
    "time-window",
    "theme",
    "refresh-interval",
    "sort-mode",
    "custom-order",
];

pub fn slot_spec(window: &str) -> Option<(i64, i64)> {
    SLOT_SPECS
        .iter()
        .find(|(name, _, _)| *name == window)
        .map(|(_, secs, count)| (*secs, *count))
}

/// Color function shared by slots and the aggregate.
pub fn status_color(total: i64, success: i64) -> &'static str {
    if total == 0 {
        return "green";
    }
    let rate = success as f64 * 100.0 / total as f64;
    if rate >= 95.0 {
        "green"
    } else if rate >= 80.0 {
        "yellow"
    } else {
        "red"
    }
}

fn success_rate(total: i64, success: i64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    success as f64 * 100.0 / total as f64
}

/// Per-model slotted success-rate history over fixed windows, plus the
/// uptime-kuma-compatible projection of the same data.
pub struct ModelStatusEngine {
    db: Arc<GatewayDb>,
    cache: Arc<CacheManager>,
}

impl ModelStatusEngine {
    pub fn new(db: Arc<GatewayDb>, cache: Arc<CacheManager>) -> Self {
        Self { db, cache }
    }

    pub fn time_windows(&self) -> Value {
        let windows: Vec<Value> = SLOT_SPECS
            .iter()
            .map(|(name, secs, count)| {
                json!({ "window": name, "slot_seconds": secs, "slot_count": count })
            })
            .collect();
        json!({ "windows": windows })
    }

    /// Models seen in the logs over the last 24 hours.
    pub async fn available_models(&self, no_cache: bool) -> Result<Value> {
        let key = "model_status:models";
        if !no_cache {
            if let Some(hit) = self.cache.get_json::<Value>(key).await {
                return Ok(hit);
            }
        }
        let start = chrono::Utc::now().timestamp() - 86_400;
        let rows = self
            .db
            .query(
                "SELECT model_name, COUNT(*) AS request_count \
                 FROM logs WHERE created_at >= ? AND type IN (2, 5) AND model_name <> '' \
                 GROUP BY model_name ORDER BY request_count DESC",
                &[SqlValue::Int(start)],
            )
            .await?;
        let models: Vec<Value> = rows
            .iter()
            .map(|r| {
                json!({
                    "model_name": row_string(r, "model_name"),
                    "request_count": row_i64(r, "request_count"),
                })
            })
            .collect();
        let value = json!({ "models": models });
        self.cache.set_json(key, &value, TTL_MODELS).await;
        Ok(value)
    }

    /// Slotted history for one model. Slots with no traffic are green.
    pub async fn model_history(&self, model: &str, window: &str) -> Result<Value> {
        let (slot_secs, slot_count) = slot_spec(window).ok_or_else(|| {
            SentinelError::InvalidParam(format!("unknown status window: {window}"))
        })?;
        let key = format!("model_history:{model}:{window}");
        if let Some(hit) = self.cache.get_json::<Value>(&key).await {
            return Ok(hit);
        }

        let end = chrono::Utc::now().timestamp();
        let start = end - slot_secs * slot_count;
        let rows = self
            .db
            .query(
                "SELECT FLOOR((created_at - ?) / ?) AS slot, \
                        COUNT(*) AS total, \
                        SUM(CASE WHEN type = 2 THEN 1 ELSE 0 END) AS success \
                 FROM logs WHERE model_name = ? AND created_at >= ? AND created_at < ? \
                   AND type IN (2, 5) \
                 GROUP BY slot",
                &[
                    SqlValue::Int(start),
                    SqlValue::Int(slot_secs),
                    SqlValue::from(model),
                    SqlValue::Int(start),
                    SqlValue::Int(end),
                ],
            )
            .await?;

        let mut by_slot: std::collections::HashMap<i64, (i64, i64)> = std::collections::HashMap::new();
        for r in &rows {
            by_slot.insert(row_i64(r, "slot"), (row_i64(r, "total"), row_i64(r, "success")));
        }

        let mut agg_total = 0i64;
        let mut agg_success = 0i64;
        let slots: Vec<Value> = (0..slot_count)
            .map(|i| {
                let (total, success) = by_slot.get(&i).copied().unwrap_or((0, 0));
                agg_total += total;
                agg_success += success;
                json!({
                    "slot": i,
                    "start_time": start + i * slot_secs,
                    "end_time": start + (i + 1) * slot_secs,
                    "total_requests": total,
                    "success_count": success,
                    "success_rate": success_rate(total, success),
                    "status": status_color(total, success),
                })
            })
            .collect();

        let value = json!({
            "model_name": model,
            "window": window,
            "slots": slots,
            "total_requests": agg_total,
            "success_count": agg_success,
            "success_rate": success_rate(agg_total, agg_success),
            "current_status": status_color(agg_total, agg_success),
        });
        self.cache.set_json(&key, &value, TTL_HISTORY).await;
        Ok(value)
    }

    pub async fn multi_history(&self, models: &[String], window: &str) -> Result<Value> {
        let mut out = Map::new();
        for model in models {
            out.insert(model.clone(), self.model_history(model, window).await?);
        }
        Ok(Value::Object(out))
    }

    pub async fn all_history(&self, window: &str) -> Result<Value> {
        let available = self.available_models(false).await?;
        let names: Vec<String> = available["models"]
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|m| m["model_name"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        self.multi_history(&names, window).await
    }

    // -- persisted display config ----------------------------------------

    pub async fn get_config(&self, key: &str) -> Result<Value> {
        if !CONFIG_KEYS.contains(&key) {
            return Err(SentinelError::InvalidParam(format!("unknown config key: {key}")));
        }
        let value = self.cache.get(&format!("model_status:config:{key}")).await;
        Ok(json!({ "key": key, "value": value }))
    }

    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        if !CONFIG_KEYS.contains(&key) {
            return Err(SentinelError::InvalidParam(format!("unknown config key: {key}")));
        }
        self.cache.set(&format!("model_status:config:{key}"), value, 0).await;
        Ok(())
    }

    /// Models chosen for the public status page; all models when unset.
    async fn selected_models(&self) -> Result<Vec<String>> {
        if let Some(raw) = self.cache.get("model_status:config:selected").await {
            if let Ok(list) = serde_json::from_str::<Vec<String>>(&raw) {
                if !list.is_empty() {
                    return Ok(list);
                }
            }
        }
        let available = self.available_models(false).await?;
        Ok(available["models"]
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|m| m["model_name"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    // -- uptime-kuma-compatible projection -------------------------------

    /// `GET /api/status-page/:slug` shape: page metadata plus monitor
    /// groups.
    pub async fn kuma_status_page(&self, slug: &str) -> Result<Value> {
        let models = self.selected_models().await?;
        let monitors: Vec<Value> = models
            .iter()
            .enumerate()
            .map(|(i, name)| json!({ "id": i + 1, "name": name, "sendUrl": 0 }))
            .collect();
        Ok(json!({
            "config": {
                "slug": slug,
                "title": "Model Availability",
                "description": "Success-rate history per model",
                "icon": "/icon.svg",
                "published": true,
                "showTags": false,
            },
            "publicGroupList": [{
                "id": 1,
                "name": "Models",
                "weight": 1,
                "monitorList": monitors,
            }],
        }))
    }

    /// Heartbeat arrays keyed by monitor id, 24h window.
    pub async fn kuma_heartbeats(&self, _slug: &str) -> Result<Value> {
        let models = self.selected_models().await?;
        let mut heartbeat_list = Map::new();
        let mut uptime_list = Map::new();
        for (i, model) in models.iter().enumerate() {
            let history = self.model_history(model, "24h").await?;
            let beats: Vec<Value> = history["slots"]
                .as_array()
                .map(|slots| {
                    slots
                        .iter()
                        .map(|s| {
                            let status = s["status"].as_str().unwrap_or("green");
                            let up = match status {
                                "green" => 1,
                                "yellow" => 1,
                                _ => 0,
                            };
                            json!({
                                "status": up,
                                "time": s["end_time"],
                                "msg": "",
                                "ping": Value::Null,
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            let id = (i + 1).to_string();
            heartbeat_list.insert(id.clone(), Value::Array(beats));
            uptime_list.insert(
                format!("{id}_24"),
                json!(history["success_rate"].as_f64().unwrap_or(100.0) / 100.0),
            );
        }
        Ok(json!({
            "heartbeatList": Value::Object(heartbeat_list),
            "uptimeList": Value::Object(uptime_list),
        }))
    }

    /// Shields-style badge payload for the page.
    pub async fn kuma_badge(&self, _slug: &str) -> Result<Value> {
        let summary = self.kuma_summary(_slug).await?;
        let up = summary["up"].as_i64().unwrap_or(0);
        let total = summary["total"].as_i64().unwrap_or(0);
        let color = if total == 0 || up == total {
            "brightgreen"
        } else if up > 0 {
            "yellow"
        } else {
            "red"
        };
        Ok(json!({
            "schemaVersion": 1,
            "label": "models",
            "message": format!("{up}/{total} up"),
            "color": color,
        }))
    }

    pub async fn kuma_summary(&self, _slug: &str) -> Result<Value> {
        let models = self.selected_models().await?;
        let mut up = 0i64;
        let mut degraded = 0i64;
        let mut down = 0i64;
        for model in &models {
            let history = self.model_history(model, "24h").await?;
            match history["current_status"].as_str().unwrap_or("green") {
                "green" => up += 1,
                "yellow" => degraded += 1,
                _ => down += 1,
            }
        }
        Ok(json!({
            "total": models.len(),
            "up": up,
            "degraded": degraded,
            "down": down,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_specs_match_contract() {
        assert_eq!(slot_spec("1h"), Some((60, 60)));
        assert_eq!(slot_spec("6h"), Some((900, 24)));
        assert_eq!(slot_spec("12h"), Some((1800, 24)));
        assert_eq!(slot_spec("24h"), Some((3600, 24)));
        assert_eq!(slot_spec("48h"), None);
        // Every layout covers its window exactly.
        for (name, secs, count) in SLOT_SPECS {
            let total = secs * count;
            let expected = match *name {
                "1h" => 3600,
                "6h" => 21600,
                "12h" => 43200,
                "24h" => 86400,
                _ => unreachable!(),
            };
            assert_eq!(total, expected, "window {name}");
        }
    }

    #[test]
    fn color_thresholds() {
        assert_eq!(status_color(0, 0), "green");
        assert_eq!(status_color(100, 95), "green");
        assert_eq!(status_color(100, 94), "yellow");
        assert_eq!(status_color(100, 80), "yellow");
        assert_eq!(status_color(100, 79), "red");
        assert_eq!(status_color(2, 1), "red");
    }

    #[test]
    fn success_rate_of_empty_slot_is_full() {
        assert_eq!(success_rate(0, 0), 100.0);
        assert_eq!(success_rate(2, 1), 50.0);
    }

    #[test]
    fn config_key_whitelist() {
        for key in ["selected", "time-window", "theme", "refresh-interval", "sort-mode", "custom-order"] {
            assert!(CONFIG_KEYS.contains(&key));
        }
        assert!(!CONFIG_KEYS.contains(&"arbitrary"));
    }
}
