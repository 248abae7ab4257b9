use std::sync::Arc;

use chrono_tz::Tz;
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::cache::CacheManager;
use crate::db::{GatewayDb, LocalStore};
use crate::error::Result;
use crate::geoip::GeoIpService;

mod dashboard;
mod ip;
mod ipswitch;
mod leaderboard;
mod risk;
mod scale;
mod trends;

pub use risk::UserFeatures;

/// Supported analysis windows, in seconds.
pub const WINDOWS: &[(&str, i64)] = &[
    ("1h", 3_600),
    ("3h", 10_800),
    ("6h", 21_600),
    ("12h", 43_200),
    ("24h", 86_400),
    ("3d", 259_200),
    ("7d", 604_800),
    ("14d", 1_209_600),
];

pub fn window_seconds(name: &str) -> Option<i64> {
    WINDOWS.iter().find(|(n, _)| *n == name).map(|(_, s)| *s)
}

/// Periods admit everything a window does plus `30d`.
pub fn period_seconds(name: &str) -> Option<i64> {
    if name == "30d" {
        return Some(30 * 86_400);
    }
    window_seconds(name)
}

// Cache TTLs, in seconds.
pub(crate) const TTL_OVERVIEW: u64 = 180;
pub(crate) const TTL_USAGE: u64 = 180;
pub(crate) const TTL_MODELS: u64 = 180;
pub(crate) const TTL_TOP_USERS: u64 = 180;
pub(crate) const TTL_CHANNELS: u64 = 180;
pub(crate) const TTL_DAILY: u64 = 300;
pub(crate) const TTL_HOURLY: u64 = 120;
pub(crate) const TTL_IP_DISTRIBUTION: u64 = 300;
pub(crate) const TTL_LEADERBOARD: u64 = 180;
pub(crate) const TTL_IP_MONITOR: u64 = 180;

/// The analytical query engine. Every read is cached under a
/// deterministic key; producers run against the gateway database and
/// results are stored only on success so a failed query gets a fresh
/// chance on the next request.
pub struct Analytics {
    pub(crate) db: Arc<GatewayDb>,
    pub(crate) cache: Arc<CacheManager>,
    pub(crate) geoip: Arc<GeoIpService>,
    pub(crate) local: LocalStore,
    pub(crate) timezone: Tz,
    quota_data: OnceCell<bool>,
    checkins: OnceCell<bool>,
}

impl Analytics {
    pub fn new(
        db: Arc<GatewayDb>,
        cache: Arc<CacheManager>,
        geoip: Arc<GeoIpService>,
        local: LocalStore,
        timezone: Tz,
    ) -> Self {
        Self {
            db,
            cache,
            geoip,
            local,
            timezone,
            quota_data: OnceCell::new(),
            checkins: OnceCell::new(),
        }
    }

    /// Whether the pre-aggregated `quota_data` table exists. Detected
    /// once per process; trends and rankings prefer it when present.
    pub(crate) async fn has_quota_data(&self) -> bool {
        *self
            .quota_data
            .get_or_init(|| async { self.db.table_exists("quota_data").await.unwrap_or(false) })
            .await
    }

    pub(crate) async fn has_checkins(&self) -> bool {
        *self
            .checkins
            .get_or_init(|| async { self.db.table_exists("checkins").await.unwrap_or(false) })
            .await
    }

    /// Cache-through wrapper. `no_cache` skips the lookup but still
    /// stores the fresh result.
    pub(crate) async fn with_cache<F>(
        &self,
        key: &str,
        ttl: u64,
        no_cache: bool,
        producer: F,
    ) -> Result<Value>
    where
        F: std::future::Future<Output = Result<Value>>,
    {
        if !no_cache {
            if let Some(hit) = self.cache.get_json::<Value>(key).await {
                return Ok(hit);
            }
        }
        let value = producer.await?;
        self.cache.set_json(key, &value, ttl).await;
        Ok(value)
    }

    /// Advance the `last_log_id` watermark in batches. On first run the
    /// current head is stored as the initial-sync cutoff so the task
    /// never replays the whole history.
    pub async fn sync_log_watermark(&self) -> Result<()> {
        const BATCH: i64 = 1_000;
        const MAX_BATCHES: usize = 5;

        let mut last = match self.local.state_get("last_log_id").await? {
            Some(id) => id,
            None => {
                let head = self
                    .db
                    .query_one("SELECT COALESCE(MAX(id), 0) AS n FROM logs", &[])
                    .await?
                    .map(|r| crate::db::row_i64(&r, "n"))
                    .unwrap_or(0);
                self.local.meta_set("initial_sync_cutoff", head).await?;
                self.local.state_set("last_log_id", head).await?;
                return Ok(());
            }
        };

        let mut processed = 0i64;
        for _ in 0..MAX_BATCHES {
            let rows = self
                .db
                .query(
                    "SELECT id FROM logs WHERE id > ? ORDER BY id ASC LIMIT ?",
                    &[crate::db::SqlValue::Int(last), crate::db::SqlValue::Int(BATCH)],
                )
                .await?;
            if rows.is_empty() {
                break;
            }
            processed += rows.len() as i64;
            last = rows
                .last()
                .map(|r| crate::db::row_i64(r, "id"))
                .unwrap_or(last);
            if (rows.len() as i64) < BATCH {
                break;
            }
        }

        if processed > 0 {
            let total = self.local.state_get("total_processed").await?.unwrap_or(0);
            self.local.state_set("last_log_id", last).await?;
            self.local.state_set("last_processed_at", now_ts()).await?;
            self.local.state_set("total_processed", total + processed).await?;
            tracing::debug!(last_log_id = last, processed, "log watermark advanced");
        }
        Ok(())
    }

    pub(crate) fn tz_offset(&self, unix_ts: i64) -> i64 {
        use chrono::{Offset, TimeZone, Utc};
        let utc = Utc.timestamp_opt(unix_ts, 0).single().unwrap_or_else(Utc::now);
        i64::from(utc.with_timezone(&self.timezone).offset().fix().local_minus_utc())
    }
}

pub(crate) fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_table_is_complete() {
        for (name, secs) in [
            ("1h", 3600),
            ("3h", 10800),
            ("6h", 21600),
            ("12h", 43200),
            ("24h", 86400),
            ("3d", 259200),
            ("7d", 604800),
            ("14d", 1209600),
        ] {
            assert_eq!(window_seconds(name), Some(secs));
        }
        assert_eq!(window_seconds("2h"), None);
        assert_eq!(window_seconds(""), None);
    }

    #[test]
    fn period_admits_30d() {
        assert_eq!(period_seconds("30d"), Some(2_592_000));
        assert_eq!(period_seconds("7d"), Some(604_800));
        assert_eq!(period_seconds("90d"), None);
    }
}
