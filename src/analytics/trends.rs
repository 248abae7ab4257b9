use std::collections::HashMap;

use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::{json, Value};

use crate::db::{row_i64, SqlValue};
use crate::error::{Result, SentinelError};

use super::{now_ts, Analytics, TTL_DAILY, TTL_HOURLY};

/// Fallback daily scans never reach past this bound.
const FALLBACK_SCAN_SECS: i64 = 30 * 86_400;

#[derive(Debug, Default, Clone, Copy)]
struct BucketAgg {
    requests: i64,
    quota: i64,
    prompt_tokens: i64,
    completion_tokens: i64,
}

/// Bucket index of `ts` in the configured zone. The same expression the
/// SQL uses, so code-side fill matches the grouping exactly.
fn bucket_index(ts: i64, tz_offset: i64, bucket_secs: i64) -> i64 {
    (ts + tz_offset).div_euclid(bucket_secs)
}

fn bucket_label(bucket: i64, bucket_secs: i64, tz_offset: i64, tz: Tz, fmt: &str) -> String {
    let ts = bucket * bucket_secs - tz_offset;
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.with_timezone(&tz).format(fmt).to_string())
        .unwrap_or_default()
}

fn fill_series(
    found: &HashMap<i64, BucketAgg>,
    first_bucket: i64,
    count: i64,
    bucket_secs: i64,
    tz_offset: i64,
    tz: Tz,
    fmt: &str,
    label_key: &str,
) -> Vec<Value> {
    (0..count)
        .map(|i| {
            let bucket = first_bucket + i;
            let agg = found.get(&bucket).copied().unwrap_or_default();
            json!({
                label_key: bucket_label(bucket, bucket_secs, tz_offset, tz, fmt),
                "request_count": agg.requests,
                "quota_used": agg.quota,
                "prompt_tokens": agg.prompt_tokens,
                "completion_tokens": agg.completion_tokens,
            })
        })
        .collect()
}

impl Analytics {
    /// Daily request/quota series for the `days` calendar days ending
    /// today in the configured zone. Missing days are zero-filled.
    pub async fn daily_trends(&self, days: u32) -> Result<Value> {
        if !(1..=90).contains(&days) {
            return Err(SentinelError::InvalidParam(format!(
                "days must be within 1..=90, got {days}"
            )));
        }
        let key = format!("dashboard:trends:daily:{days}");
        self.with_cache(&key, TTL_DAILY, false, async {
            let now = now_ts();
            let tz_offset = self.tz_offset(now);
            let bucket_secs = 86_400;
            let current = bucket_index(now, tz_offset, bucket_secs);
            let first = current - i64::from(days) + 1;
            let series_start = first * bucket_secs - tz_offset;

            let (sql, start) = if self.has_quota_data().await {
                (
                    "SELECT FLOOR((created_at + ?) / 86400) AS bucket, \
                            COALESCE(SUM(count), 0) AS requests, \
                            COALESCE(SUM(quota), 0) AS quota, \
                            0 AS prompt_tokens, 0 AS completion_tokens \
                     FROM quota_data WHERE created_at >= ? \
                     GROUP BY bucket ORDER BY bucket",
                    series_start,
                )
            } else {
                (
                    "SELECT FLOOR((created_at + ?) / 86400) AS bucket, \
                            COUNT(*) AS requests, \
                            COALESCE(SUM(quota), 0) AS quota, \
                            COALESCE(SUM(prompt_tokens), 0) AS prompt_tokens, \
                            COALESCE(SUM(completion_tokens), 0) AS completion_tokens \
                     FROM logs WHERE type = 2 AND created_at >= ? \
                     GROUP BY bucket ORDER BY bucket",
                    series_start.max(now - FALLBACK_SCAN_SECS),
                )
            };

            let rows = self
                .db
                .query(sql, &[SqlValue::Int(tz_offset), SqlValue::Int(start)])
                .await?;
            let found = collect_buckets(&rows);

            let trend = fill_series(
                &found,
                first,
                i64::from(days),
                bucket_secs,
                tz_offset,
                self.timezone,
                "%Y-%m-%d",
                "date",
            );
            Ok(json!({ "trend": trend, "days": days }))
        })
        .await
    }

    /// Hourly series for the `hours` clock hours ending now.
    pub async fn hourly_trends(&self, hours: u32) -> Result<Value> {
        if !(1..=168).contains(&hours) {
            return Err(SentinelError::InvalidParam(format!(
                "hours must be within 1..=168, got {hours}"
            )));
        }
        let key = format!("dashboard:trends:hourly:{hours}");
        self.with_cache(&key, TTL_HOURLY, false, async {
            let now = now_ts();
            let tz_offset = self.tz_offset(now);
            let bucket_secs = 3_600;
            let current = bucket_index(now, tz_offset, bucket_secs);
            let first = current - i64::from(hours) + 1;
            let series_start = first * bucket_secs - tz_offset;

            let rows = self
                .db
                .query(
                    "SELECT FLOOR((created_at + ?) / 3600) AS bucket, \
                            COUNT(*) AS requests, \
                            COALESCE(SUM(quota), 0) AS quota, \
                            COALESCE(SUM(prompt_tokens), 0) AS prompt_tokens, \
                            COALESCE(SUM(completion_tokens), 0) AS completion_tokens \
                     FROM logs WHERE type = 2 AND created_at >= ? \
                     GROUP BY bucket ORDER BY bucket",
                    &[SqlValue::Int(tz_offset), SqlValue::Int(series_start)],
                )
                .await?;
            let found = collect_buckets(&rows);

            let trend = fill_series(
                &found,
                first,
                i64::from(hours),
                bucket_secs,
                tz_offset,
                self.timezone,
                "%Y-%m-%d %H:00",
                "hour",
            );
            Ok(json!({ "trend": trend, "hours": hours }))
        })
        .await
    }
}

fn collect_buckets(rows: &[crate::db::Row]) -> HashMap<i64, BucketAgg> {
    rows.iter()
        .map(|r| {
            (
                row_i64(r, "bucket"),
                BucketAgg {
                    requests: row_i64(r, "requests"),
                    quota: row_i64(r, "quota"),
                    prompt_tokens: row_i64(r, "prompt_tokens"),
                    completion_tokens: row_i64(r, "completion_tokens"),
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_index_matches_sql_floor() {
        // 2023-11-14 22:13:20 UTC
        let ts = 1_700_000_000;
        assert_eq!(bucket_index(ts, 0, 3600), ts / 3600);
        // Shanghai (+8) rolls into the next local day at 16:00 UTC.
        let day_utc = bucket_index(ts, 0, 86_400);
        let day_cst = bucket_index(ts, 8 * 3600, 86_400);
        assert_eq!(day_cst, day_utc + 1);
    }

    #[test]
    fn bucket_index_handles_negative_offsets() {
        // Just past UTC midnight with a -5h offset is still the prior
        // local day.
        let ts = 86_400 * 100 + 60;
        let utc_day = bucket_index(ts, 0, 86_400);
        let est_day = bucket_index(ts, -5 * 3600, 86_400);
        assert_eq!(est_day, utc_day - 1);
    }

    #[test]
    fn labels_render_in_zone() {
        // 1700000000 = 2023-11-14 22:13:20 UTC = 2023-11-15 06:13:20 +08.
        let tz: Tz = chrono_tz::Asia::Shanghai;
        let offset = 8 * 3600;
        let bucket = bucket_index(1_700_000_000, offset, 86_400);
        assert_eq!(bucket_label(bucket, 86_400, offset, tz, "%Y-%m-%d"), "2023-11-15");

        let hour_bucket = bucket_index(1_700_000_000, offset, 3600);
        assert_eq!(
            bucket_label(hour_bucket, 3600, offset, tz, "%Y-%m-%d %H:00"),
            "2023-11-15 06:00"
        );
    }

    #[test]
    fn fill_series_zero_fills_gaps() {
        let mut found = HashMap::new();
        found.insert(
            10,
            BucketAgg { requests: 5, quota: 100, prompt_tokens: 50, completion_tokens: 25 },
        );
        let series = fill_series(&found, 9, 3, 3600, 0, chrono_tz::UTC, "%H:00", "hour");
        assert_eq!(series.len(), 3);
        assert_eq!(series[0]["request_count"], 0);
        assert_eq!(series[1]["request_count"], 5);
        assert_eq!(series[1]["quota_used"], 100);
        assert_eq!(series[2]["request_count"], 0);
    }

    #[test]
    fn fill_series_is_chronological() {
        let series = fill_series(&HashMap::new(), 100, 4, 86_400, 0, chrono_tz::UTC, "%Y-%m-%d", "date");
        let dates: Vec<String> =
            series.iter().map(|v| v["date"].as_str().unwrap().to_string()).collect();
        let mut sorted = dates.clone();
        sorted.sort();
        assert_eq!(dates, sorted);
    }
}
