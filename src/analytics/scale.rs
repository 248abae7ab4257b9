use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::db::{row_i64, SqlValue};
use crate::error::Result;

use super::Analytics;

const SCALE_CACHE_KEY: &str = "app:config:system_scale";
const SCALE_TTL: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemScale {
    Small,
    Medium,
    Large,
    Xlarge,
}

impl SystemScale {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemScale::Small => "small",
            SystemScale::Medium => "medium",
            SystemScale::Large => "large",
            SystemScale::Xlarge => "xlarge",
        }
    }

    pub fn is_large(&self) -> bool {
        matches!(self, SystemScale::Large | SystemScale::Xlarge)
    }

    fn from_logs(total_logs: i64) -> Self {
        if total_logs > 10_000_000 {
            SystemScale::Xlarge
        } else if total_logs > 1_000_000 {
            SystemScale::Large
        } else if total_logs > 100_000 {
            SystemScale::Medium
        } else {
            SystemScale::Small
        }
    }

    fn from_users(total_users: i64) -> Self {
        if total_users > 100_000 {
            SystemScale::Xlarge
        } else if total_users > 10_000 {
            SystemScale::Large
        } else if total_users > 1_000 {
            SystemScale::Medium
        } else {
            SystemScale::Small
        }
    }

    pub fn classify(total_users: i64, total_logs: i64) -> Self {
        Self::from_logs(total_logs).max(Self::from_users(total_users))
    }
}

impl Analytics {
    /// Deployment size classification, used to gate the expensive
    /// warmup phases. Cached durably; `force` recomputes.
    pub async fn system_scale(&self, force: bool) -> Result<Value> {
        self.with_cache(SCALE_CACHE_KEY, SCALE_TTL, force, async {
            let total_users = self
                .db
                .query_one("SELECT COUNT(*) AS n FROM users WHERE deleted_at IS NULL", &[])
                .await?
                .map(|r| row_i64(&r, "n"))
                .unwrap_or(0);

            // COUNT(*) over a billion-row log table can be brutal; fall
            // back to MAX(id) as an upper-bound estimate on timeout.
            let total_logs = match self
                .db
                .query_with_timeout(
                    "SELECT COUNT(*) AS n FROM logs",
                    &[],
                    Duration::from_secs(10),
                )
                .await
            {
                Ok(rows) => rows.first().map(|r| row_i64(r, "n")).unwrap_or(0),
                Err(e) => {
                    warn!(err = %e, "log count timed out; estimating from MAX(id)");
                    self.db
                        .query_one("SELECT COALESCE(MAX(id), 0) AS n FROM logs", &[])
                        .await?
                        .map(|r| row_i64(&r, "n"))
                        .unwrap_or(0)
                }
            };

            let scale = SystemScale::classify(total_users, total_logs);
            Ok(json!({
                "scale": scale.as_str(),
                "total_users": total_users,
                "total_logs": total_logs,
                "detected_at": super::now_ts(),
            }))
        })
        .await
    }

    /// The cached classification as an enum; recomputes when absent.
    pub async fn scale_class(&self) -> SystemScale {
        match self.system_scale(false).await {
            Ok(v) => v["scale"]
                .as_str()
                .and_then(|s| match s {
                    "small" => Some(SystemScale::Small),
                    "medium" => Some(SystemScale::Medium),
                    "large" => Some(SystemScale::Large),
                    "xlarge" => Some(SystemScale::Xlarge),
                    _ => None,
                })
                .unwrap_or(SystemScale::Small),
            Err(e) => {
                warn!(err = %e, "scale detection failed; assuming small");
                SystemScale::Small
            }
        }
    }

    /// Warmup phase 5: prime the heavy user listings that the admin UI
    /// pages through on large deployments.
    pub async fn prime_user_listings(&self) -> Result<()> {
        for order in ["quota", "used_quota", "request_count"] {
            let sql = format!(
                "SELECT id, username, display_name, status, quota, used_quota, request_count \
                 FROM users WHERE deleted_at IS NULL ORDER BY {order} DESC LIMIT ?"
            );
            let rows = self.db.query(&sql, &[SqlValue::Int(100)]).await?;
            let listing: Vec<Value> = rows
                .iter()
                .map(|r| {
                    json!({
                        "id": row_i64(r, "id"),
                        "username": crate::db::row_string(r, "username"),
                        "status": row_i64(r, "status"),
                        "quota": row_i64(r, "quota"),
                        "used_quota": row_i64(r, "used_quota"),
                        "request_count": row_i64(r, "request_count"),
                    })
                })
                .collect();
            let key = format!("dashboard:user_listing:{order}");
            self.cache.set_json(&key, &listing, 300).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_thresholds() {
        assert_eq!(SystemScale::classify(0, 50_000), SystemScale::Small);
        assert_eq!(SystemScale::classify(0, 100_001), SystemScale::Medium);
        assert_eq!(SystemScale::classify(0, 1_000_001), SystemScale::Large);
        assert_eq!(SystemScale::classify(0, 10_000_001), SystemScale::Xlarge);
    }

    #[test]
    fn user_thresholds_can_bump_the_class() {
        assert_eq!(SystemScale::classify(20_000, 0), SystemScale::Large);
        assert_eq!(SystemScale::classify(200_000, 50_000), SystemScale::Xlarge);
        // The larger of the two wins.
        assert_eq!(SystemScale::classify(500, 2_000_000), SystemScale::Large);
    }

    #[test]
    fn large_gate() {
        assert!(!SystemScale::Small.is_large());
        assert!(!SystemScale::Medium.is_large());
        assert!(SystemScale::Large.is_large());
        assert!(SystemScale::Xlarge.is_large());
    }

    #[test]
    fn serde_names_are_lowercase() {
        assert_eq!(serde_json::to_string(&SystemScale::Xlarge).unwrap(), "\"xlarge\"");
    }
}
