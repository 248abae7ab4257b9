use std::path::PathBuf;
use std::str::FromStr;

use chrono::{Offset, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{info, warn};

use crate::error::{Result, SentinelError};

/// Which SQL dialect the gateway database speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbEngine {
    Postgres,
    MySql,
}

impl DbEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbEngine::Postgres => "postgresql",
            DbEngine::MySql => "mysql",
        }
    }
}

impl FromStr for DbEngine {
    type Err = SentinelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(DbEngine::Postgres),
            "mysql" | "mariadb" => Ok(DbEngine::MySql),
            other => Err(SentinelError::Config(format!("unknown DB_ENGINE: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayDbConfig {
    pub engine: DbEngine,
    pub dsn: String,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Connection URL, or None when Redis is not configured.
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub admin_password: String,
    pub api_key: String,
    pub jwt_secret: Vec<u8>,
    pub jwt_expire_hours: u64,
}

#[derive(Debug, Clone)]
pub struct GeoIpConfig {
    /// Directory holding the MMDB files.
    pub dir: PathBuf,
    /// Mirror URL templates tried in order; `{db}` is replaced by the
    /// database file name (e.g. `GeoLite2-Country.mmdb`).
    pub mirrors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub gateway_db: GatewayDbConfig,
    pub redis: RedisConfig,
    pub auth: AuthConfig,
    pub geoip: GeoIpConfig,
    pub timezone: Tz,
    pub local_db_path: PathBuf,
    pub ai_ban_scan_interval_secs: u64,
}

// -- Defaults ------------------------------------------------------------

fn default_bind_addr() -> String {
    "0.0.0.0:8788".to_string()
}
fn default_geoip_dir() -> String {
    "./data/geoip".to_string()
}
fn default_local_db_path() -> String {
    "./data/local.db".to_string()
}
fn default_mirrors() -> Vec<String> {
    vec![
        "https://raw.githubusercontent.com/P3TERX/GeoLite.mmdb/download/{db}".to_string(),
        "https://github.com/P3TERX/GeoLite.mmdb/releases/latest/download/{db}".to_string(),
        "https://cdn.jsdelivr.net/gh/P3TERX/GeoLite.mmdb@download/{db}".to_string(),
    ]
}
fn default_jwt_expire_hours() -> u64 {
    24
}
fn default_ai_ban_scan_interval_secs() -> u64 {
    600
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).ok().filter(|s| !s.is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

// -- Config impl ---------------------------------------------------------

impl Config {
    /// Build the configuration from the process environment.
    ///
    /// `SQL_DSN` overrides the composed `DB_*` connection parameters.
    pub fn from_env() -> Result<Self> {
        let engine: DbEngine = env_or("DB_ENGINE", "postgres").parse()?;

        let dsn = match env_opt("SQL_DSN") {
            Some(dsn) => dsn,
            None => {
                let host = env_or("DB_DNS", "127.0.0.1");
                let port = env_or(
                    "DB_PORT",
                    match engine {
                        DbEngine::Postgres => "5432",
                        DbEngine::MySql => "3306",
                    },
                );
                let user = env_or("DB_USER", "root");
                let password = env_opt("DB_PASSWORD").unwrap_or_default();
                let name = env_or("DB_NAME", "new-api");
                let scheme = match engine {
                    DbEngine::Postgres => "postgres",
                    DbEngine::MySql => "mysql",
                };
                if password.is_empty() {
                    format!("{scheme}://{user}@{host}:{port}/{name}")
                } else {
                    format!("{scheme}://{user}:{password}@{host}:{port}/{name}")
                }
            }
        };

        let redis_url = env_opt("REDIS_HOST").map(|host| {
            let port = env_or("REDIS_PORT", "6379");
            let db = env_or("REDIS_DB", "0");
            match env_opt("REDIS_PASSWORD") {
                Some(pass) => format!("redis://:{pass}@{host}:{port}/{db}"),
                None => format!("redis://{host}:{port}/{db}"),
            }
        });

        let admin_password = env_opt("ADMIN_PASSWORD")
            .ok_or_else(|| SentinelError::Config("ADMIN_PASSWORD is required".into()))?;
        let jwt_secret = env_opt("JWT_SECRET")
            .ok_or_else(|| SentinelError::Config("JWT_SECRET is required".into()))?
            .into_bytes();
        let api_key = env_opt("API_KEY").unwrap_or_default();
        let jwt_expire_hours = env_opt("JWT_EXPIRE_HOURS")
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(default_jwt_expire_hours);

        let timezone: Tz = match env_opt("TIMEZONE") {
            Some(name) => name.parse().map_err(|_| {
                SentinelError::Config(format!("TIMEZONE is not a valid IANA zone: {name}"))
            })?,
            None => Tz::UTC,
        };

        let geoip = GeoIpConfig {
            dir: PathBuf::from(env_or("GEOIP_DB_PATH", &default_geoip_dir())),
            mirrors: match env_opt("GEOIP_MIRRORS") {
                Some(list) => list.split(',').map(|s| s.trim().to_string()).collect(),
                None => default_mirrors(),
            },
        };

        // Recognized but unused by the core; logged so operators can see
        // they were picked up.
        for key in ["FRONTEND_PORT", "NEWAPI_NETWORK", "LINUXDO_PROXY_URL"] {
            if env_opt(key).is_some() {
                info!(key, "deployment-only option set; ignored by the side-car core");
            }
        }

        if api_key.is_empty() {
            warn!("API_KEY not set; only JWT auth will be accepted");
        }

        Ok(Config {
            bind_addr: env_or("BIND_ADDR", &default_bind_addr()),
            gateway_db: GatewayDbConfig { engine, dsn },
            redis: RedisConfig { url: redis_url },
            auth: AuthConfig {
                admin_password,
                api_key,
                jwt_secret,
                jwt_expire_hours,
            },
            geoip,
            timezone,
            local_db_path: PathBuf::from(env_or("LOCAL_DB_PATH", &default_local_db_path())),
            ai_ban_scan_interval_secs: env_opt("AI_BAN_SCAN_INTERVAL_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(default_ai_ban_scan_interval_secs),
        })
    }

    /// UTC offset of the configured zone at `unix_ts`, in seconds.
    ///
    /// Trend SQL groups on `FLOOR((created_at + offset) / bucket)`; the
    /// offset is resolved per call so DST transitions shift buckets the
    /// same way wall clocks do.
    pub fn tz_offset_seconds(&self, unix_ts: i64) -> i64 {
        let utc = Utc.timestamp_opt(unix_ts, 0).single().unwrap_or_else(Utc::now);
        let local = utc.with_timezone(&self.timezone);
        i64::from(local.offset().fix().local_minus_utc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_parses_aliases() {
        assert_eq!("postgres".parse::<DbEngine>().unwrap(), DbEngine::Postgres);
        assert_eq!("postgresql".parse::<DbEngine>().unwrap(), DbEngine::Postgres);
        assert_eq!("mysql".parse::<DbEngine>().unwrap(), DbEngine::MySql);
        assert_eq!("mariadb".parse::<DbEngine>().unwrap(), DbEngine::MySql);
        assert!("oracle".parse::<DbEngine>().is_err());
    }

    #[test]
    fn engine_display_names() {
        assert_eq!(DbEngine::Postgres.as_str(), "postgresql");
        assert_eq!(DbEngine::MySql.as_str(), "mysql");
    }

    fn test_config(tz: Tz) -> Config {
        Config {
            bind_addr: default_bind_addr(),
            gateway_db: GatewayDbConfig {
                engine: DbEngine::Postgres,
                dsn: "postgres://u@localhost/db".into(),
            },
            redis: RedisConfig { url: None },
            auth: AuthConfig {
                admin_password: "pw".into(),
                api_key: String::new(),
                jwt_secret: b"secret".to_vec(),
                jwt_expire_hours: 24,
            },
            geoip: GeoIpConfig {
                dir: PathBuf::from("./data/geoip"),
                mirrors: default_mirrors(),
            },
            timezone: tz,
            local_db_path: PathBuf::from("./data/local.db"),
            ai_ban_scan_interval_secs: 600,
        }
    }

    #[test]
    fn tz_offset_utc_is_zero() {
        let cfg = test_config(Tz::UTC);
        assert_eq!(cfg.tz_offset_seconds(1_700_000_000), 0);
    }

    #[test]
    fn tz_offset_shanghai_is_eight_hours() {
        let cfg = test_config(chrono_tz::Asia::Shanghai);
        assert_eq!(cfg.tz_offset_seconds(1_700_000_000), 8 * 3600);
    }

    #[test]
    fn tz_offset_respects_dst() {
        let cfg = test_config(chrono_tz::Europe::Berlin);
        // 2023-01-15 (CET, +1h) vs 2023-07-15 (CEST, +2h)
        assert_eq!(cfg.tz_offset_seconds(1_673_740_800), 3600);
        assert_eq!(cfg.tz_offset_seconds(1_689_379_200), 7200);
    }
}
