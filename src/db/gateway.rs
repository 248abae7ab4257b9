use std::time::Duration;

use rust_decimal::prelude::ToPrimitive;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, MySql, Postgres, Row as _, TypeInfo};
use tracing::{info, warn};

use crate::config::{DbEngine, GatewayDbConfig};
use crate::error::{Result, SentinelError};

use super::value::{Row, SqlValue};

enum GatewayPool {
    Pg(PgPool),
    My(MySqlPool),
}

/// Connection pool to the gateway's primary database, portable between
/// PostgreSQL and MySQL. SQL is written with `?` placeholders and MySQL
/// quoting conventions; the pool rewrites placeholders for Postgres and
/// exposes `is_pg` for the few spots where the dialects diverge
/// (identifier quoting, JSON extraction).
pub struct GatewayDb {
    engine: DbEngine,
    pool: GatewayPool,
}

/// Indexes kept on the gateway tables. Names are stable so the probe on
/// MySQL (which has no CREATE INDEX IF NOT EXISTS) can check the catalog.
pub const GATEWAY_INDEXES: &[(&str, &str, &str)] = &[
    ("idx_sentinel_logs_created", "logs", "created_at"),
    ("idx_sentinel_logs_user_created", "logs", "user_id, created_at"),
    ("idx_sentinel_logs_model_created", "logs", "model_name, created_at"),
    ("idx_sentinel_logs_channel_created", "logs", "channel_id, created_at"),
    ("idx_sentinel_logs_type_created", "logs", "type, created_at"),
    ("idx_sentinel_logs_token_created", "logs", "token_id, created_at"),
    ("idx_sentinel_logs_ip_created", "logs", "ip, created_at"),
    ("idx_sentinel_users_inviter", "users", "inviter_id"),
    ("idx_sentinel_users_status", "users", "status"),
];

impl GatewayDb {
    pub async fn connect(cfg: &GatewayDbConfig) -> Result<Self> {
        let pool = match cfg.engine {
            DbEngine::Postgres => GatewayPool::Pg(
                PgPoolOptions::new()
                    .max_connections(10)
                    .acquire_timeout(Duration::from_secs(10))
                    .connect(&cfg.dsn)
                    .await?,
            ),
            DbEngine::MySql => GatewayPool::My(
                MySqlPoolOptions::new()
                    .max_connections(10)
                    .acquire_timeout(Duration::from_secs(10))
                    .connect(&cfg.dsn)
                    .await?,
            ),
        };
        info!(engine = cfg.engine.as_str(), "gateway database pool ready");
        Ok(Self { engine: cfg.engine, pool })
    }

    pub fn engine(&self) -> DbEngine {
        self.engine
    }

    pub fn is_pg(&self) -> bool {
        self.engine == DbEngine::Postgres
    }

    /// Liveness probe used by the health endpoint.
    pub async fn ping(&self) -> Result<()> {
        match &self.pool {
            GatewayPool::Pg(p) => {
                sqlx::query("SELECT 1").execute(p).await?;
            }
            GatewayPool::My(p) => {
                sqlx::query("SELECT 1").execute(p).await?;
            }
        }
        Ok(())
    }

    /// Rewrite `?` placeholders to `$1..$n` for Postgres; identity
    /// otherwise. Skips quoted string literals.
    pub fn rebind(&self, sql: &str) -> String {
        rebind_for(self.is_pg(), sql)
    }

    /// Dialect-specific placeholder for programmatic SQL building
    /// (1-based index).
    pub fn placeholder(&self, i: usize) -> String {
        if self.is_pg() {
            format!("${i}")
        } else {
            "?".to_string()
        }
    }

    /// Quote a (possibly reserved) identifier. `group` is the usual
    /// customer.
    pub fn quote_ident(&self, ident: &str) -> String {
        if self.is_pg() {
            format!("\"{ident}\"")
        } else {
            format!("`{ident}`")
        }
    }

    /// SQL expression extracting the boolean `record_ip_log` field from
    /// `users.setting` (JSON stored in a text column).
    pub fn record_ip_extract_sql(&self) -> &'static str {
        if self.is_pg() {
            "(CASE WHEN setting IS NULL OR setting = '' THEN NULL \
              ELSE setting::jsonb ->> 'record_ip_log' END)"
        } else {
            "JSON_UNQUOTE(JSON_EXTRACT(NULLIF(setting, ''), '$.record_ip_log'))"
        }
    }

    /// Full UPDATE statement enabling `record_ip_log` for every user
    /// that does not already have it on. Returns rows affected.
    pub async fn enable_ip_recording_all(&self) -> Result<u64> {
        let sql = if self.is_pg() {
            format!(
                "UPDATE users SET setting = jsonb_set( \
                   COALESCE(NULLIF(setting, '')::jsonb, '{{}}'::jsonb), \
                   '{{record_ip_log}}', 'true'::jsonb)::text \
                 WHERE deleted_at IS NULL \
                   AND COALESCE({extract}, 'false') <> 'true'",
                extract = self.record_ip_extract_sql()
            )
        } else {
            format!(
                "UPDATE users SET setting = JSON_SET( \
                   COALESCE(NULLIF(setting, ''), '{{}}'), \
                   '$.record_ip_log', true) \
                 WHERE deleted_at IS NULL \
                   AND COALESCE({extract}, 'false') <> 'true'",
                extract = self.record_ip_extract_sql()
            )
        };
        self.execute(&sql, &[]).await
    }

    /// Run a query and scan every row into a field-name map.
    pub async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        match &self.pool {
            GatewayPool::Pg(pool) => {
                let sql = rebind_for(true, sql);
                let mut q = sqlx::query(&sql);
                for p in params {
                    q = bind_pg(q, p);
                }
                let rows = q.fetch_all(pool).await?;
                Ok(rows.iter().map(scan_pg_row).collect())
            }
            GatewayPool::My(pool) => {
                let mut q = sqlx::query(sql);
                for p in params {
                    q = bind_my(q, p);
                }
                let rows = q.fetch_all(pool).await?;
                Ok(rows.iter().map(scan_my_row).collect())
            }
        }
    }

    /// Like `query` but returns the first row, or None when the result
    /// set is empty (not an error).
    pub async fn query_one(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    /// Query with an explicit upper bound on wall time. The driver-level
    /// statement is cancelled when the future is dropped.
    pub async fn query_with_timeout(
        &self,
        sql: &str,
        params: &[SqlValue],
        timeout: Duration,
    ) -> Result<Vec<Row>> {
        match tokio::time::timeout(timeout, self.query(sql, params)).await {
            Ok(res) => res,
            Err(_) => Err(SentinelError::Timeout(timeout.as_secs())),
        }
    }

    /// Execute a statement, returning rows affected.
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        match &self.pool {
            GatewayPool::Pg(pool) => {
                let sql = rebind_for(true, sql);
                let mut q = sqlx::query(&sql);
                for p in params {
                    q = bind_pg(q, p);
                }
                Ok(q.execute(pool).await?.rows_affected())
            }
            GatewayPool::My(pool) => {
                let mut q = sqlx::query(sql);
                for p in params {
                    q = bind_my(q, p);
                }
                Ok(q.execute(pool).await?.rows_affected())
            }
        }
    }

    /// Begin a transaction. Statements on the returned handle use the
    /// same `?`-placeholder convention as the pool.
    pub async fn begin(&self) -> Result<GatewayTx> {
        Ok(match &self.pool {
            GatewayPool::Pg(pool) => GatewayTx::Pg(pool.begin().await?),
            GatewayPool::My(pool) => GatewayTx::My(pool.begin().await?),
        })
    }

    /// Existence probe through the catalog.
    pub async fn table_exists(&self, name: &str) -> Result<bool> {
        let row = if self.is_pg() {
            self.query_one(
                "SELECT COUNT(*) AS n FROM information_schema.tables \
                 WHERE table_schema = 'public' AND table_name = ?",
                &[SqlValue::from(name)],
            )
            .await?
        } else {
            self.query_one(
                "SELECT COUNT(*) AS n FROM information_schema.tables \
                 WHERE table_schema = DATABASE() AND table_name = ?",
                &[SqlValue::from(name)],
            )
            .await?
        };
        Ok(row.map(|r| super::value::row_i64(&r, "n") > 0).unwrap_or(false))
    }

    async fn index_exists(&self, index: &str, table: &str) -> Result<bool> {
        let row = if self.is_pg() {
            self.query_one(
                "SELECT COUNT(*) AS n FROM pg_indexes \
                 WHERE schemaname = 'public' AND indexname = ?",
                &[SqlValue::from(index)],
            )
            .await?
        } else {
            self.query_one(
                "SELECT COUNT(*) AS n FROM information_schema.statistics \
                 WHERE table_schema = DATABASE() AND table_name = ? AND index_name = ?",
                &[SqlValue::from(table), SqlValue::from(index)],
            )
            .await?
        };
        Ok(row.map(|r| super::value::row_i64(&r, "n") > 0).unwrap_or(false))
    }

    /// Create any missing gateway indexes, sleeping `pacing` between
    /// statements to keep load off the primary.
    pub async fn ensure_indexes(&self, pacing: Duration) -> Result<usize> {
        let mut created = 0;
        for (name, table, cols) in GATEWAY_INDEXES {
            let sql = if self.is_pg() {
                format!("CREATE INDEX IF NOT EXISTS {name} ON {table} ({cols})")
            } else {
                if self.index_exists(name, table).await? {
                    continue;
                }
                format!("CREATE INDEX {name} ON {table} ({cols})")
            };
            match self.execute(&sql, &[]).await {
                Ok(_) => {
                    created += 1;
                    info!(index = name, table, "index ensured");
                }
                Err(e) => {
                    warn!(index = name, err = %e, "index creation failed");
                }
            }
            if !pacing.is_zero() {
                tokio::time::sleep(pacing).await;
            }
        }
        Ok(created)
    }

    /// Presence report for the documented index set.
    pub async fn index_status(&self) -> Result<Vec<(String, bool)>> {
        let mut out = Vec::with_capacity(GATEWAY_INDEXES.len());
        for (name, table, _) in GATEWAY_INDEXES {
            let present = self.index_exists(name, table).await?;
            out.push((name.to_string(), present));
        }
        Ok(out)
    }
}

/// An open gateway transaction. Commit is explicit; dropping without
/// commit rolls back.
pub enum GatewayTx {
    Pg(sqlx::Transaction<'static, Postgres>),
    My(sqlx::Transaction<'static, MySql>),
}

impl GatewayTx {
    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        match self {
            GatewayTx::Pg(tx) => {
                let sql = rebind_for(true, sql);
                let mut q = sqlx::query(&sql);
                for p in params {
                    q = bind_pg(q, p);
                }
                Ok(q.execute(&mut **tx).await?.rows_affected())
            }
            GatewayTx::My(tx) => {
                let mut q = sqlx::query(sql);
                for p in params {
                    q = bind_my(q, p);
                }
                Ok(q.execute(&mut **tx).await?.rows_affected())
            }
        }
    }

    pub async fn commit(self) -> Result<()> {
        match self {
            GatewayTx::Pg(tx) => tx.commit().await?,
            GatewayTx::My(tx) => tx.commit().await?,
        }
        Ok(())
    }
}

// -- Placeholder rewriting -----------------------------------------------

fn rebind_for(is_pg: bool, sql: &str) -> String {
    if !is_pg {
        return sql.to_string();
    }
    let mut out = String::with_capacity(sql.len() + 16);
    let mut n = 0usize;
    let mut in_literal = false;
    for ch in sql.chars() {
        match ch {
            '\'' => {
                in_literal = !in_literal;
                out.push(ch);
            }
            '?' if !in_literal => {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            }
            _ => out.push(ch),
        }
    }
    out
}

// -- Parameter binding ---------------------------------------------------

fn bind_pg<'q>(
    q: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    v: &SqlValue,
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    match v {
        SqlValue::Int(i) => q.bind(*i),
        SqlValue::Float(f) => q.bind(*f),
        SqlValue::Text(s) => q.bind(s.clone()),
        SqlValue::Bytes(b) => q.bind(b.clone()),
        SqlValue::Null => q.bind(Option::<i64>::None),
    }
}

fn bind_my<'q>(
    q: sqlx::query::Query<'q, MySql, sqlx::mysql::MySqlArguments>,
    v: &SqlValue,
) -> sqlx::query::Query<'q, MySql, sqlx::mysql::MySqlArguments> {
    match v {
        SqlValue::Int(i) => q.bind(*i),
        SqlValue::Float(f) => q.bind(*f),
        SqlValue::Text(s) => q.bind(s.clone()),
        SqlValue::Bytes(b) => q.bind(b.clone()),
        SqlValue::Null => q.bind(Option::<i64>::None),
    }
}

// -- Row scanning --------------------------------------------------------

fn decimal_value(d: rust_decimal::Decimal) -> SqlValue {
    if d.is_integer() {
        d.to_i64().map(SqlValue::Int).unwrap_or(SqlValue::Null)
    } else {
        d.to_f64().map(SqlValue::Float).unwrap_or(SqlValue::Null)
    }
}

fn scan_pg_row(row: &PgRow) -> Row {
    let mut out = Row::with_capacity(row.columns().len());
    for col in row.columns() {
        let idx = col.ordinal();
        let v = match col.type_info().name() {
            "INT2" => row
                .try_get::<Option<i16>, _>(idx)
                .ok()
                .flatten()
                .map(|v| SqlValue::Int(i64::from(v)))
                .unwrap_or(SqlValue::Null),
            "INT4" => row
                .try_get::<Option<i32>, _>(idx)
                .ok()
                .flatten()
                .map(|v| SqlValue::Int(i64::from(v)))
                .unwrap_or(SqlValue::Null),
            "INT8" => row
                .try_get::<Option<i64>, _>(idx)
                .ok()
                .flatten()
                .map(SqlValue::Int)
                .unwrap_or(SqlValue::Null),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(idx)
                .ok()
                .flatten()
                .map(|v| SqlValue::Float(f64::from(v)))
                .unwrap_or(SqlValue::Null),
            "FLOAT8" => row
                .try_get::<Option<f64>, _>(idx)
                .ok()
                .flatten()
                .map(SqlValue::Float)
                .unwrap_or(SqlValue::Null),
            "NUMERIC" => row
                .try_get::<Option<rust_decimal::Decimal>, _>(idx)
                .ok()
                .flatten()
                .map(decimal_value)
                .unwrap_or(SqlValue::Null),
            "BOOL" => row
                .try_get::<Option<bool>, _>(idx)
                .ok()
                .flatten()
                .map(|v| SqlValue::Int(i64::from(v)))
                .unwrap_or(SqlValue::Null),
            "BYTEA" => row
                .try_get::<Option<Vec<u8>>, _>(idx)
                .ok()
                .flatten()
                .map(SqlValue::Bytes)
                .unwrap_or(SqlValue::Null),
            _ => row
                .try_get::<Option<String>, _>(idx)
                .ok()
                .flatten()
                .map(SqlValue::Text)
                .unwrap_or(SqlValue::Null),
        };
        out.insert(col.name().to_string(), v);
    }
    out
}

fn scan_my_row(row: &MySqlRow) -> Row {
    let mut out = Row::with_capacity(row.columns().len());
    for col in row.columns() {
        let idx = col.ordinal();
        let ty = col.type_info().name();
        let v = match ty {
            "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" | "BOOLEAN" => row
                .try_get::<Option<i64>, _>(idx)
                .ok()
                .flatten()
                .map(SqlValue::Int)
                .unwrap_or(SqlValue::Null),
            "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
            | "BIGINT UNSIGNED" => row
                .try_get::<Option<u64>, _>(idx)
                .ok()
                .flatten()
                .map(|v| SqlValue::Int(v.min(i64::MAX as u64) as i64))
                .unwrap_or(SqlValue::Null),
            "FLOAT" => row
                .try_get::<Option<f32>, _>(idx)
                .ok()
                .flatten()
                .map(|v| SqlValue::Float(f64::from(v)))
                .unwrap_or(SqlValue::Null),
            "DOUBLE" => row
                .try_get::<Option<f64>, _>(idx)
                .ok()
                .flatten()
                .map(SqlValue::Float)
                .unwrap_or(SqlValue::Null),
            "DECIMAL" => row
                .try_get::<Option<rust_decimal::Decimal>, _>(idx)
                .ok()
                .flatten()
                .map(decimal_value)
                .unwrap_or(SqlValue::Null),
            _ => {
                // TEXT/VARCHAR/CHAR decode as strings; BLOB-flagged text
                // columns fall through to bytes.
                match row.try_get::<Option<String>, _>(idx) {
                    Ok(Some(s)) => SqlValue::Text(s),
                    Ok(None) => SqlValue::Null,
                    Err(_) => row
                        .try_get::<Option<Vec<u8>>, _>(idx)
                        .ok()
                        .flatten()
                        .map(SqlValue::Bytes)
                        .unwrap_or(SqlValue::Null),
                }
            }
        };
        out.insert(col.name().to_string(), v);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebind_rewrites_for_postgres_only() {
        let sql = "SELECT * FROM logs WHERE created_at >= ? AND user_id = ?";
        assert_eq!(
            rebind_for(true, sql),
            "SELECT * FROM logs WHERE created_at >= $1 AND user_id = $2"
        );
        assert_eq!(rebind_for(false, sql), sql);
    }

    #[test]
    fn rebind_skips_string_literals() {
        let sql = "SELECT '?' AS q, id FROM t WHERE id = ?";
        assert_eq!(rebind_for(true, sql), "SELECT '?' AS q, id FROM t WHERE id = $1");
    }

    #[test]
    fn rebind_counts_past_nine() {
        let sql = "SELECT 1 WHERE a IN (?,?,?,?,?,?,?,?,?,?,?)";
        let out = rebind_for(true, sql);
        assert!(out.contains("$10"));
        assert!(out.contains("$11"));
        assert!(!out.contains('?'));
    }

    #[test]
    fn decimal_value_splits_integral_and_fractional() {
        use std::str::FromStr;
        let d = rust_decimal::Decimal::from_str("42").unwrap();
        assert_eq!(decimal_value(d), SqlValue::Int(42));
        let d = rust_decimal::Decimal::from_str("42.5").unwrap();
        assert_eq!(decimal_value(d), SqlValue::Float(42.5));
    }

    #[test]
    fn index_set_covers_hot_tables() {
        let tables: std::collections::HashSet<&str> =
            GATEWAY_INDEXES.iter().map(|(_, t, _)| *t).collect();
        assert!(tables.contains("logs"));
        assert!(tables.contains("users"));
    }
}
