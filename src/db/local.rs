use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::Result;

/// SQLite store owned by the side-car. Holds everything that must
/// survive restarts without touching the gateway's database: admin
/// options, the durable cache mirror, sync watermarks and AI-ban state.
///
/// Deleting the file is safe; the next boot re-creates the schema and
/// warmup repopulates the mirror.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WhitelistEntry {
    pub user_id: i64,
    pub reason: String,
    pub added_by: String,
    pub expires_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub scan_id: String,
    pub action: String,
    pub user_id: i64,
    pub username: String,
    pub details: String,
    pub operator: String,
    pub risk_score: f64,
    pub created_at: i64,
}

impl LocalStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!("opening local store at {}", path.display());
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        migrate(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    // -- config ----------------------------------------------------------

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let value = conn
            .query_row("SELECT value FROM config WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, strftime('%s','now')) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value],
        )?;
        Ok(())
    }

    // -- analytics watermarks --------------------------------------------

    pub async fn state_get(&self, key: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().await;
        let value = conn
            .query_row("SELECT value FROM analytics_state WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub async fn state_set(&self, key: &str, value: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO analytics_state (key, value, updated_at) \
             VALUES (?1, ?2, strftime('%s','now')) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value],
        )?;
        Ok(())
    }

    pub async fn meta_get(&self, key: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().await;
        let value = conn
            .query_row("SELECT value FROM analytics_meta WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub async fn meta_set(&self, key: &str, value: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO analytics_meta (key, value, updated_at) \
             VALUES (?1, ?2, strftime('%s','now')) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value],
        )?;
        Ok(())
    }

    // -- durable cache mirror --------------------------------------------

    /// `expire_at` of 0 means the entry never expires.
    pub async fn mirror_put(&self, key: &str, value: &str, expire_at: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO cache (key, value, expire_at, created_at) \
             VALUES (?1, ?2, ?3, strftime('%s','now')) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
               expire_at = excluded.expire_at, created_at = excluded.created_at",
            params![key, value, expire_at],
        )?;
        Ok(())
    }

    pub async fn mirror_get(&self, key: &str, now: i64) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let value = conn
            .query_row(
                "SELECT value FROM cache WHERE key = ?1 AND (expire_at = 0 OR expire_at > ?2)",
                params![key, now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub async fn mirror_delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM cache WHERE key = ?1", [key])?;
        Ok(())
    }

    pub async fn mirror_delete_prefix(&self, prefix: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let n = conn.execute(
            "DELETE FROM cache WHERE key LIKE ?1 ESCAPE '\\'",
            [pattern],
        )?;
        Ok(n)
    }

    /// Every non-expired mirror entry, for cold-start restoration.
    pub async fn mirror_live(&self, now: i64) -> Result<Vec<(String, String, i64)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT key, value, expire_at FROM cache WHERE expire_at = 0 OR expire_at > ?1",
        )?;
        let rows = stmt
            .query_map([now], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub async fn mirror_cleanup(&self, now: i64) -> Result<usize> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "DELETE FROM cache WHERE expire_at > 0 AND expire_at <= ?1",
            [now],
        )?;
        Ok(n)
    }

    // -- AI-ban whitelist ------------------------------------------------

    /// Returns false when the user is already whitelisted.
    pub async fn whitelist_add(
        &self,
        user_id: i64,
        reason: &str,
        added_by: &str,
        expires_at: Option<i64>,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "INSERT OR IGNORE INTO aiban_whitelist \
               (user_id, reason, added_by, expires_at, created_at) \
             VALUES (?1, ?2, ?3, ?4, strftime('%s','now'))",
            params![user_id, reason, added_by, expires_at],
        )?;
        Ok(n > 0)
    }

    pub async fn whitelist_remove(&self, user_id: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute("DELETE FROM aiban_whitelist WHERE user_id = ?1", [user_id])?;
        Ok(n > 0)
    }

    pub async fn whitelist_contains(&self, user_id: i64, now: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let hit: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM aiban_whitelist WHERE user_id = ?1 \
                 AND (expires_at IS NULL OR expires_at > ?2)",
                params![user_id, now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    pub async fn whitelist_list(&self) -> Result<Vec<WhitelistEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT user_id, reason, added_by, expires_at, created_at \
             FROM aiban_whitelist ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(WhitelistEntry {
                    user_id: row.get(0)?,
                    reason: row.get(1)?,
                    added_by: row.get(2)?,
                    expires_at: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Search by numeric id or reason substring.
    pub async fn whitelist_search(&self, keyword: &str) -> Result<Vec<WhitelistEntry>> {
        let conn = self.conn.lock().await;
        let pattern = format!("%{keyword}%");
        let id: i64 = keyword.parse().unwrap_or(-1);
        let mut stmt = conn.prepare(
            "SELECT user_id, reason, added_by, expires_at, created_at \
             FROM aiban_whitelist WHERE user_id = ?1 OR reason LIKE ?2 \
             ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![id, pattern], |row| {
                Ok(WhitelistEntry {
                    user_id: row.get(0)?,
                    reason: row.get(1)?,
                    added_by: row.get(2)?,
                    expires_at: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // -- AI-ban audit log ------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn audit_insert(
        &self,
        scan_id: &str,
        action: &str,
        user_id: i64,
        username: &str,
        details: &str,
        operator: &str,
        risk_score: f64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO aiban_audit_logs \
               (scan_id, action, user_id, username, details, operator, risk_score, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, strftime('%s','now'))",
            params![scan_id, action, user_id, username, details, operator, risk_score],
        )?;
        Ok(())
    }

    pub async fn audit_list(
        &self,
        limit: usize,
        offset: usize,
        action: Option<&str>,
        user_id: Option<i64>,
    ) -> Result<(Vec<AuditEntry>, i64)> {
        let conn = self.conn.lock().await;
        let mut where_sql = String::from("1=1");
        let action_owned = action.map(|s| s.to_string());
        if action_owned.is_some() {
            where_sql.push_str(" AND action = ?");
        }
        if user_id.is_some() {
            where_sql.push_str(" AND user_id = ?");
        }

        let mut filters: Vec<&dyn rusqlite::ToSql> = Vec::new();
        if let Some(ref a) = action_owned {
            filters.push(a);
        }
        if let Some(ref u) = user_id {
            filters.push(u);
        }

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM aiban_audit_logs WHERE {where_sql}"),
            rusqlite::params_from_iter(filters.iter().copied()),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT id, scan_id, action, user_id, username, details, operator, risk_score, created_at \
             FROM aiban_audit_logs WHERE {where_sql} ORDER BY id DESC LIMIT ? OFFSET ?"
        );
        let limit_i = limit as i64;
        let offset_i = offset as i64;
        let mut all: Vec<&dyn rusqlite::ToSql> = filters.clone();
        all.push(&limit_i);
        all.push(&offset_i);

        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(rusqlite::params_from_iter(all.iter().copied()), |row| {
                Ok(AuditEntry {
                    id: row.get(0)?,
                    scan_id: row.get(1)?,
                    action: row.get(2)?,
                    user_id: row.get(3)?,
                    username: row.get(4)?,
                    details: row.get(5)?,
                    operator: row.get(6)?,
                    risk_score: row.get(7)?,
                    created_at: row.get(8)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok((entries, total))
    }

    pub async fn audit_clear(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let n = conn.execute("DELETE FROM aiban_audit_logs", [])?;
        Ok(n)
    }

    // -- AI-ban settings -------------------------------------------------

    pub async fn aiban_config_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let value = conn
            .query_row("SELECT value FROM aiban_config WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub async fn aiban_config_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO aiban_config (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

/// Run schema migrations. Exposed for tests that use in-memory DBs.
pub(crate) fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Admin-set options
        CREATE TABLE IF NOT EXISTS config (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  INTEGER NOT NULL DEFAULT (strftime('%s','now'))
        );

        -- Durable cache mirror (expire_at = 0 means no expiry)
        CREATE TABLE IF NOT EXISTS cache (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            expire_at   INTEGER NOT NULL DEFAULT 0,
            created_at  INTEGER NOT NULL DEFAULT (strftime('%s','now'))
        );

        CREATE INDEX IF NOT EXISTS idx_cache_expire ON cache(expire_at) WHERE expire_at > 0;

        -- Log-sync watermarks
        CREATE TABLE IF NOT EXISTS analytics_state (
            key         TEXT PRIMARY KEY,
            value       INTEGER NOT NULL,
            updated_at  INTEGER NOT NULL DEFAULT (strftime('%s','now'))
        );

        -- Initial-sync cutoff markers
        CREATE TABLE IF NOT EXISTS analytics_meta (
            key         TEXT PRIMARY KEY,
            value       INTEGER NOT NULL,
            updated_at  INTEGER NOT NULL DEFAULT (strftime('%s','now'))
        );

        -- Users never banned automatically
        CREATE TABLE IF NOT EXISTS aiban_whitelist (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     INTEGER NOT NULL UNIQUE,
            reason      TEXT NOT NULL DEFAULT '',
            added_by    TEXT NOT NULL DEFAULT '',
            expires_at  INTEGER,
            created_at  INTEGER NOT NULL DEFAULT (strftime('%s','now'))
        );

        -- Every scan decision, including dry runs
        CREATE TABLE IF NOT EXISTS aiban_audit_logs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            scan_id     TEXT NOT NULL,
            action      TEXT NOT NULL,
            user_id     INTEGER NOT NULL,
            username    TEXT NOT NULL DEFAULT '',
            details     TEXT NOT NULL DEFAULT '',
            operator    TEXT NOT NULL DEFAULT '',
            risk_score  REAL NOT NULL DEFAULT 0,
            created_at  INTEGER NOT NULL DEFAULT (strftime('%s','now'))
        );

        CREATE INDEX IF NOT EXISTS idx_aiban_audit_user ON aiban_audit_logs(user_id);
        CREATE INDEX IF NOT EXISTS idx_aiban_audit_action ON aiban_audit_logs(action);

        -- Persisted AI-ban settings (JSON values)
        CREATE TABLE IF NOT EXISTS aiban_config (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL
        );
        ",
    )?;
    info!("local store migrations complete");
    Ok(())
}

/// In-memory store with migrations applied. Use in tests.
#[cfg(test)]
pub(crate) fn test_store() -> LocalStore {
    let conn = Connection::open_in_memory().unwrap();
    migrate(&conn).unwrap();
    LocalStore { conn: Arc::new(Mutex::new(conn)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn config_roundtrip() {
        let store = test_store();
        assert!(store.config_get("theme").await.unwrap().is_none());
        store.config_set("theme", "dark").await.unwrap();
        assert_eq!(store.config_get("theme").await.unwrap().unwrap(), "dark");
        store.config_set("theme", "light").await.unwrap();
        assert_eq!(store.config_get("theme").await.unwrap().unwrap(), "light");
    }

    #[tokio::test]
    async fn watermarks_upsert() {
        let store = test_store();
        store.state_set("last_log_id", 100).await.unwrap();
        store.state_set("last_log_id", 250).await.unwrap();
        assert_eq!(store.state_get("last_log_id").await.unwrap(), Some(250));
        assert_eq!(store.state_get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn mirror_respects_expiry() {
        let store = test_store();
        let now = 1_000_000;
        store.mirror_put("a", "1", 0).await.unwrap();
        store.mirror_put("b", "2", now + 60).await.unwrap();
        store.mirror_put("c", "3", now - 60).await.unwrap();

        assert_eq!(store.mirror_get("a", now).await.unwrap(), Some("1".into()));
        assert_eq!(store.mirror_get("b", now).await.unwrap(), Some("2".into()));
        assert_eq!(store.mirror_get("c", now).await.unwrap(), None);

        let live = store.mirror_live(now).await.unwrap();
        assert_eq!(live.len(), 2);

        assert_eq!(store.mirror_cleanup(now).await.unwrap(), 1);
        let live = store.mirror_live(now).await.unwrap();
        assert_eq!(live.len(), 2);
    }

    #[tokio::test]
    async fn mirror_prefix_delete() {
        let store = test_store();
        store.mirror_put("model_status:config", "1", 0).await.unwrap();
        store.mirror_put("model_status:order", "2", 0).await.unwrap();
        store.mirror_put("app:config", "3", 0).await.unwrap();

        let n = store.mirror_delete_prefix("model_status:").await.unwrap();
        assert_eq!(n, 2);
        assert!(store.mirror_get("app:config", 0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn whitelist_dedupes_and_expires() {
        let store = test_store();
        assert!(store.whitelist_add(7, "vip", "admin", None).await.unwrap());
        assert!(!store.whitelist_add(7, "again", "admin", None).await.unwrap());
        assert!(store.whitelist_contains(7, 0).await.unwrap());

        store.whitelist_add(8, "temp", "admin", Some(100)).await.unwrap();
        assert!(store.whitelist_contains(8, 50).await.unwrap());
        assert!(!store.whitelist_contains(8, 150).await.unwrap());

        assert!(store.whitelist_remove(7).await.unwrap());
        assert!(!store.whitelist_remove(7).await.unwrap());
    }

    #[tokio::test]
    async fn whitelist_search_by_id_or_reason() {
        let store = test_store();
        store.whitelist_add(42, "internal tester", "ops", None).await.unwrap();
        store.whitelist_add(43, "partner", "ops", None).await.unwrap();

        let hits = store.whitelist_search("42").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].user_id, 42);

        let hits = store.whitelist_search("tester").await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn audit_filtering_and_paging() {
        let store = test_store();
        for i in 0..5 {
            store
                .audit_insert("scan-1", "banned", i, &format!("u{i}"), "{}", "system", 0.9)
                .await
                .unwrap();
        }
        store
            .audit_insert("scan-1", "would_ban", 99, "u99", "{}", "system", 0.5)
            .await
            .unwrap();

        let (all, total) = store.audit_list(10, 0, None, None).await.unwrap();
        assert_eq!(all.len(), 6);
        assert_eq!(total, 6);

        let (banned, total) = store.audit_list(10, 0, Some("banned"), None).await.unwrap();
        assert_eq!(banned.len(), 5);
        assert_eq!(total, 5);

        let (page, _) = store.audit_list(2, 2, Some("banned"), None).await.unwrap();
        assert_eq!(page.len(), 2);

        let (one, _) = store.audit_list(10, 0, None, Some(99)).await.unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].action, "would_ban");

        assert_eq!(store.audit_clear().await.unwrap(), 6);
    }
}
