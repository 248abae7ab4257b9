use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::LocalStore;
use crate::error::Result;

/// Key prefixes whose values are mirrored into SQLite so they survive a
/// Redis restart. Everything else is ephemeral and lives with its TTL.
const DURABLE_PREFIXES: &[&str] = &["app:config", "ai_ban:", "model_status:"];

#[derive(Debug, Clone)]
struct MemEntry {
    value: String,
    /// Absolute unix expiry; 0 = no expiry.
    expire_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hash_keys: usize,
    pub hits: u64,
    pub misses: u64,
    pub redis_available: bool,
}

/// Two-tier cache: a process-local map backed by an optional Redis tier,
/// with durable prefixes mirrored into the local SQLite store.
///
/// Writes go memory-first, then Redis, then the mirror; reads go memory
/// then Redis then (durable keys only) the mirror. A crash between the
/// tier writes leaves the mirror stale until the next overwrite, which
/// is acceptable for cache data.
pub struct CacheManager {
    mem: RwLock<HashMap<String, MemEntry>>,
    hashes: RwLock<HashMap<String, HashMap<String, String>>>,
    redis: Option<redis::aio::MultiplexedConnection>,
    local: LocalStore,
    hits: AtomicU64,
    misses: AtomicU64,
}

fn now_ts() -> i64 {
    Utc::now().timestamp()
}

fn is_durable(key: &str) -> bool {
    DURABLE_PREFIXES.iter().any(|p| key.starts_with(p))
}

impl CacheManager {
    /// Connects to Redis when a URL is configured; an unreachable Redis
    /// degrades to the in-process tier plus the mirror without failing
    /// boot.
    pub async fn new(local: LocalStore, redis_url: Option<&str>) -> Self {
        let redis = match redis_url {
            Some(url) => match Self::connect_redis(url).await {
                Ok(conn) => {
                    info!("redis cache tier connected");
                    Some(conn)
                }
                Err(e) => {
                    warn!(err = %e, "redis unreachable; using in-process cache only");
                    None
                }
            },
            None => None,
        };
        Self {
            mem: RwLock::new(HashMap::new()),
            hashes: RwLock::new(HashMap::new()),
            redis,
            local,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    async fn connect_redis(url: &str) -> Result<redis::aio::MultiplexedConnection> {
        let client = redis::Client::open(url)
            .map_err(|e| crate::error::SentinelError::Cache(e.to_string()))?;
        let conn = tokio::time::timeout(
            Duration::from_secs(3),
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| crate::error::SentinelError::Cache("redis connect timed out".into()))?
        .map_err(|e| crate::error::SentinelError::Cache(e.to_string()))?;
        Ok(conn)
    }

    pub fn is_redis_available(&self) -> bool {
        self.redis.is_some()
    }

    // -- key/value -------------------------------------------------------

    pub async fn get(&self, key: &str) -> Option<String> {
        let now = now_ts();

        let mem_hit = {
            let mem = self.mem.read().unwrap();
            mem.get(key).and_then(|e| {
                if e.expire_at == 0 || e.expire_at > now {
                    Some(e.value.clone())
                } else {
                    None
                }
            })
        };
        if let Some(v) = mem_hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(v);
        }

        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            match conn.get::<_, Option<String>>(key).await {
                Ok(Some(v)) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    self.mem
                        .write()
                        .unwrap()
                        .insert(key.to_string(), MemEntry { value: v.clone(), expire_at: 0 });
                    return Some(v);
                }
                Ok(None) => {}
                Err(e) => debug!(key, err = %e, "redis GET failed"),
            }
        }

        if is_durable(key) {
            if let Ok(Some(v)) = self.local.mirror_get(key, now).await {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.mem
                    .write()
                    .unwrap()
                    .insert(key.to_string(), MemEntry { value: v.clone(), expire_at: 0 });
                return Some(v);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, err = %e, "cached value failed to decode; dropping");
                self.delete(key).await;
                None
            }
        }
    }

    /// `ttl_secs` of 0 means no expiry.
    pub async fn set(&self, key: &str, value: &str, ttl_secs: u64) {
        let expire_at = if ttl_secs == 0 { 0 } else { now_ts() + ttl_secs as i64 };

        self.mem
            .write()
            .unwrap()
            .insert(key.to_string(), MemEntry { value: value.to_string(), expire_at });

        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            let res = if ttl_secs == 0 {
                conn.set::<_, _, ()>(key, value).await
            } else {
                conn.set_ex::<_, _, ()>(key, value, ttl_secs).await
            };
            if let Err(e) = res {
                debug!(key, err = %e, "redis SET failed");
            }
        }

        if is_durable(key) {
            if let Err(e) = self.local.mirror_put(key, value, expire_at).await {
                warn!(key, err = %e, "cache mirror write failed");
            }
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, &raw, ttl_secs).await,
            Err(e) => warn!(key, err = %e, "cache value failed to encode"),
        }
    }

    pub async fn delete(&self, key: &str) {
        self.mem.write().unwrap().remove(key);
        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            if let Err(e) = conn.del::<_, ()>(key).await {
                debug!(key, err = %e, "redis DEL failed");
            }
        }
        if let Err(e) = self.local.mirror_delete(key).await {
            warn!(key, err = %e, "cache mirror delete failed");
        }
    }

    /// Invalidate every key starting with `prefix` across all tiers.
    pub async fn delete_by_prefix(&self, prefix: &str) -> usize {
        let removed = {
            let mut mem = self.mem.write().unwrap();
            let before = mem.len();
            mem.retain(|k, _| !k.starts_with(prefix));
            before - mem.len()
        };

        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            let pattern = format!("{prefix}*");
            let mut keys: Vec<String> = Vec::new();
            match conn.scan_match::<_, String>(pattern).await {
                Ok(mut iter) => {
                    while let Some(key) = iter.next_item().await {
                        keys.push(key);
                    }
                }
                Err(e) => debug!(prefix, err = %e, "redis SCAN failed"),
            }
            if !keys.is_empty() {
                if let Err(e) = conn.del::<_, ()>(keys).await {
                    debug!(prefix, err = %e, "redis DEL failed");
                }
            }
        }

        if let Err(e) = self.local.mirror_delete_prefix(prefix).await {
            warn!(prefix, err = %e, "cache mirror prefix delete failed");
        }

        removed
    }

    // -- hash fields -----------------------------------------------------

    pub async fn hash_set(&self, hash: &str, field: &str, value: &str) {
        self.hashes
            .write()
            .unwrap()
            .entry(hash.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            if let Err(e) = conn.hset::<_, _, _, ()>(hash, field, value).await {
                debug!(hash, field, err = %e, "redis HSET failed");
            }
        }
    }

    pub async fn hash_get(&self, hash: &str, field: &str) -> Option<String> {
        let mem_hit = self
            .hashes
            .read()
            .unwrap()
            .get(hash)
            .and_then(|h| h.get(field).cloned());
        if mem_hit.is_some() {
            return mem_hit;
        }
        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            if let Ok(Some(v)) = conn.hget::<_, _, Option<String>>(hash, field).await {
                self.hashes
                    .write()
                    .unwrap()
                    .entry(hash.to_string())
                    .or_default()
                    .insert(field.to_string(), v.clone());
                return Some(v);
            }
        }
        None
    }

    pub async fn hash_delete(&self, hash: &str, field: &str) {
        if let Some(h) = self.hashes.write().unwrap().get_mut(hash) {
            h.remove(field);
        }
        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            if let Err(e) = conn.hdel::<_, _, ()>(hash, field).await {
                debug!(hash, field, err = %e, "redis HDEL failed");
            }
        }
    }

    pub async fn hash_get_all(&self, hash: &str) -> HashMap<String, String> {
        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            if let Ok(all) = conn.hgetall::<_, HashMap<String, String>>(hash).await {
                if !all.is_empty() {
                    self.hashes.write().unwrap().insert(hash.to_string(), all.clone());
                    return all;
                }
            }
        }
        self.hashes.read().unwrap().get(hash).cloned().unwrap_or_default()
    }

    // -- maintenance -----------------------------------------------------

    /// Cold-start restore: load every live mirror entry into the memory
    /// tier (and Redis, when available). Returns the number restored.
    pub async fn restore_from_mirror(&self) -> Result<usize> {
        let now = now_ts();
        let live = self.local.mirror_live(now).await?;
        let count = live.len();

        {
            let mut mem = self.mem.write().unwrap();
            for (key, value, expire_at) in &live {
                mem.insert(key.clone(), MemEntry { value: value.clone(), expire_at: *expire_at });
            }
        }

        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            for (key, value, expire_at) in &live {
                let res = if *expire_at == 0 {
                    conn.set::<_, _, ()>(key, value).await
                } else {
                    let ttl = (*expire_at - now).max(1) as u64;
                    conn.set_ex::<_, _, ()>(key, value, ttl).await
                };
                if let Err(e) = res {
                    debug!(key, err = %e, "redis restore write failed");
                }
            }
        }

        info!(count, "cache restored from mirror");
        Ok(count)
    }

    /// Drop expired entries from memory and the mirror. Returns the
    /// number of mirror rows removed.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let now = now_ts();
        {
            let mut mem = self.mem.write().unwrap();
            mem.retain(|_, e| e.expire_at == 0 || e.expire_at > now);
        }
        self.local.mirror_cleanup(now).await
    }

    /// Liveness probe: set-then-get through the full stack.
    pub async fn probe(&self) -> bool {
        let key = "app:cache_probe";
        self.set(key, "ok", 60).await;
        self.get(key).await.as_deref() == Some("ok")
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.mem.read().unwrap().len(),
            hash_keys: self.hashes.read().unwrap().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            redis_available: self.redis.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::local::test_store;

    async fn mem_cache() -> CacheManager {
        CacheManager::new(test_store(), None).await
    }

    #[tokio::test]
    async fn set_get_roundtrip() {
        let cache = mem_cache().await;
        cache.set("dashboard:overview:7d", "{\"a\":1}", 60).await;
        assert_eq!(cache.get("dashboard:overview:7d").await.unwrap(), "{\"a\":1}");
        assert!(cache.get("dashboard:missing").await.is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_misses() {
        let cache = mem_cache().await;
        cache.set("analytics:x", "v", 0).await;
        assert!(cache.get("analytics:x").await.is_some());

        // Simulate an already-expired entry.
        cache.mem.write().unwrap().insert(
            "analytics:y".into(),
            MemEntry { value: "v".into(), expire_at: now_ts() - 10 },
        );
        assert!(cache.get("analytics:y").await.is_none());
    }

    #[tokio::test]
    async fn durable_keys_survive_memory_loss() {
        let cache = mem_cache().await;
        cache.set("model_status:config:theme", "dark", 0).await;
        cache.set("dashboard:overview:7d", "ephemeral", 60).await;

        // Drop the memory tier, as a restart would.
        cache.mem.write().unwrap().clear();

        assert_eq!(cache.get("model_status:config:theme").await.unwrap(), "dark");
        assert!(cache.get("dashboard:overview:7d").await.is_none());
    }

    #[tokio::test]
    async fn restore_from_mirror_counts() {
        let cache = mem_cache().await;
        cache.set("ai_ban:settings", "{}", 0).await;
        cache.set("app:config:scale", "large", 0).await;

        cache.mem.write().unwrap().clear();
        let restored = cache.restore_from_mirror().await.unwrap();
        assert_eq!(restored, 2);
        assert_eq!(cache.get("app:config:scale").await.unwrap(), "large");
    }

    #[tokio::test]
    async fn prefix_invalidation() {
        let cache = mem_cache().await;
        cache.set("dashboard:overview:7d", "1", 60).await;
        cache.set("dashboard:usage:24h", "2", 60).await;
        cache.set("risk:leaderboard:1h", "3", 60).await;

        let removed = cache.delete_by_prefix("dashboard:").await;
        assert_eq!(removed, 2);
        assert!(cache.get("dashboard:overview:7d").await.is_none());
        assert!(cache.get("risk:leaderboard:1h").await.is_some());
    }

    #[tokio::test]
    async fn json_codec() {
        #[derive(Serialize, serde::Deserialize)]
        struct Payload {
            n: i64,
        }
        let cache = mem_cache().await;
        cache.set_json("analytics:payload", &Payload { n: 7 }, 60).await;
        let got: Payload = cache.get_json("analytics:payload").await.unwrap();
        assert_eq!(got.n, 7);

        // Corrupt entry is dropped, not returned.
        cache.set("analytics:bad", "not json", 60).await;
        assert!(cache.get_json::<Payload>("analytics:bad").await.is_none());
        assert!(cache.get("analytics:bad").await.is_none());
    }

    #[tokio::test]
    async fn hash_fields() {
        let cache = mem_cache().await;
        cache.hash_set("model_status:slots", "gpt-4", "green").await;
        cache.hash_set("model_status:slots", "claude", "yellow").await;

        assert_eq!(cache.hash_get("model_status:slots", "gpt-4").await.unwrap(), "green");
        assert_eq!(cache.hash_get_all("model_status:slots").await.len(), 2);

        cache.hash_delete("model_status:slots", "gpt-4").await;
        assert!(cache.hash_get("model_status:slots", "gpt-4").await.is_none());
    }

    #[tokio::test]
    async fn cleanup_prunes_mirror() {
        let cache = mem_cache().await;
        // Expired durable entry straight into the mirror.
        cache.local.mirror_put("ai_ban:old", "v", now_ts() - 5).await.unwrap();
        cache.local.mirror_put("ai_ban:live", "v", 0).await.unwrap();
        let n = cache.cleanup_expired().await.unwrap();
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn stats_track_hits_and_misses() {
        let cache = mem_cache().await;
        cache.set("analytics:k", "v", 60).await;
        cache.get("analytics:k").await;
        cache.get("analytics:nope").await;
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!(!stats.redis_available);
    }
}
