use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::Rng;
use serde_json::{json, Value};

use crate::db::{GatewayDb, SqlValue};
use crate::error::{Result, SentinelError};

const KEY_LEN: usize = 32;
const MAX_PREFIX: usize = 20;
const COUNTER_SPACE: u64 = 36 * 36 * 36 * 36;
const MAX_BATCH: usize = 1000;

fn base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

fn last_padded(s: &str, width: usize) -> String {
    if s.len() >= width {
        s[s.len() - width..].to_string()
    } else {
        format!("{s:0>width$}")
    }
}

/// Generates 32-character redemption keys:
/// `prefix || random-hex fill || base36(unix_ms) last 8 || base36(counter) last 4`.
/// The counter is process-wide so keys minted in the same millisecond
/// still differ.
pub struct KeyGenerator {
    counter: AtomicU64,
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self { counter: AtomicU64::new(0) }
    }
}

impl KeyGenerator {
    pub fn generate(&self, prefix: &str) -> String {
        let prefix: String = prefix.chars().take(MAX_PREFIX).collect();
        let ts = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let ts_part = last_padded(&base36(ts), 8);
        let counter = self.counter.fetch_add(1, Ordering::Relaxed) % COUNTER_SPACE;
        let counter_part = last_padded(&base36(counter), 4);

        let fill_len = KEY_LEN.saturating_sub(prefix.len() + ts_part.len() + counter_part.len());
        let mut rng = rand::thread_rng();
        let fill: String = (0..fill_len)
            .map(|_| char::from_digit(rng.gen_range(0..16u32), 16).unwrap_or('0'))
            .collect();

        let mut key = format!("{prefix}{fill}{ts_part}{counter_part}");
        key.truncate(KEY_LEN);
        while key.len() < KEY_LEN {
            key.push('0');
        }
        key
    }

    /// A batch of distinct keys. Tries up to 3x the requested count
    /// before giving up on uniqueness.
    pub fn batch(&self, count: usize, prefix: &str) -> Result<Vec<String>> {
        if count == 0 || count > MAX_BATCH {
            return Err(SentinelError::InvalidParam(format!(
                "count must be within 1..={MAX_BATCH}, got {count}"
            )));
        }
        let mut keys = Vec::with_capacity(count);
        let mut seen = HashSet::with_capacity(count);
        let mut attempts = 0;
        while keys.len() < count {
            attempts += 1;
            if attempts > count * 3 {
                return Err(SentinelError::Conflict(
                    "could not generate enough distinct keys".into(),
                ));
            }
            let key = self.generate(prefix);
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

/// Batch generation plus the gateway insert.
pub struct RedemptionService {
    db: Arc<GatewayDb>,
    generator: KeyGenerator,
}

impl RedemptionService {
    pub fn new(db: Arc<GatewayDb>) -> Self {
        Self { db, generator: KeyGenerator::default() }
    }

    pub async fn generate_batch(
        &self,
        count: usize,
        prefix: &str,
        quota: i64,
        name: &str,
        expired_time: i64,
    ) -> Result<Value> {
        let keys = self.generator.batch(count, prefix)?;
        let now = chrono::Utc::now().timestamp();
        let key_col = self.db.quote_ident("key");

        let sql = format!(
            "INSERT INTO redemptions ({key_col}, name, quota, status, created_time, expired_time) \
             VALUES (?, ?, ?, 1, ?, ?)"
        );
        for key in &keys {
            self.db
                .execute(
                    &sql,
                    &[
                        SqlValue::from(key.clone()),
                        SqlValue::from(name),
                        SqlValue::Int(quota),
                        SqlValue::Int(now),
                        SqlValue::Int(expired_time),
                    ],
                )
                .await?;
        }

        Ok(json!({
            "count": keys.len(),
            "keys": keys,
            "quota": quota,
            "prefix": prefix,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_exactly_32_chars() {
        let generator = KeyGenerator::default();
        for prefix in ["", "TEST", "a-prefix-at-the-20-c", "way-too-long-prefix-gets-cut"] {
            let key = generator.generate(prefix);
            assert_eq!(key.len(), KEY_LEN, "prefix {prefix:?}");
        }
    }

    #[test]
    fn keys_start_with_prefix() {
        let generator = KeyGenerator::default();
        let key = generator.generate("TEST");
        assert!(key.starts_with("TEST"));

        // Over-long prefixes are clamped to 20 characters.
        let key = generator.generate("way-too-long-prefix-gets-cut");
        assert!(key.starts_with("way-too-long-prefix-"));
    }

    #[test]
    fn batch_is_distinct() {
        let generator = KeyGenerator::default();
        let keys = generator.batch(1000, "TEST").unwrap();
        assert_eq!(keys.len(), 1000);
        let unique: HashSet<&String> = keys.iter().collect();
        assert_eq!(unique.len(), 1000);
        assert!(keys.iter().all(|k| k.len() == KEY_LEN));
        assert!(keys.iter().all(|k| k.starts_with("TEST")));
    }

    #[test]
    fn batch_bounds() {
        let generator = KeyGenerator::default();
        assert!(generator.batch(0, "").is_err());
        assert!(generator.batch(1001, "").is_err());
        assert!(generator.batch(1, "").is_ok());
    }

    #[test]
    fn base36_digits() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
        assert_eq!(base36(36 * 36), "100");
    }

    #[test]
    fn last_padded_trims_and_pads() {
        assert_eq!(last_padded("abcdef", 4), "cdef");
        assert_eq!(last_padded("ab", 4), "00ab");
        assert_eq!(last_padded("abcd", 4), "abcd");
    }

    #[test]
    fn counter_wraps_within_its_space() {
        let generator = KeyGenerator::default();
        generator.counter.store(COUNTER_SPACE - 1, Ordering::Relaxed);
        let a = generator.generate("X");
        let b = generator.generate("X");
        assert_ne!(a, b);
        assert_eq!(a.len(), KEY_LEN);
        assert_eq!(b.len(), KEY_LEN);
    }
}
