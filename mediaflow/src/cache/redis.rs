//! Tier 2: shared cache in Redis.
//!
//! Keys are `{prefix}:{namespace}:{key}` holding JSON strings with `SETEX`
//! expiry, so every process pointing at the same server shares entries.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::glob::redis_literal;
use super::{CacheTier, GlobPattern};
use crate::Result;

const SCAN_BATCH: usize = 200;
/// How long a counted tier size is reported before the prefix is scanned again.
const SIZE_REFRESH: Duration = Duration::from_secs(60);

/// Last counted size of the tier.
#[derive(Debug, Default)]
struct SizeSnapshot {
    counted: Option<(Instant, u64)>,
}

impl SizeSnapshot {
    fn fresh(&self, max_age: Duration) -> Option<u64> {
        self.counted
            .filter(|(at, _)| at.elapsed() < max_age)
            .map(|(_, size)| size)
    }

    fn record(&mut self, size: u64) {
        self.counted = Some((Instant::now(), size));
    }
}

pub struct RedisTier {
    conn: ConnectionManager,
    prefix: String,
    size: Mutex<SizeSnapshot>,
}

impl RedisTier {
    /// Connect to `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::from_connection(conn, prefix))
    }

    pub fn from_connection(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            size: Mutex::new(SizeSnapshot::default()),
        }
    }

    fn namespace_prefix(&self, namespace: &str) -> String {
        format!("{}:{}:", self.prefix, namespace)
    }

    fn full_key(&self, namespace: &str, key: &str) -> String {
        format!("{}{}", self.namespace_prefix(namespace), key)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }
}

#[async_trait]
impl CacheTier for RedisTier {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.full_key(namespace, key)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn get_with_ttl(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<(serde_json::Value, Option<Duration>)>> {
        let full_key = self.full_key(namespace, key);
        let mut conn = self.conn.clone();
        let (raw, pttl): (Option<String>, i64) = redis::pipe()
            .get(&full_key)
            .cmd("PTTL")
            .arg(&full_key)
            .query_async(&mut conn)
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        // PTTL is -1 for keys without expiry.
        let remaining = (pttl >= 0).then(|| Duration::from_millis(pttl as u64));
        Ok(Some((serde_json::from_str(&raw)?, remaining)))
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let seconds = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(self.full_key(namespace, key), value.to_string(), seconds)
            .await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(self.full_key(namespace, key)).await?;
        Ok(removed > 0)
    }

    async fn delete_pattern(&self, namespace: &str, pattern: &GlobPattern) -> Result<u64> {
        let scan_pattern = format!(
            "{}{}",
            redis_literal(&self.namespace_prefix(namespace)),
            pattern.to_redis_pattern()
        );
        let keys = self.scan(&scan_pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(keys).await?;
        Ok(removed)
    }

    /// Counted with a prefix scan at most once per [`SIZE_REFRESH`].
    async fn len(&self) -> Option<u64> {
        let cached = self.size.lock().fresh(SIZE_REFRESH);
        if cached.is_some() {
            return cached;
        }
        let pattern = format!("{}:*", redis_literal(&self.prefix));
        let size = self.scan(&pattern).await.ok()?.len() as u64;
        self.size.lock().record(size);
        Some(size)
    }
}
