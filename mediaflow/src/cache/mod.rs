//! Multi-tier read-through / write-through cache.
//!
//! Tier 1 is an in-process LRU, Tier 2 an optional shared cache (Redis with
//! the `redis-backend` feature) and Tier 3 a SQLite-backed TTL store. Values
//! are JSON so any tier can hold any result.

pub mod glob;
pub mod guarded;
pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;
pub mod sqlite;
pub mod tiered;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use glob::GlobPattern;
pub use guarded::GuardedTier;
pub use memory::{MemoryLruTier, TtlMapTier};
#[cfg(feature = "redis-backend")]
pub use self::redis::RedisTier;
pub use sqlite::SqliteTier;
pub use tiered::TieredCache;

use crate::Result;

/// One storage layer of the cache.
///
/// Errors are reported to the caller; [`TieredCache`] logs them and treats
/// the tier as a miss.
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Short backend name for stats (`lru`, `redis`, `sqlite`, ...).
    fn backend(&self) -> &'static str;

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<serde_json::Value>>;

    /// Like [`CacheTier::get`], plus the entry's remaining time to live when
    /// the backend tracks it.
    async fn get_with_ttl(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<(serde_json::Value, Option<Duration>)>> {
        Ok(self.get(namespace, key).await?.map(|value| (value, None)))
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<()>;

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool>;

    /// Remove every key in `namespace` matching `pattern`.
    async fn delete_pattern(&self, namespace: &str, pattern: &GlobPattern) -> Result<u64>;

    /// Number of live entries, when the backend can tell cheaply.
    async fn len(&self) -> Option<u64>;
}

/// Cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Tier 1 capacity in entries.
    pub l1_capacity: usize,
    /// Tier 2 Redis URL; Tier 2 is absent when unset.
    pub redis_url: Option<String>,
    pub redis_key_prefix: String,
    /// Keep Tier 3 in SQLite (otherwise an in-process TTL map).
    pub l3_enabled: bool,
    /// TTL used when an operation does not specify one.
    pub default_ttl_secs: u64,
    /// Interval of the expired-entry cleanup for Tier 3.
    pub cleanup_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 1024,
            redis_url: None,
            redis_key_prefix: "mediaflow".to_string(),
            l3_enabled: true,
            default_ttl_secs: 3600,
            cleanup_interval_secs: 600,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

/// Counters for one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierStats {
    /// 1 (fastest) to 3 (slowest).
    pub tier: u8,
    pub backend: String,
    pub hits: u64,
    pub misses: u64,
    pub size: Option<u64>,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub tiers: Vec<TierStats>,
    /// Calls into a compute function.
    pub computations: u64,
    /// Keys currently being computed.
    pub in_flight: usize,
}

impl CacheStats {
    pub fn tier(&self, tier: u8) -> Option<&TierStats> {
        self.tiers.iter().find(|t| t.tier == tier)
    }
}
