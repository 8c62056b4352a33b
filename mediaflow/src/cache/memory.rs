//! In-process cache tiers.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;

use super::{CacheTier, GlobPattern};
use crate::Result;

#[derive(Clone)]
struct Entry {
    value: serde_json::Value,
    expires_at: Instant,
}

impl Entry {
    fn new(value: &serde_json::Value, ttl: Duration) -> Self {
        Self {
            value: value.clone(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

type EntryKey = (String, String);

fn entry_key(namespace: &str, key: &str) -> EntryKey {
    (namespace.to_string(), key.to_string())
}

/// Tier 1: bounded LRU with per-entry expiry.
pub struct MemoryLruTier {
    entries: Mutex<LruCache<EntryKey, Entry>>,
}

impl MemoryLruTier {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Capacity is clamped to at least one entry.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN))
    }
}

#[async_trait]
impl CacheTier for MemoryLruTier {
    fn backend(&self) -> &'static str {
        "lru"
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.get_with_ttl(namespace, key).await?.map(|(value, _)| value))
    }

    async fn get_with_ttl(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<(serde_json::Value, Option<Duration>)>> {
        let k = entry_key(namespace, key);
        let mut entries = self.entries.lock();
        match entries.get(&k) {
            Some(entry) if !entry.is_expired() => {
                Ok(Some((entry.value.clone(), Some(entry.remaining()))))
            }
            Some(_) => {
                entries.pop(&k);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<()> {
        self.entries
            .lock()
            .put(entry_key(namespace, key), Entry::new(value, ttl));
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        Ok(self.entries.lock().pop(&entry_key(namespace, key)).is_some())
    }

    async fn delete_pattern(&self, namespace: &str, pattern: &GlobPattern) -> Result<u64> {
        let mut entries = self.entries.lock();
        let doomed: Vec<EntryKey> = entries
            .iter()
            .filter(|((ns, k), _)| ns == namespace && pattern.matches(k))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &doomed {
            entries.pop(k);
        }
        Ok(doomed.len() as u64)
    }

    async fn len(&self) -> Option<u64> {
        Some(self.entries.lock().len() as u64)
    }
}

/// Unbounded TTL map.
///
/// Stands in for the shared tier or the persistent tier when those are not
/// configured.
#[derive(Default)]
pub struct TtlMapTier {
    entries: DashMap<EntryKey, Entry>,
}

impl TtlMapTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cleanup_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        before - self.entries.len()
    }
}

#[async_trait]
impl CacheTier for TtlMapTier {
    fn backend(&self) -> &'static str {
        "ttl_map"
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.get_with_ttl(namespace, key).await?.map(|(value, _)| value))
    }

    async fn get_with_ttl(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<(serde_json::Value, Option<Duration>)>> {
        let k = entry_key(namespace, key);
        let Some(entry) = self.entries.get(&k) else {
            return Ok(None);
        };
        if entry.is_expired() {
            drop(entry);
            self.entries.remove(&k);
            return Ok(None);
        }
        Ok(Some((entry.value.clone(), Some(entry.remaining()))))
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<()> {
        self.entries
            .insert(entry_key(namespace, key), Entry::new(value, ttl));
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        Ok(self.entries.remove(&entry_key(namespace, key)).is_some())
    }

    async fn delete_pattern(&self, namespace: &str, pattern: &GlobPattern) -> Result<u64> {
        let before = self.entries.len();
        self.entries
            .retain(|(ns, k), _| !(ns == namespace && pattern.matches(k)));
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }

    async fn len(&self) -> Option<u64> {
        Some(self.entries.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_lru_evicts_least_recently_used() {
        let tier = MemoryLruTier::with_capacity(2);
        let ttl = Duration::from_secs(60);
        tier.set("ns", "a", &json!(1), ttl).await.unwrap();
        tier.set("ns", "b", &json!(2), ttl).await.unwrap();
        assert_eq!(tier.get("ns", "a").await.unwrap(), Some(json!(1)));

        tier.set("ns", "c", &json!(3), ttl).await.unwrap();
        assert_eq!(tier.get("ns", "b").await.unwrap(), None);
        assert_eq!(tier.get("ns", "a").await.unwrap(), Some(json!(1)));
        assert_eq!(tier.len().await, Some(2));
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let lru = MemoryLruTier::with_capacity(4);
        let map = TtlMapTier::new();
        for tier in [&lru as &dyn CacheTier, &map as &dyn CacheTier] {
            tier.set("ns", "k", &json!("v"), Duration::from_millis(10))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(lru.get("ns", "k").await.unwrap(), None);
        assert_eq!(map.get("ns", "k").await.unwrap(), None);
        assert_eq!(map.len().await, Some(0));
    }

    #[tokio::test]
    async fn test_delete_pattern_is_namespace_scoped() {
        let lru = MemoryLruTier::with_capacity(8);
        let map = TtlMapTier::new();
        let ttl = Duration::from_secs(60);
        let pattern = GlobPattern::new("media-1:*").unwrap();

        for tier in [&lru as &dyn CacheTier, &map as &dyn CacheTier] {
            tier.set("caption", "media-1:a", &json!(1), ttl).await.unwrap();
            tier.set("caption", "media-1:b", &json!(2), ttl).await.unwrap();
            tier.set("caption", "media-2:a", &json!(3), ttl).await.unwrap();
            tier.set("detect", "media-1:a", &json!(4), ttl).await.unwrap();

            assert_eq!(tier.delete_pattern("caption", &pattern).await.unwrap(), 2);
            assert_eq!(tier.get("caption", "media-2:a").await.unwrap(), Some(json!(3)));
            assert_eq!(tier.get("detect", "media-1:a").await.unwrap(), Some(json!(4)));
        }
    }
}
