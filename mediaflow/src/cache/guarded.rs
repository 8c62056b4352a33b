//! Circuit-breaker wrapper for remote cache tiers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{CacheTier, GlobPattern};
use crate::Result;
use crate::resilience::CircuitBreaker;

/// Routes every call to `inner` through `breaker`.
///
/// While the breaker is open, calls fail fast with `Error::CircuitOpen` and
/// the tiered cache treats the tier as a miss.
pub struct GuardedTier {
    inner: Arc<dyn CacheTier>,
    breaker: Arc<CircuitBreaker>,
}

impl GuardedTier {
    pub fn new(inner: Arc<dyn CacheTier>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }
}

#[async_trait]
impl CacheTier for GuardedTier {
    fn backend(&self) -> &'static str {
        self.inner.backend()
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<serde_json::Value>> {
        self.breaker
            .call_async(|| self.inner.get(namespace, key))
            .await
    }

    async fn get_with_ttl(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<(serde_json::Value, Option<Duration>)>> {
        self.breaker
            .call_async(|| self.inner.get_with_ttl(namespace, key))
            .await
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<()> {
        self.breaker
            .call_async(|| self.inner.set(namespace, key, value, ttl))
            .await
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        self.breaker
            .call_async(|| self.inner.delete(namespace, key))
            .await
    }

    async fn delete_pattern(&self, namespace: &str, pattern: &GlobPattern) -> Result<u64> {
        self.breaker
            .call_async(|| self.inner.delete_pattern(namespace, pattern))
            .await
    }

    async fn len(&self) -> Option<u64> {
        if !self.breaker.is_allowed() {
            return None;
        }
        self.inner.len().await
    }
}
