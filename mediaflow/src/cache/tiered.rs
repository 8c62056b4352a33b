//! Tiered cache with read-through promotion and request deduplication.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Notify, OnceCell};
use tracing::{debug, warn};

use super::{CacheStats, CacheTier, GlobPattern, TierStats};
use crate::{Error, Result};

/// Failure of a shared computation as seen by waiters.
#[derive(Debug, Clone)]
struct InFlightFailure {
    reason: String,
    transient: bool,
}

impl InFlightFailure {
    /// The computation was abandoned or invalidated; asking again may work.
    fn interrupted(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
            transient: true,
        }
    }

    fn from_error(error: &Error) -> Self {
        Self {
            reason: error.to_string(),
            transient: error.is_transient(),
        }
    }

    fn into_error(self) -> Error {
        if self.transient {
            Error::Cache(self.reason)
        } else {
            Error::Terminal(self.reason)
        }
    }
}

type InFlightResult = std::result::Result<serde_json::Value, InFlightFailure>;

/// A computation other callers can wait on.
struct InFlightState {
    result: OnceCell<InFlightResult>,
    notify: Notify,
}

impl InFlightState {
    fn new() -> Self {
        Self {
            result: OnceCell::new(),
            notify: Notify::new(),
        }
    }

    fn set_result(&self, result: InFlightResult) {
        let _ = self.result.set(result);
        self.notify.notify_waiters();
    }

    async fn wait(&self) -> InFlightResult {
        loop {
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            let notified = self.notify.notified();
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            notified.await;
        }
    }
}

type InFlightRequest = Arc<InFlightState>;

struct TierSlot {
    level: u8,
    backend: Arc<dyn CacheTier>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Fails the in-flight entry if the leader is dropped before finishing.
struct LeaderGuard<'a> {
    cache: &'a TieredCache,
    key: &'a str,
    request: InFlightRequest,
    done: bool,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.cache.fail_in_flight(
                self.key,
                &self.request,
                InFlightFailure::interrupted("computation abandoned"),
            );
        }
    }
}

/// Three-tier read-through / write-through cache.
///
/// Lookups check the tiers fastest first. A hit is copied into every faster
/// tier before returning. A full miss runs the compute function once per key
/// no matter how many callers ask concurrently, then writes the value into
/// every tier.
pub struct TieredCache {
    tiers: Vec<TierSlot>,
    in_flight: DashMap<String, InFlightRequest>,
    computations: AtomicU64,
}

impl TieredCache {
    /// Cache with only Tier 1.
    pub fn new(l1: Arc<dyn CacheTier>) -> Self {
        Self {
            tiers: vec![TierSlot::new(1, l1)],
            in_flight: DashMap::new(),
            computations: AtomicU64::new(0),
        }
    }

    /// Add the shared tier.
    pub fn with_l2(self, l2: Arc<dyn CacheTier>) -> Self {
        self.with_tier(2, l2)
    }

    /// Add the slow persistent tier.
    pub fn with_l3(self, l3: Arc<dyn CacheTier>) -> Self {
        self.with_tier(3, l3)
    }

    fn with_tier(mut self, level: u8, backend: Arc<dyn CacheTier>) -> Self {
        self.tiers.retain(|t| t.level != level);
        self.tiers.push(TierSlot::new(level, backend));
        self.tiers.sort_by_key(|t| t.level);
        self
    }

    pub fn has_tier(&self, level: u8) -> bool {
        self.tiers.iter().any(|t| t.level == level)
    }

    /// Return the cached value for `(namespace, key)` or compute and store it.
    ///
    /// When another caller is already computing the same key, this waits for
    /// that result instead of computing again. A failure of that computation
    /// is reported here as `Error::Cache` when it is worth retrying and as
    /// `Error::Terminal` otherwise; the computing caller itself gets the
    /// original error.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        namespace: &str,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(value) = self.lookup(namespace, key, ttl).await
            && let Some(decoded) = Self::decode(namespace, key, value)
        {
            return Ok(decoded);
        }

        let flight_key = Self::flight_key(namespace, key);
        let (request, is_leader) = self.get_or_create_in_flight(&flight_key);

        if !is_leader {
            debug!(namespace, key, "Waiting for in-flight computation");
            return match request.wait().await {
                Ok(value) => serde_json::from_value(value).map_err(Error::from),
                Err(failure) => Err(failure.into_error()),
            };
        }

        let mut guard = LeaderGuard {
            cache: self,
            key: &flight_key,
            request: request.clone(),
            done: false,
        };

        // A previous leader may have finished between our lookup and now.
        if let Some(value) = self.peek_l1(namespace, key).await
            && let Ok(decoded) = serde_json::from_value::<T>(value.clone())
        {
            self.complete_in_flight(&flight_key, &request, value);
            guard.done = true;
            return Ok(decoded);
        }

        self.computations.fetch_add(1, Ordering::Relaxed);
        let outcome = compute().await;
        guard.done = true;

        match outcome {
            Ok(computed) => {
                let value = match serde_json::to_value(&computed) {
                    Ok(value) => value,
                    Err(e) => {
                        let e = Error::from(e);
                        self.fail_in_flight(&flight_key, &request, InFlightFailure::from_error(&e));
                        return Err(e);
                    }
                };
                // Skip the write if the key was invalidated while computing.
                if self.complete_in_flight(&flight_key, &request, value.clone()) {
                    self.write_through(namespace, key, &value, ttl, self.tiers.len())
                        .await;
                }
                Ok(computed)
            }
            Err(e) => {
                self.fail_in_flight(&flight_key, &request, InFlightFailure::from_error(&e));
                Err(e)
            }
        }
    }

    /// Read without computing. Hits are promoted like in `get_or_compute`.
    pub async fn get<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
        ttl: Duration,
    ) -> Option<T> {
        let value = self.lookup(namespace, key, ttl).await?;
        Self::decode(namespace, key, value)
    }

    /// Write a value into every tier.
    pub async fn set<T: Serialize>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.write_through(namespace, key, &value, ttl, self.tiers.len())
            .await;
        Ok(())
    }

    /// Remove one key from every tier.
    pub async fn invalidate(&self, namespace: &str, key: &str) -> u64 {
        let mut removed = 0;
        for slot in &self.tiers {
            match slot.backend.delete(namespace, key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(tier = slot.level, namespace, key, error = %e, "Cache delete failed")
                }
            }
        }
        self.cancel_in_flight(&Self::flight_key(namespace, key), "invalidated");
        removed
    }

    /// Remove every key in `namespace` matching the glob `pattern` from every
    /// tier and abandon matching computations. Returns the number of entries
    /// removed across tiers; unreachable tiers are skipped.
    pub async fn invalidate_pattern(&self, pattern: &str, namespace: &str) -> Result<u64> {
        let glob = GlobPattern::new(pattern)?;
        let mut removed = 0;
        for slot in &self.tiers {
            match slot.backend.delete_pattern(namespace, &glob).await {
                Ok(n) => removed += n,
                Err(e) => warn!(
                    tier = slot.level,
                    backend = slot.backend.backend(),
                    namespace,
                    pattern,
                    error = %e,
                    "Cache pattern invalidation failed"
                ),
            }
        }

        let prefix = Self::flight_key(namespace, "");
        self.in_flight.retain(|flight_key, request| {
            let matches = flight_key
                .strip_prefix(&prefix)
                .is_some_and(|key| glob.matches(key));
            if matches {
                request.set_result(Err(InFlightFailure::interrupted("invalidated")));
            }
            !matches
        });

        debug!(namespace, pattern, removed, "Cache pattern invalidated");
        Ok(removed)
    }

    pub async fn stats(&self) -> CacheStats {
        let mut tiers = Vec::with_capacity(self.tiers.len());
        for slot in &self.tiers {
            let hits = slot.hits.load(Ordering::Relaxed);
            let misses = slot.misses.load(Ordering::Relaxed);
            let total = hits + misses;
            tiers.push(TierStats {
                tier: slot.level,
                backend: slot.backend.backend().to_string(),
                hits,
                misses,
                size: slot.backend.len().await,
                hit_rate: if total == 0 {
                    0.0
                } else {
                    hits as f64 / total as f64
                },
            });
        }
        CacheStats {
            tiers,
            computations: self.computations.load(Ordering::Relaxed),
            in_flight: self.in_flight.len(),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    async fn lookup(
        &self,
        namespace: &str,
        key: &str,
        ttl: Duration,
    ) -> Option<serde_json::Value> {
        for (index, slot) in self.tiers.iter().enumerate() {
            match slot.backend.get_with_ttl(namespace, key).await {
                Ok(Some((value, remaining))) => {
                    slot.hits.fetch_add(1, Ordering::Relaxed);
                    if index > 0 {
                        // Promoted copies never outlive the source entry.
                        let ttl = remaining.map_or(ttl, |left| left.min(ttl));
                        debug!(tier = slot.level, namespace, key, ?ttl, "Promoting cache hit");
                        self.write_through(namespace, key, &value, ttl, index).await;
                    }
                    return Some(value);
                }
                Ok(None) => {
                    slot.misses.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    slot.misses.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        tier = slot.level,
                        backend = slot.backend.backend(),
                        namespace,
                        key,
                        error = %e,
                        "Cache tier read failed, treating as miss"
                    );
                }
            }
        }
        None
    }

    /// Tier 1 read that does not touch the counters.
    async fn peek_l1(&self, namespace: &str, key: &str) -> Option<serde_json::Value> {
        let slot = self.tiers.first()?;
        slot.backend.get(namespace, key).await.ok().flatten()
    }

    /// Write `value` into the first `upto` tiers.
    async fn write_through(
        &self,
        namespace: &str,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
        upto: usize,
    ) {
        let writes = self.tiers[..upto.min(self.tiers.len())]
            .iter()
            .map(|slot| async move {
                if let Err(e) = slot.backend.set(namespace, key, value, ttl).await {
                    warn!(
                        tier = slot.level,
                        backend = slot.backend.backend(),
                        namespace,
                        key,
                        error = %e,
                        "Cache tier write failed"
                    );
                }
            });
        futures::future::join_all(writes).await;
    }

    fn decode<T: DeserializeOwned>(
        namespace: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Option<T> {
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!(
                    namespace,
                    key,
                    error = %e,
                    "Cached value has unexpected shape, recomputing"
                );
                None
            }
        }
    }

    fn flight_key(namespace: &str, key: &str) -> String {
        format!("{namespace}\u{1f}{key}")
    }

    fn get_or_create_in_flight(&self, flight_key: &str) -> (InFlightRequest, bool) {
        if let Some(existing) = self.in_flight.get(flight_key) {
            return (existing.clone(), false);
        }

        let request = Arc::new(InFlightState::new());
        match self.in_flight.entry(flight_key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => (entry.get().clone(), false),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(request.clone());
                (request, true)
            }
        }
    }

    /// Publish a result. Returns false if `request` is no longer current.
    fn complete_in_flight(
        &self,
        flight_key: &str,
        request: &InFlightRequest,
        value: serde_json::Value,
    ) -> bool {
        let removed = self
            .in_flight
            .remove_if(flight_key, |_, current| Arc::ptr_eq(current, request));
        // Waiters still hold `request`; wake them either way.
        request.set_result(Ok(value));
        removed.is_some()
    }

    fn fail_in_flight(
        &self,
        flight_key: &str,
        request: &InFlightRequest,
        failure: InFlightFailure,
    ) {
        self.in_flight
            .remove_if(flight_key, |_, current| Arc::ptr_eq(current, request));
        request.set_result(Err(failure));
    }

    fn cancel_in_flight(&self, flight_key: &str, reason: &str) {
        if let Some((_, request)) = self.in_flight.remove(flight_key) {
            request.set_result(Err(InFlightFailure::interrupted(reason)));
        }
    }
}

impl TierSlot {
    fn new(level: u8, backend: Arc<dyn CacheTier>) -> Self {
        Self {
            level,
            backend,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }
}
