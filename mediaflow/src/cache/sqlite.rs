//! Tier 3: TTL store in the `cache_entry` table.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CacheTier, GlobPattern};
use crate::Result;
use crate::database::models::CacheEntryDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;

#[derive(Clone)]
pub struct SqliteTier {
    pool: SqlitePool,
}

impl SqliteTier {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Delete expired rows; returns how many were removed.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let now = now_ms();
        retry_on_sqlite_busy("cleanup_cache_entries", || async {
            let result = sqlx::query("DELETE FROM cache_entry WHERE expires_at <= ?")
                .bind(now)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    /// Periodically remove expired rows until cancelled.
    pub fn start_cleanup_task(
        &self,
        every: Duration,
        cancellation_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let tier = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(every.max(Duration::from_secs(1)));
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        debug!("Cache cleanup task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        match tier.cleanup_expired().await {
                            Ok(0) => {}
                            Ok(removed) => info!(removed, "Removed expired cache entries"),
                            Err(e) => warn!(error = %e, "Cache cleanup failed"),
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl CacheTier for SqliteTier {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.get_with_ttl(namespace, key).await?.map(|(value, _)| value))
    }

    async fn get_with_ttl(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<(serde_json::Value, Option<Duration>)>> {
        let row = sqlx::query_as::<_, CacheEntryDbModel>(
            "SELECT * FROM cache_entry WHERE namespace = ? AND key = ?",
        )
        .bind(namespace)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let remaining_ms = row.expires_at - now_ms();
        if remaining_ms <= 0 {
            self.delete(namespace, key).await?;
            return Ok(None);
        }
        let remaining = Duration::from_millis(remaining_ms as u64);
        Ok(Some((serde_json::from_str(&row.value)?, Some(remaining))))
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<()> {
        let now = now_ms();
        let expires_at = now + ttl.as_millis() as i64;
        let value = value.to_string();
        retry_on_sqlite_busy("set_cache_entry", || async {
            sqlx::query(
                r#"
                INSERT INTO cache_entry (namespace, key, value, expires_at, created_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(namespace, key) DO UPDATE SET
                    value = excluded.value,
                    expires_at = excluded.expires_at
                "#,
            )
            .bind(namespace)
            .bind(key)
            .bind(&value)
            .bind(expires_at)
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        retry_on_sqlite_busy("delete_cache_entry", || async {
            let result = sqlx::query("DELETE FROM cache_entry WHERE namespace = ? AND key = ?")
                .bind(namespace)
                .bind(key)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn delete_pattern(&self, namespace: &str, pattern: &GlobPattern) -> Result<u64> {
        let keys: Vec<(String,)> = sqlx::query_as("SELECT key FROM cache_entry WHERE namespace = ?")
            .bind(namespace)
            .fetch_all(&self.pool)
            .await?;

        let mut removed = 0;
        for (key,) in keys.into_iter().filter(|(k,)| pattern.matches(k)) {
            if self.delete(namespace, &key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn len(&self) -> Option<u64> {
        sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM cache_entry WHERE expires_at > ?")
            .bind(now_ms())
            .fetch_one(&self.pool)
            .await
            .ok()
            .map(|(n,)| n.max(0) as u64)
    }
}
