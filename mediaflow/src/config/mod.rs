//! Application configuration.
//!
//! Every section has serde defaults; [`AppConfig::from_env`] overlays
//! `MEDIAFLOW_*` environment variables (after loading `.env`).

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::dead_letter::DeadLetterConfig;
use crate::logging::LoggingSettings;
use crate::queue::{QueueConfig, WorkerPoolConfig};
use crate::reconcile::ReconcileConfig;
use crate::resilience::{BreakerSettings, RetryConfig};
use crate::{Error, Result};

const ENV_PREFIX: &str = "MEDIAFLOW_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite URL. `sqlite::memory:` keeps everything in process.
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:mediaflow.db?mode=rwc".to_string(),
            max_connections: 8,
        }
    }
}

impl DatabaseConfig {
    pub fn is_memory(&self) -> bool {
        self.url.contains(":memory:")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub workers: WorkerPoolConfig,
    pub cache: CacheConfig,
    pub breakers: BreakerSettings,
    pub retry: RetryConfig,
    pub dead_letter: DeadLetterConfig,
    pub reconcile: ReconcileConfig,
    pub logging: LoggingSettings,
}

impl AppConfig {
    /// Load `.env`, then read `MEDIAFLOW_*` variables over the defaults.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars { lookup: &lookup };
        let mut config = Self::default();

        vars.set_string("DATABASE_URL", &mut config.database.url);
        vars.set("DATABASE_MAX_CONNECTIONS", &mut config.database.max_connections)?;

        vars.set("WORKERS", &mut config.workers.workers)?;
        if let Some(secs) = vars.parse::<u64>("JOB_TIMEOUT_SECS")? {
            config.workers.job_timeout_secs = (secs > 0).then_some(secs);
        }
        vars.set("SHUTDOWN_TIMEOUT_SECS", &mut config.workers.shutdown_timeout_secs)?;
        vars.set("MAX_BACKLOG", &mut config.queue.max_backlog)?;
        vars.set("HISTORY_LIMIT", &mut config.queue.history_limit)?;

        vars.set("L1_CAPACITY", &mut config.cache.l1_capacity)?;
        if let Some(url) = vars.get("REDIS_URL") {
            config.cache.redis_url = (!url.is_empty()).then_some(url);
        }
        vars.set_string("REDIS_KEY_PREFIX", &mut config.cache.redis_key_prefix);
        vars.set("L3_ENABLED", &mut config.cache.l3_enabled)?;
        vars.set("CACHE_TTL_SECS", &mut config.cache.default_ttl_secs)?;

        vars.set("MAX_RETRIES", &mut config.retry.max_retries)?;
        vars.set("RETRY_INITIAL_DELAY_MS", &mut config.retry.initial_delay_ms)?;
        vars.set("RETRY_MAX_DELAY_MS", &mut config.retry.max_delay_ms)?;

        vars.set("DLQ_AUTO_REPROCESS", &mut config.dead_letter.auto_reprocess)?;
        vars.set(
            "DLQ_REPROCESS_INTERVAL_SECS",
            &mut config.dead_letter.auto_reprocess_interval_secs,
        )?;

        vars.set("RECONCILE_ENABLED", &mut config.reconcile.enabled)?;
        vars.set("RECONCILE_INTERVAL_SECS", &mut config.reconcile.interval_secs)?;
        vars.set(
            "RECONCILE_STALE_AFTER_SECS",
            &mut config.reconcile.stale_after_secs,
        )?;

        if let Some(filter) = vars.get("LOG_FILTER") {
            config.logging.filter = Some(filter);
        }
        if let Some(dir) = vars.get("LOG_DIR") {
            config.logging.log_dir = (!dir.is_empty()).then_some(dir);
        }
        vars.set("LOG_JSON", &mut config.logging.json)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.queue.max_backlog == 0 {
            return Err(Error::config("max_backlog must be at least 1"));
        }
        if self.cache.l1_capacity == 0 {
            return Err(Error::config("l1_capacity must be at least 1"));
        }
        if self.database.max_connections == 0 {
            return Err(Error::config("database max_connections must be at least 1"));
        }
        let breakers = std::iter::once(("default", &self.breakers.default)).chain(
            self.breakers
                .classes
                .iter()
                .map(|(class, config)| (class.as_str(), config)),
        );
        for (class, breaker) in breakers {
            if breaker.failure_threshold == 0 {
                return Err(Error::config(format!(
                    "breaker '{class}' failure_threshold must be at least 1"
                )));
            }
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::config("retry backoff_multiplier must be >= 1.0"));
        }
        Ok(())
    }
}

struct Vars<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Vars<'_> {
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{name}")).map(|v| v.trim().to_string())
    }

    fn parse<T: FromStr>(&self, name: &str) -> Result<Option<T>> {
        match self.get(name) {
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                Error::config(format!("{ENV_PREFIX}{name}: cannot parse '{raw}'"))
            }),
            None => Ok(None),
        }
    }

    fn set<T: FromStr>(&self, name: &str, target: &mut T) -> Result<()> {
        if let Some(value) = self.parse(name)? {
            *target = value;
        }
        Ok(())
    }

    fn set_string(&self, name: &str, target: &mut String) {
        if let Some(value) = self.get(name) {
            *target = value;
        }
    }
}
