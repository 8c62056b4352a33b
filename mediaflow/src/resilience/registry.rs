//! Registry of named circuit breakers.
//!
//! Breaker names follow `class[:instance]`. The class selects the
//! thresholds; the full name owns an isolated state machine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitBreakerStatus};
use crate::{Error, Result};

/// Breaker class for the work item / dead letter store.
pub const STORAGE: &str = "storage";
/// Breaker class for remote model APIs.
pub const REMOTE_API: &str = "remote_api";
/// Breaker class for the shared (Tier 2) cache.
pub const SHARED_CACHE: &str = "shared_cache";

/// Per-class breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Used for classes without an explicit entry.
    pub default: BreakerConfig,
    /// Keyed by class (the part of the breaker name before `:`).
    pub classes: HashMap<String, BreakerConfig>,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        let classes = HashMap::from([
            (
                STORAGE.to_string(),
                BreakerConfig::new(5, Duration::from_secs(30)),
            ),
            (
                REMOTE_API.to_string(),
                BreakerConfig::new(5, Duration::from_secs(60)),
            ),
            (
                SHARED_CACHE.to_string(),
                BreakerConfig::new(3, Duration::from_secs(15)),
            ),
        ]);
        Self {
            default: BreakerConfig::default(),
            classes,
        }
    }
}

impl BreakerSettings {
    pub fn with_class(mut self, class: impl Into<String>, config: BreakerConfig) -> Self {
        self.classes.insert(class.into(), config);
        self
    }

    /// Resolve the configuration for a breaker name.
    pub fn config_for(&self, name: &str) -> BreakerConfig {
        let class = name.split(':').next().unwrap_or(name);
        self.classes.get(class).copied().unwrap_or(self.default)
    }
}

/// Owner of every breaker in the process, keyed by dependency name.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    settings: BreakerSettings,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry.
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            settings,
        }
    }

    /// Get or create the breaker for a dependency.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read();
            if let Some(breaker) = breakers.get(name) {
                return breaker.clone();
            }
        }

        let mut breakers = self.breakers.write();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = self.settings.config_for(name);
                debug!(
                    breaker = name,
                    threshold = config.failure_threshold,
                    recovery_timeout_ms = config.recovery_timeout_ms,
                    "Registered circuit breaker"
                );
                Arc::new(CircuitBreaker::new(name, config))
            })
            .clone()
    }

    /// Check if a dependency is allowed (circuit not open).
    pub fn is_allowed(&self, name: &str) -> bool {
        self.get(name).is_allowed()
    }

    /// Force a breaker back to closed.
    pub fn reset(&self, name: &str) -> Result<()> {
        let breaker = self
            .breakers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("CircuitBreaker", name))?;
        breaker.reset();
        Ok(())
    }

    /// Status of every registered breaker, sorted by name.
    pub fn status(&self) -> Vec<CircuitBreakerStatus> {
        let mut statuses: Vec<_> = self
            .breakers
            .read()
            .values()
            .map(|b| b.status())
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitState;

    fn fail() -> Result<u32> {
        Err(Error::transient("boom"))
    }

    #[test]
    fn test_settings_resolve_by_class() {
        let settings = BreakerSettings::default();
        assert_eq!(settings.config_for("storage").failure_threshold, 5);
        assert_eq!(
            settings.config_for("remote_api:captioner").recovery_timeout(),
            Duration::from_secs(60)
        );
        assert_eq!(settings.config_for("shared_cache").failure_threshold, 3);
        assert_eq!(settings.config_for("unknown"), BreakerConfig::default());
    }

    #[test]
    fn test_registry_isolates_instances() {
        let registry = CircuitBreakerRegistry::new(
            BreakerSettings::default()
                .with_class(REMOTE_API, BreakerConfig::new(2, Duration::from_secs(60))),
        );
        let captioner = registry.get("remote_api:captioner");
        let _ = captioner.call(fail);
        let _ = captioner.call(fail);

        assert!(!registry.is_allowed("remote_api:captioner"));
        assert!(registry.is_allowed("remote_api:transcriber"));

        let statuses = registry.status();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].name, "remote_api:captioner");
        assert_eq!(statuses[0].state, CircuitState::Open);

        registry.reset("remote_api:captioner").unwrap();
        assert!(registry.is_allowed("remote_api:captioner"));
        assert!(matches!(
            registry.reset("storage:missing"),
            Err(Error::NotFound { .. })
        ));
    }
}
