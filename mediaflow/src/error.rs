//! Application-wide error types.

use std::time::Duration;

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Queue is full: {queued} jobs waiting (limit {capacity})")]
    QueueFull { queued: usize, capacity: usize },

    #[error("Circuit '{name}' is open, retry after {}ms", .retry_after.as_millis())]
    CircuitOpen { name: String, retry_after: Duration },

    #[error("Operation '{operation}' failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
        dead_letter_id: Option<String>,
    },

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Unrecoverable failure: {0}")]
    Terminal(String),

    #[error("[{item_id}] {stage} stage, operation '{operation}': {source}")]
    Stage {
        item_id: String,
        stage: String,
        operation: String,
        source: Box<Error>,
    },

    #[error("[{item_id}] {stage} stage incomplete: {reason}")]
    StageIncomplete {
        item_id: String,
        stage: String,
        reason: String,
    },

    #[error("shutdown: {0}")]
    ShuttingDown(String),

    #[error("Timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[cfg(feature = "redis-backend")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }

    pub fn shutdown(msg: impl Into<String>) -> Self {
        Self::ShuttingDown(msg.into())
    }

    /// Whether the failure describes a temporary condition worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) | Self::Timeout(_) | Self::Cache(_) | Self::Io(_) => true,
            Self::DatabaseSqlx(e) => matches!(e, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)),
            #[cfg(feature = "redis-backend")]
            Self::Redis(e) => e.is_timeout() || e.is_connection_dropped() || e.is_io_error(),
            Self::Stage { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Hint for callers rejected by an open circuit.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } => Some(*retry_after),
            Self::Stage { source, .. } => source.retry_after(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::transient("timeout").is_transient());
        assert!(Error::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!Error::terminal("bad input").is_transient());
        assert!(
            !Error::CircuitOpen {
                name: "storage".to_string(),
                retry_after: Duration::from_secs(3),
            }
            .is_transient()
        );
        assert!(
            !Error::QueueFull {
                queued: 10,
                capacity: 10
            }
            .is_transient()
        );
    }

    #[test]
    fn test_stage_error_keeps_context() {
        let err = Error::Stage {
            item_id: "media-1".to_string(),
            stage: "slow".to_string(),
            operation: "transcribe".to_string(),
            source: Box::new(Error::transient("connection reset")),
        };
        let msg = err.to_string();
        assert!(msg.contains("media-1"));
        assert!(msg.contains("slow"));
        assert!(msg.contains("transcribe"));
        assert!(msg.contains("connection reset"));
        assert!(err.is_transient());
    }

    #[test]
    fn test_retry_after_hint() {
        let err = Error::CircuitOpen {
            name: "remote_api".to_string(),
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
        assert!(err.to_string().contains("1500ms"));
        assert_eq!(Error::terminal("x").retry_after(), None);
    }
}
