//! Failure isolation and retry.

pub mod circuit_breaker;
pub mod registry;
pub mod retry;

pub use circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitBreakerStatus, CircuitState};
pub use registry::{BreakerSettings, CircuitBreakerRegistry, REMOTE_API, SHARED_CACHE, STORAGE};
pub use retry::{RetryConfig, RetryDisposition, RetryExecutor};
