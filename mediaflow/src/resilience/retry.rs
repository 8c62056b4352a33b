//! Backoff retry with dead-letter routing.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::dead_letter::DeadLetterQueue;
use crate::{Error, Result};

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Initial delay between retries in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based). Attempt 0 is the first call.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay_ms as f64
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32);

        let delay_ms = base_delay.min(self.max_delay_ms as f64) as u64;

        let final_delay = if self.use_jitter {
            // Up to 25% on top of the capped delay.
            let jitter = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            delay_ms + jitter
        } else {
            delay_ms
        };

        Duration::from_millis(final_delay)
    }

    /// Check if another retry should be attempted.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// What the executor does with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Back off and try again.
    Retry,
    /// Stop and persist the unit of work for later replay.
    DeadLetter,
    /// Stop and hand the error to the caller untouched.
    Surface,
}

impl RetryDisposition {
    pub fn classify(err: &Error) -> Self {
        match err {
            Error::ShuttingDown(_) | Error::QueueFull { .. } | Error::RetryExhausted { .. } => {
                Self::Surface
            }
            // The breaker is the retry gate; keep the unit so it can be replayed after recovery.
            Error::CircuitOpen { .. } => Self::DeadLetter,
            Error::Stage { source, .. } => Self::classify(source),
            e if e.is_transient() => Self::Retry,
            _ => Self::DeadLetter,
        }
    }
}

/// Runs operations under [`RetryConfig`], dead-lettering what cannot be recovered.
pub struct RetryExecutor {
    config: RetryConfig,
    dead_letters: Option<Arc<DeadLetterQueue>>,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            dead_letters: None,
        }
    }

    pub fn with_dead_letters(mut self, queue: Arc<DeadLetterQueue>) -> Self {
        self.dead_letters = Some(queue);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `op` until it succeeds or the failure is not worth retrying.
    ///
    /// An always-failing transient operation is attempted `max_retries + 1`
    /// times, then dead-lettered with `retry_count = max_retries` and
    /// reported as [`Error::RetryExhausted`]. Terminal failures are
    /// dead-lettered at once and returned as-is.
    pub async fn execute<T, I, F, Fut>(
        &self,
        item_id: &str,
        operation: &str,
        input: &I,
        mut op: F,
    ) -> Result<T>
    where
        I: Serialize + ?Sized,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        let mut previous_delay = Duration::ZERO;

        loop {
            let err = match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(item_id, operation, attempt, "Operation recovered after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            match RetryDisposition::classify(&err) {
                RetryDisposition::Surface => return Err(err),
                RetryDisposition::DeadLetter => {
                    warn!(item_id, operation, error = %err, "Operation failed, not retrying");
                    self.dead_letter(item_id, operation, input, &err, attempt)
                        .await;
                    return Err(err);
                }
                RetryDisposition::Retry if self.config.should_retry(attempt) => {
                    attempt += 1;
                    // Jitter must never shorten the wait below the previous one.
                    let delay = self.config.delay_for_attempt(attempt).max(previous_delay);
                    previous_delay = delay;
                    warn!(
                        item_id,
                        operation,
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDisposition::Retry => {
                    error!(
                        item_id,
                        operation,
                        attempts = attempt + 1,
                        error = %err,
                        "Retries exhausted"
                    );
                    let dead_letter_id = self
                        .dead_letter(item_id, operation, input, &err, self.config.max_retries)
                        .await;
                    return Err(Error::RetryExhausted {
                        operation: operation.to_string(),
                        attempts: attempt + 1,
                        last_error: err.to_string(),
                        dead_letter_id,
                    });
                }
            }
        }
    }

    async fn dead_letter<I>(
        &self,
        item_id: &str,
        operation: &str,
        input: &I,
        err: &Error,
        retry_count: u32,
    ) -> Option<String>
    where
        I: Serialize + ?Sized,
    {
        let queue = self.dead_letters.as_ref()?;
        let input = serde_json::to_value(input).unwrap_or_else(|e| {
            warn!(item_id, operation, error = %e, "Dead letter input is not serializable");
            serde_json::Value::Null
        });

        match queue
            .add(item_id, operation, input, &err.to_string(), retry_count)
            .await
        {
            Ok(record) => Some(record.id),
            Err(e) => {
                error!(item_id, operation, error = %e, "Failed to persist dead letter");
                None
            }
        }
    }
}
