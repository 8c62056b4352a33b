//! Circuit breaker, retry and dead-letter behavior.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mediaflow::config::AppConfig;
use mediaflow::database::repositories::InMemoryDeadLetterRepository;
use mediaflow::dead_letter::{DeadLetterFilter, DeadLetterQueue};
use mediaflow::pipeline::{OperationContext, PartialResult, Stage, StageOperation};
use mediaflow::queue::JobStatus;
use mediaflow::resilience::{
    BreakerConfig, CircuitBreaker, CircuitState, RetryConfig, RetryExecutor,
};
use mediaflow::services::ServiceContainer;
use mediaflow::{Error, Result};
use parking_lot::Mutex;
use serde_json::json;

#[tokio::test]
async fn test_breaker_opens_rejects_and_recovers() {
    let breaker = CircuitBreaker::new(
        "remote_api:captioner",
        BreakerConfig::new(3, Duration::from_millis(100)),
    );
    let calls = AtomicU32::new(0);

    for _ in 0..3 {
        let result: Result<()> = breaker
            .call_async(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::transient("model server unavailable"))
            })
            .await;
        assert!(matches!(result, Err(Error::Transient(_))));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let rejected: Result<()> = breaker
        .call_async(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    let err = rejected.unwrap_err();
    assert!(matches!(err, Error::CircuitOpen { .. }));
    assert!(err.retry_after().unwrap() <= Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    tokio::time::sleep(Duration::from_millis(150)).await;

    let value = breaker.call_async(|| async { Ok(7) }).await.unwrap();
    assert_eq!(value, 7);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}

#[tokio::test]
async fn test_retry_exhaustion_dead_letters_once() {
    let dead_letters = Arc::new(DeadLetterQueue::new(Arc::new(
        InMemoryDeadLetterRepository::new(),
    )));
    let config = RetryConfig {
        max_retries: 3,
        initial_delay_ms: 10,
        max_delay_ms: 40,
        backoff_multiplier: 2.0,
        use_jitter: false,
    };
    let executor = RetryExecutor::new(config.clone()).with_dead_letters(dead_letters.clone());
    let attempts = Mutex::new(Vec::new());

    let result: Result<()> = executor
        .execute("podcast-9", "transcribe", &json!({ "lang": "en" }), || {
            attempts.lock().push(Instant::now());
            async { Err(Error::transient("inference timeout")) }
        })
        .await;

    let attempts = attempts.into_inner();
    assert_eq!(attempts.len(), 4);
    for (k, pair) in attempts.windows(2).enumerate() {
        let gap = pair[1] - pair[0];
        assert!(gap >= config.delay_for_attempt(k as u32 + 1));
    }
    assert!(config.delay_for_attempt(1) <= config.delay_for_attempt(2));
    assert!(config.delay_for_attempt(2) <= config.delay_for_attempt(3));

    let id = match result {
        Err(Error::RetryExhausted {
            attempts: tried,
            dead_letter_id: Some(id),
            ..
        }) => {
            assert_eq!(tried, 4);
            id
        }
        other => panic!("expected RetryExhausted, got {other:?}"),
    };

    let records = dead_letters.list(&DeadLetterFilter::default()).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, id);
    assert_eq!(records[0].retry_count, 3);
    assert_eq!(records[0].input, json!({ "lang": "en" }));
}

#[tokio::test]
async fn test_circuit_open_is_not_retried() {
    let executor = RetryExecutor::new(RetryConfig::default());
    let calls = AtomicU32::new(0);

    let result: Result<()> = executor
        .execute("clip-1", "caption", &(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(Error::CircuitOpen {
                    name: "remote_api:caption".to_string(),
                    retry_after: Duration::from_secs(30),
                })
            }
        })
        .await;

    assert!(matches!(result, Err(Error::CircuitOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Fails until switched on.
struct Flaky {
    healthy: AtomicBool,
}

#[async_trait]
impl StageOperation for Flaky {
    fn name(&self) -> &str {
        "captions"
    }

    fn stage(&self) -> Stage {
        Stage::Medium
    }

    async fn execute(&self, ctx: &OperationContext) -> Result<PartialResult> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(PartialResult::new(5, json!({ "item": ctx.item_id })))
        } else {
            Err(Error::transient("captioning backend unavailable"))
        }
    }
}

#[tokio::test]
async fn test_dead_letter_reprocessed_after_recovery() {
    let flaky = Arc::new(Flaky {
        healthy: AtomicBool::new(false),
    });
    let mut config = AppConfig::default();
    config.workers.workers = 1;
    config.retry.max_retries = 1;
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 2;

    let services = ServiceContainer::builder()
        .in_memory()
        .config(config)
        .operation(flaky.clone())
        .build()
        .await
        .unwrap();
    services.start();

    services
        .submit_job("interview-2", None, json!(null))
        .await
        .unwrap();
    let job = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(job) = services.get_job_status("interview-2").await
                && job.is_terminal()
            {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(job.status, JobStatus::Failed);

    let pending = services
        .get_dead_letter_items(&DeadLetterFilter::pending())
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_count, 1);

    // Still failing: the record stays queued with one more attempt counted.
    assert!(services.reprocess_dead_letter(&pending[0].id).await.is_err());
    let record = services.dead_letters().get(&pending[0].id).await.unwrap();
    assert!(!record.processed);
    assert_eq!(record.retry_count, 2);

    flaky.healthy.store(true, Ordering::SeqCst);
    let record = services
        .reprocess_dead_letter(&pending[0].id)
        .await
        .unwrap();
    assert!(record.processed);
    assert!(record.processed_at.is_some());

    let err = services
        .reprocess_dead_letter(&pending[0].id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidStateTransition { .. }));
    assert!(
        services
            .get_dead_letter_items(&DeadLetterFilter::pending())
            .await
            .unwrap()
            .is_empty()
    );

    services.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_breaker_status_and_reset() {
    let services = ServiceContainer::builder().in_memory().build().await.unwrap();
    let breaker = services.breakers().get("remote_api:detector");
    for _ in 0..5 {
        breaker.record_failure();
    }

    let status = services
        .get_circuit_breaker_status()
        .into_iter()
        .find(|s| s.name == "remote_api:detector")
        .unwrap();
    assert_eq!(status.state, CircuitState::Open);
    assert_eq!(status.failure_count, 5);
    assert!(status.retry_after_ms.is_some());

    services.reset_circuit_breaker("remote_api:detector").unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}
