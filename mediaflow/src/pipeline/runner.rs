//! Call chain for a single stage operation.
//!
//! `retry -> breaker -> cache -> operation`, followed by persisting the
//! result. Dead letter replay uses the same chain minus the retry layer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::operation::{OperationContext, PartialResult, StageOperation};
use crate::Result;
use crate::cache::TieredCache;
use crate::database::models::StageResultDbModel;
use crate::database::repositories::StageResultRepository;
use crate::dead_letter::{DeadLetterRecord, ReplayHandler};
use crate::resilience::{CircuitBreakerRegistry, RetryExecutor, STORAGE};

pub struct OperationRunner {
    cache: Arc<TieredCache>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: Arc<RetryExecutor>,
    results: Arc<dyn StageResultRepository>,
    default_ttl: Duration,
}

impl OperationRunner {
    pub fn new(
        cache: Arc<TieredCache>,
        breakers: Arc<CircuitBreakerRegistry>,
        retry: Arc<RetryExecutor>,
        results: Arc<dyn StageResultRepository>,
        default_ttl: Duration,
    ) -> Self {
        Self {
            cache,
            breakers,
            retry,
            results,
            default_ttl,
        }
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Run `op` with retries. Failures that are not retried, or that exhaust
    /// the retries, end up in the dead letter queue.
    pub async fn run(
        &self,
        op: &dyn StageOperation,
        ctx: &OperationContext,
    ) -> Result<PartialResult> {
        self.retry
            .execute(&ctx.item_id, op.name(), ctx, || self.attempt(op, ctx))
            .await
    }

    /// One attempt: compute (or fetch from cache) and persist.
    pub async fn attempt(
        &self,
        op: &dyn StageOperation,
        ctx: &OperationContext,
    ) -> Result<PartialResult> {
        let result = self.invoke(op, ctx).await?;
        self.persist(op, ctx, &result).await?;
        Ok(result)
    }

    async fn invoke(
        &self,
        op: &dyn StageOperation,
        ctx: &OperationContext,
    ) -> Result<PartialResult> {
        let breaker = self.breakers.get(&op.dependency());
        let ttl = op.cache_ttl().unwrap_or(self.default_ttl);
        let key = op.cache_key(ctx);

        breaker
            .call_async(|| {
                self.cache
                    .get_or_compute(op.cache_namespace(), &key, ttl, || op.execute(ctx))
            })
            .await
    }

    async fn persist(
        &self,
        op: &dyn StageOperation,
        ctx: &OperationContext,
        result: &PartialResult,
    ) -> Result<()> {
        let row = StageResultDbModel::new(
            &ctx.job_id,
            &ctx.item_id,
            ctx.stage.as_str(),
            op.name(),
            result.count as i64,
            result.data.to_string(),
        );
        self.breakers
            .get(STORAGE)
            .call_async(|| self.results.replace(&row))
            .await?;
        debug!(
            job_id = %ctx.job_id,
            item_id = %ctx.item_id,
            operation = op.name(),
            count = result.count,
            "Stage result persisted"
        );
        Ok(())
    }
}

/// Replays a dead-lettered operation from its serialized context.
pub struct OperationReplay {
    runner: Arc<OperationRunner>,
    operation: Arc<dyn StageOperation>,
}

impl OperationReplay {
    pub fn new(runner: Arc<OperationRunner>, operation: Arc<dyn StageOperation>) -> Self {
        Self { runner, operation }
    }
}

#[async_trait]
impl ReplayHandler for OperationReplay {
    async fn replay(&self, record: &DeadLetterRecord) -> Result<()> {
        let ctx: OperationContext = serde_json::from_value(record.input.clone())?;
        self.runner
            .attempt(self.operation.as_ref(), &ctx)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryLruTier;
    use crate::database::models::DeadLetterFilter;
    use crate::database::repositories::{
        InMemoryDeadLetterRepository, InMemoryStageResultRepository,
    };
    use crate::dead_letter::DeadLetterQueue;
    use crate::pipeline::Stage;
    use crate::resilience::{BreakerSettings, RetryConfig};
    use crate::Error;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct Captions {
        calls: AtomicU32,
        healthy: AtomicBool,
    }

    #[async_trait]
    impl StageOperation for Captions {
        fn name(&self) -> &str {
            "caption"
        }
        fn stage(&self) -> Stage {
            Stage::Medium
        }
        async fn execute(&self, ctx: &OperationContext) -> Result<PartialResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(PartialResult::new(
                    ctx.count("frames"),
                    serde_json::json!({"model": "test"}),
                ))
            } else {
                Err(Error::transient("model server unavailable"))
            }
        }
    }

    struct Fixture {
        runner: Arc<OperationRunner>,
        results: Arc<InMemoryStageResultRepository>,
        dlq: Arc<DeadLetterQueue>,
    }

    fn fixture() -> Fixture {
        let results = Arc::new(InMemoryStageResultRepository::new());
        let dlq = Arc::new(DeadLetterQueue::new(Arc::new(
            InMemoryDeadLetterRepository::new(),
        )));
        let retry = RetryExecutor::new(RetryConfig {
            max_retries: 1,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
            use_jitter: false,
        })
        .with_dead_letters(dlq.clone());
        let runner = Arc::new(OperationRunner::new(
            Arc::new(TieredCache::new(Arc::new(MemoryLruTier::with_capacity(16)))),
            Arc::new(CircuitBreakerRegistry::new(BreakerSettings::default())),
            Arc::new(retry),
            results.clone(),
            Duration::from_secs(60),
        ));
        Fixture {
            runner,
            results,
            dlq,
        }
    }

    fn context() -> OperationContext {
        let mut prior = BTreeMap::new();
        prior.insert("frames".to_string(), PartialResult::new(12, serde_json::Value::Null));
        OperationContext {
            job_id: "job-1".into(),
            item_id: "media-1".into(),
            stage: Stage::Medium,
            metadata: serde_json::Value::Null,
            prior,
        }
    }

    #[tokio::test]
    async fn test_run_caches_and_persists() {
        let fx = fixture();
        let op = Captions {
            calls: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
        };
        let ctx = context();

        let first = fx.runner.run(&op, &ctx).await.unwrap();
        let second = fx.runner.run(&op, &ctx).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.count, 12);
        assert_eq!(op.calls.load(Ordering::SeqCst), 1);

        let rows = fx.results.list_for_job("job-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].stage, "medium");
        assert_eq!(rows[0].operation, "caption");
        assert_eq!(rows[0].count, 12);
    }

    #[tokio::test]
    async fn test_dead_letter_replay_after_recovery() {
        let fx = fixture();
        let op = Arc::new(Captions {
            calls: AtomicU32::new(0),
            healthy: AtomicBool::new(false),
        });
        fx.dlq.register_handler(
            "caption",
            Arc::new(OperationReplay::new(fx.runner.clone(), op.clone())),
        );

        let err = fx.runner.run(op.as_ref(), &context()).await.unwrap_err();
        let Error::RetryExhausted { dead_letter_id, .. } = err else {
            panic!("expected RetryExhausted, got {err:?}");
        };
        let dead_letter_id = dead_letter_id.unwrap();
        assert_eq!(op.calls.load(Ordering::SeqCst), 2);

        let pending = fx.dlq.list(&DeadLetterFilter::pending()).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].input["item_id"], "media-1");

        op.healthy.store(true, Ordering::SeqCst);
        let record = fx.dlq.reprocess(&dead_letter_id).await.unwrap();
        assert!(record.processed);
        assert_eq!(fx.results.list_for_job("job-1").await.unwrap().len(), 1);
    }
}
