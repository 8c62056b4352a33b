//! Service container for dependency injection.
//!
//! The `ServiceContainer` owns every component of the core (queue, worker
//! pool, pipeline, cache, breakers, dead letters, reconciler) and exposes
//! the operations external collaborators call.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{
    CacheStats, CacheTier, GuardedTier, MemoryLruTier, SqliteTier, TieredCache, TtlMapTier,
};
use crate::config::AppConfig;
use crate::database::repositories::{
    DeadLetterRepository, InMemoryDeadLetterRepository, InMemoryStageResultRepository,
    InMemoryWorkItemRepository, SqlxDeadLetterRepository, SqlxStageResultRepository,
    SqlxWorkItemRepository, StageResultRepository, WorkItemRepository,
};
use crate::database::{self, DbPool};
use crate::dead_letter::{DeadLetterFilter, DeadLetterQueue, DeadLetterRecord};
use crate::pipeline::{OperationRunner, ProgressSink, StageOperation, StageSpec, StagedPipeline};
use crate::queue::{
    JobQueue, Priority, QueueStatus, ShutdownReport, SubmitReceipt, WorkItem, WorkerPool,
};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::resilience::{CircuitBreakerRegistry, CircuitBreakerStatus, RetryExecutor, SHARED_CACHE};
use crate::Result;

/// Breaker guarding the Tier 3 store; shares thresholds with the `storage` class.
const CACHE_STORE_BREAKER: &str = "storage:cache";

/// Where records live.
enum Storage {
    Sqlite(DbPool),
    Memory,
}

/// Builder for [`ServiceContainer`].
pub struct ServiceContainerBuilder {
    config: AppConfig,
    pool: Option<DbPool>,
    in_memory: bool,
    stages: Option<Vec<StageSpec>>,
    operations: Vec<Arc<dyn StageOperation>>,
    sinks: Vec<Arc<dyn ProgressSink>>,
    shared_cache: Option<Arc<dyn CacheTier>>,
}

impl ServiceContainerBuilder {
    fn new() -> Self {
        Self {
            config: AppConfig::default(),
            pool: None,
            in_memory: false,
            stages: None,
            operations: Vec::new(),
            sinks: Vec::new(),
            shared_cache: None,
        }
    }

    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an existing pool instead of opening `config.database.url`.
    pub fn pool(mut self, pool: DbPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Keep records and Tier 3 in process; no database is opened.
    pub fn in_memory(mut self) -> Self {
        self.in_memory = true;
        self
    }

    pub fn stages(mut self, stages: Vec<StageSpec>) -> Self {
        self.stages = Some(stages);
        self
    }

    pub fn operation(mut self, operation: Arc<dyn StageOperation>) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Tier 2 backend to use instead of the configured Redis URL.
    pub fn shared_cache(mut self, tier: Arc<dyn CacheTier>) -> Self {
        self.shared_cache = Some(tier);
        self
    }

    pub async fn build(self) -> Result<ServiceContainer> {
        let config = self.config;
        config.validate()?;

        let storage = if self.in_memory {
            Storage::Memory
        } else {
            let pool = match self.pool {
                Some(pool) => pool,
                None if config.database.is_memory() => database::init_memory_pool().await?,
                None => {
                    database::init_pool_with_size(
                        &config.database.url,
                        config.database.max_connections,
                    )
                    .await?
                }
            };
            database::run_migrations(&pool).await?;
            Storage::Sqlite(pool)
        };

        let (work_items, results, dead_letter_repo): (
            Arc<dyn WorkItemRepository>,
            Arc<dyn StageResultRepository>,
            Arc<dyn DeadLetterRepository>,
        ) = match &storage {
            Storage::Sqlite(pool) => (
                Arc::new(SqlxWorkItemRepository::new(pool.clone())),
                Arc::new(SqlxStageResultRepository::new(pool.clone())),
                Arc::new(SqlxDeadLetterRepository::new(pool.clone())),
            ),
            Storage::Memory => (
                Arc::new(InMemoryWorkItemRepository::new()),
                Arc::new(InMemoryStageResultRepository::new()),
                Arc::new(InMemoryDeadLetterRepository::new()),
            ),
        };

        let breakers = Arc::new(CircuitBreakerRegistry::new(config.breakers.clone()));

        // Cache tiers
        let mut cache = TieredCache::new(Arc::new(MemoryLruTier::with_capacity(
            config.cache.l1_capacity,
        )));
        let shared = match self.shared_cache {
            Some(tier) => Some(tier),
            None => connect_shared_cache(&config).await,
        };
        if let Some(tier) = shared {
            cache = cache.with_l2(Arc::new(GuardedTier::new(tier, breakers.get(SHARED_CACHE))));
        }
        let sqlite_cache = match &storage {
            Storage::Sqlite(pool) if config.cache.l3_enabled => Some(SqliteTier::new(pool.clone())),
            _ => None,
        };
        let l3: Arc<dyn CacheTier> = match &sqlite_cache {
            Some(tier) => Arc::new(tier.clone()),
            None => Arc::new(TtlMapTier::new()),
        };
        let cache = Arc::new(cache.with_l3(Arc::new(GuardedTier::new(
            l3,
            breakers.get(CACHE_STORE_BREAKER),
        ))));

        // Retry and dead letters
        let dead_letters = Arc::new(DeadLetterQueue::new(dead_letter_repo));
        let retry = Arc::new(
            RetryExecutor::new(config.retry.clone()).with_dead_letters(dead_letters.clone()),
        );

        // Pipeline
        let runner = Arc::new(OperationRunner::new(
            cache.clone(),
            breakers.clone(),
            retry,
            results.clone(),
            config.cache.default_ttl(),
        ));
        let mut pipeline = StagedPipeline::new(runner);
        if let Some(stages) = self.stages {
            pipeline = pipeline.with_stages(stages);
        }
        for operation in self.operations {
            pipeline = pipeline.with_operation(operation);
        }
        pipeline.register_replay_handlers(&dead_letters);
        let pipeline = Arc::new(pipeline);

        // Queue and workers
        let queue = Arc::new(JobQueue::new(config.queue.clone(), work_items.clone()));
        let workers = WorkerPool::new(config.workers.clone(), queue.clone(), pipeline.clone())
            .with_sinks(self.sinks);

        let reconciler = Arc::new(
            Reconciler::new(work_items.clone(), results)
                .with_queue(queue.clone())
                .with_stale_after(config.reconcile.stale_after()),
        );

        let pool = match storage {
            Storage::Sqlite(pool) => Some(pool),
            Storage::Memory => None,
        };

        info!(
            workers = config.workers.workers,
            operations = pipeline.operations().len(),
            persistent = pool.is_some(),
            shared_cache = cache.has_tier(2),
            "Service container built"
        );

        Ok(ServiceContainer {
            config,
            pool,
            work_items,
            queue,
            workers,
            pipeline,
            cache,
            sqlite_cache,
            breakers,
            dead_letters,
            reconciler,
            cancellation_token: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

#[cfg(feature = "redis-backend")]
async fn connect_shared_cache(config: &AppConfig) -> Option<Arc<dyn CacheTier>> {
    let url = config.cache.redis_url.as_deref()?;
    match crate::cache::RedisTier::connect(url, config.cache.redis_key_prefix.clone()).await {
        Ok(tier) => {
            info!("Tier 2 cache connected to Redis");
            Some(Arc::new(tier))
        }
        Err(e) => {
            warn!(error = %e, "Redis unavailable; running without Tier 2 cache");
            None
        }
    }
}

#[cfg(not(feature = "redis-backend"))]
async fn connect_shared_cache(config: &AppConfig) -> Option<Arc<dyn CacheTier>> {
    if config.cache.redis_url.is_some() {
        warn!("redis_url is set but the redis-backend feature is disabled, skipping Tier 2");
    }
    None
}

/// Service container holding all core services.
pub struct ServiceContainer {
    config: AppConfig,
    pool: Option<DbPool>,
    work_items: Arc<dyn WorkItemRepository>,
    queue: Arc<JobQueue>,
    workers: WorkerPool,
    pipeline: Arc<StagedPipeline>,
    cache: Arc<TieredCache>,
    sqlite_cache: Option<SqliteTier>,
    breakers: Arc<CircuitBreakerRegistry>,
    dead_letters: Arc<DeadLetterQueue>,
    reconciler: Arc<Reconciler>,
    /// Stops background tasks.
    cancellation_token: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceContainer {
    pub fn builder() -> ServiceContainerBuilder {
        ServiceContainerBuilder::new()
    }

    /// Launch workers and background tasks. Calling it twice is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Service container already started");
            return;
        }

        let mut tasks = self.tasks.lock();
        if let Some(writer) = self
            .queue
            .start_progress_writer(self.cancellation_token.child_token())
        {
            tasks.push(writer);
        }

        self.workers.start();

        if self.config.dead_letter.auto_reprocess {
            tasks.push(self.dead_letters.start_auto_reprocess(
                self.config.dead_letter.clone(),
                self.cancellation_token.child_token(),
            ));
        }

        if self.config.reconcile.enabled {
            tasks.push(self.reconciler.start_periodic(
                Duration::from_secs(self.config.reconcile.interval_secs.max(1)),
                self.config.reconcile.dry_run,
                self.cancellation_token.child_token(),
            ));
        }

        if let Some(tier) = &self.sqlite_cache {
            tasks.push(tier.start_cleanup_task(
                Duration::from_secs(self.config.cache.cleanup_interval_secs),
                self.cancellation_token.child_token(),
            ));
        }

        info!(background_tasks = tasks.len(), "Services started");
    }

    /// Queue an item for processing.
    pub async fn submit_job(
        &self,
        item_id: &str,
        priority: Option<Priority>,
        metadata: serde_json::Value,
    ) -> Result<SubmitReceipt> {
        self.queue
            .submit(item_id, priority.unwrap_or_default(), metadata)
            .await
    }

    /// Latest job for an item, live or persisted.
    pub async fn get_job_status(&self, item_id: &str) -> Result<WorkItem> {
        self.queue.lookup_item(item_id).await
    }

    pub fn get_queue_status(&self) -> QueueStatus {
        self.queue.queue_status(self.workers.worker_count())
    }

    pub fn get_circuit_breaker_status(&self) -> Vec<CircuitBreakerStatus> {
        self.breakers.status()
    }

    pub fn reset_circuit_breaker(&self, name: &str) -> Result<()> {
        self.breakers.reset(name)
    }

    pub async fn get_cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// Remove every cached key in `namespace` matching the glob `pattern`.
    pub async fn invalidate_cache(&self, pattern: &str, namespace: &str) -> Result<u64> {
        self.cache.invalidate_pattern(pattern, namespace).await
    }

    pub async fn get_dead_letter_items(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterRecord>> {
        self.dead_letters.list(filter).await
    }

    pub async fn reprocess_dead_letter(&self, id: &str) -> Result<DeadLetterRecord> {
        self.dead_letters.reprocess(id).await
    }

    /// Persisted job counts by status, including jobs of earlier runs.
    pub async fn persisted_job_counts(&self) -> Result<Vec<(String, i64)>> {
        self.work_items.count_by_status().await
    }

    /// Run a reconciliation sweep that applies its fixes.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.reconciler.run(false).await
    }

    /// Stop workers, background tasks and the database, all within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let started = Instant::now();
        let deadline = tokio::time::Instant::from_std(started + timeout);
        info!(timeout_ms = timeout.as_millis() as u64, "Shutting down services");

        let report = self.workers.shutdown(timeout).await;
        self.cancellation_token.cancel();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        let aborts: Vec<_> = tasks.iter().map(|task| task.abort_handle()).collect();
        if tokio::time::timeout_at(deadline, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!(tasks = aborts.len(), "Background tasks did not stop in time, aborting");
            aborts.iter().for_each(|task| task.abort());
        }

        if let Some(pool) = &self.pool
            && tokio::time::timeout_at(deadline, pool.close()).await.is_err()
        {
            warn!("Database pool did not close in time");
        }

        info!(
            graceful = report.graceful,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Services shut down"
        );
        report
    }

    /// Shut down with the configured grace period.
    pub async fn shutdown_default(&self) -> ShutdownReport {
        self.shutdown(self.config.workers.shutdown_timeout()).await
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn pool(&self) -> Option<&DbPool> {
        self.pool.as_ref()
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn pipeline(&self) -> &Arc<StagedPipeline> {
        &self.pipeline
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.dead_letters
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutdown_requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{OperationContext, PartialResult, Stage};
    use crate::queue::JobStatus;
    use async_trait::async_trait;

    struct Count(Stage, &'static str, u64);

    #[async_trait]
    impl StageOperation for Count {
        fn name(&self) -> &str {
            self.1
        }
        fn stage(&self) -> Stage {
            self.0
        }
        async fn execute(&self, _ctx: &OperationContext) -> Result<PartialResult> {
            Ok(PartialResult::new(self.2, serde_json::Value::Null))
        }
    }

    async fn wait_terminal(services: &ServiceContainer, item_id: &str) -> WorkItem {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(job) = services.get_job_status(item_id).await
                    && job.is_terminal()
                {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_container_runs_jobs() {
        let services = ServiceContainer::builder()
            .in_memory()
            .operation(Arc::new(Count(Stage::Fast, "scenes", 3)))
            .operation(Arc::new(Count(Stage::Medium, "captions", 2)))
            .build()
            .await
            .unwrap();
        services.start();
        services.start();

        let receipt = services
            .submit_job("video-1", Some(Priority::High), serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(receipt.queue_size, 1);

        let job = wait_terminal(&services, "video-1").await;
        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(job.stage_counts[&Stage::Fast], 3);
        assert_eq!(job.stage_counts[&Stage::Medium], 2);

        let status = services.get_queue_status();
        assert_eq!(status.completed_jobs, 1);
        assert_eq!(status.worker_count, 2);

        let stats = services.get_cache_stats().await;
        assert_eq!(stats.computations, 2);
        assert!(stats.tier(2).is_none());

        let report = services.shutdown(Duration::from_secs(1)).await;
        assert!(report.graceful);
        assert!(services.is_shutting_down());
        assert!(matches!(
            services
                .submit_job("video-2", None, serde_json::Value::Null)
                .await,
            Err(crate::Error::ShuttingDown(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_breaker_reset_is_not_found() {
        let services = ServiceContainer::builder().in_memory().build().await.unwrap();
        assert!(matches!(
            services.reset_circuit_breaker("remote_api:nothing"),
            Err(crate::Error::NotFound { .. })
        ));
        // The cache breakers exist from construction.
        let names: Vec<_> = services
            .get_circuit_breaker_status()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert!(names.contains(&CACHE_STORE_BREAKER.to_string()));
        assert!(services.reset_circuit_breaker(CACHE_STORE_BREAKER).is_ok());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = AppConfig::default();
        config.workers.workers = 0;
        let result = ServiceContainer::builder()
            .in_memory()
            .config(config)
            .build()
            .await;
        assert!(matches!(result, Err(crate::Error::Configuration(_))));
    }
}
