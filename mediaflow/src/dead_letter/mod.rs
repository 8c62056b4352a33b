//! Dead letter queue: persisted operations that could not be completed.
//!
//! Records are created by the retry executor, triaged through
//! [`DeadLetterQueue::list`] and replayed with [`DeadLetterQueue::reprocess`].
//! Replay goes through the [`ReplayHandler`] registered for the record's
//! operation. Records are never deleted, only archived.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use crate::database::models::DeadLetterFilter;
use crate::database::models::DeadLetterDbModel;
use crate::database::repositories::DeadLetterRepository;
use crate::database::time::{from_ms, now_ms, to_ms};
use crate::{Error, Result};

/// Dead letter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// Replay unprocessed records in the background.
    pub auto_reprocess: bool,
    pub auto_reprocess_interval_secs: u64,
    /// Records replayed per sweep.
    pub batch_size: i64,
    /// Records at or above this retry count are left for manual triage.
    pub max_auto_attempts: u32,
    /// Processed records older than this are archived by the sweep.
    pub archive_after_days: u32,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            auto_reprocess: false,
            auto_reprocess_interval_secs: 300,
            batch_size: 20,
            max_auto_attempts: 5,
            archive_after_days: 7,
        }
    }
}

/// A dead-lettered unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: String,
    pub item_id: String,
    pub operation: String,
    /// Serialized operation input, handed back to the replay handler.
    pub input: serde_json::Value,
    pub error_message: String,
    pub retry_count: u32,
    pub processed: bool,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl DeadLetterRecord {
    fn from_db_model(model: DeadLetterDbModel) -> Self {
        let input = serde_json::from_str(&model.input).unwrap_or_else(|e| {
            warn!(dead_letter_id = %model.id, error = %e, "Stored dead letter input is not JSON");
            serde_json::Value::String(model.input.clone())
        });
        Self {
            id: model.id,
            item_id: model.item_id,
            operation: model.operation,
            input,
            error_message: model.error_message,
            retry_count: model.retry_count.max(0) as u32,
            processed: model.processed,
            archived: model.archived,
            created_at: from_ms(model.created_at),
            updated_at: from_ms(model.updated_at),
            processed_at: model.processed_at.map(from_ms),
        }
    }

    fn to_db_model(&self) -> DeadLetterDbModel {
        DeadLetterDbModel {
            id: self.id.clone(),
            item_id: self.item_id.clone(),
            operation: self.operation.clone(),
            input: self.input.to_string(),
            error_message: self.error_message.clone(),
            retry_count: self.retry_count as i64,
            processed: self.processed,
            archived: self.archived,
            created_at: to_ms(self.created_at),
            updated_at: to_ms(self.updated_at),
            processed_at: self.processed_at.map(to_ms),
        }
    }
}

/// Re-runs the operation a dead letter was recorded for.
#[async_trait]
pub trait ReplayHandler: Send + Sync {
    async fn replay(&self, record: &DeadLetterRecord) -> Result<()>;
}

/// Outcome of one background sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub attempted: usize,
    pub recovered: usize,
    pub failed: usize,
    pub archived: u64,
}

pub struct DeadLetterQueue {
    repository: Arc<dyn DeadLetterRepository>,
    handlers: RwLock<HashMap<String, Arc<dyn ReplayHandler>>>,
    /// Records currently being replayed.
    in_progress: DashMap<String, ()>,
}

impl DeadLetterQueue {
    pub fn new(repository: Arc<dyn DeadLetterRepository>) -> Self {
        Self {
            repository,
            handlers: RwLock::new(HashMap::new()),
            in_progress: DashMap::new(),
        }
    }

    /// Register the replay handler for an operation name.
    pub fn register_handler(&self, operation: impl Into<String>, handler: Arc<dyn ReplayHandler>) {
        let operation = operation.into();
        debug!(operation = %operation, "Registered dead letter replay handler");
        self.handlers.write().insert(operation, handler);
    }

    pub fn has_handler(&self, operation: &str) -> bool {
        self.handlers.read().contains_key(operation)
    }

    /// Persist a new record.
    pub async fn add(
        &self,
        item_id: &str,
        operation: &str,
        input: serde_json::Value,
        error_message: &str,
        retry_count: u32,
    ) -> Result<DeadLetterRecord> {
        let model = DeadLetterDbModel::new(
            item_id,
            operation,
            input.to_string(),
            error_message,
            retry_count as i64,
        );
        self.repository.insert(&model).await?;
        warn!(
            dead_letter_id = %model.id,
            item_id,
            operation,
            retry_count,
            error = error_message,
            "Operation dead-lettered"
        );
        Ok(DeadLetterRecord::from_db_model(model))
    }

    pub async fn get(&self, id: &str) -> Result<DeadLetterRecord> {
        Ok(DeadLetterRecord::from_db_model(self.repository.get(id).await?))
    }

    pub async fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterRecord>> {
        Ok(self
            .repository
            .list(filter)
            .await?
            .into_iter()
            .map(DeadLetterRecord::from_db_model)
            .collect())
    }

    /// Mark a record as handled without replaying it.
    pub async fn mark_processed(&self, id: &str) -> Result<DeadLetterRecord> {
        let mut record = self.get(id).await?;
        if record.processed {
            return Ok(record);
        }
        let now = Utc::now();
        record.processed = true;
        record.processed_at = Some(now);
        record.updated_at = now;
        self.repository.update(&record.to_db_model()).await?;
        info!(dead_letter_id = id, "Dead letter marked processed");
        Ok(record)
    }

    /// Re-run the original operation once.
    ///
    /// Success marks the record processed. Failure increments `retry_count`,
    /// stores the new error and leaves the record queued; the replay error is
    /// returned.
    pub async fn reprocess(&self, id: &str) -> Result<DeadLetterRecord> {
        if self.in_progress.insert(id.to_string(), ()).is_some() {
            return Err(Error::InvalidStateTransition {
                from: "reprocessing".to_string(),
                to: "reprocessing".to_string(),
            });
        }
        let result = self.reprocess_inner(id).await;
        self.in_progress.remove(id);
        result
    }

    async fn reprocess_inner(&self, id: &str) -> Result<DeadLetterRecord> {
        let mut record = self.get(id).await?;
        if record.processed {
            return Err(Error::InvalidStateTransition {
                from: "processed".to_string(),
                to: "reprocessing".to_string(),
            });
        }

        let handler = self
            .handlers
            .read()
            .get(&record.operation)
            .cloned()
            .ok_or_else(|| Error::not_found("ReplayHandler", &record.operation))?;

        info!(
            dead_letter_id = id,
            item_id = %record.item_id,
            operation = %record.operation,
            retry_count = record.retry_count,
            "Reprocessing dead letter"
        );

        let outcome = handler.replay(&record).await;
        let now = Utc::now();
        record.updated_at = now;

        match outcome {
            Ok(()) => {
                record.processed = true;
                record.processed_at = Some(now);
                self.repository.update(&record.to_db_model()).await?;
                info!(dead_letter_id = id, "Dead letter reprocessed successfully");
                Ok(record)
            }
            Err(e) => {
                record.retry_count = record.retry_count.saturating_add(1);
                record.error_message = e.to_string();
                self.repository.update(&record.to_db_model()).await?;
                warn!(
                    dead_letter_id = id,
                    retry_count = record.retry_count,
                    error = %e,
                    "Dead letter reprocessing failed"
                );
                Err(e)
            }
        }
    }

    /// Archive processed records last touched more than `older_than` ago.
    pub async fn archive_processed(&self, older_than: Duration) -> Result<u64> {
        let cutoff = now_ms() - older_than.as_millis() as i64;
        let archived = self.repository.archive_processed(cutoff).await?;
        if archived > 0 {
            info!(archived, "Archived processed dead letters");
        }
        Ok(archived)
    }

    /// One automatic replay pass over the oldest eligible records.
    pub async fn sweep(&self, config: &DeadLetterConfig) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let mut candidates = self.list(&DeadLetterFilter::pending()).await?;
        candidates.retain(|r| {
            r.retry_count < config.max_auto_attempts && self.has_handler(&r.operation)
        });
        // list() is newest first; replay the oldest first.
        candidates.reverse();
        candidates.truncate(config.batch_size.max(0) as usize);

        for record in candidates {
            report.attempted += 1;
            match self.reprocess(&record.id).await {
                Ok(_) => report.recovered += 1,
                Err(_) => report.failed += 1,
            }
        }

        report.archived = self
            .archive_processed(Duration::from_secs(
                u64::from(config.archive_after_days) * 24 * 3600,
            ))
            .await?;
        Ok(report)
    }

    /// Spawn the background replay loop.
    pub fn start_auto_reprocess(
        self: &Arc<Self>,
        config: DeadLetterConfig,
        cancellation_token: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(
                config.auto_reprocess_interval_secs.max(1),
            ));
            info!(
                interval_secs = config.auto_reprocess_interval_secs,
                batch_size = config.batch_size,
                "Dead letter auto-reprocess started"
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Dead letter auto-reprocess shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        match queue.sweep(&config).await {
                            Ok(report) if report.attempted > 0 || report.archived > 0 => {
                                info!(
                                    attempted = report.attempted,
                                    recovered = report.recovered,
                                    failed = report.failed,
                                    archived = report.archived,
                                    "Dead letter sweep finished"
                                );
                            }
                            Ok(_) => debug!("Dead letter sweep found nothing to do"),
                            Err(e) => error!(error = %e, "Dead letter sweep failed"),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::InMemoryDeadLetterRepository;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails `failures` times, then succeeds.
    struct FlakyHandler {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ReplayHandler for FlakyHandler {
        async fn replay(&self, _record: &DeadLetterRecord) -> Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                Err(Error::transient("still down"))
            } else {
                Ok(())
            }
        }
    }

    fn queue_with_handler(failures: u32) -> (DeadLetterQueue, Arc<FlakyHandler>) {
        let queue = DeadLetterQueue::new(Arc::new(InMemoryDeadLetterRepository::new()));
        let handler = Arc::new(FlakyHandler {
            failures,
            calls: AtomicU32::new(0),
        });
        queue.register_handler("caption", handler.clone());
        (queue, handler)
    }

    #[tokio::test]
    async fn test_reprocess_failure_then_success() {
        let (queue, handler) = queue_with_handler(1);
        let record = queue
            .add("media-1", "caption", serde_json::json!({"k": 1}), "boom", 3)
            .await
            .unwrap();

        let err = queue.reprocess(&record.id).await.unwrap_err();
        assert!(matches!(err, Error::Transient(_)));
        let stored = queue.get(&record.id).await.unwrap();
        assert_eq!(stored.retry_count, 4);
        assert!(!stored.processed);
        assert!(stored.error_message.contains("still down"));

        let done = queue.reprocess(&record.id).await.unwrap();
        assert!(done.processed);
        assert!(done.processed_at.is_some());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

        assert!(matches!(
            queue.reprocess(&record.id).await,
            Err(Error::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_reprocess_unknown_operation() {
        let (queue, _) = queue_with_handler(0);
        let record = queue
            .add("media-1", "transcribe", serde_json::Value::Null, "boom", 0)
            .await
            .unwrap();
        assert!(matches!(
            queue.reprocess(&record.id).await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            queue.reprocess("missing").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_mark_processed_and_archive() {
        let (queue, _) = queue_with_handler(0);
        let record = queue
            .add("media-1", "caption", serde_json::Value::Null, "boom", 0)
            .await
            .unwrap();
        queue.mark_processed(&record.id).await.unwrap();

        assert_eq!(queue.archive_processed(Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(queue.archive_processed(Duration::ZERO).await.unwrap(), 1);
        assert!(queue
            .list(&DeadLetterFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_sweep_respects_attempt_limit() {
        let (queue, handler) = queue_with_handler(0);
        queue
            .add("media-1", "caption", serde_json::Value::Null, "boom", 0)
            .await
            .unwrap();
        queue
            .add("media-2", "caption", serde_json::Value::Null, "boom", 9)
            .await
            .unwrap();
        queue
            .add("media-3", "unregistered", serde_json::Value::Null, "boom", 0)
            .await
            .unwrap();

        let config = DeadLetterConfig {
            max_auto_attempts: 5,
            ..Default::default()
        };
        let report = queue.sweep(&config).await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.recovered, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        let pending = queue.list(&DeadLetterFilter::pending()).await.unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn test_auto_reprocess_stops_on_cancel() {
        let (queue, handler) = queue_with_handler(0);
        let queue = Arc::new(queue);
        queue
            .add("media-1", "caption", serde_json::Value::Null, "boom", 0)
            .await
            .unwrap();

        let token = CancellationToken::new();
        let config = DeadLetterConfig {
            auto_reprocess: true,
            auto_reprocess_interval_secs: 1,
            ..Default::default()
        };
        let handle = queue.start_auto_reprocess(config, token.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(queue
            .list(&DeadLetterFilter::pending())
            .await
            .unwrap()
            .is_empty());
    }
}
