//! Staged pipeline processor.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::operation::{OperationContext, PartialResult, StageOperation};
use super::progress::{ProgressEvent, ProgressReporter};
use super::runner::{OperationReplay, OperationRunner};
use super::stage::{Stage, StageSpec, default_stages};
use crate::dead_letter::DeadLetterQueue;
use crate::{Error, Result};

/// The unit of work handed to [`StagedPipeline::run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineJob {
    pub job_id: String,
    pub item_id: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineOutcome {
    /// Result of every successful operation, by name.
    pub results: BTreeMap<String, PartialResult>,
    /// Sum of result counts per executed stage.
    pub stage_counts: BTreeMap<Stage, u64>,
    pub skipped: Vec<Stage>,
}

/// Drives an item through the configured stages in order.
pub struct StagedPipeline {
    stages: Vec<StageSpec>,
    operations: Vec<Arc<dyn StageOperation>>,
    runner: Arc<OperationRunner>,
}

impl StagedPipeline {
    pub fn new(runner: Arc<OperationRunner>) -> Self {
        Self {
            stages: default_stages(),
            operations: Vec::new(),
            runner,
        }
    }

    pub fn with_stages(mut self, mut stages: Vec<StageSpec>) -> Self {
        stages.sort_by_key(|spec| spec.stage);
        self.stages = stages;
        self
    }

    /// Register an operation. A later operation with the same name replaces
    /// the earlier one.
    pub fn with_operation(mut self, operation: Arc<dyn StageOperation>) -> Self {
        self.operations.retain(|op| op.name() != operation.name());
        self.operations.push(operation);
        self
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn operations(&self) -> &[Arc<dyn StageOperation>] {
        &self.operations
    }

    pub fn runner(&self) -> &Arc<OperationRunner> {
        &self.runner
    }

    /// Register every operation with `queue` so its dead letters can be replayed.
    pub fn register_replay_handlers(&self, queue: &DeadLetterQueue) {
        for op in &self.operations {
            queue.register_handler(
                op.name(),
                Arc::new(OperationReplay::new(self.runner.clone(), op.clone())),
            );
        }
    }

    /// Run all stages for `job`.
    ///
    /// Results of completed stages stay persisted when a later stage fails.
    /// Cancellation is observed between stages and while operations run.
    pub async fn run(
        &self,
        job: &PipelineJob,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        let mut outcome = PipelineOutcome::default();
        let mut base = 0.0f32;

        for spec in &self.stages {
            if cancel.is_cancelled() {
                return Err(Error::shutdown(format!(
                    "job {} cancelled before {} stage",
                    job.job_id, spec.stage
                )));
            }

            let weight = spec.weight as f32;
            let ctx = OperationContext {
                job_id: job.job_id.clone(),
                item_id: job.item_id.clone(),
                stage: spec.stage,
                metadata: job.metadata.clone(),
                prior: outcome.results.clone(),
            };

            let registered: Vec<&Arc<dyn StageOperation>> = self
                .operations
                .iter()
                .filter(|op| op.stage() == spec.stage)
                .collect();
            let runnable: Vec<&Arc<dyn StageOperation>> = registered
                .iter()
                .copied()
                .filter(|op| op.inputs_available(&ctx))
                .collect();

            if runnable.is_empty() {
                let reason = if registered.is_empty() {
                    "no operations registered"
                } else {
                    "inputs not available"
                };
                info!(
                    job_id = %job.job_id,
                    item_id = %job.item_id,
                    stage = %spec.stage,
                    reason,
                    "Stage skipped"
                );
                base += weight;
                reporter.stage_skipped(spec, base, reason);
                outcome.skipped.push(spec.stage);
                continue;
            }

            info!(
                job_id = %job.job_id,
                item_id = %job.item_id,
                stage = %spec.stage,
                operations = runnable.len(),
                "Stage started"
            );
            reporter.stage_started(spec, base);

            let started = Instant::now();
            let total = runnable.len();
            let finished = AtomicUsize::new(0);

            let calls = runnable.iter().copied().map(|op| {
                let ctx = &ctx;
                let finished = &finished;
                async move {
                    let result = self.runner.run(op.as_ref(), ctx).await;
                    let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
                    let (count, succeeded) = match &result {
                        Ok(r) => (r.count, true),
                        Err(_) => (0, false),
                    };
                    reporter.report(
                        ProgressEvent::OperationFinished {
                            stage: spec.stage,
                            operation: op.name().to_string(),
                            count,
                            succeeded,
                        },
                        base + weight * done as f32 / total as f32,
                        format!("{} ({done}/{total})", spec.label),
                    );
                    (op, result)
                }
            });

            let results = tokio::select! {
                results = join_all(calls) => results,
                _ = cancel.cancelled() => {
                    return Err(Error::shutdown(format!(
                        "job {} cancelled during {} stage",
                        job.job_id, spec.stage
                    )));
                }
            };

            let mut stage_count = 0u64;
            let mut failure = None;
            for (op, result) in results {
                match result {
                    Ok(result) => {
                        stage_count += result.count;
                        outcome.results.insert(op.name().to_string(), result);
                    }
                    Err(e) => {
                        error!(
                            job_id = %job.job_id,
                            item_id = %job.item_id,
                            stage = %spec.stage,
                            operation = op.name(),
                            error = %e,
                            "Operation failed"
                        );
                        if failure.is_none() {
                            failure = Some(Error::Stage {
                                item_id: job.item_id.clone(),
                                stage: spec.stage.to_string(),
                                operation: op.name().to_string(),
                                source: Box::new(e),
                            });
                        }
                    }
                }
            }
            outcome.stage_counts.insert(spec.stage, stage_count);

            let elapsed = started.elapsed();
            if elapsed > spec.target_latency {
                warn!(
                    job_id = %job.job_id,
                    stage = %spec.stage,
                    elapsed_ms = elapsed.as_millis() as u64,
                    budget_ms = spec.target_latency.as_millis() as u64,
                    "Stage exceeded its latency budget"
                );
            }

            let failure = failure.or_else(|| {
                spec.predicate
                    .evaluate(stage_count, &outcome.results)
                    .err()
                    .map(|reason| Error::StageIncomplete {
                        item_id: job.item_id.clone(),
                        stage: spec.stage.to_string(),
                        reason,
                    })
            });

            if let Some(err) = failure {
                reporter.report(
                    ProgressEvent::StageFailed {
                        stage: spec.stage,
                        count: stage_count,
                        error: err.to_string(),
                    },
                    reporter.percent(),
                    format!("{} failed", spec.label),
                );
                return Err(err);
            }

            base += weight;
            info!(
                job_id = %job.job_id,
                item_id = %job.item_id,
                stage = %spec.stage,
                count = stage_count,
                elapsed_ms = elapsed.as_millis() as u64,
                "Stage completed"
            );
            reporter.report(
                ProgressEvent::StageCompleted {
                    stage: spec.stage,
                    count: stage_count,
                },
                base,
                format!("{} done, {stage_count} results", spec.label),
            );
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryLruTier, TieredCache};
    use crate::database::repositories::{
        InMemoryDeadLetterRepository, InMemoryStageResultRepository, StageResultRepository,
    };
    use crate::pipeline::progress::{ProgressSink, ProgressUpdate};
    use crate::pipeline::stage::CompletionPredicate;
    use crate::resilience::{BreakerSettings, CircuitBreakerRegistry, RetryConfig, RetryExecutor};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Operation returning a fixed count, or a terminal error when `count` is None.
    struct Scripted {
        name: &'static str,
        stage: Stage,
        count: Option<u64>,
        needs: Option<&'static str>,
    }

    impl Scripted {
        fn ok(name: &'static str, stage: Stage, count: u64) -> Arc<dyn StageOperation> {
            Arc::new(Self {
                name,
                stage,
                count: Some(count),
                needs: None,
            })
        }

        fn failing(name: &'static str, stage: Stage) -> Arc<dyn StageOperation> {
            Arc::new(Self {
                name,
                stage,
                count: None,
                needs: None,
            })
        }
    }

    #[async_trait]
    impl StageOperation for Scripted {
        fn name(&self) -> &str {
            self.name
        }
        fn stage(&self) -> Stage {
            self.stage
        }
        fn inputs_available(&self, ctx: &OperationContext) -> bool {
            self.needs.is_none_or(|op| ctx.count(op) > 0)
        }
        async fn execute(&self, _ctx: &OperationContext) -> crate::Result<PartialResult> {
            match self.count {
                Some(count) => Ok(PartialResult::new(count, serde_json::json!({"op": self.name}))),
                None => Err(Error::terminal(format!("{} crashed", self.name))),
            }
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ProgressUpdate>>);

    impl ProgressSink for Recorder {
        fn on_progress(&self, update: &ProgressUpdate) {
            self.0.lock().push(update.clone());
        }
    }

    fn runner(results: Arc<InMemoryStageResultRepository>) -> Arc<OperationRunner> {
        let dlq = Arc::new(DeadLetterQueue::new(Arc::new(
            InMemoryDeadLetterRepository::new(),
        )));
        let retry = RetryExecutor::new(RetryConfig {
            max_retries: 0,
            initial_delay_ms: 1,
            max_delay_ms: 1,
            backoff_multiplier: 1.0,
            use_jitter: false,
        })
        .with_dead_letters(dlq);
        Arc::new(OperationRunner::new(
            Arc::new(TieredCache::new(Arc::new(MemoryLruTier::with_capacity(64)))),
            Arc::new(CircuitBreakerRegistry::new(BreakerSettings::default())),
            Arc::new(retry),
            results,
            Duration::from_secs(60),
        ))
    }

    fn job(id: &str) -> PipelineJob {
        PipelineJob {
            job_id: format!("job-{id}"),
            item_id: format!("media-{id}"),
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_runs_all_stages_in_order() {
        let results = Arc::new(InMemoryStageResultRepository::new());
        let pipeline = StagedPipeline::new(runner(results.clone()))
            .with_operation(Scripted::ok("frames", Stage::Fast, 10))
            .with_operation(Scripted::ok("caption", Stage::Medium, 9))
            .with_operation(Scripted::ok("objects", Stage::Medium, 4))
            .with_operation(Scripted::ok("transcript", Stage::Slow, 30));
        let recorder = Arc::new(Recorder::default());
        let reporter = ProgressReporter::new("job-a", "media-a", vec![recorder.clone()]);

        let outcome = pipeline
            .run(&job("a"), &reporter, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.stage_counts[&Stage::Fast], 10);
        assert_eq!(outcome.stage_counts[&Stage::Medium], 13);
        assert_eq!(outcome.stage_counts[&Stage::Slow], 30);
        assert_eq!(results.list_for_job("job-a").await.unwrap().len(), 4);

        let updates = recorder.0.lock();
        let started: Vec<Stage> = updates
            .iter()
            .filter_map(|u| match &u.event {
                ProgressEvent::StageStarted { stage, .. } => Some(*stage),
                _ => None,
            })
            .collect();
        assert_eq!(started, Stage::ALL.to_vec());
        assert!(updates.windows(2).all(|w| w[0].percent <= w[1].percent));
        assert_eq!(updates.last().unwrap().percent, 100.0);
    }

    #[tokio::test]
    async fn test_slow_failure_keeps_earlier_results() {
        let results = Arc::new(InMemoryStageResultRepository::new());
        let pipeline = StagedPipeline::new(runner(results.clone()))
            .with_operation(Scripted::ok("frames", Stage::Fast, 10))
            .with_operation(Scripted::ok("caption", Stage::Medium, 10))
            .with_operation(Scripted::failing("transcript", Stage::Slow));

        let err = pipeline
            .run(&job("b"), &ProgressReporter::noop("job-b", "media-b"), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            Error::Stage { stage, operation, .. } => {
                assert_eq!(stage, "slow");
                assert_eq!(operation, "transcript");
            }
            other => panic!("unexpected error {other:?}"),
        }
        let rows = results.list_for_job("job-b").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.count == 10));
    }

    #[tokio::test]
    async fn test_sibling_success_is_kept_when_one_fails() {
        let results = Arc::new(InMemoryStageResultRepository::new());
        let pipeline = StagedPipeline::new(runner(results.clone()))
            .with_operation(Scripted::ok("frames", Stage::Fast, 5))
            .with_operation(Scripted::ok("caption", Stage::Medium, 5))
            .with_operation(Scripted::failing("objects", Stage::Medium));
        let recorder = Arc::new(Recorder::default());
        let reporter = ProgressReporter::new("job-c", "media-c", vec![recorder.clone()]);

        assert!(pipeline
            .run(&job("c"), &reporter, &CancellationToken::new())
            .await
            .is_err());

        let operations: Vec<String> = results
            .list_for_job("job-c")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.operation)
            .collect();
        assert!(operations.contains(&"caption".to_string()));
        assert!(recorder.0.lock().iter().any(|u| matches!(
            u.event,
            ProgressEvent::StageFailed { stage: Stage::Medium, count: 5, .. }
        )));
    }

    #[tokio::test]
    async fn test_stage_without_inputs_is_skipped() {
        let results = Arc::new(InMemoryStageResultRepository::new());
        let pipeline = StagedPipeline::new(runner(results))
            .with_operation(Scripted::ok("frames", Stage::Fast, 3))
            .with_operation(Scripted::ok("audio", Stage::Fast, 0))
            .with_operation(Arc::new(Scripted {
                name: "transcript",
                stage: Stage::Slow,
                count: Some(7),
                needs: Some("audio"),
            }));

        let outcome = pipeline
            .run(&job("d"), &ProgressReporter::noop("job-d", "media-d"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.skipped, vec![Stage::Medium, Stage::Slow]);
        assert!(!outcome.stage_counts.contains_key(&Stage::Slow));
    }

    #[tokio::test]
    async fn test_unmet_predicate_stops_pipeline() {
        let results = Arc::new(InMemoryStageResultRepository::new());
        let mut stages = default_stages();
        stages[1] = stages[1].clone().with_predicate(CompletionPredicate::Ratio {
            operation: "caption".into(),
            relative_to: "frames".into(),
            min_ratio: 0.8,
        });
        let pipeline = StagedPipeline::new(runner(results.clone()))
            .with_stages(stages)
            .with_operation(Scripted::ok("frames", Stage::Fast, 10))
            .with_operation(Scripted::ok("caption", Stage::Medium, 5))
            .with_operation(Scripted::ok("transcript", Stage::Slow, 1));

        let err = pipeline
            .run(&job("e"), &ProgressReporter::noop("job-e", "media-e"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::StageIncomplete { ref stage, .. } if stage == "medium"));
        let rows = results.list_for_job("job-e").await.unwrap();
        assert!(rows.iter().all(|r| r.operation != "transcript"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let results = Arc::new(InMemoryStageResultRepository::new());
        let pipeline = StagedPipeline::new(runner(results))
            .with_operation(Scripted::ok("frames", Stage::Fast, 1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pipeline
            .run(&job("f"), &ProgressReporter::noop("job-f", "media-f"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShuttingDown(_)));
    }
}
