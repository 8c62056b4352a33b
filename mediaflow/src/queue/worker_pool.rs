//! Fixed-size worker pool driving jobs through the pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::job_queue::JobQueue;
use crate::Error;
use crate::pipeline::{PipelineJob, ProgressReporter, ProgressSink, StagedPipeline};

/// Configuration for a worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Per-job timeout in seconds; `None` disables it.
    pub job_timeout_secs: Option<u64>,
    /// Grace period used by [`WorkerPool::shutdown`] callers that have no
    /// timeout of their own.
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            job_timeout_secs: None,
            shutdown_timeout_secs: 30,
        }
    }
}

impl WorkerPoolConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Every in-flight job finished within the timeout.
    pub graceful: bool,
    /// Jobs still running at the deadline, marked failed.
    pub force_failed: Vec<String>,
    /// Jobs that never started, marked failed.
    pub cancelled_queued: Vec<String>,
    pub elapsed_ms: u64,
}

/// A worker pool for processing jobs.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<JobQueue>,
    pipeline: Arc<StagedPipeline>,
    sinks: Vec<Arc<dyn ProgressSink>>,
    active_workers: Arc<AtomicUsize>,
    /// Stops dequeuing.
    stop_token: CancellationToken,
    /// Cancels running jobs.
    jobs_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<JobQueue>,
        pipeline: Arc<StagedPipeline>,
    ) -> Self {
        Self {
            config,
            queue,
            pipeline,
            sinks: Vec::new(),
            active_workers: Arc::new(AtomicUsize::new(0)),
            stop_token: CancellationToken::new(),
            jobs_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Additional progress sinks; the job queue is always notified.
    pub fn with_sinks(mut self, sinks: Vec<Arc<dyn ProgressSink>>) -> Self {
        self.sinks = sinks;
        self
    }

    /// Start the worker pool.
    pub fn start(&self) {
        let job_timeout = self.config.job_timeout_secs.map(Duration::from_secs);
        let mut sinks: Vec<Arc<dyn ProgressSink>> = vec![self.queue.clone()];
        sinks.extend(self.sinks.iter().cloned());

        info!(workers = self.config.workers, ?job_timeout, "Starting worker pool");

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            warn!("Worker pool already shut down");
            return;
        };

        for worker in 0..self.config.workers {
            let queue = self.queue.clone();
            let pipeline = self.pipeline.clone();
            let sinks = sinks.clone();
            let active = self.active_workers.clone();
            let stop_token = self.stop_token.clone();
            let jobs_token = self.jobs_token.clone();

            join_set.spawn(async move {
                debug!(worker, "Worker started");

                while let Some(item) = queue.dequeue(&stop_token).await {
                    active.fetch_add(1, Ordering::SeqCst);

                    let job = PipelineJob {
                        job_id: item.job_id.clone(),
                        item_id: item.item_id.clone(),
                        metadata: item.metadata.clone(),
                    };
                    let reporter = ProgressReporter::new(&job.job_id, &job.item_id, sinks.clone());
                    let run = pipeline.run(&job, &reporter, &jobs_token);

                    let result = match job_timeout {
                        Some(limit) => tokio::time::timeout(limit, run)
                            .await
                            .unwrap_or(Err(Error::Timeout(limit))),
                        None => run.await,
                    };

                    match result {
                        Ok(outcome) => {
                            queue.complete(&job.job_id, &outcome).await;
                        }
                        Err(e) => {
                            queue.fail(&job.job_id, &e.to_string()).await;
                        }
                    }
                    active.fetch_sub(1, Ordering::SeqCst);
                }

                debug!(worker, "Worker stopped");
            });
        }
    }

    /// Stop accepting work, let running jobs finish within `timeout`, then
    /// cancel whatever is left and mark it failed. Returns by the deadline.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let started = Instant::now();
        let deadline = tokio::time::Instant::from_std(started + timeout);
        // Keep a slice of the budget for cancelling and failing stragglers.
        let reserve = (timeout / 10).min(Duration::from_millis(250));
        let grace_deadline = deadline - reserve;

        info!(timeout_ms = timeout.as_millis() as u64, "Shutting down worker pool");
        // Rewritten at the end in case an aborted worker never persisted them.
        let mut touched = self.queue.active_job_ids();
        self.queue.request_shutdown();
        self.stop_token.cancel();

        let mut report = ShutdownReport::default();
        for job_id in self.queue.drain_backlog() {
            if self.queue.fail_in_memory(&job_id, "shutdown: cancelled before start") {
                report.cancelled_queued.push(job_id);
            }
        }

        let join_set = self.tasks.lock().take();
        let drain_workers = async {
            let Some(mut join_set) = join_set else {
                return (true, None);
            };
            let drained = tokio::time::timeout_at(grace_deadline, async {
                while join_set.join_next().await.is_some() {}
            })
            .await
            .is_ok();
            (drained, Some(join_set))
        };
        let (persist_backlog, (drained, join_set)) = tokio::join!(
            self.queue.persist_terminal(&report.cancelled_queued, deadline),
            drain_workers
        );
        report.graceful = drained;

        if let Some(mut join_set) = join_set
            && !drained
        {
            self.jobs_token.cancel();
            join_set.abort_all();
            let _ = tokio::time::timeout_at(deadline, async {
                while join_set.join_next().await.is_some() {}
            })
            .await;
        }

        let limit = format!("shutdown: job did not finish within {}s", timeout.as_secs_f64());
        for job_id in self.queue.active_job_ids() {
            if self.queue.fail_in_memory(&job_id, &limit) {
                report.force_failed.push(job_id.clone());
            }
            if !touched.contains(&job_id) {
                touched.push(job_id);
            }
        }
        if !drained || !report.force_failed.is_empty() {
            self.queue.persist_terminal(&touched, deadline).await;
        }
        self.active_workers.store(0, Ordering::SeqCst);

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        if report.graceful {
            info!(
                cancelled_queued = report.cancelled_queued.len(),
                backlog_persisted = persist_backlog,
                elapsed_ms = report.elapsed_ms,
                "Worker pool stopped gracefully"
            );
        } else {
            warn!(
                force_failed = ?report.force_failed,
                cancelled_queued = report.cancelled_queued.len(),
                backlog_persisted = persist_backlog,
                elapsed_ms = report.elapsed_ms,
                "Worker pool stopped with jobs force-failed"
            );
        }
        report
    }

    pub fn worker_count(&self) -> usize {
        self.config.workers
    }

    /// Workers currently running a job.
    pub fn active_count(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.stop_token.is_cancelled()
    }
}
