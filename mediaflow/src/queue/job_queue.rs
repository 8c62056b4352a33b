//! Priority job queue.
//!
//! The backlog is a binary heap ordered by priority, then submission order.
//! Job records live in memory for queued, running and recently finished jobs
//! and are mirrored to the [`WorkItemRepository`] for external polling.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::work_item::{JobStatus, Priority, WorkItem};
use crate::database::repositories::WorkItemRepository;
use crate::pipeline::{PipelineOutcome, ProgressSink, ProgressUpdate};
use crate::{Error, Result};

/// Job queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Submissions beyond this many queued jobs are rejected.
    pub max_backlog: usize,
    /// Finished jobs kept in memory for dashboards.
    pub history_limit: usize,
    /// Pending progress writes before updates are dropped.
    pub progress_buffer: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_backlog: 1000,
            history_limit: 100,
            progress_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub job_id: String,
    /// 1-based position in dequeue order; 0 once the job has started.
    pub queue_position: usize,
    pub queue_size: usize,
    pub active_jobs: usize,
    /// True when the item already had a queued or running job.
    pub existing: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub active_jobs: usize,
    pub queued_jobs: usize,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub worker_count: usize,
    pub shutdown_requested: bool,
}

#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    rank: u8,
    seq: u64,
    job_id: String,
}

impl QueueEntry {
    fn key(&self) -> (u8, u64) {
        (self.rank, self.seq)
    }
}

impl Ord for QueueEntry {
    // BinaryHeap is a max-heap; the smallest (rank, seq) must pop first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.key().cmp(&self.key())
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

pub struct JobQueue {
    config: QueueConfig,
    backlog: Mutex<BinaryHeap<QueueEntry>>,
    seq: AtomicU64,
    jobs: DashMap<String, WorkItem>,
    /// item_id -> most recent job_id
    by_item: DashMap<String, String>,
    /// Finished job ids, oldest first.
    history: Mutex<VecDeque<String>>,
    completed: AtomicU64,
    failed: AtomicU64,
    notify: Notify,
    shutdown: AtomicBool,
    repository: Arc<dyn WorkItemRepository>,
    /// Serializes snapshot-then-write so an older snapshot never lands last.
    persist_lock: tokio::sync::Mutex<()>,
    progress_tx: mpsc::Sender<String>,
    progress_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

impl JobQueue {
    pub fn new(config: QueueConfig, repository: Arc<dyn WorkItemRepository>) -> Self {
        let (progress_tx, progress_rx) = mpsc::channel(config.progress_buffer.max(1));
        Self {
            config,
            backlog: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            jobs: DashMap::new(),
            by_item: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            repository,
            persist_lock: tokio::sync::Mutex::new(()),
            progress_tx,
            progress_rx: Mutex::new(Some(progress_rx)),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Queue `item_id` for processing.
    ///
    /// Resubmitting an item whose job is still queued or running returns
    /// that job's receipt.
    pub async fn submit(
        &self,
        item_id: &str,
        priority: Priority,
        metadata: serde_json::Value,
    ) -> Result<SubmitReceipt> {
        if self.is_shutdown_requested() {
            return Err(Error::shutdown("queue is not accepting new jobs"));
        }
        if item_id.trim().is_empty() {
            return Err(Error::validation("item_id must not be empty"));
        }

        let (receipt, item) = {
            let mut backlog = self.backlog.lock();

            if let Some(existing) = self.active_job_for_item(item_id) {
                let receipt = SubmitReceipt {
                    queue_position: Self::position_in(&backlog, &existing),
                    queue_size: backlog.len(),
                    active_jobs: self.active_count(),
                    job_id: existing,
                    existing: true,
                };
                debug!(item_id, job_id = %receipt.job_id, "Item already has an active job");
                return Ok(receipt);
            }

            if backlog.len() >= self.config.max_backlog {
                return Err(Error::QueueFull {
                    queued: backlog.len(),
                    capacity: self.config.max_backlog,
                });
            }

            let item = WorkItem::new(item_id, priority, metadata);
            let entry = QueueEntry {
                rank: priority.rank(),
                seq: self.seq.fetch_add(1, Ordering::SeqCst),
                job_id: item.job_id.clone(),
            };
            let queue_position = backlog.iter().filter(|e| e.key() < entry.key()).count() + 1;

            self.jobs.insert(item.job_id.clone(), item.clone());
            self.by_item
                .insert(item.item_id.clone(), item.job_id.clone());
            backlog.push(entry);

            let receipt = SubmitReceipt {
                job_id: item.job_id.clone(),
                queue_position,
                queue_size: backlog.len(),
                active_jobs: self.active_count(),
                existing: false,
            };
            (receipt, item)
        };

        info!(
            job_id = %item.job_id,
            item_id = %item.item_id,
            priority = %item.priority,
            submitted_at = %item.submitted_at,
            queue_position = receipt.queue_position,
            "Job queued"
        );
        self.persist(&item.job_id).await;
        self.notify.notify_one();
        Ok(receipt)
    }

    /// Wait for the next job and mark it processing. Returns `None` once
    /// `cancel` fires.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Option<WorkItem> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return None;
            }
            if let Some(item) = self.try_dequeue() {
                info!(
                    job_id = %item.job_id,
                    item_id = %item.item_id,
                    priority = %item.priority,
                    submitted_at = %item.submitted_at,
                    started_at = ?item.started_at,
                    "Job started"
                );
                self.persist(&item.job_id).await;
                return Some(item);
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    /// Pop the highest-priority job, if any, and mark it processing.
    pub fn try_dequeue(&self) -> Option<WorkItem> {
        let mut backlog = self.backlog.lock();
        while let Some(entry) = backlog.pop() {
            if let Some(mut job) = self.jobs.get_mut(&entry.job_id)
                && job.status == JobStatus::Queued
            {
                job.mark_processing();
                return Some(job.clone());
            }
        }
        None
    }

    /// Mark a job complete.
    pub async fn complete(&self, job_id: &str, outcome: &PipelineOutcome) -> bool {
        // Counted under the entry lock.
        let Some(item) = self.transition(job_id, |job| {
            job.mark_complete(&outcome.stage_counts);
            self.completed.fetch_add(1, Ordering::Relaxed);
        }) else {
            return false;
        };
        info!(
            job_id,
            item_id = %item.item_id,
            priority = %item.priority,
            submitted_at = %item.submitted_at,
            started_at = ?item.started_at,
            completed_at = ?item.completed_at,
            "Job complete"
        );
        self.finish(job_id).await;
        true
    }

    /// Mark a job failed. Returns false if it had already finished.
    pub async fn fail(&self, job_id: &str, error: &str) -> bool {
        if !self.fail_in_memory(job_id, error) {
            return false;
        }
        self.finish(job_id).await;
        true
    }

    /// Mark a job failed without persisting it. Pair with
    /// [`JobQueue::persist_terminal`].
    pub fn fail_in_memory(&self, job_id: &str, error: &str) -> bool {
        let Some(item) = self.transition(job_id, |job| {
            job.mark_failed(error);
            self.failed.fetch_add(1, Ordering::Relaxed);
        }) else {
            return false;
        };
        warn!(
            job_id,
            item_id = %item.item_id,
            priority = %item.priority,
            stage = ?item.stage,
            submitted_at = %item.submitted_at,
            completed_at = ?item.completed_at,
            error,
            "Job failed"
        );
        true
    }

    /// Write the current state of `job_ids` concurrently, giving up at
    /// `deadline`. Returns false if the deadline cut the writes short.
    pub async fn persist_terminal(&self, job_ids: &[String], deadline: Instant) -> bool {
        if job_ids.is_empty() {
            return true;
        }
        let write = async {
            let _guard = self.persist_lock.lock().await;
            let models: Vec<_> = job_ids
                .iter()
                .filter_map(|id| self.jobs.get(id).map(|job| job.to_db_model()))
                .collect();
            let results = join_all(models.iter().map(|model| self.repository.upsert(model))).await;
            for (model, result) in models.iter().zip(results) {
                if let Err(e) = result {
                    error!(job_id = %model.job_id, error = %e, "Failed to persist job status");
                }
            }
        };
        let persisted = tokio::time::timeout_at(deadline, write).await.is_ok();
        if !persisted {
            warn!(jobs = job_ids.len(), "Deadline reached before job states were persisted");
        }
        for job_id in job_ids {
            if self.jobs.get(job_id).is_some_and(|job| job.is_terminal()) {
                self.record_history(job_id);
            }
        }
        persisted
    }

    fn transition(&self, job_id: &str, apply: impl FnOnce(&mut WorkItem)) -> Option<WorkItem> {
        let mut job = self.jobs.get_mut(job_id)?;
        if job.is_terminal() {
            return None;
        }
        apply(&mut job);
        Some(job.clone())
    }

    async fn finish(&self, job_id: &str) {
        self.persist(job_id).await;
        self.record_history(job_id);
    }

    fn record_history(&self, job_id: &str) {
        let evicted: Vec<String> = {
            let mut history = self.history.lock();
            if history.iter().any(|id| id == job_id) {
                return;
            }
            history.push_back(job_id.to_string());
            let excess = history.len().saturating_sub(self.config.history_limit);
            history.drain(..excess).collect()
        };
        for id in evicted {
            if let Some((_, job)) = self.jobs.remove(&id) {
                self.by_item.remove_if(&job.item_id, |_, latest| *latest == id);
                debug!(job_id = %id, "Evicted job from history");
            }
        }
    }

    pub fn status(&self, job_id: &str) -> Option<WorkItem> {
        self.jobs.get(job_id).map(|job| job.clone())
    }

    pub fn status_for_item(&self, item_id: &str) -> Option<WorkItem> {
        let job_id = self.by_item.get(item_id)?.clone();
        self.status(&job_id)
    }

    /// Latest job for an item, falling back to the store for evicted jobs.
    pub async fn lookup_item(&self, item_id: &str) -> Result<WorkItem> {
        if let Some(item) = self.status_for_item(item_id) {
            return Ok(item);
        }
        match self.repository.latest_for_item(item_id).await? {
            Some(model) => WorkItem::from_db_model(model),
            None => Err(Error::not_found("WorkItem", item_id)),
        }
    }

    fn active_job_for_item(&self, item_id: &str) -> Option<String> {
        let job_id = self.by_item.get(item_id)?.clone();
        let job = self.jobs.get(&job_id)?;
        (!job.is_terminal()).then_some(job_id)
    }

    fn position_in(backlog: &BinaryHeap<QueueEntry>, job_id: &str) -> usize {
        let Some(target) = backlog.iter().find(|e| e.job_id == job_id) else {
            return 0;
        };
        backlog.iter().filter(|e| e.key() < target.key()).count() + 1
    }

    pub fn position(&self, job_id: &str) -> usize {
        Self::position_in(&self.backlog.lock(), job_id)
    }

    pub fn len(&self) -> usize {
        self.backlog.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|job| job.status == JobStatus::Processing)
            .count()
    }

    pub fn active_job_ids(&self) -> Vec<String> {
        self.jobs
            .iter()
            .filter(|job| job.status == JobStatus::Processing)
            .map(|job| job.job_id.clone())
            .collect()
    }

    pub fn queue_status(&self, worker_count: usize) -> QueueStatus {
        QueueStatus {
            active_jobs: self.active_count(),
            queued_jobs: self.len(),
            completed_jobs: self.completed.load(Ordering::Relaxed),
            failed_jobs: self.failed.load(Ordering::Relaxed),
            worker_count,
            shutdown_requested: self.is_shutdown_requested(),
        }
    }

    /// Stop accepting submissions and wake idle workers.
    pub fn request_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!(queued = self.len(), "Job queue shutdown requested");
        }
        self.notify.notify_waiters();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Remove every queued job from the backlog and return their ids.
    pub fn drain_backlog(&self) -> Vec<String> {
        let mut backlog = self.backlog.lock();
        let mut drained = Vec::with_capacity(backlog.len());
        while let Some(entry) = backlog.pop() {
            drained.push(entry.job_id);
        }
        drained
    }

    async fn persist(&self, job_id: &str) {
        let _guard = self.persist_lock.lock().await;
        let Some(model) = self.jobs.get(job_id).map(|job| job.to_db_model()) else {
            return;
        };
        if let Err(e) = self.repository.upsert(&model).await {
            error!(job_id, error = %e, "Failed to persist job status");
        }
    }

    /// Persist progress updates in the background, coalescing bursts per job.
    pub fn start_progress_writer(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let mut rx = self.progress_rx.lock().take()?;
        let queue = Arc::clone(self);

        Some(tokio::spawn(async move {
            loop {
                let first = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(job_id) => job_id,
                        None => break,
                    },
                };

                let mut pending = HashSet::from([first]);
                while let Ok(job_id) = rx.try_recv() {
                    pending.insert(job_id);
                }
                for job_id in pending {
                    queue.persist(&job_id).await;
                }
            }
            debug!("Progress writer stopped");
        }))
    }
}

impl ProgressSink for JobQueue {
    fn on_progress(&self, update: &ProgressUpdate) {
        {
            let Some(mut job) = self.jobs.get_mut(&update.job_id) else {
                return;
            };
            if job.is_terminal() {
                return;
            }
            job.apply_progress(update);
        }
        if self.progress_tx.try_send(update.job_id.clone()).is_err() {
            debug!(job_id = %update.job_id, "Progress write buffer full");
        }
    }
}
