//! Offline consistency sweep over persisted job state.
//!
//! Every check is idempotent: a second run over a repaired store finds
//! nothing. The sweep never runs on the job hot path.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::database::models::StageResultDbModel;
use crate::database::repositories::{StageResultRepository, WorkItemRepository};
use crate::database::time::now_ms;
use crate::queue::JobQueue;

const INTERRUPTED: &str = "interrupted: job was not running in any worker";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Run the sweep periodically in the background.
    pub enabled: bool,
    pub interval_secs: u64,
    /// Report issues without fixing them.
    pub dry_run: bool,
    /// Untracked queued or processing jobs count as stale only once their
    /// last update is at least this old. Zero fails every untracked job.
    pub stale_after_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 3600,
            dry_run: false,
            stale_after_secs: 900,
        }
    }
}

impl ReconcileConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Result row whose job has no work item.
    OrphanedStageResult,
    /// Several rows for one job, stage and operation.
    DuplicateStageResult,
    /// Job persisted as queued or processing that no worker owns and that
    /// has not been updated recently.
    StaleProcessing,
    /// Terminal job whose counts disagree with its result rows.
    StageCountMismatch,
    /// Terminal job without a completion timestamp.
    MissingCompletedAt,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub issues_found: u64,
    pub fixes_applied: u64,
    pub by_kind: BTreeMap<IssueKind, u64>,
    pub dry_run: bool,
    pub duration_ms: u64,
}

impl ReconcileReport {
    fn found(&mut self, kind: IssueKind, n: u64) {
        if n > 0 {
            self.issues_found += n;
            *self.by_kind.entry(kind).or_default() += n;
        }
    }

    pub fn count(&self, kind: IssueKind) -> u64 {
        self.by_kind.get(&kind).copied().unwrap_or(0)
    }
}

pub struct Reconciler {
    work_items: Arc<dyn WorkItemRepository>,
    results: Arc<dyn StageResultRepository>,
    /// Live jobs are never treated as stale.
    queue: Option<Arc<JobQueue>>,
    stale_after: Duration,
    running: tokio::sync::Mutex<()>,
}

impl Reconciler {
    pub fn new(
        work_items: Arc<dyn WorkItemRepository>,
        results: Arc<dyn StageResultRepository>,
    ) -> Self {
        Self {
            work_items,
            results,
            queue: None,
            stale_after: ReconcileConfig::default().stale_after(),
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_queue(mut self, queue: Arc<JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Minimum age of the last update before an untracked job is stale.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Run every check once. Concurrent calls are serialized.
    pub async fn run(&self, dry_run: bool) -> Result<ReconcileReport> {
        let _running = self.running.lock().await;
        let started = Instant::now();
        let mut report = ReconcileReport {
            dry_run,
            ..Default::default()
        };

        let items = self.work_items.list_all().await?;
        let rows = self.results.list_all().await?;
        let known: HashSet<&str> = items.iter().map(|i| i.job_id.as_str()).collect();
        let (orphans, rows): (Vec<&StageResultDbModel>, Vec<&StageResultDbModel>) = rows
            .iter()
            .partition(|row| !known.contains(row.job_id.as_str()));
        report.found(IssueKind::OrphanedStageResult, orphans.len() as u64);

        let (survivors, duplicates) = split_duplicates(rows);
        report.found(IssueKind::DuplicateStageResult, duplicates.len() as u64);

        let to_delete: Vec<String> = orphans
            .iter()
            .chain(duplicates.iter())
            .map(|row| row.id.clone())
            .collect();
        if !dry_run && !to_delete.is_empty() {
            match self.results.delete_by_ids(&to_delete).await {
                Ok(deleted) => report.fixes_applied += deleted,
                Err(e) => error!(error = %e, "Failed to delete inconsistent stage results"),
            }
        }

        let mut counts_by_job: HashMap<&str, BTreeMap<String, u64>> = HashMap::new();
        for row in &survivors {
            *counts_by_job
                .entry(row.job_id.as_str())
                .or_default()
                .entry(row.stage.clone())
                .or_default() += row.count.max(0) as u64;
        }

        let now = now_ms();
        let stale_before = now.saturating_sub(self.stale_after.as_millis() as i64);
        for item in &items {
            let mut fixed = item.clone();
            let mut fixes = 0u64;

            if !item.is_terminal()
                && item.updated_at <= stale_before
                && !self.owned_by_this_process(&item.job_id)
            {
                report.found(IssueKind::StaleProcessing, 1);
                warn!(
                    job_id = %item.job_id,
                    item_id = %item.item_id,
                    status = %item.status,
                    updated_at = item.updated_at,
                    "Stale job"
                );
                fixed.status = "FAILED".to_string();
                fixed.stage_label = "failed".to_string();
                fixed.error = Some(INTERRUPTED.to_string());
                fixed.message = format!("failed: {INTERRUPTED}");
                fixed.completed_at = Some(now);
                fixes += 1;
            }

            if fixed.is_terminal() {
                let expected = counts_by_job
                    .get(item.job_id.as_str())
                    .cloned()
                    .unwrap_or_default();
                let recorded: BTreeMap<String, u64> =
                    serde_json::from_str(&item.stage_counts).unwrap_or_default();
                if without_zeros(&recorded) != without_zeros(&expected) {
                    report.found(IssueKind::StageCountMismatch, 1);
                    debug!(job_id = %item.job_id, ?recorded, ?expected, "Stage counts disagree");
                    fixed.stage_counts =
                        serde_json::to_string(&expected).unwrap_or_else(|_| "{}".to_string());
                    fixes += 1;
                }

                if fixed.completed_at.is_none() {
                    report.found(IssueKind::MissingCompletedAt, 1);
                    fixed.completed_at = Some(item.updated_at);
                    fixes += 1;
                }
            }

            if fixes == 0 || dry_run {
                continue;
            }
            fixed.updated_at = now;
            match self.work_items.upsert(&fixed).await {
                Ok(()) => report.fixes_applied += fixes,
                Err(e) => error!(job_id = %item.job_id, error = %e, "Failed to repair work item"),
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        if report.issues_found > 0 {
            info!(
                issues_found = report.issues_found,
                fixes_applied = report.fixes_applied,
                dry_run,
                by_kind = ?report.by_kind,
                "Reconciliation finished"
            );
        } else {
            debug!(duration_ms = report.duration_ms, "Reconciliation found no issues");
        }
        Ok(report)
    }

    /// Jobs the queue still tracks may have moved on since the store was read.
    fn owned_by_this_process(&self, job_id: &str) -> bool {
        self.queue
            .as_ref()
            .is_some_and(|queue| queue.status(job_id).is_some())
    }

    /// Run the sweep every `every` until `cancel` fires.
    pub fn start_periodic(
        self: &Arc<Self>,
        every: Duration,
        dry_run: bool,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let reconciler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = reconciler.run(dry_run).await {
                            warn!(error = %e, "Periodic reconciliation failed");
                        }
                    }
                }
            }
            debug!("Reconciliation task stopped");
        })
    }
}

/// Keep the newest row of every (job, stage, operation); return (kept, extra).
fn split_duplicates(
    rows: Vec<&StageResultDbModel>,
) -> (Vec<&StageResultDbModel>, Vec<&StageResultDbModel>) {
    let mut groups: HashMap<(&str, &str, &str), Vec<&StageResultDbModel>> = HashMap::new();
    for row in rows {
        groups
            .entry((row.job_id.as_str(), row.stage.as_str(), row.operation.as_str()))
            .or_default()
            .push(row);
    }

    let mut kept = Vec::with_capacity(groups.len());
    let mut extra = Vec::new();
    for (_, mut group) in groups {
        group.sort_by(|a, b| (b.created_at, &b.id).cmp(&(a.created_at, &a.id)));
        let mut group = group.into_iter();
        if let Some(newest) = group.next() {
            kept.push(newest);
        }
        extra.extend(group);
    }
    (kept, extra)
}

fn without_zeros(counts: &BTreeMap<String, u64>) -> BTreeMap<&str, u64> {
    counts
        .iter()
        .filter(|(_, count)| **count > 0)
        .map(|(stage, count)| (stage.as_str(), *count))
        .collect()
}
