use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::stage::{Stage, StageSpec};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    StageStarted {
        stage: Stage,
        label: String,
    },
    OperationFinished {
        stage: Stage,
        operation: String,
        count: u64,
        succeeded: bool,
    },
    StageCompleted {
        stage: Stage,
        count: u64,
    },
    /// The stage ended with at least one failed operation; `count` covers
    /// the operations that succeeded.
    StageFailed {
        stage: Stage,
        count: u64,
        error: String,
    },
    StageSkipped {
        stage: Stage,
        reason: String,
    },
}

impl ProgressEvent {
    pub fn stage(&self) -> Stage {
        match self {
            Self::StageStarted { stage, .. }
            | Self::OperationFinished { stage, .. }
            | Self::StageCompleted { stage, .. }
            | Self::StageFailed { stage, .. }
            | Self::StageSkipped { stage, .. } => *stage,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub job_id: String,
    pub item_id: String,
    pub event: ProgressEvent,
    /// Whole-job progress; never decreases within a job.
    pub percent: f32,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

/// Receiver of progress updates. Called inline from the worker, so
/// implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, update: &ProgressUpdate);
}

/// Forwards updates to an mpsc channel, dropping them when it is full.
pub struct ChannelProgressSink {
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ChannelProgressSink {
    pub fn new(tx: mpsc::Sender<ProgressUpdate>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

impl ProgressSink for ChannelProgressSink {
    fn on_progress(&self, update: &ProgressUpdate) {
        let _ = self.tx.try_send(update.clone());
    }
}

/// Per-job progress emitter.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: String,
    item_id: String,
    sinks: Arc<Vec<Arc<dyn ProgressSink>>>,
    high_water: Arc<Mutex<f32>>,
}

impl ProgressReporter {
    pub fn new(
        job_id: impl Into<String>,
        item_id: impl Into<String>,
        sinks: Vec<Arc<dyn ProgressSink>>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            item_id: item_id.into(),
            sinks: Arc::new(sinks),
            high_water: Arc::new(Mutex::new(0.0)),
        }
    }

    pub fn noop(job_id: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self::new(job_id, item_id, Vec::new())
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn percent(&self) -> f32 {
        *self.high_water.lock()
    }

    /// Emit `event`; `percent` is clamped to `[previous, 100]`.
    pub fn report(&self, event: ProgressEvent, percent: f32, message: impl Into<String>) {
        let percent = {
            let mut high_water = self.high_water.lock();
            let clamped = percent.clamp(*high_water, 100.0);
            *high_water = clamped;
            clamped
        };

        let update = ProgressUpdate {
            job_id: self.job_id.clone(),
            item_id: self.item_id.clone(),
            event,
            percent,
            message: message.into(),
            updated_at: Utc::now(),
        };
        for sink in self.sinks.iter() {
            sink.on_progress(&update);
        }
    }

    pub(crate) fn stage_started(&self, spec: &StageSpec, percent: f32) {
        self.report(
            ProgressEvent::StageStarted {
                stage: spec.stage,
                label: spec.label.clone(),
            },
            percent,
            format!("{}...", spec.label),
        );
    }

    pub(crate) fn stage_skipped(&self, spec: &StageSpec, percent: f32, reason: &str) {
        self.report(
            ProgressEvent::StageSkipped {
                stage: spec.stage,
                reason: reason.to_string(),
            },
            percent,
            format!("{} skipped: {reason}", spec.stage),
        );
    }
}
