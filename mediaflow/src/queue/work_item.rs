//! Work item (job) model.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database::models::WorkItemDbModel;
use crate::database::time::{from_ms, to_ms};
use crate::pipeline::{ProgressEvent, ProgressUpdate, Stage};
use crate::{Error, Result};

/// Job priority. Higher priorities are always dequeued first.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Dequeue rank, lower first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Processing,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// One run of an item through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub job_id: String,
    pub item_id: String,
    pub priority: Priority,
    pub status: JobStatus,
    /// Stage currently (or last) executing.
    pub stage: Option<Stage>,
    /// Human-facing status label (`queued`, `extracting`, ..., `complete`).
    pub stage_label: String,
    pub progress_percent: f32,
    pub message: String,
    pub stage_counts: BTreeMap<Stage, u64>,
    pub metadata: serde_json::Value,
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(
        item_id: impl Into<String>,
        priority: Priority,
        metadata: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            item_id: item_id.into(),
            priority,
            status: JobStatus::Queued,
            stage: None,
            stage_label: "queued".to_string(),
            progress_percent: 0.0,
            message: "waiting for a worker".to_string(),
            stage_counts: BTreeMap::new(),
            metadata,
            error: None,
            submitted_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn mark_processing(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Processing;
        self.started_at = Some(now);
        self.message = "processing".to_string();
        self.updated_at = now;
    }

    pub(crate) fn mark_complete(&mut self, stage_counts: &BTreeMap<Stage, u64>) {
        let now = Utc::now();
        self.status = JobStatus::Complete;
        self.stage_label = "complete".to_string();
        self.progress_percent = 100.0;
        self.message = "complete".to_string();
        self.stage_counts
            .extend(stage_counts.iter().map(|(stage, count)| (*stage, *count)));
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub(crate) fn mark_failed(&mut self, error: &str) {
        let now = Utc::now();
        self.status = JobStatus::Failed;
        self.stage_label = "failed".to_string();
        self.message = format!("failed: {error}");
        self.error = Some(error.to_string());
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Fold a progress update into the status.
    pub(crate) fn apply_progress(&mut self, update: &ProgressUpdate) {
        self.progress_percent = self.progress_percent.max(update.percent);
        self.message = update.message.clone();
        self.updated_at = update.updated_at;

        match &update.event {
            ProgressEvent::StageStarted { stage, label } => {
                self.stage = Some(*stage);
                self.stage_label = label.clone();
            }
            ProgressEvent::OperationFinished {
                stage,
                count,
                succeeded: true,
                ..
            } => {
                *self.stage_counts.entry(*stage).or_default() += count;
            }
            ProgressEvent::StageCompleted { stage, count }
            | ProgressEvent::StageFailed { stage, count, .. } => {
                self.stage_counts.insert(*stage, *count);
            }
            ProgressEvent::OperationFinished { .. } | ProgressEvent::StageSkipped { .. } => {}
        }
    }

    pub fn to_db_model(&self) -> WorkItemDbModel {
        WorkItemDbModel {
            job_id: self.job_id.clone(),
            item_id: self.item_id.clone(),
            priority: self.priority.to_string(),
            status: self.status.to_string(),
            stage: self.stage.map(|s| s.to_string()),
            stage_label: self.stage_label.clone(),
            progress_percent: self.progress_percent as f64,
            message: self.message.clone(),
            stage_counts: serde_json::to_string(&self.stage_counts)
                .unwrap_or_else(|_| "{}".to_string()),
            metadata: self.metadata.to_string(),
            error: self.error.clone(),
            submitted_at: to_ms(self.submitted_at),
            started_at: self.started_at.map(to_ms),
            completed_at: self.completed_at.map(to_ms),
            updated_at: to_ms(self.updated_at),
        }
    }

    pub fn from_db_model(model: WorkItemDbModel) -> Result<Self> {
        let priority = Priority::from_str(&model.priority)
            .map_err(|_| Error::validation(format!("unknown priority '{}'", model.priority)))?;
        let status = JobStatus::from_str(&model.status)
            .map_err(|_| Error::validation(format!("unknown job status '{}'", model.status)))?;
        let stage = model
            .stage
            .as_deref()
            .map(Stage::from_str)
            .transpose()
            .map_err(|_| Error::validation(format!("unknown stage {:?}", model.stage)))?;

        Ok(Self {
            job_id: model.job_id,
            item_id: model.item_id,
            priority,
            status,
            stage,
            stage_label: model.stage_label,
            progress_percent: model.progress_percent as f32,
            message: model.message,
            stage_counts: serde_json::from_str(&model.stage_counts)?,
            metadata: serde_json::from_str(&model.metadata).unwrap_or(serde_json::Value::Null),
            error: model.error,
            submitted_at: from_ms(model.submitted_at),
            started_at: model.started_at.map(from_ms),
            completed_at: model.completed_at.map(from_ms),
            updated_at: from_ms(model.updated_at),
        })
    }
}
