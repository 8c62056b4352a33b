//! Database row models.
//!
//! Enums are stored as their string form and JSON payloads as TEXT; the
//! domain modules own conversion to and from their typed representations.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::time::now_ms;

/// Persisted status of one job (one run of a work item through the pipeline).
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct WorkItemDbModel {
    pub job_id: String,
    pub item_id: String,
    /// HIGH, NORMAL, LOW
    pub priority: String,
    /// QUEUED, PROCESSING, COMPLETE, FAILED
    pub status: String,
    /// fast, medium, slow
    pub stage: Option<String>,
    pub stage_label: String,
    pub progress_percent: f64,
    pub message: String,
    /// JSON object mapping stage name to result count
    pub stage_counts: String,
    /// JSON blob supplied at submission
    pub metadata: String,
    pub error: Option<String>,
    pub submitted_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
}

impl WorkItemDbModel {
    pub fn is_terminal(&self) -> bool {
        self.status == "COMPLETE" || self.status == "FAILED"
    }
}

/// Output of one stage operation for one job.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct StageResultDbModel {
    pub id: String,
    pub job_id: String,
    pub item_id: String,
    pub stage: String,
    pub operation: String,
    pub count: i64,
    /// JSON payload returned by the operation
    pub data: String,
    pub created_at: i64,
}

impl StageResultDbModel {
    pub fn new(
        job_id: impl Into<String>,
        item_id: impl Into<String>,
        stage: impl Into<String>,
        operation: impl Into<String>,
        count: i64,
        data: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            item_id: item_id.into(),
            stage: stage.into(),
            operation: operation.into(),
            count,
            data: data.into(),
            created_at: now_ms(),
        }
    }
}

/// Operation that failed permanently, kept for triage and replay.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct DeadLetterDbModel {
    pub id: String,
    pub item_id: String,
    pub operation: String,
    /// Serialized operation input (JSON)
    pub input: String,
    pub error_message: String,
    pub retry_count: i64,
    pub processed: bool,
    pub archived: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub processed_at: Option<i64>,
}

impl DeadLetterDbModel {
    pub fn new(
        item_id: impl Into<String>,
        operation: impl Into<String>,
        input: impl Into<String>,
        error_message: impl Into<String>,
        retry_count: i64,
    ) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            item_id: item_id.into(),
            operation: operation.into(),
            input: input.into(),
            error_message: error_message.into(),
            retry_count,
            processed: false,
            archived: false,
            created_at: now,
            updated_at: now,
            processed_at: None,
        }
    }
}

/// Triage filter for dead letter listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadLetterFilter {
    pub item_id: Option<String>,
    pub operation: Option<String>,
    pub processed: Option<bool>,
    #[serde(default)]
    pub include_archived: bool,
    pub limit: Option<i64>,
}

impl DeadLetterFilter {
    /// Unprocessed, unarchived records.
    pub fn pending() -> Self {
        Self {
            processed: Some(false),
            ..Default::default()
        }
    }

    pub fn with_item(mut self, item_id: impl Into<String>) -> Self {
        self.item_id = Some(item_id.into());
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &DeadLetterDbModel) -> bool {
        if !self.include_archived && record.archived {
            return false;
        }
        if let Some(processed) = self.processed
            && record.processed != processed
        {
            return false;
        }
        if let Some(item_id) = &self.item_id
            && &record.item_id != item_id
        {
            return false;
        }
        if let Some(operation) = &self.operation
            && &record.operation != operation
        {
            return false;
        }
        true
    }
}

/// Tier 3 cache row.
#[derive(Debug, Clone, FromRow)]
pub struct CacheEntryDbModel {
    pub namespace: String,
    pub key: String,
    pub value: String,
    pub expires_at: i64,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_letter_filter_matches() {
        let mut record = DeadLetterDbModel::new("media-1", "caption", "{}", "boom", 3);
        let pending = DeadLetterFilter::pending();
        assert!(pending.matches(&record));
        assert!(pending.clone().with_item("media-1").matches(&record));
        assert!(!pending.clone().with_item("media-2").matches(&record));
        assert!(!pending.clone().with_operation("transcribe").matches(&record));

        record.processed = true;
        assert!(!pending.matches(&record));
        assert!(DeadLetterFilter::default().matches(&record));

        record.archived = true;
        assert!(!DeadLetterFilter::default().matches(&record));
        let archived = DeadLetterFilter {
            include_archived: true,
            ..Default::default()
        };
        assert!(archived.matches(&record));
    }
}
