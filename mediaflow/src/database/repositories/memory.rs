//! In-memory repositories.
//!
//! Used by tests and by deployments that run without a status store. They
//! mirror the SQLite implementations, including the non-atomic stage result
//! replace.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{DeadLetterRepository, StageResultRepository, WorkItemRepository};
use crate::database::models::{
    DeadLetterDbModel, DeadLetterFilter, StageResultDbModel, WorkItemDbModel,
};
use crate::{Error, Result};

#[derive(Default)]
pub struct InMemoryWorkItemRepository {
    items: RwLock<HashMap<String, WorkItemDbModel>>,
}

impl InMemoryWorkItemRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkItemRepository for InMemoryWorkItemRepository {
    async fn upsert(&self, item: &WorkItemDbModel) -> Result<()> {
        self.items
            .write()
            .insert(item.job_id.clone(), item.clone());
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<WorkItemDbModel> {
        self.items
            .read()
            .get(job_id)
            .cloned()
            .ok_or_else(|| Error::not_found("Job", job_id))
    }

    async fn latest_for_item(&self, item_id: &str) -> Result<Option<WorkItemDbModel>> {
        Ok(self
            .items
            .read()
            .values()
            .filter(|i| i.item_id == item_id)
            .max_by_key(|i| i.submitted_at)
            .cloned())
    }

    async fn list_by_status(&self, status: &str) -> Result<Vec<WorkItemDbModel>> {
        let mut items: Vec<_> = self
            .items
            .read()
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect();
        items.sort_by_key(|i| i.submitted_at);
        Ok(items)
    }

    async fn list_all(&self) -> Result<Vec<WorkItemDbModel>> {
        let mut items: Vec<_> = self.items.read().values().cloned().collect();
        items.sort_by_key(|i| i.submitted_at);
        Ok(items)
    }

    async fn count_by_status(&self) -> Result<Vec<(String, i64)>> {
        let mut counts: HashMap<String, i64> = HashMap::new();
        for item in self.items.read().values() {
            *counts.entry(item.status.clone()).or_default() += 1;
        }
        let mut counts: Vec<_> = counts.into_iter().collect();
        counts.sort();
        Ok(counts)
    }
}

#[derive(Default)]
pub struct InMemoryStageResultRepository {
    results: RwLock<Vec<StageResultDbModel>>,
}

impl InMemoryStageResultRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert without removing existing rows.
    pub fn insert_raw(&self, result: StageResultDbModel) {
        self.results.write().push(result);
    }
}

#[async_trait]
impl StageResultRepository for InMemoryStageResultRepository {
    async fn replace(&self, result: &StageResultDbModel) -> Result<()> {
        self.results.write().retain(|r| {
            !(r.job_id == result.job_id
                && r.stage == result.stage
                && r.operation == result.operation)
        });
        self.results.write().push(result.clone());
        Ok(())
    }

    async fn list_for_job(&self, job_id: &str) -> Result<Vec<StageResultDbModel>> {
        Ok(self
            .results
            .read()
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<StageResultDbModel>> {
        Ok(self.results.read().clone())
    }

    async fn delete_by_ids(&self, ids: &[String]) -> Result<u64> {
        let mut results = self.results.write();
        let before = results.len();
        results.retain(|r| !ids.contains(&r.id));
        Ok((before - results.len()) as u64)
    }
}

#[derive(Default)]
pub struct InMemoryDeadLetterRepository {
    records: RwLock<HashMap<String, DeadLetterDbModel>>,
}

impl InMemoryDeadLetterRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterRepository for InMemoryDeadLetterRepository {
    async fn insert(&self, record: &DeadLetterDbModel) -> Result<()> {
        self.records
            .write()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<DeadLetterDbModel> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("DeadLetter", id))
    }

    async fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterDbModel>> {
        let mut records: Vec<_> = self
            .records
            .read()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            records.truncate(limit.max(0) as usize);
        }
        Ok(records)
    }

    async fn update(&self, record: &DeadLetterDbModel) -> Result<()> {
        let mut records = self.records.write();
        let existing = records
            .get_mut(&record.id)
            .ok_or_else(|| Error::not_found("DeadLetter", &record.id))?;
        *existing = record.clone();
        Ok(())
    }

    async fn archive_processed(&self, before_ms: i64) -> Result<u64> {
        let mut archived = 0;
        for record in self.records.write().values_mut() {
            if record.processed && !record.archived && record.updated_at < before_ms {
                record.archived = true;
                archived += 1;
            }
        }
        Ok(archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stage_result_replace_matches_sqlite_semantics() {
        let repo = InMemoryStageResultRepository::new();
        repo.replace(&StageResultDbModel::new("j", "m", "fast", "frames", 1, "null"))
            .await
            .unwrap();
        repo.replace(&StageResultDbModel::new("j", "m", "fast", "frames", 2, "null"))
            .await
            .unwrap();
        let results = repo.list_for_job("j").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].count, 2);

        repo.insert_raw(StageResultDbModel::new("j", "m", "fast", "frames", 3, "null"));
        assert_eq!(repo.list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_dead_letter_list_is_newest_first() {
        let repo = InMemoryDeadLetterRepository::new();
        let mut older = DeadLetterDbModel::new("m", "caption", "{}", "e", 0);
        older.created_at -= 1000;
        let newer = DeadLetterDbModel::new("m", "caption", "{}", "e", 0);
        repo.insert(&older).await.unwrap();
        repo.insert(&newer).await.unwrap();

        let listed = repo.list(&DeadLetterFilter::default()).await.unwrap();
        assert_eq!(listed[0].id, newer.id);
        assert_eq!(listed[1].id, older.id);
    }
}
