//! Work item (job status) repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::WorkItemDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::{Error, Result};

/// Status store polled by external callers.
#[async_trait]
pub trait WorkItemRepository: Send + Sync {
    /// Insert or overwrite the row for `item.job_id`.
    async fn upsert(&self, item: &WorkItemDbModel) -> Result<()>;
    async fn get(&self, job_id: &str) -> Result<WorkItemDbModel>;
    /// Most recently submitted job for an item.
    async fn latest_for_item(&self, item_id: &str) -> Result<Option<WorkItemDbModel>>;
    async fn list_by_status(&self, status: &str) -> Result<Vec<WorkItemDbModel>>;
    async fn list_all(&self) -> Result<Vec<WorkItemDbModel>>;
    /// `(status, count)` pairs.
    async fn count_by_status(&self) -> Result<Vec<(String, i64)>>;
}

/// SQLx implementation of WorkItemRepository.
pub struct SqlxWorkItemRepository {
    pool: SqlitePool,
}

impl SqlxWorkItemRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkItemRepository for SqlxWorkItemRepository {
    async fn upsert(&self, item: &WorkItemDbModel) -> Result<()> {
        retry_on_sqlite_busy("upsert_work_item", || async {
            sqlx::query(
                r#"
                INSERT INTO work_item (
                    job_id, item_id, priority, status, stage, stage_label, progress_percent,
                    message, stage_counts, metadata, error, submitted_at, started_at,
                    completed_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(job_id) DO UPDATE SET
                    status = excluded.status,
                    stage = excluded.stage,
                    stage_label = excluded.stage_label,
                    progress_percent = excluded.progress_percent,
                    message = excluded.message,
                    stage_counts = excluded.stage_counts,
                    metadata = excluded.metadata,
                    error = excluded.error,
                    started_at = excluded.started_at,
                    completed_at = excluded.completed_at,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&item.job_id)
            .bind(&item.item_id)
            .bind(&item.priority)
            .bind(&item.status)
            .bind(&item.stage)
            .bind(&item.stage_label)
            .bind(item.progress_percent)
            .bind(&item.message)
            .bind(&item.stage_counts)
            .bind(&item.metadata)
            .bind(&item.error)
            .bind(item.submitted_at)
            .bind(item.started_at)
            .bind(item.completed_at)
            .bind(item.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get(&self, job_id: &str) -> Result<WorkItemDbModel> {
        sqlx::query_as::<_, WorkItemDbModel>("SELECT * FROM work_item WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", job_id))
    }

    async fn latest_for_item(&self, item_id: &str) -> Result<Option<WorkItemDbModel>> {
        let item = sqlx::query_as::<_, WorkItemDbModel>(
            "SELECT * FROM work_item WHERE item_id = ? ORDER BY submitted_at DESC LIMIT 1",
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(item)
    }

    async fn list_by_status(&self, status: &str) -> Result<Vec<WorkItemDbModel>> {
        let items = sqlx::query_as::<_, WorkItemDbModel>(
            "SELECT * FROM work_item WHERE status = ? ORDER BY submitted_at",
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn list_all(&self) -> Result<Vec<WorkItemDbModel>> {
        let items =
            sqlx::query_as::<_, WorkItemDbModel>("SELECT * FROM work_item ORDER BY submitted_at")
                .fetch_all(&self.pool)
                .await?;
        Ok(items)
    }

    async fn count_by_status(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM work_item GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{init_memory_pool, run_migrations};

    fn model(job_id: &str, item_id: &str, submitted_at: i64) -> WorkItemDbModel {
        WorkItemDbModel {
            job_id: job_id.to_string(),
            item_id: item_id.to_string(),
            priority: "NORMAL".to_string(),
            status: "QUEUED".to_string(),
            stage: None,
            stage_label: "queued".to_string(),
            progress_percent: 0.0,
            message: String::new(),
            stage_counts: "{}".to_string(),
            metadata: "{}".to_string(),
            error: None,
            submitted_at,
            started_at: None,
            completed_at: None,
            updated_at: submitted_at,
        }
    }

    async fn repo() -> SqlxWorkItemRepository {
        let pool = init_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqlxWorkItemRepository::new(pool)
    }

    #[tokio::test]
    async fn test_upsert_overwrites_status() {
        let repo = repo().await;
        let mut item = model("job-1", "media-1", 1);
        repo.upsert(&item).await.unwrap();

        item.status = "FAILED".to_string();
        item.error = Some("shutdown".to_string());
        item.completed_at = Some(5);
        repo.upsert(&item).await.unwrap();

        let stored = repo.get("job-1").await.unwrap();
        assert_eq!(stored, item);
        assert!(stored.is_terminal());
        assert!(matches!(
            repo.get("missing").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_latest_for_item_and_counts() {
        let repo = repo().await;
        repo.upsert(&model("job-1", "media-1", 1)).await.unwrap();
        repo.upsert(&model("job-2", "media-1", 2)).await.unwrap();
        let mut other = model("job-3", "media-2", 3);
        other.status = "COMPLETE".to_string();
        repo.upsert(&other).await.unwrap();

        let latest = repo.latest_for_item("media-1").await.unwrap().unwrap();
        assert_eq!(latest.job_id, "job-2");
        assert!(repo.latest_for_item("nope").await.unwrap().is_none());

        let counts = repo.count_by_status().await.unwrap();
        assert_eq!(
            counts,
            vec![("COMPLETE".to_string(), 1), ("QUEUED".to_string(), 2)]
        );
        assert_eq!(repo.list_by_status("QUEUED").await.unwrap().len(), 2);
        assert_eq!(repo.list_all().await.unwrap().len(), 3);
    }
}
