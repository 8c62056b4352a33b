//! Stage result repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::StageResultDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::Result;

/// Store of per-operation outputs.
#[async_trait]
pub trait StageResultRepository: Send + Sync {
    /// Replace the result for `(job_id, stage, operation)`.
    ///
    /// Delete and insert are separate statements, so a crash or a concurrent
    /// replay can leave duplicates for reconciliation to remove.
    async fn replace(&self, result: &StageResultDbModel) -> Result<()>;
    async fn list_for_job(&self, job_id: &str) -> Result<Vec<StageResultDbModel>>;
    async fn list_all(&self) -> Result<Vec<StageResultDbModel>>;
    async fn delete_by_ids(&self, ids: &[String]) -> Result<u64>;
}

/// SQLx implementation of StageResultRepository.
pub struct SqlxStageResultRepository {
    pool: SqlitePool,
}

impl SqlxStageResultRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StageResultRepository for SqlxStageResultRepository {
    async fn replace(&self, result: &StageResultDbModel) -> Result<()> {
        retry_on_sqlite_busy("replace_stage_result", || async {
            sqlx::query("DELETE FROM stage_result WHERE job_id = ? AND stage = ? AND operation = ?")
                .bind(&result.job_id)
                .bind(&result.stage)
                .bind(&result.operation)
                .execute(&self.pool)
                .await?;

            sqlx::query(
                r#"
                INSERT INTO stage_result (
                    id, job_id, item_id, stage, operation, count, data, created_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&result.id)
            .bind(&result.job_id)
            .bind(&result.item_id)
            .bind(&result.stage)
            .bind(&result.operation)
            .bind(result.count)
            .bind(&result.data)
            .bind(result.created_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn list_for_job(&self, job_id: &str) -> Result<Vec<StageResultDbModel>> {
        let results = sqlx::query_as::<_, StageResultDbModel>(
            "SELECT * FROM stage_result WHERE job_id = ? ORDER BY created_at",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(results)
    }

    async fn list_all(&self) -> Result<Vec<StageResultDbModel>> {
        let results = sqlx::query_as::<_, StageResultDbModel>(
            "SELECT * FROM stage_result ORDER BY job_id, created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(results)
    }

    async fn delete_by_ids(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        retry_on_sqlite_busy("delete_stage_results", || async {
            let mut tx = self.pool.begin().await?;
            let mut removed = 0;
            for id in ids {
                removed += sqlx::query("DELETE FROM stage_result WHERE id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
            }
            tx.commit().await?;
            Ok(removed)
        })
        .await
    }
}
