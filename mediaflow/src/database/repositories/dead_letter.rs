//! Dead letter repository.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::database::models::{DeadLetterDbModel, DeadLetterFilter};
use crate::database::retry::retry_on_sqlite_busy;
use crate::{Error, Result};

/// Persistent store for dead letter records. Records are never deleted.
#[async_trait]
pub trait DeadLetterRepository: Send + Sync {
    async fn insert(&self, record: &DeadLetterDbModel) -> Result<()>;
    async fn get(&self, id: &str) -> Result<DeadLetterDbModel>;
    /// Newest first.
    async fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterDbModel>>;
    /// Persist retry_count, error, processed and timestamps.
    async fn update(&self, record: &DeadLetterDbModel) -> Result<()>;
    /// Archive processed records last updated before `before_ms`.
    async fn archive_processed(&self, before_ms: i64) -> Result<u64>;
}

/// SQLx implementation of DeadLetterRepository.
pub struct SqlxDeadLetterRepository {
    pool: SqlitePool,
}

impl SqlxDeadLetterRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterRepository for SqlxDeadLetterRepository {
    async fn insert(&self, record: &DeadLetterDbModel) -> Result<()> {
        retry_on_sqlite_busy("insert_dead_letter", || async {
            sqlx::query(
                r#"
                INSERT INTO dead_letter (
                    id, item_id, operation, input, error_message, retry_count,
                    processed, archived, created_at, updated_at, processed_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.id)
            .bind(&record.item_id)
            .bind(&record.operation)
            .bind(&record.input)
            .bind(&record.error_message)
            .bind(record.retry_count)
            .bind(record.processed)
            .bind(record.archived)
            .bind(record.created_at)
            .bind(record.updated_at)
            .bind(record.processed_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<DeadLetterDbModel> {
        sqlx::query_as::<_, DeadLetterDbModel>("SELECT * FROM dead_letter WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("DeadLetter", id))
    }

    async fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterDbModel>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM dead_letter WHERE 1=1");
        if !filter.include_archived {
            qb.push(" AND archived = 0");
        }
        if let Some(processed) = filter.processed {
            qb.push(" AND processed = ").push_bind(processed);
        }
        if let Some(item_id) = &filter.item_id {
            qb.push(" AND item_id = ").push_bind(item_id);
        }
        if let Some(operation) = &filter.operation {
            qb.push(" AND operation = ").push_bind(operation);
        }
        qb.push(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }

        let records = qb
            .build_query_as::<DeadLetterDbModel>()
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn update(&self, record: &DeadLetterDbModel) -> Result<()> {
        let affected = retry_on_sqlite_busy("update_dead_letter", || async {
            let result = sqlx::query(
                r#"
                UPDATE dead_letter SET
                    error_message = ?,
                    retry_count = ?,
                    processed = ?,
                    archived = ?,
                    updated_at = ?,
                    processed_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&record.error_message)
            .bind(record.retry_count)
            .bind(record.processed)
            .bind(record.archived)
            .bind(record.updated_at)
            .bind(record.processed_at)
            .bind(&record.id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if affected == 0 {
            return Err(Error::not_found("DeadLetter", &record.id));
        }
        Ok(())
    }

    async fn archive_processed(&self, before_ms: i64) -> Result<u64> {
        retry_on_sqlite_busy("archive_dead_letters", || async {
            let result = sqlx::query(
                r#"
                UPDATE dead_letter SET archived = 1
                WHERE processed = 1 AND archived = 0 AND updated_at < ?
                "#,
            )
            .bind(before_ms)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }
}
