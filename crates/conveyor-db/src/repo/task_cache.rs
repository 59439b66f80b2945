//! Task cache records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::ResourceId;
use conveyor_core::container::TaskCache;

use crate::DbResult;
use crate::postgres::PgStore;

#[async_trait]
pub trait TaskCacheRepo: Send + Sync {
    async fn find_or_create_task_cache(
        &self,
        pipeline_id: ResourceId,
        job_id: ResourceId,
        step_name: &str,
        path: &str,
    ) -> DbResult<TaskCache>;

    async fn find_task_cache(&self, id: ResourceId) -> DbResult<Option<TaskCache>>;

    /// Remove the caches of a job's step, or only the one at `path`.
    /// Returns how many were removed.
    async fn clear_task_caches(
        &self,
        job_id: ResourceId,
        step_name: &str,
        path: Option<&str>,
    ) -> DbResult<u64>;
}

#[derive(Debug, sqlx::FromRow)]
struct TaskCacheRow {
    id: uuid::Uuid,
    pipeline_id: uuid::Uuid,
    job_id: uuid::Uuid,
    step_name: String,
    path: String,
    created_at: DateTime<Utc>,
}

impl From<TaskCacheRow> for TaskCache {
    fn from(row: TaskCacheRow) -> Self {
        TaskCache {
            id: row.id.into(),
            pipeline_id: row.pipeline_id.into(),
            job_id: row.job_id.into(),
            step_name: row.step_name,
            path: row.path,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl TaskCacheRepo for PgStore {
    async fn find_or_create_task_cache(
        &self,
        pipeline_id: ResourceId,
        job_id: ResourceId,
        step_name: &str,
        path: &str,
    ) -> DbResult<TaskCache> {
        // The no-op update makes RETURNING yield the existing row.
        let row = sqlx::query_as::<_, TaskCacheRow>(
            r#"
            INSERT INTO task_caches (id, pipeline_id, job_id, step_name, path, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (job_id, step_name, path) DO UPDATE SET path = EXCLUDED.path
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(pipeline_id.as_uuid())
        .bind(job_id.as_uuid())
        .bind(step_name)
        .bind(path)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn find_task_cache(&self, id: ResourceId) -> DbResult<Option<TaskCache>> {
        let row = sqlx::query_as::<_, TaskCacheRow>("SELECT * FROM task_caches WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn clear_task_caches(
        &self,
        job_id: ResourceId,
        step_name: &str,
        path: Option<&str>,
    ) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM task_caches
            WHERE job_id = $1 AND step_name = $2 AND ($3::TEXT IS NULL OR path = $3)
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(step_name)
        .bind(path)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
