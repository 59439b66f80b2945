//! Pipeline, job and resource repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::ResourceId;
use conveyor_core::pipeline::{Job, Pipeline, PipelineConfig, Resource};
use sqlx::types::Json;

use crate::postgres::{PgStore, map_unique, to_u64};
use crate::{DbError, DbResult};

#[async_trait]
pub trait PipelineRepo: Send + Sync {
    /// Create or update a pipeline's config, syncing job and resource records
    /// by name. Jobs and resources missing from the new config are marked
    /// inactive.
    async fn save_pipeline(
        &self,
        team: &str,
        name: &str,
        config: &PipelineConfig,
    ) -> DbResult<Pipeline>;
    async fn get_pipeline(&self, id: ResourceId) -> DbResult<Pipeline>;
    async fn find_pipeline(&self, team: &str, name: &str) -> DbResult<Option<Pipeline>>;
    async fn list_pipelines(&self) -> DbResult<Vec<Pipeline>>;
    async fn set_pipeline_paused(&self, id: ResourceId, paused: bool) -> DbResult<()>;
    /// Mark the pipeline as being destroyed. Idempotent.
    async fn begin_destroy(&self, id: ResourceId) -> DbResult<Pipeline>;
    /// Delete the pipeline and everything it owns. Refuses with `Conflict`
    /// while any of its builds is pending or started.
    async fn delete_pipeline(&self, id: ResourceId) -> DbResult<()>;
    async fn destroying_pipelines(&self) -> DbResult<Vec<Pipeline>>;

    /// Active jobs of a pipeline, by name.
    async fn jobs(&self, pipeline_id: ResourceId) -> DbResult<Vec<Job>>;
    async fn get_job(&self, id: ResourceId) -> DbResult<Job>;
    async fn find_job(&self, pipeline_id: ResourceId, name: &str) -> DbResult<Option<Job>>;
    async fn set_job_paused(&self, id: ResourceId, paused: bool) -> DbResult<()>;
    /// Record a pending manual trigger, consumed by the next manual build.
    async fn request_manual_trigger(&self, id: ResourceId) -> DbResult<()>;

    /// Active resources of a pipeline, by name.
    async fn resources(&self, pipeline_id: ResourceId) -> DbResult<Vec<Resource>>;
    async fn get_resource(&self, id: ResourceId) -> DbResult<Resource>;
    async fn find_resource(&self, pipeline_id: ResourceId, name: &str)
    -> DbResult<Option<Resource>>;
}

#[derive(Debug, sqlx::FromRow)]
struct PipelineRow {
    id: uuid::Uuid,
    team: String,
    name: String,
    config: Json<PipelineConfig>,
    config_version: i64,
    paused: bool,
    destroying: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PipelineRow> for Pipeline {
    fn from(row: PipelineRow) -> Self {
        Pipeline {
            id: row.id.into(),
            team: row.team,
            name: row.name,
            config: row.config.0,
            config_version: to_u64(row.config_version),
            paused: row.paused,
            destroying: row.destroying,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: uuid::Uuid,
    pipeline_id: uuid::Uuid,
    name: String,
    paused: bool,
    active: bool,
    manual_trigger_requested: bool,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: row.id.into(),
            pipeline_id: row.pipeline_id.into(),
            name: row.name,
            paused: row.paused,
            active: row.active,
            manual_trigger_requested: row.manual_trigger_requested,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ResourceRow {
    id: uuid::Uuid,
    pipeline_id: uuid::Uuid,
    name: String,
    resource_type: String,
    active: bool,
}

impl From<ResourceRow> for Resource {
    fn from(row: ResourceRow) -> Self {
        Resource {
            id: row.id.into(),
            pipeline_id: row.pipeline_id.into(),
            name: row.name,
            resource_type: row.resource_type,
            active: row.active,
        }
    }
}

#[async_trait]
impl PipelineRepo for PgStore {
    async fn save_pipeline(
        &self,
        team: &str,
        name: &str,
        config: &PipelineConfig,
    ) -> DbResult<Pipeline> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, PipelineRow>(
            "SELECT * FROM pipelines WHERE team = $1 AND name = $2 FOR UPDATE",
        )
        .bind(team)
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?;

        let row = match existing {
            Some(row) if row.destroying => {
                return Err(DbError::PipelineDestroyed(format!("{team}/{name}")));
            }
            Some(row) => {
                sqlx::query_as::<_, PipelineRow>(
                    r#"
                    UPDATE pipelines
                    SET config = $2, config_version = config_version + 1, updated_at = NOW()
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(row.id)
                .bind(Json(config))
                .fetch_one(&mut *tx)
                .await?
            }
            None => sqlx::query_as::<_, PipelineRow>(
                r#"
                INSERT INTO pipelines (id, team, name, config, created_at, updated_at)
                VALUES ($1, $2, $3, $4, NOW(), NOW())
                RETURNING *
                "#,
            )
            .bind(uuid::Uuid::now_v7())
            .bind(team)
            .bind(name)
            .bind(Json(config))
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_unique(e, || format!("pipeline {team}/{name}")))?,
        };

        let job_names: Vec<String> = config.jobs.iter().map(|j| j.name.clone()).collect();
        sqlx::query("UPDATE jobs SET active = (name = ANY($2)) WHERE pipeline_id = $1")
            .bind(row.id)
            .bind(&job_names)
            .execute(&mut *tx)
            .await?;
        for job in &config.jobs {
            sqlx::query(
                r#"
                INSERT INTO jobs (id, pipeline_id, name)
                VALUES ($1, $2, $3)
                ON CONFLICT (pipeline_id, name) DO UPDATE SET active = TRUE
                "#,
            )
            .bind(uuid::Uuid::now_v7())
            .bind(row.id)
            .bind(&job.name)
            .execute(&mut *tx)
            .await?;
        }

        let resource_names: Vec<String> =
            config.resources.iter().map(|r| r.name.clone()).collect();
        sqlx::query("UPDATE resources SET active = (name = ANY($2)) WHERE pipeline_id = $1")
            .bind(row.id)
            .bind(&resource_names)
            .execute(&mut *tx)
            .await?;
        for resource in &config.resources {
            sqlx::query(
                r#"
                INSERT INTO resources (id, pipeline_id, name, resource_type)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (pipeline_id, name)
                DO UPDATE SET active = TRUE, resource_type = EXCLUDED.resource_type
                "#,
            )
            .bind(uuid::Uuid::now_v7())
            .bind(row.id)
            .bind(&resource.name)
            .bind(&resource.resource_type)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(row.into())
    }

    async fn get_pipeline(&self, id: ResourceId) -> DbResult<Pipeline> {
        let row = sqlx::query_as::<_, PipelineRow>("SELECT * FROM pipelines WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("pipeline {}", id)))?;
        Ok(row.into())
    }

    async fn find_pipeline(&self, team: &str, name: &str) -> DbResult<Option<Pipeline>> {
        let row = sqlx::query_as::<_, PipelineRow>(
            "SELECT * FROM pipelines WHERE team = $1 AND name = $2",
        )
        .bind(team)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_pipelines(&self) -> DbResult<Vec<Pipeline>> {
        let rows = sqlx::query_as::<_, PipelineRow>("SELECT * FROM pipelines ORDER BY team, name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn set_pipeline_paused(&self, id: ResourceId, paused: bool) -> DbResult<()> {
        let result = sqlx::query("UPDATE pipelines SET paused = $2, updated_at = NOW() WHERE id = $1")
            .bind(id.as_uuid())
            .bind(paused)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("pipeline {}", id)));
        }
        Ok(())
    }

    async fn begin_destroy(&self, id: ResourceId) -> DbResult<Pipeline> {
        let row = sqlx::query_as::<_, PipelineRow>(
            r#"
            UPDATE pipelines SET destroying = TRUE, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("pipeline {}", id)))?;
        Ok(row.into())
    }

    async fn delete_pipeline(&self, id: ResourceId) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let locked: Option<uuid::Uuid> =
            sqlx::query_scalar("SELECT id FROM pipelines WHERE id = $1 FOR UPDATE")
                .bind(id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            return Err(DbError::NotFound(format!("pipeline {}", id)));
        }

        let running: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM builds
                WHERE pipeline_id = $1 AND status IN ('pending', 'started')
            )
            "#,
        )
        .bind(id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;
        if running {
            return Err(DbError::Conflict(format!(
                "pipeline {} still has builds in flight",
                id
            )));
        }

        sqlx::query("DELETE FROM pipelines WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn destroying_pipelines(&self) -> DbResult<Vec<Pipeline>> {
        let rows = sqlx::query_as::<_, PipelineRow>(
            "SELECT * FROM pipelines WHERE destroying ORDER BY updated_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn jobs(&self, pipeline_id: ResourceId) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE pipeline_id = $1 AND active ORDER BY name",
        )
        .bind(pipeline_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_job(&self, id: ResourceId) -> DbResult<Job> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        Ok(row.into())
    }

    async fn find_job(&self, pipeline_id: ResourceId, name: &str) -> DbResult<Option<Job>> {
        let row =
            sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE pipeline_id = $1 AND name = $2")
                .bind(pipeline_id.as_uuid())
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Into::into))
    }

    async fn set_job_paused(&self, id: ResourceId, paused: bool) -> DbResult<()> {
        let result = sqlx::query("UPDATE jobs SET paused = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(paused)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("job {}", id)));
        }
        Ok(())
    }

    async fn request_manual_trigger(&self, id: ResourceId) -> DbResult<()> {
        let result = sqlx::query("UPDATE jobs SET manual_trigger_requested = TRUE WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("job {}", id)));
        }
        Ok(())
    }

    async fn resources(&self, pipeline_id: ResourceId) -> DbResult<Vec<Resource>> {
        let rows = sqlx::query_as::<_, ResourceRow>(
            "SELECT * FROM resources WHERE pipeline_id = $1 AND active ORDER BY name",
        )
        .bind(pipeline_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_resource(&self, id: ResourceId) -> DbResult<Resource> {
        let row = sqlx::query_as::<_, ResourceRow>("SELECT * FROM resources WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("resource {}", id)))?;
        Ok(row.into())
    }

    async fn find_resource(
        &self,
        pipeline_id: ResourceId,
        name: &str,
    ) -> DbResult<Option<Resource>> {
        let row = sqlx::query_as::<_, ResourceRow>(
            "SELECT * FROM resources WHERE pipeline_id = $1 AND name = $2",
        )
        .bind(pipeline_id.as_uuid())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }
}
