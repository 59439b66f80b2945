//! Container records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::ResourceId;
use conveyor_core::container::{
    Container, ContainerOwner, ContainerScope, ContainerState, NewContainer,
};
use sqlx::types::Json;
use std::collections::BTreeMap;

use crate::postgres::PgStore;
use crate::{DbError, DbResult};

#[async_trait]
pub trait ContainerRepo: Send + Sync {
    /// Record a container in the `creating` state before the backend is
    /// asked for it. Fails if its pipeline is being destroyed or its owning
    /// build is already terminal.
    async fn create_container(&self, handle: &str, new: NewContainer) -> DbResult<Container>;
    async fn mark_container_created(&self, handle: &str) -> DbResult<()>;
    /// Move an expiring container's best-if-used-by out to `until`. Never
    /// shortens it and leaves containers without one alone.
    async fn extend_container_expiry(&self, handle: &str, until: DateTime<Utc>) -> DbResult<()>;
    async fn find_container(&self, handle: &str) -> DbResult<Option<Container>>;

    /// Mark every container of `owner` released. Returns how many were not
    /// released before.
    async fn release_containers(&self, owner: &ContainerOwner) -> DbResult<u64>;
    async fn release_pipeline_containers(&self, pipeline_id: ResourceId) -> DbResult<u64>;

    async fn containers_on_worker(&self, worker_name: &str) -> DbResult<Vec<Container>>;
    async fn list_containers(&self, scope: &ContainerScope) -> DbResult<Vec<Container>>;
    async fn containers_for_owner(&self, owner: &ContainerOwner) -> DbResult<Vec<Container>>;
    /// Unreleased containers per worker.
    async fn container_counts(&self) -> DbResult<BTreeMap<String, usize>>;
    async fn delete_container(&self, handle: &str) -> DbResult<()>;
}

#[derive(Debug, sqlx::FromRow)]
struct ContainerRow {
    handle: String,
    worker_name: String,
    owner: Json<ContainerOwner>,
    state: String,
    team: String,
    pipeline_id: Option<uuid::Uuid>,
    created_at: DateTime<Utc>,
    best_if_used_by: Option<DateTime<Utc>>,
    released_at: Option<DateTime<Utc>>,
}

impl From<ContainerRow> for Container {
    fn from(row: ContainerRow) -> Self {
        Container {
            handle: row.handle,
            worker_name: row.worker_name,
            owner: row.owner.0,
            state: if row.state == ContainerState::Created.as_str() {
                ContainerState::Created
            } else {
                ContainerState::Creating
            },
            team: row.team,
            pipeline_id: row.pipeline_id.map(Into::into),
            created_at: row.created_at,
            best_if_used_by: row.best_if_used_by,
            released_at: row.released_at,
        }
    }
}

fn into_containers(rows: Vec<ContainerRow>) -> Vec<Container> {
    rows.into_iter().map(Into::into).collect()
}

#[async_trait]
impl ContainerRepo for PgStore {
    async fn create_container(&self, handle: &str, new: NewContainer) -> DbResult<Container> {
        let mut tx = self.pool.begin().await?;

        if let Some(pipeline_id) = new.pipeline_id {
            let destroying: Option<bool> =
                sqlx::query_scalar("SELECT destroying FROM pipelines WHERE id = $1 FOR SHARE")
                    .bind(pipeline_id.as_uuid())
                    .fetch_optional(&mut *tx)
                    .await?;
            if destroying.unwrap_or(true) {
                return Err(DbError::PipelineDestroyed(pipeline_id.to_string()));
            }
        }

        if let Some(build_id) = new.owner.build_id() {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM builds WHERE id = $1 FOR SHARE")
                    .bind(build_id.as_uuid())
                    .fetch_optional(&mut *tx)
                    .await?;
            match status.as_deref() {
                None => return Err(DbError::NotFound(format!("build {}", build_id))),
                Some("pending") | Some("started") => {}
                Some(other) => {
                    return Err(DbError::Conflict(format!(
                        "build {} is already {}",
                        build_id, other
                    )));
                }
            }
        }

        let row = sqlx::query_as::<_, ContainerRow>(
            r#"
            INSERT INTO containers (handle, worker_name, owner, owner_kind, build_id, state,
                                    team, pipeline_id, created_at, best_if_used_by)
            VALUES ($1, $2, $3, $4, $5, 'creating', $6, $7, NOW(), $8)
            RETURNING *
            "#,
        )
        .bind(handle)
        .bind(&new.worker_name)
        .bind(Json(&new.owner))
        .bind(new.owner.kind())
        .bind(new.owner.build_id().map(uuid::Uuid::from))
        .bind(&new.team)
        .bind(new.pipeline_id.map(uuid::Uuid::from))
        .bind(new.best_if_used_by)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                DbError::NotFound(format!("worker {}", new.worker_name))
            }
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                DbError::Duplicate(format!("container {}", handle))
            }
            _ => DbError::Database(e),
        })?;

        tx.commit().await?;
        Ok(row.into())
    }

    async fn mark_container_created(&self, handle: &str) -> DbResult<()> {
        let result = sqlx::query("UPDATE containers SET state = 'created' WHERE handle = $1")
            .bind(handle)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("container {}", handle)));
        }
        Ok(())
    }

    async fn extend_container_expiry(&self, handle: &str, until: DateTime<Utc>) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE containers
            SET best_if_used_by = CASE
                WHEN best_if_used_by IS NULL THEN NULL
                ELSE GREATEST(best_if_used_by, $2)
            END
            WHERE handle = $1
            "#,
        )
        .bind(handle)
        .bind(until)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("container {}", handle)));
        }
        Ok(())
    }

    async fn find_container(&self, handle: &str) -> DbResult<Option<Container>> {
        let row = sqlx::query_as::<_, ContainerRow>("SELECT * FROM containers WHERE handle = $1")
            .bind(handle)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn release_containers(&self, owner: &ContainerOwner) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE containers SET released_at = NOW()
            WHERE owner = $1 AND released_at IS NULL
            "#,
        )
        .bind(Json(owner))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn release_pipeline_containers(&self, pipeline_id: ResourceId) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE containers SET released_at = NOW()
            WHERE pipeline_id = $1 AND released_at IS NULL
            "#,
        )
        .bind(pipeline_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn containers_on_worker(&self, worker_name: &str) -> DbResult<Vec<Container>> {
        let rows = sqlx::query_as::<_, ContainerRow>(
            "SELECT * FROM containers WHERE worker_name = $1 ORDER BY created_at, handle",
        )
        .bind(worker_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(into_containers(rows))
    }

    async fn list_containers(&self, scope: &ContainerScope) -> DbResult<Vec<Container>> {
        let query = match scope {
            ContainerScope::Team(team) => sqlx::query_as::<_, ContainerRow>(
                "SELECT * FROM containers WHERE team = $1 ORDER BY created_at, handle",
            )
            .bind(team.clone()),
            ContainerScope::Pipeline(id) => sqlx::query_as::<_, ContainerRow>(
                "SELECT * FROM containers WHERE pipeline_id = $1 ORDER BY created_at, handle",
            )
            .bind(uuid::Uuid::from(*id)),
            ContainerScope::Worker(name) => sqlx::query_as::<_, ContainerRow>(
                "SELECT * FROM containers WHERE worker_name = $1 ORDER BY created_at, handle",
            )
            .bind(name.clone()),
        };
        let rows = query.fetch_all(&self.pool).await?;
        Ok(into_containers(rows))
    }

    async fn containers_for_owner(&self, owner: &ContainerOwner) -> DbResult<Vec<Container>> {
        let rows = sqlx::query_as::<_, ContainerRow>(
            "SELECT * FROM containers WHERE owner = $1 ORDER BY created_at, handle",
        )
        .bind(Json(owner))
        .fetch_all(&self.pool)
        .await?;
        Ok(into_containers(rows))
    }

    async fn container_counts(&self) -> DbResult<BTreeMap<String, usize>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT worker_name, COUNT(*) FROM containers
            WHERE released_at IS NULL
            GROUP BY worker_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(name, count)| (name, usize::try_from(count).unwrap_or_default()))
            .collect())
    }

    async fn delete_container(&self, handle: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM containers WHERE handle = $1")
            .bind(handle)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
