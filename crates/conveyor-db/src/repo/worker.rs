//! Worker repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::worker::{Worker, WorkerResourceType};
use sqlx::types::Json;

use crate::postgres::{PgStore, to_i64, to_u64};
use crate::{DbError, DbResult};

#[async_trait]
pub trait WorkerRepo: Send + Sync {
    /// Insert or replace a worker's registration.
    async fn save_worker(&self, worker: Worker) -> DbResult<Worker>;
    /// Renew a worker's expiry by its TTL, counted from `now`.
    async fn heartbeat_worker(&self, name: &str, now: DateTime<Utc>) -> DbResult<Worker>;
    async fn list_workers(&self) -> DbResult<Vec<Worker>>;
    async fn get_worker(&self, name: &str) -> DbResult<Worker>;
    async fn find_worker(&self, name: &str) -> DbResult<Option<Worker>>;
    /// Remove a worker together with its container records.
    async fn delete_worker(&self, name: &str) -> DbResult<()>;
    /// Remove every worker that expired before `before`, returning their
    /// names.
    async fn prune_expired_workers(&self, before: DateTime<Utc>) -> DbResult<Vec<String>>;
}

#[derive(Debug, sqlx::FromRow)]
struct WorkerRow {
    name: String,
    platform: String,
    tags: Json<Vec<String>>,
    resource_types: Json<Vec<WorkerResourceType>>,
    address: String,
    team: Option<String>,
    ttl_secs: i64,
    registered_at: DateTime<Utc>,
    heartbeat_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl From<WorkerRow> for Worker {
    fn from(row: WorkerRow) -> Self {
        Worker {
            name: row.name,
            platform: row.platform,
            tags: row.tags.0,
            resource_types: row.resource_types.0,
            address: row.address,
            team: row.team,
            ttl_secs: to_u64(row.ttl_secs),
            registered_at: row.registered_at,
            heartbeat_at: row.heartbeat_at,
            expires_at: row.expires_at,
        }
    }
}

#[async_trait]
impl WorkerRepo for PgStore {
    async fn save_worker(&self, worker: Worker) -> DbResult<Worker> {
        let row = sqlx::query_as::<_, WorkerRow>(
            r#"
            INSERT INTO workers (name, platform, tags, resource_types, address, team, ttl_secs,
                                 registered_at, heartbeat_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (name) DO UPDATE SET
                platform = EXCLUDED.platform,
                tags = EXCLUDED.tags,
                resource_types = EXCLUDED.resource_types,
                address = EXCLUDED.address,
                team = EXCLUDED.team,
                ttl_secs = EXCLUDED.ttl_secs,
                heartbeat_at = EXCLUDED.heartbeat_at,
                expires_at = EXCLUDED.expires_at
            RETURNING *
            "#,
        )
        .bind(&worker.name)
        .bind(&worker.platform)
        .bind(Json(&worker.tags))
        .bind(Json(&worker.resource_types))
        .bind(&worker.address)
        .bind(&worker.team)
        .bind(to_i64(worker.ttl_secs))
        .bind(worker.registered_at)
        .bind(worker.heartbeat_at)
        .bind(worker.expires_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn heartbeat_worker(&self, name: &str, now: DateTime<Utc>) -> DbResult<Worker> {
        let row = sqlx::query_as::<_, WorkerRow>(
            r#"
            UPDATE workers
            SET heartbeat_at = $2, expires_at = $2 + make_interval(secs => ttl_secs)
            WHERE name = $1
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("worker {}", name)))?;
        Ok(row.into())
    }

    async fn list_workers(&self) -> DbResult<Vec<Worker>> {
        let rows = sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_worker(&self, name: &str) -> DbResult<Worker> {
        self.find_worker(name)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("worker {}", name)))
    }

    async fn find_worker(&self, name: &str) -> DbResult<Option<Worker>> {
        let row = sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn delete_worker(&self, name: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM workers WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn prune_expired_workers(&self, before: DateTime<Utc>) -> DbResult<Vec<String>> {
        let names: Vec<String> =
            sqlx::query_scalar("DELETE FROM workers WHERE expires_at < $1 RETURNING name")
                .bind(before)
                .fetch_all(&self.pool)
                .await?;
        Ok(names)
    }
}
