//! Resource version history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::ResourceId;
use conveyor_core::version::{MetadataField, ResourceVersion, Version};
use sqlx::types::Json;

use crate::postgres::{PgStore, to_u64};
use crate::{DbError, DbResult};

#[async_trait]
pub trait VersionRepo: Send + Sync {
    /// Every version of a resource, ascending by check order.
    async fn versions(&self, resource_id: ResourceId) -> DbResult<Vec<ResourceVersion>>;

    /// Append a version, assigning the next check order. Appends to one
    /// resource are serialised; appending a version already in the history
    /// returns the existing entry unchanged.
    async fn append_version(
        &self,
        resource_id: ResourceId,
        version: Version,
        metadata: Vec<MetadataField>,
    ) -> DbResult<ResourceVersion>;

    async fn latest_version(&self, resource_id: ResourceId) -> DbResult<Option<ResourceVersion>>;
}

#[derive(Debug, sqlx::FromRow)]
struct VersionRow {
    resource_id: uuid::Uuid,
    check_order: i64,
    version: Json<Version>,
    metadata: Json<Vec<MetadataField>>,
    discovered_at: DateTime<Utc>,
}

impl From<VersionRow> for ResourceVersion {
    fn from(row: VersionRow) -> Self {
        ResourceVersion {
            resource_id: row.resource_id.into(),
            version: row.version.0,
            metadata: row.metadata.0,
            check_order: to_u64(row.check_order),
            discovered_at: row.discovered_at,
        }
    }
}

#[async_trait]
impl VersionRepo for PgStore {
    async fn versions(&self, resource_id: ResourceId) -> DbResult<Vec<ResourceVersion>> {
        let rows = sqlx::query_as::<_, VersionRow>(
            "SELECT * FROM resource_versions WHERE resource_id = $1 ORDER BY check_order",
        )
        .bind(resource_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn append_version(
        &self,
        resource_id: ResourceId,
        version: Version,
        metadata: Vec<MetadataField>,
    ) -> DbResult<ResourceVersion> {
        let mut tx = self.pool.begin().await?;

        // The row lock on the resource serialises check order assignment.
        let locked: Option<uuid::Uuid> =
            sqlx::query_scalar("SELECT id FROM resources WHERE id = $1 FOR UPDATE")
                .bind(resource_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            return Err(DbError::NotFound(format!("resource {}", resource_id)));
        }

        let existing = sqlx::query_as::<_, VersionRow>(
            "SELECT * FROM resource_versions WHERE resource_id = $1 AND version = $2",
        )
        .bind(resource_id.as_uuid())
        .bind(Json(&version))
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = existing {
            tx.commit().await?;
            return Ok(row.into());
        }

        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(check_order), 0) + 1 FROM resource_versions WHERE resource_id = $1",
        )
        .bind(resource_id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, VersionRow>(
            r#"
            INSERT INTO resource_versions (resource_id, check_order, version, metadata, discovered_at)
            VALUES ($1, $2, $3, $4, NOW())
            RETURNING *
            "#,
        )
        .bind(resource_id.as_uuid())
        .bind(next)
        .bind(Json(&version))
        .bind(Json(&metadata))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row.into())
    }

    async fn latest_version(&self, resource_id: ResourceId) -> DbResult<Option<ResourceVersion>> {
        let row = sqlx::query_as::<_, VersionRow>(
            r#"
            SELECT * FROM resource_versions
            WHERE resource_id = $1
            ORDER BY check_order DESC
            LIMIT 1
            "#,
        )
        .bind(resource_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }
}
