//! Build repository.
//!
//! Build creation is guarded by concurrency leases: a build may only be
//! inserted if every lease scope it claims is below its limit, checked and
//! taken in the same transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::ResourceId;
use conveyor_core::build::{
    Build, BuildInput, BuildOutput, BuildStatus, CreateBuildOutcome, LeaseClaim, LeaseDenial,
    NewBuild, Page, Pagination,
};
use conveyor_core::plan::Plan;
use sqlx::types::Json;

use crate::postgres::{PgStore, to_i64, to_u64};
use crate::{DbError, DbResult};

const NON_TERMINAL: [&str; 2] = ["pending", "started"];

#[async_trait]
pub trait BuildRepo: Send + Sync {
    /// Atomically create a pending build if the job may build right now:
    /// its pipeline is not being destroyed, the job is active and unpaused
    /// and every lease in `leases` has room. A manual build consumes the
    /// job's pending manual trigger.
    async fn create_build(
        &self,
        new: NewBuild,
        leases: &[LeaseClaim],
    ) -> DbResult<CreateBuildOutcome>;

    /// Create a pending build that belongs to no job. No leases apply.
    async fn create_one_off_build(&self, pipeline_id: ResourceId, plan: Plan) -> DbResult<Build>;

    async fn get_build(&self, id: ResourceId) -> DbResult<Build>;
    async fn find_build(&self, id: ResourceId) -> DbResult<Option<Build>>;

    /// A page of a job's builds, newest first.
    async fn job_builds(&self, job_id: ResourceId, page: Page)
    -> DbResult<(Vec<Build>, Pagination)>;

    /// The job's build with the highest sequence number.
    async fn latest_build(&self, job_id: ResourceId) -> DbResult<Option<Build>>;

    /// Succeeded builds of a job, newest first.
    async fn successful_builds(&self, job_id: ResourceId) -> DbResult<Vec<Build>>;

    /// Every pending build, oldest first.
    async fn pending_builds(&self) -> DbResult<Vec<Build>>;

    /// `pending -> started`, claimed by the caller until `claim_until`.
    /// Returns false if the build was not pending.
    async fn start_build(&self, id: ResourceId, claim_until: DateTime<Utc>) -> DbResult<bool>;

    /// Push a started build's claim out to `until`. Returns false once the
    /// build is no longer started.
    async fn renew_build_claim(&self, id: ResourceId, until: DateTime<Utc>) -> DbResult<bool>;

    /// Started builds whose claim ran out at or before `now`, oldest first.
    async fn expired_build_claims(&self, now: DateTime<Utc>) -> DbResult<Vec<Build>>;

    /// Move a build to a terminal status and drop its leases. Returns false
    /// if the state machine does not allow the transition from the build's
    /// current status.
    async fn finish_build(&self, id: ResourceId, status: BuildStatus) -> DbResult<bool>;

    /// Pending builds are aborted on the spot; started builds get their
    /// abort flag set. Terminal builds are left alone.
    async fn request_abort(&self, id: ResourceId) -> DbResult<Build>;

    async fn abort_requested(&self, id: ResourceId) -> DbResult<bool>;

    /// Pending or started builds of a pipeline.
    async fn in_flight_builds(&self, pipeline_id: ResourceId) -> DbResult<Vec<Build>>;

    async fn record_build_output(&self, id: ResourceId, output: BuildOutput) -> DbResult<()>;
}

/// Statuses a build may be in for `next` to be a legal transition.
pub(crate) fn allowed_sources(next: BuildStatus) -> Vec<BuildStatus> {
    [BuildStatus::Pending, BuildStatus::Started]
        .into_iter()
        .filter(|s| s.can_transition_to(next))
        .collect()
}

/// Cut a window out of a job's builds, which must be sorted newest first.
pub(crate) fn paginate(builds: Vec<Build>, page: Page) -> (Vec<Build>, Pagination) {
    let limit = page.limit.max(1);
    let newest_overall = builds.first().map(|b| b.sequence);
    let oldest_overall = builds.last().map(|b| b.sequence);

    let matching: Vec<Build> = builds
        .into_iter()
        .filter(|b| page.contains(b.sequence))
        .collect();

    // Paging towards newer builds keeps the ones closest to `until`.
    let window: Vec<Build> = if page.until.is_some() && page.since.is_none() {
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).collect()
    } else {
        matching.into_iter().take(limit).collect()
    };

    let has_newer = match (window.first(), newest_overall) {
        (Some(b), Some(newest)) => newest > b.sequence,
        _ => false,
    };
    let has_older = match (window.last(), oldest_overall) {
        (Some(b), Some(oldest)) => oldest < b.sequence,
        _ => false,
    };
    let pagination = pagination_for(&window, limit, has_newer, has_older);
    (window, pagination)
}

pub(crate) fn pagination_for(
    window: &[Build],
    limit: usize,
    has_newer: bool,
    has_older: bool,
) -> Pagination {
    let newest = window.first().map(|b| b.sequence);
    let oldest = window.last().map(|b| b.sequence);
    Pagination {
        previous: match (has_newer, newest) {
            (true, Some(seq)) => Some(Page {
                since: None,
                until: Some(seq),
                limit,
            }),
            _ => None,
        },
        next: match (has_older, oldest) {
            (true, Some(seq)) => Some(Page {
                since: Some(seq),
                until: None,
                limit,
            }),
            _ => None,
        },
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BuildRow {
    id: uuid::Uuid,
    team: String,
    pipeline_id: uuid::Uuid,
    job_id: Option<uuid::Uuid>,
    job_name: Option<String>,
    sequence: i64,
    status: String,
    manually_triggered: bool,
    inputs: Json<Vec<BuildInput>>,
    outputs: Json<Vec<BuildOutput>>,
    plan: Option<Json<Plan>>,
    abort_requested: bool,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    claim_expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<BuildRow> for Build {
    type Error = DbError;

    fn try_from(row: BuildRow) -> DbResult<Self> {
        let status = row
            .status
            .parse::<BuildStatus>()
            .map_err(|e| DbError::Database(sqlx::Error::Decode(Box::new(e))))?;
        Ok(Build {
            id: row.id.into(),
            team: row.team,
            pipeline_id: row.pipeline_id.into(),
            job_id: row.job_id.map(Into::into),
            job_name: row.job_name,
            sequence: to_u64(row.sequence),
            status,
            manually_triggered: row.manually_triggered,
            inputs: row.inputs.0,
            outputs: row.outputs.0,
            plan: row.plan.map(|p| p.0),
            abort_requested: row.abort_requested,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            claim_expires_at: row.claim_expires_at,
        })
    }
}

fn into_builds(rows: Vec<BuildRow>) -> DbResult<Vec<Build>> {
    rows.into_iter().map(Build::try_from).collect()
}

#[derive(Debug, sqlx::FromRow)]
struct JobGate {
    active: bool,
    job_paused: bool,
    pipeline_paused: bool,
    destroying: bool,
    team: String,
    pipeline_name: String,
    job_name: String,
}

#[async_trait]
impl BuildRepo for PgStore {
    async fn create_build(
        &self,
        new: NewBuild,
        leases: &[LeaseClaim],
    ) -> DbResult<CreateBuildOutcome> {
        let mut tx = self.pool.begin().await?;

        let gate = sqlx::query_as::<_, JobGate>(
            r#"
            SELECT j.active, j.paused AS job_paused, p.paused AS pipeline_paused,
                   p.destroying, p.team, p.name AS pipeline_name, j.name AS job_name
            FROM jobs j
            JOIN pipelines p ON p.id = j.pipeline_id
            WHERE j.id = $1 AND p.id = $2
            FOR UPDATE OF j FOR SHARE OF p
            "#,
        )
        .bind(new.job_id.as_uuid())
        .bind(new.pipeline_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("job {}", new.job_id)))?;

        if gate.destroying {
            return Err(DbError::PipelineDestroyed(format!(
                "{}/{}",
                gate.team, gate.pipeline_name
            )));
        }
        if !gate.active || gate.job_paused || gate.pipeline_paused {
            return Ok(CreateBuildOutcome::LeaseDenied(LeaseDenial::Unavailable));
        }

        let mut claims = leases.to_vec();
        claims.sort_by(|a, b| a.scope.cmp(&b.scope));
        for claim in &claims {
            let key = claim.scope.key();
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(&key)
                .execute(&mut *tx)
                .await?;
            let holders: Vec<uuid::Uuid> = sqlx::query_scalar(
                r#"
                SELECT l.build_id FROM build_leases l
                JOIN builds b ON b.id = l.build_id
                WHERE l.scope = $1 AND b.status = ANY($2)
                "#,
            )
            .bind(&key)
            .bind(&NON_TERMINAL[..])
            .fetch_all(&mut *tx)
            .await?;
            if holders.len() >= claim.limit as usize {
                return Ok(CreateBuildOutcome::LeaseDenied(LeaseDenial::Held {
                    scope: claim.scope.clone(),
                    limit: claim.limit,
                    holders: holders.into_iter().map(Into::into).collect(),
                }));
            }
        }

        let sequence: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(sequence), 0) + 1 FROM builds WHERE job_id = $1")
                .bind(new.job_id.as_uuid())
                .fetch_one(&mut *tx)
                .await?;

        let row = sqlx::query_as::<_, BuildRow>(
            r#"
            INSERT INTO builds (id, team, pipeline_id, job_id, job_name, sequence, status,
                                manually_triggered, inputs, outputs, plan, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8, '[]', $9, NOW())
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(&gate.team)
        .bind(new.pipeline_id.as_uuid())
        .bind(new.job_id.as_uuid())
        .bind(&gate.job_name)
        .bind(sequence)
        .bind(new.manually_triggered)
        .bind(Json(&new.inputs))
        .bind(Json(&new.plan))
        .fetch_one(&mut *tx)
        .await?;

        for claim in &claims {
            sqlx::query("INSERT INTO build_leases (scope, build_id) VALUES ($1, $2)")
                .bind(claim.scope.key())
                .bind(row.id)
                .execute(&mut *tx)
                .await?;
        }

        if new.manually_triggered {
            sqlx::query("UPDATE jobs SET manual_trigger_requested = FALSE WHERE id = $1")
                .bind(new.job_id.as_uuid())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(CreateBuildOutcome::Created(row.try_into()?))
    }

    async fn create_one_off_build(&self, pipeline_id: ResourceId, plan: Plan) -> DbResult<Build> {
        let mut tx = self.pool.begin().await?;

        let pipeline: Option<(String, String, bool)> = sqlx::query_as(
            "SELECT team, name, destroying FROM pipelines WHERE id = $1 FOR UPDATE",
        )
        .bind(pipeline_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;
        let (team, name, destroying) =
            pipeline.ok_or_else(|| DbError::NotFound(format!("pipeline {}", pipeline_id)))?;
        if destroying {
            return Err(DbError::PipelineDestroyed(format!("{team}/{name}")));
        }

        let sequence: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(MAX(sequence), 0) + 1 FROM builds
            WHERE pipeline_id = $1 AND job_id IS NULL
            "#,
        )
        .bind(pipeline_id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, BuildRow>(
            r#"
            INSERT INTO builds (id, team, pipeline_id, sequence, status, manually_triggered,
                                inputs, outputs, plan, created_at)
            VALUES ($1, $2, $3, $4, 'pending', TRUE, '[]', '[]', $5, NOW())
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(&team)
        .bind(pipeline_id.as_uuid())
        .bind(sequence)
        .bind(Json(&plan))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn get_build(&self, id: ResourceId) -> DbResult<Build> {
        self.find_build(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))
    }

    async fn find_build(&self, id: ResourceId) -> DbResult<Option<Build>> {
        let row = sqlx::query_as::<_, BuildRow>("SELECT * FROM builds WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Build::try_from).transpose()
    }

    async fn job_builds(
        &self,
        job_id: ResourceId,
        page: Page,
    ) -> DbResult<(Vec<Build>, Pagination)> {
        let limit = page.limit.max(1);
        let since = page.since.map(to_i64);
        let until = page.until.map(to_i64);

        let rows = if until.is_some() && since.is_none() {
            let mut rows = sqlx::query_as::<_, BuildRow>(
                r#"
                SELECT * FROM builds
                WHERE job_id = $1 AND sequence > $2
                ORDER BY sequence ASC
                LIMIT $3
                "#,
            )
            .bind(job_id.as_uuid())
            .bind(until)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
            rows.reverse();
            rows
        } else {
            sqlx::query_as::<_, BuildRow>(
                r#"
                SELECT * FROM builds
                WHERE job_id = $1
                  AND ($2::BIGINT IS NULL OR sequence < $2)
                  AND ($3::BIGINT IS NULL OR sequence > $3)
                ORDER BY sequence DESC
                LIMIT $4
                "#,
            )
            .bind(job_id.as_uuid())
            .bind(since)
            .bind(until)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
        };
        let builds = into_builds(rows)?;

        let (has_newer, has_older) = match (builds.first(), builds.last()) {
            (Some(newest), Some(oldest)) => {
                let newer: bool = sqlx::query_scalar(
                    "SELECT EXISTS (SELECT 1 FROM builds WHERE job_id = $1 AND sequence > $2)",
                )
                .bind(job_id.as_uuid())
                .bind(to_i64(newest.sequence))
                .fetch_one(&self.pool)
                .await?;
                let older: bool = sqlx::query_scalar(
                    "SELECT EXISTS (SELECT 1 FROM builds WHERE job_id = $1 AND sequence < $2)",
                )
                .bind(job_id.as_uuid())
                .bind(to_i64(oldest.sequence))
                .fetch_one(&self.pool)
                .await?;
                (newer, older)
            }
            _ => (false, false),
        };

        let pagination = pagination_for(&builds, limit, has_newer, has_older);
        Ok((builds, pagination))
    }

    async fn latest_build(&self, job_id: ResourceId) -> DbResult<Option<Build>> {
        let row = sqlx::query_as::<_, BuildRow>(
            "SELECT * FROM builds WHERE job_id = $1 ORDER BY sequence DESC LIMIT 1",
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Build::try_from).transpose()
    }

    async fn successful_builds(&self, job_id: ResourceId) -> DbResult<Vec<Build>> {
        let rows = sqlx::query_as::<_, BuildRow>(
            r#"
            SELECT * FROM builds
            WHERE job_id = $1 AND status = 'succeeded'
            ORDER BY sequence DESC
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        into_builds(rows)
    }

    async fn pending_builds(&self) -> DbResult<Vec<Build>> {
        let rows = sqlx::query_as::<_, BuildRow>(
            "SELECT * FROM builds WHERE status = 'pending' ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        into_builds(rows)
    }

    async fn start_build(&self, id: ResourceId, claim_until: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE builds SET status = 'started', started_at = NOW(), claim_expires_at = $2
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id.as_uuid())
        .bind(claim_until)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn renew_build_claim(&self, id: ResourceId, until: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE builds SET claim_expires_at = $2 WHERE id = $1 AND status = 'started'",
        )
        .bind(id.as_uuid())
        .bind(until)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn expired_build_claims(&self, now: DateTime<Utc>) -> DbResult<Vec<Build>> {
        let rows = sqlx::query_as::<_, BuildRow>(
            r#"
            SELECT * FROM builds
            WHERE status = 'started'
              AND (claim_expires_at IS NULL OR claim_expires_at <= $1)
            ORDER BY created_at, id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        into_builds(rows)
    }

    async fn finish_build(&self, id: ResourceId, status: BuildStatus) -> DbResult<bool> {
        if !status.is_terminal() {
            return Err(DbError::Conflict(format!(
                "cannot finish build {} as {}",
                id, status
            )));
        }
        let sources: Vec<&str> = allowed_sources(status).iter().map(|s| s.as_str()).collect();

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE builds SET status = $2, finished_at = NOW(), claim_expires_at = NULL
            WHERE id = $1 AND status = ANY($3)
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(&sources)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        sqlx::query("DELETE FROM build_leases WHERE build_id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn request_abort(&self, id: ResourceId) -> DbResult<Build> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, BuildRow>("SELECT * FROM builds WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;

        let row = match row.status.as_str() {
            "pending" => {
                sqlx::query("DELETE FROM build_leases WHERE build_id = $1")
                    .bind(id.as_uuid())
                    .execute(&mut *tx)
                    .await?;
                sqlx::query_as::<_, BuildRow>(
                    r#"
                    UPDATE builds
                    SET status = 'aborted', abort_requested = TRUE, finished_at = NOW()
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(id.as_uuid())
                .fetch_one(&mut *tx)
                .await?
            }
            "started" => {
                sqlx::query_as::<_, BuildRow>(
                    "UPDATE builds SET abort_requested = TRUE WHERE id = $1 RETURNING *",
                )
                .bind(id.as_uuid())
                .fetch_one(&mut *tx)
                .await?
            }
            _ => row,
        };

        tx.commit().await?;
        row.try_into()
    }

    async fn abort_requested(&self, id: ResourceId) -> DbResult<bool> {
        let flag: Option<bool> =
            sqlx::query_scalar("SELECT abort_requested FROM builds WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        flag.ok_or_else(|| DbError::NotFound(format!("build {}", id)))
    }

    async fn in_flight_builds(&self, pipeline_id: ResourceId) -> DbResult<Vec<Build>> {
        let rows = sqlx::query_as::<_, BuildRow>(
            r#"
            SELECT * FROM builds
            WHERE pipeline_id = $1 AND status = ANY($2)
            ORDER BY created_at, id
            "#,
        )
        .bind(pipeline_id.as_uuid())
        .bind(&NON_TERMINAL[..])
        .fetch_all(&self.pool)
        .await?;
        into_builds(rows)
    }

    async fn record_build_output(&self, id: ResourceId, output: BuildOutput) -> DbResult<()> {
        let result = sqlx::query("UPDATE builds SET outputs = outputs || $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(Json(vec![output]))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("build {}", id)));
        }
        Ok(())
    }
}
