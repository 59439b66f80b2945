//! PostgreSQL-backed store.
//!
//! The repository traits are implemented for [`PgStore`] in the `repo`
//! modules, next to the trait they implement.

use sqlx::PgPool;

use crate::{DbResult, create_pool, run_migrations};

#[derive(Clone)]
pub struct PgStore {
    pub(crate) pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and bring the schema up to date.
    pub async fn connect(database_url: &str) -> DbResult<Self> {
        let pool = create_pool(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Map a unique-violation into [`crate::DbError::Duplicate`].
pub(crate) fn map_unique(err: sqlx::Error, what: impl FnOnce() -> String) -> crate::DbError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => crate::DbError::Duplicate(what()),
        _ => crate::DbError::Database(err),
    }
}

pub(crate) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}
