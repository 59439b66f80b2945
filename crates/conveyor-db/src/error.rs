//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    /// A compare-and-set or referential precondition did not hold.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("pipeline is being destroyed: {0}")]
    PipelineDestroyed(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl From<DbError> for conveyor_core::Error {
    fn from(err: DbError) -> Self {
        use conveyor_core::Error;
        match err {
            DbError::NotFound(what) => Error::NotFound(what),
            DbError::Duplicate(what) | DbError::Conflict(what) => Error::Conflict(what),
            DbError::PipelineDestroyed(what) => Error::PipelineDestroyed(what),
            DbError::Database(e) => Error::Infrastructure(e.to_string()),
            DbError::Migration(e) => Error::Infrastructure(e.to_string()),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;
