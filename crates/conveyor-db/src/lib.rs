//! Persistent store for the Conveyor CI orchestrator.
//!
//! Provides repository traits, an in-memory implementation and a
//! PostgreSQL implementation. Every trait method is atomic on its own.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod repo;

pub use error::{DbError, DbResult};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use repo::*;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations applied");
    Ok(())
}
