//! SQLite connection pool.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::DbError;

/// Type alias for the shared pool used across the whole application.
pub type DbPool = SqlitePool;

/// Create a new connection pool from the given `database_url`
/// (e.g. `sqlite://orchestrator.db`). The database file is created if it
/// does not exist yet.
///
/// `max_connections` controls the pool ceiling.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, DbError> {
    info!("Connecting to database (max_connections={})", max_connections);
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .busy_timeout(std::time::Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// A private in-memory database with the schema applied.
///
/// Every SQLite `:memory:` connection is its own database, so the pool is
/// pinned to a single connection that is never recycled.
pub async fn create_in_memory_pool() -> Result<DbPool, DbError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Run embedded SQLx migrations located in `./migrations` (relative to the
/// workspace root at build time).
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    info!("Running database migrations");
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}
