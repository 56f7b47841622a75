//! Typed error type for the db crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("row not found")]
    NotFound,

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The execution row already holds a terminal status and may not change.
    #[error("execution '{0}' is terminal and cannot be updated")]
    RecordFrozen(String),

    /// Another execution of this workflow is already `running`.
    #[error("workflow '{0}' already has a running execution")]
    AlreadyRunning(String),
}
