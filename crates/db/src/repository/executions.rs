//! Execution record repository functions.

use sqlx::SqlitePool;

use crate::{
    models::{status, ExecutionRow},
    DbError,
};

/// Insert an execution row, or update it in place while it is still
/// `running`.
///
/// Terminal rows are frozen: the `WHERE` guard on the upsert turns a late
/// write into a no-op, reported as [`DbError::RecordFrozen`].
///
/// A workflow has at most one `running` row (partial unique index); a
/// second one is rejected with [`DbError::AlreadyRunning`].
pub async fn save_execution(pool: &SqlitePool, row: &ExecutionRow) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        INSERT INTO executions
            (id, workflow_name, trigger_type, status, started_at, finished_at, record)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            status      = excluded.status,
            finished_at = excluded.finished_at,
            record      = excluded.record
        WHERE executions.status = ?
        "#,
    )
    .bind(&row.id)
    .bind(&row.workflow_name)
    .bind(&row.trigger_type)
    .bind(&row.status)
    .bind(row.started_at)
    .bind(row.finished_at)
    .bind(&row.record)
    .bind(status::RUNNING)
    .execute(pool)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            DbError::AlreadyRunning(row.workflow_name.clone())
        }
        _ => DbError::from(e),
    })?;

    if result.rows_affected() == 0 {
        return Err(DbError::RecordFrozen(row.id.clone()));
    }

    Ok(())
}

/// Fetch a single execution by its primary key.
pub async fn get_execution(pool: &SqlitePool, id: &str) -> Result<ExecutionRow, DbError> {
    sqlx::query_as::<_, ExecutionRow>(
        r#"
        SELECT id, workflow_name, trigger_type, status, started_at, finished_at, record
        FROM executions
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}

/// Return executions newest first, optionally restricted to one workflow.
pub async fn list_executions(
    pool: &SqlitePool,
    workflow_name: Option<&str>,
    limit: i64,
) -> Result<Vec<ExecutionRow>, DbError> {
    let rows = sqlx::query_as::<_, ExecutionRow>(
        r#"
        SELECT id, workflow_name, trigger_type, status, started_at, finished_at, record
        FROM executions
        WHERE (?1 IS NULL OR workflow_name = ?1)
        ORDER BY started_at DESC, rowid DESC
        LIMIT ?2
        "#,
    )
    .bind(workflow_name)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Return every execution still marked `running`.
pub async fn list_running(pool: &SqlitePool) -> Result<Vec<ExecutionRow>, DbError> {
    let rows = sqlx::query_as::<_, ExecutionRow>(
        r#"
        SELECT id, workflow_name, trigger_type, status, started_at, finished_at, record
        FROM executions
        WHERE status = ?
        ORDER BY started_at ASC
        "#,
    )
    .bind(status::RUNNING)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
