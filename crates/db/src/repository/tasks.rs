//! Scheduled task repository functions.
//!
//! The scheduler is the only writer of `next_fire_at`; every write is a
//! single-row statement, so a fire and its recomputed next fire time land
//! atomically.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::{models::ScheduledTaskRow, DbError};

/// Insert a task, or replace the definition of the task with the same name.
///
/// On replacement the stored `id`, `created_at` and `next_fire_at` are kept,
/// so reloading configuration never loses a pending fire.
pub async fn upsert_task(pool: &SqlitePool, row: &ScheduledTaskRow) -> Result<ScheduledTaskRow, DbError> {
    let stored = sqlx::query_as::<_, ScheduledTaskRow>(
        r#"
        INSERT INTO scheduled_tasks
            (id, name, definition, next_fire_at, last_fired_at, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(name) DO UPDATE SET
            definition = excluded.definition,
            updated_at = excluded.updated_at
        RETURNING id, name, definition, next_fire_at, last_fired_at, created_at, updated_at
        "#,
    )
    .bind(&row.id)
    .bind(&row.name)
    .bind(&row.definition)
    .bind(row.next_fire_at)
    .bind(row.last_fired_at)
    .bind(row.created_at)
    .bind(row.updated_at)
    .fetch_one(pool)
    .await?;

    Ok(stored)
}

/// Fetch a single task by its primary key.
pub async fn get_task(pool: &SqlitePool, id: &str) -> Result<ScheduledTaskRow, DbError> {
    sqlx::query_as::<_, ScheduledTaskRow>(
        r#"
        SELECT id, name, definition, next_fire_at, last_fired_at, created_at, updated_at
        FROM scheduled_tasks
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}

/// Return all tasks ordered by name.
pub async fn list_tasks(pool: &SqlitePool) -> Result<Vec<ScheduledTaskRow>, DbError> {
    let rows = sqlx::query_as::<_, ScheduledTaskRow>(
        r#"
        SELECT id, name, definition, next_fire_at, last_fired_at, created_at, updated_at
        FROM scheduled_tasks
        ORDER BY name ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Persist the scheduler's bookkeeping for one task.
pub async fn update_fire_times(
    pool: &SqlitePool,
    id: &str,
    next_fire_at: Option<DateTime<Utc>>,
    last_fired_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE scheduled_tasks
        SET next_fire_at = ?, last_fired_at = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(next_fire_at)
    .bind(last_fired_at)
    .bind(updated_at)
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    Ok(())
}

/// Permanently delete a task by its primary key.
///
/// Returns `DbError::NotFound` if no row was deleted.
pub async fn delete_task(pool: &SqlitePool, id: &str) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM scheduled_tasks WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    Ok(())
}
