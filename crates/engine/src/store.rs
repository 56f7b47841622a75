//! Persistence seam between the engine and the `db` crate.
//!
//! [`RecordStore`] speaks domain types; [`SqlStore`] maps them onto the
//! `db` row structs (full records are stored as JSON next to a few indexed
//! columns). [`MemoryStore`] keeps everything in process for tests and
//! one-shot CLI runs.
//!
//! Both implementations refuse to overwrite a terminal execution record and
//! hold at most one `Running` record per workflow. The second rule is what
//! keeps two processes sharing one database from running the same workflow
//! at once.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use db::models::{ExecutionRow, ScheduledTaskRow};
use db::repository::{executions, tasks};
use db::{DbError, DbPool};

use crate::models::{ExecutionRecord, ScheduledTask, TaskSpec};
use crate::EngineError;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or update a record. Fails with `DbError::RecordFrozen` if the
    /// stored record is already terminal, and with `WorkflowLocked` if a
    /// different record of the same workflow is still running.
    async fn save_execution(&self, record: &ExecutionRecord) -> Result<(), EngineError>;

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRecord>, EngineError>;

    /// Newest first, optionally filtered by workflow.
    async fn list_executions(
        &self,
        workflow: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, EngineError>;

    async fn list_running(&self) -> Result<Vec<ExecutionRecord>, EngineError>;

    /// Register a task by name. An existing task keeps its id and fire
    /// times; only its definition is replaced.
    async fn upsert_task(&self, task: &ScheduledTask, now: DateTime<Utc>) -> Result<ScheduledTask, EngineError>;

    async fn list_tasks(&self) -> Result<Vec<ScheduledTask>, EngineError>;

    async fn update_fire_times(
        &self,
        id: &str,
        next_fire_time: Option<DateTime<Utc>>,
        last_fired_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError>;

    /// Returns `false` if no such task existed.
    async fn delete_task(&self, id: &str) -> Result<bool, EngineError>;
}

// ---------------------------------------------------------------------------
// SqlStore
// ---------------------------------------------------------------------------

/// [`RecordStore`] backed by the SQLite pool.
#[derive(Debug, Clone)]
pub struct SqlStore {
    pool: DbPool,
}

impl SqlStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

fn to_row(record: &ExecutionRecord) -> Result<ExecutionRow, EngineError> {
    Ok(ExecutionRow {
        id: record.id.to_string(),
        workflow_name: record.workflow_name.clone(),
        trigger_type: record.trigger_type.as_str().to_string(),
        status: record.status.as_str().to_string(),
        started_at: record.start_time,
        finished_at: record.end_time,
        record: serde_json::to_string(record)?,
    })
}

fn from_row(row: &ExecutionRow) -> Result<ExecutionRecord, EngineError> {
    Ok(serde_json::from_str(&row.record)?)
}

fn task_from_row(row: &ScheduledTaskRow) -> Result<ScheduledTask, EngineError> {
    let spec: TaskSpec = serde_json::from_str(&row.definition)?;
    Ok(ScheduledTask {
        id: row.id.clone(),
        spec,
        next_fire_time: row.next_fire_at,
        last_fired_at: row.last_fired_at,
    })
}

#[async_trait]
impl RecordStore for SqlStore {
    async fn save_execution(&self, record: &ExecutionRecord) -> Result<(), EngineError> {
        match executions::save_execution(&self.pool, &to_row(record)?).await {
            Err(DbError::AlreadyRunning(name)) => Err(EngineError::WorkflowLocked(name)),
            other => Ok(other?),
        }
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRecord>, EngineError> {
        match executions::get_execution(&self.pool, &id.to_string()).await {
            Ok(row) => Ok(Some(from_row(&row)?)),
            Err(DbError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_executions(
        &self,
        workflow: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, EngineError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        executions::list_executions(&self.pool, workflow, limit)
            .await?
            .iter()
            .map(from_row)
            .collect()
    }

    async fn list_running(&self) -> Result<Vec<ExecutionRecord>, EngineError> {
        executions::list_running(&self.pool)
            .await?
            .iter()
            .map(from_row)
            .collect()
    }

    async fn upsert_task(&self, task: &ScheduledTask, now: DateTime<Utc>) -> Result<ScheduledTask, EngineError> {
        let row = ScheduledTaskRow {
            id: task.id.clone(),
            name: task.spec.name.clone(),
            definition: serde_json::to_string(&task.spec)?,
            next_fire_at: task.next_fire_time,
            last_fired_at: task.last_fired_at,
            created_at: now,
            updated_at: now,
        };
        task_from_row(&tasks::upsert_task(&self.pool, &row).await?)
    }

    async fn list_tasks(&self) -> Result<Vec<ScheduledTask>, EngineError> {
        tasks::list_tasks(&self.pool)
            .await?
            .iter()
            .map(task_from_row)
            .collect()
    }

    async fn update_fire_times(
        &self,
        id: &str,
        next_fire_time: Option<DateTime<Utc>>,
        last_fired_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        match tasks::update_fire_times(&self.pool, id, next_fire_time, last_fired_at, now).await {
            Err(DbError::NotFound) => Err(EngineError::UnknownTask(id.to_string())),
            other => Ok(other?),
        }
    }

    async fn delete_task(&self, id: &str) -> Result<bool, EngineError> {
        match tasks::delete_task(&self.pool, id).await {
            Ok(()) => Ok(true),
            Err(DbError::NotFound) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-process [`RecordStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    executions: Mutex<Vec<ExecutionRecord>>,
    tasks: Mutex<HashMap<String, ScheduledTask>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn save_execution(&self, record: &ExecutionRecord) -> Result<(), EngineError> {
        let mut executions = self.executions.lock();
        match executions.iter().position(|r| r.id == record.id) {
            Some(idx) if executions[idx].status.is_terminal() => {
                Err(DbError::RecordFrozen(record.id.to_string()).into())
            }
            Some(idx) => {
                executions[idx] = record.clone();
                Ok(())
            }
            None if !record.status.is_terminal()
                && executions
                    .iter()
                    .any(|r| r.workflow_name == record.workflow_name && !r.status.is_terminal()) =>
            {
                Err(EngineError::WorkflowLocked(record.workflow_name.clone()))
            }
            None => {
                executions.push(record.clone());
                Ok(())
            }
        }
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRecord>, EngineError> {
        Ok(self.executions.lock().iter().find(|r| r.id == id).cloned())
    }

    async fn list_executions(
        &self,
        workflow: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, EngineError> {
        let executions = self.executions.lock();
        let mut matching: Vec<(usize, &ExecutionRecord)> = executions
            .iter()
            .enumerate()
            .filter(|(_, r)| workflow.map_or(true, |w| r.workflow_name == w))
            .collect();
        // Newest first; later inserts win ties on start time.
        matching.sort_by(|(ia, a), (ib, b)| b.start_time.cmp(&a.start_time).then(ib.cmp(ia)));
        Ok(matching.into_iter().take(limit).map(|(_, r)| r.clone()).collect())
    }

    async fn list_running(&self) -> Result<Vec<ExecutionRecord>, EngineError> {
        Ok(self
            .executions
            .lock()
            .iter()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn upsert_task(&self, task: &ScheduledTask, _now: DateTime<Utc>) -> Result<ScheduledTask, EngineError> {
        let mut tasks = self.tasks.lock();
        let stored = match tasks.get(&task.spec.name) {
            Some(existing) => ScheduledTask {
                spec: task.spec.clone(),
                ..existing.clone()
            },
            None => task.clone(),
        };
        tasks.insert(stored.spec.name.clone(), stored.clone());
        Ok(stored)
    }

    async fn list_tasks(&self) -> Result<Vec<ScheduledTask>, EngineError> {
        let mut all: Vec<_> = self.tasks.lock().values().cloned().collect();
        all.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
        Ok(all)
    }

    async fn update_fire_times(
        &self,
        id: &str,
        next_fire_time: Option<DateTime<Utc>>,
        last_fired_at: Option<DateTime<Utc>>,
        _now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .values_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| EngineError::UnknownTask(id.to_string()))?;
        task.next_fire_time = next_fire_time;
        task.last_fired_at = last_fired_at;
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> Result<bool, EngineError> {
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|_, t| t.id != id);
        Ok(tasks.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use crate::models::{
        ExecutionStatus, RunContext, TaskCommand, TriggerKind, WorkflowDefinition,
    };

    fn record(name: &str, start: DateTime<Utc>) -> ExecutionRecord {
        let def = WorkflowDefinition::new(name, TriggerKind::Manual, vec![]);
        ExecutionRecord::start(&def, &RunContext::manual(), start)
    }

    fn task(id: &str, name: &str) -> ScheduledTask {
        ScheduledTask {
            id: id.into(),
            spec: TaskSpec::new(name, "0 2 * * *", TaskCommand::Deploy { environment: "prod".into() }),
            next_fire_time: None,
            last_fired_at: None,
        }
    }

    async fn stores() -> Vec<Box<dyn RecordStore>> {
        let pool = db::pool::create_in_memory_pool().await.unwrap();
        vec![Box::new(MemoryStore::new()), Box::new(SqlStore::new(pool))]
    }

    #[tokio::test]
    async fn terminal_records_are_frozen() {
        for store in stores().await {
            let mut rec = record("wf", Utc::now());
            store.save_execution(&rec).await.unwrap();

            rec.finish(ExecutionStatus::Succeeded, Utc::now());
            store.save_execution(&rec).await.unwrap();

            rec.status = ExecutionStatus::Failed;
            let err = store.save_execution(&rec).await.unwrap_err();
            assert!(matches!(err, EngineError::Database(DbError::RecordFrozen(_))));

            let stored = store.get_execution(rec.id).await.unwrap().unwrap();
            assert_eq!(stored.status, ExecutionStatus::Succeeded);
        }
    }

    #[tokio::test]
    async fn lists_newest_first_with_filter() {
        for store in stores().await {
            let t0 = Utc::now();
            let mut old = record("a", t0);
            old.finish(ExecutionStatus::Failed, t0 + Duration::seconds(1));
            let new = record("a", t0 + Duration::seconds(5));
            let other = record("b", t0 + Duration::seconds(1));
            for r in [&old, &new, &other] {
                store.save_execution(r).await.unwrap();
            }

            let ids: Vec<_> = store.list_executions(Some("a"), 10).await.unwrap().iter().map(|r| r.id).collect();
            assert_eq!(ids, vec![new.id, old.id]);
            assert_eq!(store.list_executions(None, 2).await.unwrap().len(), 2);
            assert_eq!(store.list_running().await.unwrap().len(), 2);
            assert!(store.get_execution(Uuid::new_v4()).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn second_running_record_of_a_workflow_is_locked() {
        for store in stores().await {
            let t0 = Utc::now();
            let mut first = record("deploy", t0);
            store.save_execution(&first).await.unwrap();

            let second = record("deploy", t0);
            assert!(matches!(
                store.save_execution(&second).await,
                Err(EngineError::WorkflowLocked(name)) if name == "deploy"
            ));
            store.save_execution(&record("backup", t0)).await.unwrap();

            // Progress writes to the running record itself are fine.
            store.save_execution(&first).await.unwrap();
            first.finish(ExecutionStatus::Succeeded, t0);
            store.save_execution(&first).await.unwrap();
            store.save_execution(&second).await.unwrap();
        }
    }

    #[tokio::test]
    async fn task_upsert_keeps_identity_and_fire_times() {
        for store in stores().await {
            let now = Utc::now();
            let first = store.upsert_task(&task("t1", "backup"), now).await.unwrap();
            let next = now + Duration::hours(1);
            store.update_fire_times(&first.id, Some(next), None, now).await.unwrap();

            let mut replacement = task("t2", "backup");
            replacement.spec.cron = "0 3 * * *".into();
            let stored = store.upsert_task(&replacement, now).await.unwrap();

            assert_eq!(stored.id, "t1");
            assert_eq!(stored.spec.cron, "0 3 * * *");
            assert_eq!(
                stored.next_fire_time.map(|t| t.timestamp()),
                Some(next.timestamp())
            );

            assert!(store.delete_task("t1").await.unwrap());
            assert!(!store.delete_task("t1").await.unwrap());
            assert!(matches!(
                store.update_fire_times("t1", None, None, now).await,
                Err(EngineError::UnknownTask(_))
            ));
        }
    }
}
