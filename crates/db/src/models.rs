//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models; they carry no domain behaviour.
//! Domain types live in the `engine` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// executions
// ---------------------------------------------------------------------------

/// Status strings stored in `executions.status`.
pub mod status {
    pub const RUNNING: &str = "running";
    pub const SUCCEEDED: &str = "succeeded";
    pub const FAILED: &str = "failed";
    pub const ROLLED_BACK: &str = "rolled_back";
}

/// A persisted execution record row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ExecutionRow {
    pub id: String,
    pub workflow_name: String,
    pub trigger_type: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Full JSON execution record (step results, params, ...).
    pub record: String,
}

// ---------------------------------------------------------------------------
// scheduled_tasks
// ---------------------------------------------------------------------------

/// A persisted scheduled task row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ScheduledTaskRow {
    pub id: String,
    pub name: String,
    /// Full JSON task definition (cron, command, environment, notifications).
    pub definition: String,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
