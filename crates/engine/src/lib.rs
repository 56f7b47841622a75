//! `engine` crate — workflow definitions, the execution coordinator and the
//! cron scheduler.
//!
//! The moving parts:
//!
//! * [`definitions`] loads and validates workflow and scheduled-task files.
//! * [`coordinator::ExecutionCoordinator`] runs workflows one step at a time,
//!   at most one run per workflow, with rollback and notifications.
//! * [`scheduler::Scheduler`] fires cron tasks through the coordinator.
//! * [`store::RecordStore`] persists execution records and tasks.

pub mod clock;
pub mod condition;
pub mod coordinator;
pub mod cron;
pub mod definitions;
pub mod error;
pub mod executor;
pub mod models;
pub mod notify;
pub mod rollback;
pub mod scheduler;
pub mod store;

pub use clock::{ManualClock, SharedClock, SystemClock, TimeSource};
pub use condition::Condition;
pub use coordinator::{CoordinatorConfig, EventOutcome, ExecutionCoordinator};
pub use cron::CronSchedule;
pub use definitions::{DefinitionSet, DefinitionStore};
pub use error::EngineError;
pub use executor::StepExecutor;
pub use models::{
    ExecutionRecord, ExecutionStatus, ExecutionSummary, RunContext, ScheduledTask, TaskSpec,
    TriggerEvent, TriggerType, WorkflowDefinition,
};
pub use notify::{ChannelRouter, Notifier};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use store::{MemoryStore, RecordStore, SqlStore};

#[cfg(test)]
mod coordinator_tests;
