pub mod executions;
pub mod tasks;
pub mod webhooks;
pub mod workflows;
