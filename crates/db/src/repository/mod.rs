//! Repository functions, one function per database operation.
//!
//! Every function takes a `&DbPool` and returns a `Result<T, DbError>`.
//! No business logic and no domain types, only SQL.

pub mod executions;
pub mod tasks;
