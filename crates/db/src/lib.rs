//! `db` crate — pure persistence layer.
//!
//! Provides a SQLite connection pool, typed row structs, and repository
//! functions for every table in the orchestrator schema. No business logic
//! lives here.

pub mod error;
pub mod models;
pub mod pool;
pub mod repository;

pub use error::DbError;
pub use pool::DbPool;
