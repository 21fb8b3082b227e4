//! `db` crate — pure persistence layer.
//!
//! Provides a connection pool, typed row structs, and repository functions
//! for every table in the orchestrator schema. No business logic lives here.

pub mod codec;
pub mod error;
pub mod models;
pub mod pool;
pub mod repository;

pub use error::DbError;
pub use pool::{commit, rollback, DbPool};

/// A write transaction on the writer pool.
pub type Tx<'a> = sqlx::Transaction<'a, sqlx::Sqlite>;
