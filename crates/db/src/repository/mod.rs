//! Repository functions — one function per database operation.
//!
//! Every function takes an sqlx executor (`&SqlitePool` for one-off
//! statements, `&mut *tx` inside a transaction) and returns a
//! `Result<T, DbError>`. Pure SQL with no business logic.
//! Multi-statement operations that must be atomic take a connection and are
//! called inside a caller-owned transaction.

pub mod compensations;
pub mod jobs;
pub mod locks;
pub mod runs;
pub mod signals;
pub mod steps;
pub mod timers;
pub mod vars;
pub mod workflows;
