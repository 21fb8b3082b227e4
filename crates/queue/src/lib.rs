//! `queue` crate — durable, delayed job queue on top of the `jobs` table.
//!
//! Jobs tell a worker to drive a run forward ([`Job::Advance`]) or to fire a
//! wait timer ([`Job::FireTimer`]). A job that fails is retried with
//! exponential backoff and dead-lettered after `max_attempts`.

mod error;
mod job;

pub use error::QueueError;
pub use job::{ClaimedJob, Job, JobQueue};
