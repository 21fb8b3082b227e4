use std::time::Duration;

use chrono::{DateTime, Utc};
use db::models::{JobRow, JobStatus};
use db::repository::jobs;
use db::{DbPool, Tx};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::QueueError;

/// Work item carried in `jobs.payload`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    /// Run the executor loop for a run.
    Advance { run_id: Uuid },
    /// Fire a wait timer once it is due.
    FireTimer { timer_id: Uuid },
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Job::Advance { .. } => "advance",
            Job::FireTimer { .. } => "fire_timer",
        }
    }
}

/// A job claimed by [`JobQueue::next_due`].
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub job: Job,
    pub attempts: u32,
}

#[derive(Clone, Debug)]
pub struct JobQueue {
    pool: DbPool,
    max_attempts: u32,
    base_backoff: Duration,
}

impl JobQueue {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, base: Duration) -> Self {
        self.base_backoff = base;
        self
    }

    /// Enqueue a job that is due immediately.
    pub async fn enqueue(&self, job: Job) -> Result<Uuid, QueueError> {
        self.enqueue_at(job, Utc::now()).await
    }

    /// Enqueue a job that becomes visible at `run_at`.
    pub async fn enqueue_at(&self, job: Job, run_at: DateTime<Utc>) -> Result<Uuid, QueueError> {
        let payload = serde_json::to_value(job)?;
        let row = jobs::enqueue_job(&self.pool.writer, job.kind(), &payload, run_at, self.max_attempts).await?;
        debug!(job_id = %row.id, kind = job.kind(), run_at = %run_at, "Job enqueued");
        Ok(row.id)
    }

    /// Enqueue as part of the caller's write transaction; the job becomes
    /// visible only if that transaction commits.
    pub async fn enqueue_in(&self, tx: &mut Tx<'_>, job: Job, run_at: DateTime<Utc>) -> Result<Uuid, QueueError> {
        let payload = serde_json::to_value(job)?;
        let row = jobs::enqueue_job(&mut **tx, job.kind(), &payload, run_at, self.max_attempts).await?;
        debug!(job_id = %row.id, kind = job.kind(), run_at = %run_at, "Job enqueued in transaction");
        Ok(row.id)
    }

    /// Claim the oldest due job, if any.
    ///
    /// A row whose payload no longer decodes is dead-lettered on the spot and
    /// reported as an error.
    pub async fn next_due(&self) -> Result<Option<ClaimedJob>, QueueError> {
        let Some(row) = jobs::fetch_next_job(&self.pool, Utc::now()).await? else {
            return Ok(None);
        };

        match serde_json::from_value::<Job>(row.payload.clone()) {
            Ok(job) => Ok(Some(ClaimedJob {
                id: row.id,
                job,
                attempts: row.attempts,
            })),
            Err(source) => {
                warn!(job_id = %row.id, "Undecodable job payload, dead-lettering");
                jobs::dead_letter_job(&self.pool.writer, row.id, &source.to_string()).await?;
                Err(QueueError::Payload { id: row.id, source })
            }
        }
    }

    pub async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        jobs::complete_job(&self.pool.writer, id).await?;
        Ok(())
    }

    /// Record a failure and schedule the retry. Returns the job's new status.
    pub async fn fail(&self, id: Uuid, error: &str) -> Result<JobStatus, QueueError> {
        let current = jobs::get_job(&self.pool.reader, id).await?;
        let retry_at = Utc::now() + self.backoff(current.attempts);
        let row = jobs::fail_job(&self.pool.writer, id, error, retry_at).await?;
        if row.status == JobStatus::DeadLettered {
            warn!(job_id = %id, attempts = row.attempts, error, "Job dead-lettered");
        } else {
            debug!(job_id = %id, attempts = row.attempts, retry_at = %row.run_at, "Job will be retried");
        }
        Ok(row.status)
    }

    pub async fn list(&self) -> Result<Vec<JobRow>, QueueError> {
        Ok(jobs::list_jobs(&self.pool.reader).await?)
    }

    /// Delay before retry number `attempts`: `base * 2^(attempts - 1)`.
    fn backoff(&self, attempts: u32) -> chrono::Duration {
        let factor = 2u32.saturating_pow(attempts.saturating_sub(1));
        let delay = self.base_backoff.saturating_mul(factor);
        chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1))
    }
}
