//! Queue worker.
//!
//! Polls the durable job queue and hands each job to the [`Orchestrator`]:
//! `Advance` drives a run, `FireTimer` fires a wait timer. Failed jobs go
//! back to the queue for a retry with backoff.

use std::time::Duration;

use chrono::Utc;
use queue::{ClaimedJob, Job, QueueError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::orchestrator::Orchestrator;
use crate::EngineError;

#[derive(Clone, Debug)]
pub struct Worker {
    orchestrator: Orchestrator,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let poll_interval = orchestrator.config().poll_interval;
        Self {
            orchestrator,
            poll_interval,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Process jobs until `shutdown` is cancelled. Sleeps `poll_interval`
    /// whenever the queue is empty.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), EngineError> {
        info!(poll_interval = ?self.poll_interval, "Worker started");
        self.catch_up().await?;

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let busy = match self.tick().await {
                Ok(busy) => busy,
                Err(e) => {
                    error!(error = %e, "Worker tick failed");
                    false
                }
            };
            if busy {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("Worker stopped");
        Ok(())
    }

    /// Claim and process one due job. Returns `false` when the queue had
    /// nothing due.
    pub async fn tick(&self) -> Result<bool, EngineError> {
        let claimed = match self.orchestrator.queue().next_due().await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return Ok(false),
            Err(QueueError::Payload { id, source }) => {
                warn!(job_id = %id, error = %source, "Skipped malformed job");
                return Ok(true);
            }
            Err(e) => return Err(e.into()),
        };

        match self.handle(&claimed).await {
            Ok(()) => self.orchestrator.queue().complete(claimed.id).await?,
            Err(e) => {
                let message = e.to_string();
                warn!(job_id = %claimed.id, kind = claimed.job.kind(), error = %message, "Job failed");
                self.orchestrator.queue().fail(claimed.id, &message).await?;
            }
        }
        Ok(true)
    }

    #[instrument(skip(self, claimed), fields(job_id = %claimed.id, kind = claimed.job.kind(), attempts = claimed.attempts))]
    async fn handle(&self, claimed: &ClaimedJob) -> Result<(), EngineError> {
        match claimed.job {
            Job::Advance { run_id } => {
                let summary = self.orchestrator.advance(run_id).await?;
                debug!(run_id = %run_id, status = %summary.status, "Run advanced");
            }
            Job::FireTimer { timer_id } => {
                let outcome = self.orchestrator.fire_timer(timer_id).await?;
                debug!(timer_id = %timer_id, ?outcome, "Timer handled");
            }
        }
        Ok(())
    }

    /// Re-enqueue timers that fell due while no worker was running. Firing
    /// is idempotent, so a timer that still has its own job is harmless.
    async fn catch_up(&self) -> Result<(), EngineError> {
        let due = self.orchestrator.timers().due_timers(Utc::now()).await?;
        for timer in &due {
            self.orchestrator
                .queue()
                .enqueue(Job::FireTimer { timer_id: timer.id })
                .await?;
        }
        if !due.is_empty() {
            info!(timers = due.len(), "Re-enqueued overdue timers");
        }
        Ok(())
    }
}
