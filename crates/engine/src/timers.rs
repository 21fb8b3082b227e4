//! Wait-timer scheduler.
//!
//! A timer is a durable row plus a delayed `FireTimer` queue job. Firing is
//! idempotent: the `pending → triggered` transition happens at most once and
//! moves the parked step back to `pending` in the same transaction.

use std::time::Duration;

use chrono::{DateTime, Utc};
use db::models::{TimerStatus, WaitTimerRow};
use db::repository::{steps, timers};
use db::{DbPool, Tx};
use queue::{Job, JobQueue};
use serde_json::Value;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::EngineError;

/// Result of [`TimerScheduler::fire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// The timer had already fired; nothing changed.
    AlreadyTriggered,
    /// The timer fired now. `resumed` tells whether its step was still
    /// parked and went back to `pending`.
    Triggered { resumed: bool },
}

#[derive(Clone, Debug)]
pub struct TimerScheduler {
    pool: DbPool,
    queue: JobQueue,
}

impl TimerScheduler {
    pub fn new(pool: DbPool, queue: JobQueue) -> Self {
        Self { pool, queue }
    }

    /// Persist a pending timer due after `delay` and enqueue the job that
    /// fires it.
    pub async fn schedule_wait(
        &self,
        run_id: Uuid,
        step_id: &str,
        delay: Duration,
        payload: Value,
    ) -> Result<Uuid, EngineError> {
        let mut tx = self.pool.begin().await?;
        let timer_id = self.schedule_in(&mut tx, run_id, step_id, delay, payload).await?;
        db::commit(tx).await?;
        Ok(timer_id)
    }

    /// [`schedule_wait`](Self::schedule_wait) inside the caller's transaction.
    /// The timer row and its `FireTimer` job commit together with whatever
    /// parked the step.
    #[instrument(skip(self, tx, payload), fields(run_id = %run_id, step_id))]
    pub async fn schedule_in(
        &self,
        tx: &mut Tx<'_>,
        run_id: Uuid,
        step_id: &str,
        delay: Duration,
        payload: Value,
    ) -> Result<Uuid, EngineError> {
        let now = Utc::now();
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let timer = WaitTimerRow {
            id: Uuid::new_v4(),
            run_id,
            step_id: step_id.to_owned(),
            trigger_at: now + delay,
            payload,
            status: TimerStatus::Pending,
            created_at: now,
            triggered_at: None,
        };
        timers::insert_timer(&mut **tx, &timer).await?;
        self.queue
            .enqueue_in(tx, Job::FireTimer { timer_id: timer.id }, timer.trigger_at)
            .await?;

        info!(timer_id = %timer.id, trigger_at = %timer.trigger_at, "Wait timer scheduled");
        Ok(timer.id)
    }

    /// Fire a timer, sleeping first if it is not yet due.
    #[instrument(skip(self), fields(timer_id = %timer_id))]
    pub async fn fire(&self, timer_id: Uuid) -> Result<FireOutcome, EngineError> {
        let timer = timers::find_timer(&self.pool.reader, timer_id)
            .await?
            .ok_or(EngineError::TimerNotFound(timer_id))?;

        if timer.status == TimerStatus::Triggered {
            debug!("Timer already triggered");
            return Ok(FireOutcome::AlreadyTriggered);
        }

        if let Ok(remaining) = (timer.trigger_at - Utc::now()).to_std() {
            tokio::time::sleep(remaining).await;
        }

        let mut tx = self.pool.begin().await?;
        if !timers::mark_triggered(&mut *tx, timer_id, Utc::now()).await? {
            db::rollback(tx).await?;
            return Ok(FireOutcome::AlreadyTriggered);
        }
        let resumed = steps::resume(&mut *tx, timer.run_id, &timer.step_id, None).await?;
        db::commit(tx).await?;

        info!(run_id = %timer.run_id, step_id = %timer.step_id, resumed, "Timer fired");
        Ok(FireOutcome::Triggered { resumed })
    }

    /// Pending timers already past due, for catch-up after downtime.
    pub async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<WaitTimerRow>, EngineError> {
        Ok(timers::list_due(&self.pool.reader, now).await?)
    }

    pub async fn timers_for_run(&self, run_id: Uuid) -> Result<Vec<WaitTimerRow>, EngineError> {
        Ok(timers::list_for_run(&self.pool.reader, run_id).await?)
    }
}
