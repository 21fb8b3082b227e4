//! Startup recovery sweep.
//!
//! A step left `running` by a crashed dispatcher is returned to `pending`
//! with its next attempt pre-charged, so the replay is dispatched as
//! `attempt + 1` and the claim does not increment it a second time. Queue
//! jobs a dead worker was holding go back to `pending`.

use std::collections::BTreeSet;

use chrono::Utc;
use db::repository::{jobs, locks, runs, steps};
use db::DbPool;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::EngineError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Orphaned steps reset to `pending`.
    pub steps_reset: u64,
    /// Queue jobs a dead worker left `processing`, now `pending` again.
    pub jobs_requeued: u64,
    /// Runs that need an `advance`: those with reset steps, every run still
    /// `pending` or `running`, and parked runs holding a resumed step.
    pub runs: Vec<Uuid>,
}

#[derive(Clone, Debug)]
pub struct RecoverySweep {
    pool: DbPool,
}

impl RecoverySweep {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Reset orphaned steps and return how many were reset.
    pub async fn recover_on_startup(&self) -> Result<u64, EngineError> {
        Ok(self.sweep().await?.steps_reset)
    }

    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<RecoveryReport, EngineError> {
        let mut tx = self.pool.begin().await?;

        let orphans = steps::list_orphaned(&mut *tx).await?;
        let mut affected: BTreeSet<Uuid> = BTreeSet::new();
        let mut steps_reset = 0u64;
        for step in &orphans {
            if steps::reclaim(&mut *tx, step.id).await? {
                locks::release_step(&mut *tx, step.run_id, &step.step_id).await?;
                affected.insert(step.run_id);
                steps_reset += 1;
                info!(run_id = %step.run_id, step_id = %step.step_id, attempt = step.attempt + 1, "Reset orphaned step");
            }
        }

        for run in runs::list_active_runs(&mut *tx).await? {
            affected.insert(run.id);
        }
        let jobs_requeued = jobs::requeue_in_flight(&mut *tx, Utc::now()).await?;
        db::commit(tx).await?;

        info!(steps_reset, jobs_requeued, runs = affected.len(), "Recovery sweep finished");
        Ok(RecoveryReport {
            steps_reset,
            jobs_requeued,
            runs: affected.into_iter().collect(),
        })
    }
}
