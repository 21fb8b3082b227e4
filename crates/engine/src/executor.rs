//! Run executor.
//!
//! [`Executor::advance`] drives one run as far as it can go:
//! 1. Computes the ready set: `pending` steps whose predecessors are all
//!    `completed`.
//! 2. Claims each ready step in its own write transaction, guarded by a
//!    time-bounded lock row.
//! 3. Dispatches the claimed steps concurrently through the
//!    [`HandlerRegistry`].
//! 4. Records each outcome with a conditional update, so results for steps
//!    that were cancelled meanwhile are discarded.
//! 5. Repeats until a pass makes no progress, then settles the run status.
//!
//! `advance` is idempotent and may be called for the same run from several
//! dispatchers at once; the claim guarantees each step is dispatched at most
//! once per attempt.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use db::models::{RunRow, RunStatus, RunStepRow, StepStatus};
use db::repository::{locks, runs, steps, timers, vars, workflows};
use db::{DbError, DbPool};
use nodes::{HandlerRegistry, NodeError, SignalEvent, StepContext, StepHandler, StepOutcome};

use crate::compensator::Compensator;
use crate::config::OrchestratorConfig;
use crate::models::Dag;
use crate::timers::TimerScheduler;
use crate::EngineError;

/// Load and decode the compiled DAG of a workflow.
pub(crate) async fn load_dag(pool: &DbPool, workflow_id: Uuid) -> Result<Dag, EngineError> {
    let row = match workflows::get_workflow(&pool.reader, workflow_id).await {
        Ok(row) => row,
        Err(DbError::NotFound) => return Err(EngineError::WorkflowNotFound(workflow_id)),
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_value(row.compiled_dag)?)
}

/// `pending` steps whose predecessors have all completed, in declaration
/// order.
fn ready_steps<'a>(dag: &Dag, steps: &'a [RunStepRow]) -> Vec<&'a str> {
    let status: HashMap<&str, StepStatus> = steps.iter().map(|s| (s.step_id.as_str(), s.status)).collect();
    steps
        .iter()
        .filter(|s| s.status == StepStatus::Pending)
        .filter(|s| {
            dag.predecessors(&s.step_id)
                .iter()
                .all(|p| status.get(p) == Some(&StepStatus::Completed))
        })
        .map(|s| s.step_id.as_str())
        .collect()
}

/// A step this dispatcher owns until its outcome is recorded.
struct ClaimedStep {
    row: RunStepRow,
    token: String,
}

enum Settled {
    /// New work became ready; run another pass.
    Continue,
    Done(RunRow),
}

#[derive(Clone, Debug)]
pub struct Executor {
    pool: DbPool,
    registry: HandlerRegistry,
    timers: TimerScheduler,
    compensator: Compensator,
    lock_ttl: chrono::Duration,
    max_passes: u32,
}

impl Executor {
    pub fn new(
        pool: DbPool,
        registry: HandlerRegistry,
        timers: TimerScheduler,
        compensator: Compensator,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            pool,
            registry,
            timers,
            compensator,
            lock_ttl: chrono::Duration::from_std(config.lock_ttl).unwrap_or_else(|_| chrono::Duration::seconds(30)),
            max_passes: config.max_passes.max(1),
        }
    }

    /// Drive a run forward until no further progress is possible and return
    /// its current record.
    ///
    /// # Errors
    /// [`EngineError::RunNotFound`] for an unknown run; database errors
    /// otherwise. Handler failures are not errors here: they fail the run.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn advance(&self, run_id: Uuid) -> Result<RunRow, EngineError> {
        let run = self.load_run(run_id).await?;
        if run.status.is_terminal() {
            debug!(status = %run.status, "Run is terminal; nothing to do");
            return Ok(run);
        }
        let dag = load_dag(&self.pool, run.workflow_id).await?;
        runs::mark_running(&self.pool.writer, run_id, Utc::now()).await?;

        let mut idle_passes = 0u32;
        for pass in 1..=self.max_passes {
            let steps = steps::list_steps(&self.pool.reader, run_id).await?;

            let mut claimed = Vec::new();
            for step_id in ready_steps(&dag, &steps) {
                if let Some(claim) = self.claim(run_id, &dag, step_id).await? {
                    claimed.push(claim);
                }
            }

            if claimed.is_empty() {
                match self.settle(run_id, &dag).await? {
                    Settled::Done(run) => return Ok(run),
                    // Ready steps we could not claim belong to someone else;
                    // give up after a retry rather than spin on their locks.
                    Settled::Continue if idle_passes >= 1 => return self.load_run(run_id).await,
                    Settled::Continue => {
                        idle_passes += 1;
                        continue;
                    }
                }
            }
            idle_passes = 0;

            runs::mark_running(&self.pool.writer, run_id, Utc::now()).await?;
            debug!(pass, claimed = claimed.len(), "Dispatching steps");

            let run = self.load_run(run_id).await?;
            let failed = self.dispatch(&run, &dag, &steps, claimed).await?;
            if failed {
                return self.load_run(run_id).await;
            }
        }

        warn!(max_passes = self.max_passes, "Pass limit reached; leaving run for a later advance");
        self.load_run(run_id).await
    }

    async fn load_run(&self, run_id: Uuid) -> Result<RunRow, EngineError> {
        runs::find_run(&self.pool.reader, run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))
    }

    /// Claim one step: take its lock, re-check readiness and flip it to
    /// `running`, all in one transaction. `None` means another dispatcher got
    /// there first.
    async fn claim(&self, run_id: Uuid, dag: &Dag, step_id: &str) -> Result<Option<ClaimedStep>, EngineError> {
        let token = Uuid::new_v4().to_string();
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        if !locks::try_acquire(&mut tx, run_id, step_id, &token, now + self.lock_ttl, now).await? {
            db::rollback(tx).await?;
            debug!(step_id, "Step lock held elsewhere; skipping");
            return Ok(None);
        }

        let current = steps::list_steps(&mut *tx, run_id).await?;
        let status_of = |id: &str| current.iter().find(|s| s.step_id == id).map(|s| s.status);
        let ready = status_of(step_id) == Some(StepStatus::Pending)
            && dag
                .predecessors(step_id)
                .into_iter()
                .all(|p| status_of(p) == Some(StepStatus::Completed));

        if !ready || !steps::claim(&mut *tx, run_id, step_id, now).await? {
            db::rollback(tx).await?;
            debug!(step_id, "Step no longer claimable; skipping");
            return Ok(None);
        }

        let row = steps::find_step(&mut *tx, run_id, step_id).await?;
        db::commit(tx).await?;
        Ok(row.map(|row| ClaimedStep { row, token }))
    }

    /// Run claimed steps concurrently and record their outcomes. Returns
    /// `true` if any step failed.
    async fn dispatch(
        &self,
        run: &RunRow,
        dag: &Dag,
        steps: &[RunStepRow],
        claimed: Vec<ClaimedStep>,
    ) -> Result<bool, EngineError> {
        let vars: HashMap<String, Value> = vars::list_vars(&self.pool.reader, run.id)
            .await?
            .into_iter()
            .map(|v| (v.key, v.value))
            .collect();
        let outputs: HashMap<&str, &Value> = steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .filter_map(|s| s.output.as_ref().map(|o| (s.step_id.as_str(), o)))
            .collect();

        let mut set = JoinSet::new();
        for claim in claimed {
            let ctx = self.context(run, dag, &claim.row, &vars, &outputs).await?;
            steps::set_input(&self.pool.writer, run.id, &claim.row.step_id, &ctx.input()).await?;

            let handler = self.registry.handler(&claim.row.step_type);
            info!(step_id = %claim.row.step_id, step_type = %claim.row.step_type, attempt = claim.row.attempt, "Dispatching step");
            set.spawn(async move {
                let result = run_handler(handler, ctx).await;
                (claim, result)
            });
        }

        let mut failed = false;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((claim, result)) => failed |= self.record(run, dag, &claim, result).await?,
                Err(e) => error!(error = %e, "Dispatch task aborted"),
            }
        }
        Ok(failed)
    }

    async fn context(
        &self,
        run: &RunRow,
        dag: &Dag,
        row: &RunStepRow,
        vars: &HashMap<String, Value>,
        outputs: &HashMap<&str, &Value>,
    ) -> Result<StepContext, EngineError> {
        let upstream = dag
            .predecessors(&row.step_id)
            .into_iter()
            .filter_map(|p| outputs.get(p).map(|o| (p.to_owned(), (*o).clone())))
            .collect();

        let signals: Vec<SignalEvent> = serde_json::from_value(row.signals.clone()).unwrap_or_else(|e| {
            warn!(step_id = %row.step_id, error = %e, "Ignoring unreadable signal history");
            Vec::new()
        });

        Ok(StepContext {
            run_id: run.id,
            step_id: row.step_id.clone(),
            step_type: row.step_type.clone(),
            attempt: row.attempt,
            inputs: run.inputs.clone(),
            config: dag.node(&row.step_id).map(|n| n.meta.clone()).unwrap_or_default(),
            vars: vars.clone(),
            upstream,
            signals,
            timers_fired: timers::count_triggered(&self.pool.reader, run.id, &row.step_id).await?,
        })
    }

    /// Persist one outcome and release the step lock. Returns `true` if the
    /// step failed.
    async fn record(
        &self,
        run: &RunRow,
        dag: &Dag,
        claim: &ClaimedStep,
        result: Result<StepOutcome, NodeError>,
    ) -> Result<bool, EngineError> {
        let step_id = claim.row.step_id.as_str();
        let attempt = claim.row.attempt;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let failed = match result {
            Ok(StepOutcome::Completed(output)) => {
                if steps::complete(&mut *tx, run.id, step_id, &output, now).await? {
                    if let Some(var) = dag.output_var(step_id) {
                        vars::upsert_var(&mut *tx, run.id, var, &output, now).await?;
                    }
                    info!(step_id, attempt, "Step completed");
                } else {
                    debug!(step_id, "Discarding result of a step that is no longer running");
                }
                false
            }

            Ok(StepOutcome::WaitForSignal(name)) => {
                if steps::park(&mut *tx, run.id, step_id, Some(&name)).await? {
                    runs::set_status(&mut *tx, run.id, RunStatus::WaitingForSignal).await?;
                    info!(step_id, signal = %name, "Step waiting for signal");
                }
                false
            }

            Ok(StepOutcome::WaitFor(delay)) => {
                if steps::park(&mut *tx, run.id, step_id, None).await? {
                    let payload = json!({ "delay_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX) });
                    self.timers.schedule_in(&mut tx, run.id, step_id, delay, payload).await?;
                    runs::set_status(&mut *tx, run.id, RunStatus::WaitingForSignal).await?;
                    info!(step_id, ?delay, "Step waiting for timer");
                }
                false
            }

            Err(e) => {
                let message = e.to_string();
                if steps::fail(&mut *tx, run.id, step_id, &message, now).await? {
                    let run_error = format!("step '{step_id}' failed: {message}");
                    runs::finish(&mut *tx, run.id, RunStatus::Failed, Some(&run_error), now).await?;
                    error!(step_id, attempt, error = %message, "Step failed");
                    true
                } else {
                    debug!(step_id, "Discarding failure of a step that is no longer running");
                    false
                }
            }
        };

        locks::release(&mut *tx, run.id, step_id, &claim.token).await?;
        db::commit(tx).await?;

        if failed {
            let failed_step = steps::find_step(&self.pool.reader, run.id, step_id).await?;
            let failed_step = failed_step.as_ref().unwrap_or(&claim.row);
            self.compensator.compensate(run, failed_step, dag).await?;
        }
        Ok(failed)
    }

    /// Decide the run status after a pass that claimed nothing.
    async fn settle(&self, run_id: Uuid, dag: &Dag) -> Result<Settled, EngineError> {
        let run = self.load_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(Settled::Done(run));
        }

        let steps = steps::list_steps(&self.pool.reader, run_id).await?;
        if !ready_steps(dag, &steps).is_empty() {
            return Ok(Settled::Continue);
        }

        let pending: Vec<&str> = steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| s.step_id.as_str())
            .collect();
        let running = steps.iter().any(|s| s.status == StepStatus::Running);
        let waiting = steps.iter().any(|s| s.status == StepStatus::WaitingForSignal);
        let now = Utc::now();

        match (pending.is_empty(), running, waiting) {
            (true, false, false) => {
                if runs::finish(&self.pool.writer, run_id, RunStatus::Completed, None, now).await? {
                    info!("Run completed");
                }
            }
            (_, false, true) => {
                runs::set_status(&self.pool.writer, run_id, RunStatus::WaitingForSignal).await?;
                debug!("Run waiting for signal");
            }
            (false, false, false) => {
                let message = format!("deadlock: stalled steps [{}]", pending.join(", "));
                error!(stalled = ?pending, "Run deadlocked");
                runs::finish(&self.pool.writer, run_id, RunStatus::Failed, Some(&message), now).await?;
            }
            // Another dispatcher owns the in-flight steps.
            (_, true, _) => {}
        }

        Ok(Settled::Done(self.load_run(run_id).await?))
    }
}

/// Execute a handler on its own task, applying its timeout. Panics and
/// missing handlers become fatal step failures.
async fn run_handler(handler: Option<Arc<dyn StepHandler>>, ctx: StepContext) -> Result<StepOutcome, NodeError> {
    let Some(handler) = handler else {
        return Err(NodeError::fatal(format!(
            "no handler registered for step type '{}'",
            ctx.step_type
        )));
    };

    let task = tokio::spawn(async move {
        match handler.timeout() {
            Some(limit) => tokio::time::timeout(limit, handler.execute(&ctx))
                .await
                .unwrap_or_else(|_| Err(NodeError::fatal(format!("step timed out after {limit:?}")))),
            None => handler.execute(&ctx).await,
        }
    });

    match task.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(NodeError::fatal("step handler panicked")),
        Err(e) => Err(NodeError::fatal(e.to_string())),
    }
}
