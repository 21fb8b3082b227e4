//! `Orchestrator` — the public face of the engine.
//!
//! Wires the executor, compensator, signal router, timer scheduler and
//! recovery sweep to one database pool and one handler registry. The HTTP
//! layer, the CLI and the queue worker all go through this type.

use std::collections::BTreeMap;

use chrono::Utc;
use db::models::{RunRow, RunStatus, RunStepRow, SignalRow, StepStatus, WorkflowDefRow};
use db::repository::{compensations, locks, runs, steps, timers as timer_repo, vars, workflows};
use db::{DbError, DbPool};
use nodes::HandlerRegistry;
use queue::{Job, JobQueue};
use serde_json::Value;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::compensator::Compensator;
use crate::compiler::compile;
use crate::config::OrchestratorConfig;
use crate::executor::Executor;
use crate::models::{
    CompensationView, Dag, NewRun, NewWorkflow, RegisteredWorkflow, RunSummary, RunView, StepView,
    WorkflowView,
};
use crate::recovery::{RecoveryReport, RecoverySweep};
use crate::signals::SignalRouter;
use crate::timers::{FireOutcome, TimerScheduler};
use crate::EngineError;

#[derive(Clone, Debug)]
pub struct Orchestrator {
    pool: DbPool,
    config: OrchestratorConfig,
    queue: JobQueue,
    executor: Executor,
    router: SignalRouter,
    timers: TimerScheduler,
    recovery: RecoverySweep,
}

impl Orchestrator {
    pub fn new(pool: DbPool, registry: HandlerRegistry, config: OrchestratorConfig) -> Self {
        let queue = JobQueue::new(pool.clone());
        let timers = TimerScheduler::new(pool.clone(), queue.clone());
        let compensator = Compensator::new(pool.clone(), registry.clone(), config.compensation_scope);
        let executor = Executor::new(pool.clone(), registry, timers.clone(), compensator, &config);
        Self {
            router: SignalRouter::new(pool.clone(), config.signal_matching),
            recovery: RecoverySweep::new(pool.clone()),
            pool,
            config,
            queue,
            executor,
            timers,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn timers(&self) -> &TimerScheduler {
        &self.timers
    }

    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    /// Compile and store a new workflow definition.
    ///
    /// # Errors
    /// [`EngineError::Compile`] for an invalid definition and
    /// [`EngineError::Conflict`] when `(name, version)` is taken.
    #[instrument(skip(self, new), fields(name = %new.name, version = %new.version))]
    pub async fn register_workflow(&self, new: NewWorkflow) -> Result<RegisteredWorkflow, EngineError> {
        let dag = compile(&new.definition_text)?;

        if workflows::find_by_name_version(&self.pool.reader, &new.name, &new.version)
            .await?
            .is_some()
        {
            return Err(duplicate(&new.name, &new.version));
        }

        let row = WorkflowDefRow {
            id: Uuid::new_v4(),
            name: new.name,
            version: new.version,
            definition_text: new.definition_text,
            compiled_dag: serde_json::to_value(&dag)?,
            created_by: new.created_by,
            created_at: Utc::now(),
        };
        match workflows::insert_workflow(&self.pool.writer, &row).await {
            Ok(_) => {}
            Err(DbError::Conflict(_)) => return Err(duplicate(&row.name, &row.version)),
            Err(e) => return Err(e.into()),
        }

        info!(workflow_id = %row.id, steps = dag.nodes.len(), "Workflow registered");
        Ok(RegisteredWorkflow {
            id: row.id,
            name: row.name,
            version: row.version,
            dag,
        })
    }

    /// Compile a definition without storing it.
    pub fn plan(&self, definition_text: &str) -> Result<Dag, EngineError> {
        Ok(compile(definition_text)?)
    }

    pub async fn list_workflows(
        &self,
        name: Option<&str>,
        version: Option<&str>,
    ) -> Result<Vec<WorkflowView>, EngineError> {
        workflows::list_workflows(&self.pool.reader, name, version)
            .await?
            .into_iter()
            .map(workflow_view)
            .collect()
    }

    pub async fn get_workflow(&self, id: Uuid) -> Result<WorkflowView, EngineError> {
        match workflows::get_workflow(&self.pool.reader, id).await {
            Ok(row) => workflow_view(row),
            Err(DbError::NotFound) => Err(EngineError::WorkflowNotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Create a run with one pending step per DAG node and queue its first
    /// `advance`. Handlers run on a worker, never in the caller.
    #[instrument(skip(self, new), fields(workflow_id = %new.workflow_id))]
    pub async fn start_run(&self, new: NewRun) -> Result<RunSummary, EngineError> {
        let workflow = self.get_workflow(new.workflow_id).await?;
        let dag = workflow.dag;
        let now = Utc::now();

        let run = RunRow {
            id: Uuid::new_v4(),
            workflow_id: workflow.id,
            version: workflow.version,
            status: RunStatus::Pending,
            tenant: new.tenant,
            caller: new.caller,
            inputs: new.inputs,
            error: None,
            started_at: None,
            ended_at: None,
            created_at: now,
        };

        let mut tx = self.pool.begin().await?;
        runs::insert_run(&mut *tx, &run).await?;
        for (position, node) in dag.nodes.iter().enumerate() {
            let step = RunStepRow {
                id: Uuid::new_v4(),
                run_id: run.id,
                step_id: node.id.clone(),
                position: u32::try_from(position).unwrap_or(u32::MAX),
                step_type: node.step_type.clone(),
                status: StepStatus::Pending,
                attempt: 0,
                recovered: false,
                wait_signal: None,
                signals: Value::Array(Vec::new()),
                input: None,
                output: None,
                error: None,
                started_at: None,
                ended_at: None,
            };
            steps::insert_step(&mut *tx, &step).await?;
        }
        self.queue.enqueue_in(&mut tx, Job::Advance { run_id: run.id }, now).await?;
        db::commit(tx).await?;
        info!(run_id = %run.id, steps = dag.nodes.len(), "Run created");

        Ok(RunSummary {
            run_id: run.id,
            status: run.status,
        })
    }

    /// Runs of a workflow, newest first.
    pub async fn list_runs(&self, workflow_id: Uuid) -> Result<Vec<RunSummary>, EngineError> {
        self.get_workflow(workflow_id).await?;
        Ok(runs::list_runs_for_workflow(&self.pool.reader, workflow_id)
            .await?
            .into_iter()
            .map(|r| RunSummary {
                run_id: r.id,
                status: r.status,
            })
            .collect())
    }

    /// Drive a run forward. Safe to call at any time, from anywhere.
    pub async fn advance(&self, run_id: Uuid) -> Result<RunSummary, EngineError> {
        let run = self.executor.advance(run_id).await?;
        Ok(RunSummary {
            run_id: run.id,
            status: run.status,
        })
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<RunView, EngineError> {
        let run = runs::find_run(&self.pool.reader, run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        let steps = steps::list_steps(&self.pool.reader, run_id).await?;

        Ok(RunView {
            run_id: run.id,
            workflow_id: run.workflow_id,
            version: run.version,
            status: run.status,
            error: run.error,
            started_at: run.started_at,
            ended_at: run.ended_at,
            steps: steps
                .into_iter()
                .map(|s| StepView {
                    step_id: s.step_id,
                    step_type: s.step_type,
                    status: s.status,
                    attempt: s.attempt,
                    output: s.output,
                    error: s.error,
                    started_at: s.started_at,
                    ended_at: s.ended_at,
                })
                .collect(),
        })
    }

    /// Cancel a run. Pending steps are skipped, running and parked steps are
    /// cancelled, and every lock is dropped. Cancelling a terminal run is a
    /// no-op that reports its current status.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<RunSummary, EngineError> {
        let mut tx = self.pool.begin().await?;
        let run = runs::find_run(&mut *tx, run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;

        if run.status.is_terminal() {
            db::rollback(tx).await?;
            return Ok(RunSummary {
                run_id,
                status: run.status,
            });
        }

        let now = Utc::now();
        runs::finish(&mut *tx, run_id, RunStatus::Cancelled, None, now).await?;
        let closed = steps::cancel_open(&mut *tx, run_id, now).await?;
        locks::release_all_for_run(&mut *tx, run_id).await?;
        db::commit(tx).await?;

        info!(steps_closed = closed, "Run cancelled");
        Ok(RunSummary {
            run_id,
            status: RunStatus::Cancelled,
        })
    }

    /// Deliver a signal; a handled signal schedules an `advance`.
    pub async fn send_signal(&self, run_id: Uuid, name: &str, payload: Value) -> Result<bool, EngineError> {
        let handled = self.router.handle_signal(run_id, name, payload).await?;
        if handled {
            self.queue.enqueue(Job::Advance { run_id }).await?;
        }
        Ok(handled)
    }

    /// Fire a wait timer; a resumed step schedules an `advance`.
    pub async fn fire_timer(&self, timer_id: Uuid) -> Result<FireOutcome, EngineError> {
        let outcome = self.timers.fire(timer_id).await?;
        if let FireOutcome::Triggered { resumed: true } = outcome {
            if let Some(timer) = timer_repo::find_timer(&self.pool.reader, timer_id).await? {
                self.queue.enqueue(Job::Advance { run_id: timer.run_id }).await?;
            }
        }
        Ok(outcome)
    }

    /// Every signal received for a run, oldest first.
    pub async fn signals(&self, run_id: Uuid) -> Result<Vec<SignalRow>, EngineError> {
        self.router.signals_for_run(run_id).await
    }

    pub async fn run_vars(&self, run_id: Uuid) -> Result<BTreeMap<String, Value>, EngineError> {
        Ok(vars::list_vars(&self.pool.reader, run_id)
            .await?
            .into_iter()
            .map(|v| (v.key, v.value))
            .collect())
    }

    pub async fn compensations(&self, run_id: Uuid) -> Result<Vec<CompensationView>, EngineError> {
        Ok(compensations::list_for_run(&self.pool.reader, run_id)
            .await?
            .into_iter()
            .map(|c| CompensationView {
                step_id: c.step_id,
                action: c.action,
                status: c.status,
                error: c.error,
                created_at: c.created_at,
            })
            .collect())
    }

    /// Run the recovery sweep and schedule an `advance` for every affected
    /// run.
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let report = self.recovery.sweep().await?;
        for run_id in &report.runs {
            self.queue.enqueue(Job::Advance { run_id: *run_id }).await?;
        }
        Ok(report)
    }
}

fn duplicate(name: &str, version: &str) -> EngineError {
    EngineError::Conflict(format!("workflow {name}@{version} already exists"))
}

fn workflow_view(row: WorkflowDefRow) -> Result<WorkflowView, EngineError> {
    Ok(WorkflowView {
        dag: serde_json::from_value(row.compiled_dag)?,
        id: row.id,
        name: row.name,
        version: row.version,
        definition_text: row.definition_text,
        created_by: row.created_by,
        created_at: row.created_at,
    })
}
