//! Saga compensator.
//!
//! When a run fails, the failed step's declared compensation action is
//! looked up in the registry and executed once. Every attempt leaves a row in
//! `compensations`; failures are recorded there and never propagated or
//! retried.

use chrono::Utc;
use db::models::{CompensationRow, CompensationStatus, RunRow, RunStepRow, StepStatus};
use db::repository::{compensations, steps};
use db::DbPool;
use nodes::{CompensationContext, HandlerRegistry};
use serde_json::json;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::CompensationScope;
use crate::models::Dag;
use crate::EngineError;

/// What happened to the failed step's compensation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensationResult {
    /// The step declares no compensation; a placeholder row was recorded.
    NoAction,
    Done,
    Failed(String),
}

#[derive(Clone, Debug)]
pub struct Compensator {
    pool: DbPool,
    registry: HandlerRegistry,
    scope: CompensationScope,
}

impl Compensator {
    pub fn new(pool: DbPool, registry: HandlerRegistry, scope: CompensationScope) -> Self {
        Self { pool, registry, scope }
    }

    /// Compensate a failed run.
    ///
    /// With [`CompensationScope::Unwind`] the run's completed steps are
    /// compensated afterwards, latest first; steps without an action are
    /// skipped without a row.
    #[instrument(skip_all, fields(run_id = %run.id, step_id = %failed_step.step_id))]
    pub async fn compensate(
        &self,
        run: &RunRow,
        failed_step: &RunStepRow,
        dag: &Dag,
    ) -> Result<CompensationResult, EngineError> {
        let action = dag.compensation(&failed_step.step_id);
        if action.is_none() {
            warn!("Failed step declares no compensation");
        }
        let result = self.compensate_step(run, failed_step, action).await?;

        if self.scope == CompensationScope::Unwind {
            let completed = steps::list_steps_with_status(&self.pool.reader, run.id, StepStatus::Completed).await?;
            for step_id in dag.topological_order().into_iter().rev() {
                let Some(action) = dag.compensation(step_id) else {
                    continue;
                };
                if let Some(step) = completed.iter().find(|s| s.step_id == step_id) {
                    self.compensate_step(run, step, Some(action)).await?;
                }
            }
        }

        Ok(result)
    }

    async fn compensate_step(
        &self,
        run: &RunRow,
        step: &RunStepRow,
        action: Option<&str>,
    ) -> Result<CompensationResult, EngineError> {
        let now = Utc::now();
        let row = CompensationRow {
            id: Uuid::new_v4(),
            run_id: run.id,
            step_id: step.step_id.clone(),
            action: action.map(str::to_owned),
            status: CompensationStatus::Created,
            payload: json!({
                "step_status": step.status,
                "error": step.error,
                "output": step.output,
            }),
            error: None,
            created_at: now,
            updated_at: now,
        };
        compensations::insert_compensation(&self.pool.writer, &row).await?;

        let Some(action) = action else {
            return Ok(CompensationResult::NoAction);
        };

        let result = match self.registry.compensation(action) {
            None => CompensationResult::Failed(format!("no compensation action registered as '{action}'")),
            Some(handler) => {
                let ctx = CompensationContext {
                    run_id: run.id,
                    step_id: step.step_id.clone(),
                    action: action.to_owned(),
                    inputs: run.inputs.clone(),
                    step_input: step.input.clone(),
                    step_output: step.output.clone(),
                    step_error: step.error.clone(),
                };
                // Run on its own task so a panicking action is contained.
                match tokio::spawn(async move { handler.compensate(&ctx).await }).await {
                    Ok(Ok(())) => CompensationResult::Done,
                    Ok(Err(e)) => CompensationResult::Failed(e.to_string()),
                    Err(join_err) if join_err.is_panic() => {
                        CompensationResult::Failed("compensation action panicked".to_owned())
                    }
                    Err(join_err) => CompensationResult::Failed(join_err.to_string()),
                }
            }
        };

        match &result {
            CompensationResult::Done => {
                compensations::update_status(&self.pool.writer, row.id, CompensationStatus::Done, None, Utc::now())
                    .await?;
                info!(step_id = %step.step_id, action, "Compensation done");
            }
            CompensationResult::Failed(msg) => {
                compensations::update_status(
                    &self.pool.writer,
                    row.id,
                    CompensationStatus::Failed,
                    Some(msg),
                    Utc::now(),
                )
                .await?;
                error!(step_id = %step.step_id, action, error = %msg, "Compensation failed");
            }
            CompensationResult::NoAction => {}
        }

        Ok(result)
    }
}
