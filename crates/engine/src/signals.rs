//! Signal router — delivers external events to parked steps.

use chrono::Utc;
use db::models::{SignalRow, StepStatus};
use db::repository::{runs, signals, steps};
use db::DbPool;
use nodes::SignalEvent;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::SignalMatching;
use crate::executor::load_dag;
use crate::EngineError;

#[derive(Clone, Debug)]
pub struct SignalRouter {
    pool: DbPool,
    matching: SignalMatching,
}

impl SignalRouter {
    pub fn new(pool: DbPool, matching: SignalMatching) -> Self {
        Self { pool, matching }
    }

    /// Deliver signal `name` to run `run_id`.
    ///
    /// The signal is always logged. Returns `true` when a waiting step was
    /// resumed: preferably one that declared or parked on `name`, otherwise
    /// (under [`SignalMatching::FallbackToFirst`]) the first waiting step in
    /// declaration order.
    #[instrument(skip(self, payload), fields(run_id = %run_id))]
    pub async fn handle_signal(&self, run_id: Uuid, name: &str, payload: Value) -> Result<bool, EngineError> {
        let run = runs::find_run(&self.pool.reader, run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        let dag = load_dag(&self.pool, run.workflow_id).await?;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        let waiting = steps::list_steps_with_status(&mut *tx, run_id, StepStatus::WaitingForSignal).await?;

        let target = waiting
            .iter()
            .find(|s| dag.signal(&s.step_id) == Some(name) || s.wait_signal.as_deref() == Some(name))
            .or_else(|| match self.matching {
                SignalMatching::FallbackToFirst => waiting.first(),
                SignalMatching::Strict => None,
            });

        let handled = match target {
            Some(step) => {
                let mut history: Vec<SignalEvent> = serde_json::from_value(step.signals.clone()).unwrap_or_else(|e| {
                    warn!(step_id = %step.step_id, error = %e, "Discarding unreadable signal history");
                    Vec::new()
                });
                history.push(SignalEvent {
                    name: name.to_owned(),
                    payload: payload.clone(),
                    received_at: now,
                });
                let history = serde_json::to_value(&history)?;
                steps::resume(&mut *tx, run_id, &step.step_id, Some(&history)).await?
            }
            None => false,
        };

        signals::insert_signal(
            &mut *tx,
            &SignalRow {
                id: Uuid::new_v4(),
                run_id,
                name: name.to_owned(),
                payload,
                handled,
                created_at: now,
            },
        )
        .await?;
        db::commit(tx).await?;

        match target {
            Some(step) if handled => info!(step_id = %step.step_id, signal = name, "Signal resumed step"),
            _ => debug!(signal = name, waiting = waiting.len(), "Signal not handled"),
        }
        Ok(handled)
    }

    pub async fn signals_for_run(&self, run_id: Uuid) -> Result<Vec<SignalRow>, EngineError> {
        Ok(signals::list_signals(&self.pool.reader, run_id).await?)
    }
}
