//! The `StepHandler` and `CompensationAction` traits: the contract every
//! step type and every rollback action must fulfil.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::NodeError;

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// One entry of a step's accumulated signal history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

/// Everything a handler can see when it is dispatched.
///
/// Defined here (in the nodes crate) so both the engine and individual handler
/// implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: Uuid,
    /// DAG node id of the step being executed.
    pub step_id: String,
    /// Registered handler type the step was dispatched to.
    pub step_type: String,
    /// Dispatch attempt, starting at 1.
    pub attempt: u32,
    /// Inputs supplied when the run was started.
    pub inputs: Value,
    /// Node metadata from the compiled definition (everything except
    /// `id`, `type` and `depends_on`).
    pub config: Map<String, Value>,
    /// Run-scoped variables written by earlier steps.
    pub vars: HashMap<String, Value>,
    /// Outputs of the step's direct predecessors, keyed by step id.
    pub upstream: HashMap<String, Value>,
    /// Signals delivered to this step so far, oldest first.
    pub signals: Vec<SignalEvent>,
    /// Number of wait timers that have fired for this step.
    pub timers_fired: u32,
}

impl StepContext {
    /// The handler input: the node's static `input` metadata when declared,
    /// otherwise the run inputs.
    pub fn input(&self) -> Value {
        self.config
            .get("input")
            .cloned()
            .unwrap_or_else(|| self.inputs.clone())
    }

    /// Most recent delivery of the named signal, if any.
    pub fn last_signal(&self, name: &str) -> Option<&SignalEvent> {
        self.signals.iter().rev().find(|s| s.name == name)
    }

    /// String-valued metadata lookup.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// StepOutcome
// ---------------------------------------------------------------------------

/// What a handler reports back to the executor on success.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step finished; the value becomes the step's `output`.
    Completed(Value),
    /// Park the step until the named signal arrives.
    WaitForSignal(String),
    /// Park the step until a timer fires after the given delay.
    WaitFor(Duration),
}

// ---------------------------------------------------------------------------
// StepHandler
// ---------------------------------------------------------------------------

/// The core handler trait, registered per step `type`.
///
/// # Idempotency
///
/// After a crash the recovery sweep re-dispatches any step that was left
/// `running`, so a handler may see the same step more than once (with a
/// higher `attempt`). Handlers must be idempotent or check for their own side
/// effects before repeating them; the orchestrator does not enforce this.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Execute the step.
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, NodeError>;

    /// Execution time limit for a single dispatch. `None` means unbounded.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

// ---------------------------------------------------------------------------
// CompensationAction
// ---------------------------------------------------------------------------

/// Data handed to a compensation action.
#[derive(Debug, Clone)]
pub struct CompensationContext {
    pub run_id: Uuid,
    pub step_id: String,
    /// Name under which the action was registered.
    pub action: String,
    pub inputs: Value,
    pub step_input: Option<Value>,
    pub step_output: Option<Value>,
    pub step_error: Option<String>,
}

/// A rollback action referenced by a step's `compensation` metadata.
#[async_trait]
pub trait CompensationAction: Send + Sync {
    async fn compensate(&self, ctx: &CompensationContext) -> Result<(), NodeError>;
}
