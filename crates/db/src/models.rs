//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models and carry no domain behaviour.
//! Domain types (the DAG, step outcomes) live in the `engine` and `nodes`
//! crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use uuid::Uuid;

use crate::codec;

/// Declares a status enum stored as snake_case TEXT.
macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($name), ": {}"), other)),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

status_enum! {
    /// Lifecycle of a run.
    RunStatus {
        Pending => "pending",
        Running => "running",
        WaitingForSignal => "waiting_for_signal",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl RunStatus {
    pub const TERMINAL: [RunStatus; 3] = [Self::Completed, Self::Failed, Self::Cancelled];

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

status_enum! {
    /// Lifecycle of one step within a run.
    StepStatus {
        Pending => "pending",
        Running => "running",
        WaitingForSignal => "waiting_for_signal",
        Completed => "completed",
        Failed => "failed",
        Skipped => "skipped",
        Cancelled => "cancelled",
    }
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

status_enum! {
    TimerStatus {
        Pending => "pending",
        Triggered => "triggered",
    }
}

status_enum! {
    CompensationStatus {
        Created => "created",
        Done => "done",
        Failed => "failed",
    }
}

status_enum! {
    /// Possible statuses for a queued job.
    JobStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
        DeadLettered => "dead_lettered",
    }
}

// ---------------------------------------------------------------------------
// workflow_defs
// ---------------------------------------------------------------------------

/// A registered, immutable workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefRow {
    pub id: Uuid,
    pub name: String,
    pub version: String,
    /// Source definition text as submitted.
    pub definition_text: String,
    /// Compiled DAG (nodes + edges), computed once at registration.
    pub compiled_dag: Value,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for WorkflowDefRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: codec::uuid(row, "id")?,
            name: row.try_get("name")?,
            version: row.try_get("version")?,
            definition_text: row.try_get("definition_text")?,
            compiled_dag: codec::json(row, "compiled_dag")?,
            created_by: row.try_get("created_by")?,
            created_at: codec::ts(row, "created_at")?,
        })
    }
}

// ---------------------------------------------------------------------------
// runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version: String,
    pub status: RunStatus,
    pub tenant: Option<String>,
    pub caller: Option<String>,
    pub inputs: Value,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for RunRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: codec::uuid(row, "id")?,
            workflow_id: codec::uuid(row, "workflow_id")?,
            version: row.try_get("version")?,
            status: codec::parsed(row, "status")?,
            tenant: row.try_get("tenant")?,
            caller: row.try_get("caller")?,
            inputs: codec::json(row, "inputs")?,
            error: row.try_get("error")?,
            started_at: codec::opt_ts(row, "started_at")?,
            ended_at: codec::opt_ts(row, "ended_at")?,
            created_at: codec::ts(row, "created_at")?,
        })
    }
}

// ---------------------------------------------------------------------------
// run_steps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStepRow {
    pub id: Uuid,
    pub run_id: Uuid,
    /// DAG node id.
    pub step_id: String,
    /// Declaration order within the definition.
    pub position: u32,
    pub step_type: String,
    pub status: StepStatus,
    pub attempt: u32,
    /// Set by the recovery sweep; the next claim consumes it instead of
    /// incrementing `attempt` again.
    pub recovered: bool,
    /// Signal name the step is parked on, if it asked for one.
    pub wait_signal: Option<String>,
    /// Accumulated signal history (JSON array).
    pub signals: Value,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, SqliteRow> for RunStepRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: codec::uuid(row, "id")?,
            run_id: codec::uuid(row, "run_id")?,
            step_id: row.try_get("step_id")?,
            position: codec::count(row, "position")?,
            step_type: row.try_get("step_type")?,
            status: codec::parsed(row, "status")?,
            attempt: codec::count(row, "attempt")?,
            recovered: row.try_get("recovered")?,
            wait_signal: row.try_get("wait_signal")?,
            signals: codec::json(row, "signals")?,
            input: codec::opt_json(row, "input")?,
            output: codec::opt_json(row, "output")?,
            error: row.try_get("error")?,
            started_at: codec::opt_ts(row, "started_at")?,
            ended_at: codec::opt_ts(row, "ended_at")?,
        })
    }
}

// ---------------------------------------------------------------------------
// run_vars
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunVarRow {
    pub run_id: Uuid,
    pub key: String,
    pub value: Value,
    pub updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for RunVarRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: codec::uuid(row, "run_id")?,
            key: row.try_get("key")?,
            value: codec::json(row, "value")?,
            updated_at: codec::ts(row, "updated_at")?,
        })
    }
}

// ---------------------------------------------------------------------------
// signals
// ---------------------------------------------------------------------------

/// An inbound external event. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRow {
    pub id: Uuid,
    pub run_id: Uuid,
    pub name: String,
    pub payload: Value,
    /// Whether the event resumed a step when it arrived.
    pub handled: bool,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for SignalRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: codec::uuid(row, "id")?,
            run_id: codec::uuid(row, "run_id")?,
            name: row.try_get("name")?,
            payload: codec::json(row, "payload")?,
            handled: row.try_get("handled")?,
            created_at: codec::ts(row, "created_at")?,
        })
    }
}

// ---------------------------------------------------------------------------
// wait_timers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitTimerRow {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: String,
    pub trigger_at: DateTime<Utc>,
    pub payload: Value,
    pub status: TimerStatus,
    pub created_at: DateTime<Utc>,
    pub triggered_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, SqliteRow> for WaitTimerRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: codec::uuid(row, "id")?,
            run_id: codec::uuid(row, "run_id")?,
            step_id: row.try_get("step_id")?,
            trigger_at: codec::ts(row, "trigger_at")?,
            payload: codec::json(row, "payload")?,
            status: codec::parsed(row, "status")?,
            created_at: codec::ts(row, "created_at")?,
            triggered_at: codec::opt_ts(row, "triggered_at")?,
        })
    }
}

// ---------------------------------------------------------------------------
// compensations
// ---------------------------------------------------------------------------

/// One rollback attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationRow {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: String,
    /// Declared compensation action; `None` when the step declares none.
    pub action: Option<String>,
    pub status: CompensationStatus,
    pub payload: Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for CompensationRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: codec::uuid(row, "id")?,
            run_id: codec::uuid(row, "run_id")?,
            step_id: row.try_get("step_id")?,
            action: row.try_get("action")?,
            status: codec::parsed(row, "status")?,
            payload: codec::json(row, "payload")?,
            error: row.try_get("error")?,
            created_at: codec::ts(row, "created_at")?,
            updated_at: codec::ts(row, "updated_at")?,
        })
    }
}

// ---------------------------------------------------------------------------
// locks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRow {
    pub run_id: Uuid,
    pub step_id: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for LockRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: codec::uuid(row, "run_id")?,
            step_id: row.try_get("step_id")?,
            token: row.try_get("token")?,
            expires_at: codec::ts(row, "expires_at")?,
        })
    }
}

// ---------------------------------------------------------------------------
// jobs
// ---------------------------------------------------------------------------

/// A job row fetched from the queue table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRow {
    pub id: Uuid,
    pub kind: String,
    pub payload: Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for JobRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: codec::uuid(row, "id")?,
            kind: row.try_get("kind")?,
            payload: codec::json(row, "payload")?,
            status: codec::parsed(row, "status")?,
            attempts: codec::count(row, "attempts")?,
            max_attempts: codec::count(row, "max_attempts")?,
            run_at: codec::ts(row, "run_at")?,
            last_error: row.try_get("last_error")?,
            created_at: codec::ts(row, "created_at")?,
            updated_at: codec::ts(row, "updated_at")?,
        })
    }
}
