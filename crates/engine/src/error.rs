//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

/// Reasons a definition fails to compile. Compilation stops at the first
/// problem found; no partial DAG is ever produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("invalid YAML: {0}")]
    InvalidYaml(String),

    #[error("root of the definition must be a mapping")]
    RootNotMapping,

    #[error("definition must contain a 'steps' key")]
    MissingSteps,

    #[error("'steps' must be a list")]
    StepsNotList,

    #[error("definition declares no steps")]
    EmptyDefinition,

    #[error("each step must be a mapping; step at index {index} is not")]
    StepNotMapping { index: usize },

    #[error("step at index {index} is missing an 'id' (string or integer)")]
    MissingId { index: usize },

    #[error("duplicate step id: '{0}'")]
    DuplicateId(String),

    #[error("step '{step}' is missing 'type' (non-empty string)")]
    MissingType { step: String },

    #[error("'depends_on' for step '{step}' must be a string or a list of strings")]
    InvalidDependsOn { step: String },

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    /// Kahn's algorithm could not order these nodes.
    #[error("cycle detected among steps {0:?}")]
    CycleDetected(Vec<String>),
}

/// Errors produced by the orchestrator.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid workflow definition: {0}")]
    Compile(#[from] CompileError),

    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("timer {0} not found")]
    TimerNotFound(Uuid),

    /// A uniqueness rule rejected the request (e.g. duplicate name/version).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("queue error: {0}")]
    Queue(#[from] queue::QueueError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
