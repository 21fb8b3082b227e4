//! `engine` crate — workflow compiler, executor and saga machinery.
//!
//! Entry point is [`Orchestrator`]; the other components are public so the
//! CLI and tests can drive them one at a time.

pub mod compensator;
pub mod compiler;
pub mod config;
pub mod error;
pub mod executor;
pub mod models;
pub mod orchestrator;
pub mod recovery;
pub mod signals;
pub mod timers;
pub mod worker;

pub use compensator::{CompensationResult, Compensator};
pub use compiler::compile;
pub use config::{CompensationScope, OrchestratorConfig, SignalMatching};
pub use error::{CompileError, EngineError};
pub use executor::Executor;
pub use models::{
    CompensationView, Dag, Edge, NewRun, NewWorkflow, RegisteredWorkflow, RunSummary, RunView, StepNode, StepView,
    WorkflowView,
};
pub use orchestrator::Orchestrator;
pub use recovery::{RecoveryReport, RecoverySweep};
pub use signals::SignalRouter;
pub use timers::{FireOutcome, TimerScheduler};
pub use worker::Worker;

#[cfg(test)]
mod executor_tests;
