//! `nodes` crate — the task-handler boundary.
//!
//! Every step type, built-in or external, must implement
//! [`StepHandler`], and every rollback action [`CompensationAction`]. The
//! engine crate dispatches through these trait objects via a
//! [`HandlerRegistry`].

pub mod builtin;
pub mod error;
pub mod mock;
pub mod registry;
pub mod retry;
pub mod traits;

pub use error::NodeError;
pub use registry::HandlerRegistry;
pub use retry::{RetryPolicy, RetryingHandler};
pub use traits::{
    CompensationAction, CompensationContext, SignalEvent, StepContext, StepHandler, StepOutcome,
};
