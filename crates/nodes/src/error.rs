//! Handler-level error type.

use thiserror::Error;

/// Errors returned by a handler's `execute` (or a compensation's `compensate`).
///
/// The orchestrator treats every error it receives as terminal for the step.
/// `Retryable` only matters to handler-side wrappers such as
/// [`RetryingHandler`](crate::retry::RetryingHandler), which retry transient
/// failures with back-off before giving up.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Transient failure; a retrying wrapper may try again.
    #[error("retryable node error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal node error: {0}")]
    Fatal(String),
}

impl NodeError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}
