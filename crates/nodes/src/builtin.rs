//! Built-in step types that every orchestrator ships with.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{NodeError, StepContext, StepHandler, StepOutcome};

/// Completes immediately, echoing its input.
pub struct NoopNode;

#[async_trait]
impl StepHandler for NoopNode {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, NodeError> {
        Ok(StepOutcome::Completed(ctx.input()))
    }
}

/// Parks until the signal named by the `signal` metadata arrives (the step id
/// is used when none is declared), then completes with the signal payload.
pub struct WaitForSignalNode;

#[async_trait]
impl StepHandler for WaitForSignalNode {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, NodeError> {
        let name = ctx.config_str("signal").unwrap_or(&ctx.step_id);

        match ctx.last_signal(name) {
            Some(signal) => Ok(StepOutcome::Completed(json!({
                "signal": signal.name,
                "payload": signal.payload,
            }))),
            None => Ok(StepOutcome::WaitForSignal(name.to_owned())),
        }
    }
}

/// Pauses for a duration taken from `seconds` or `duration_ms` metadata and
/// completes once a timer has fired for it.
pub struct WaitNode;

impl WaitNode {
    fn delay(ctx: &StepContext) -> Result<Duration, NodeError> {
        if let Some(ms) = ctx.config.get("duration_ms").and_then(Value::as_u64) {
            return Ok(Duration::from_millis(ms));
        }
        match ctx.config.get("seconds").and_then(Value::as_f64) {
            Some(secs) => Duration::try_from_secs_f64(secs)
                .map_err(|_| NodeError::fatal("`seconds` must be a non-negative number in range")),
            None => Err(NodeError::fatal(
                "wait step requires `seconds` or `duration_ms` metadata",
            )),
        }
    }
}

#[async_trait]
impl StepHandler for WaitNode {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, NodeError> {
        let delay = Self::delay(ctx)?;
        if ctx.timers_fired > 0 {
            return Ok(StepOutcome::Completed(json!({
                "waited_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            })));
        }
        Ok(StepOutcome::WaitFor(delay))
    }
}

/// Always fails with the `message` metadata. Handy for exercising sagas.
pub struct FailNode;

#[async_trait]
impl StepHandler for FailNode {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, NodeError> {
        let message = ctx.config_str("message").unwrap_or("step failed");
        Err(NodeError::fatal(message))
    }
}
