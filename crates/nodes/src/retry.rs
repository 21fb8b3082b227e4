//! Handler-side retry with exponential back-off.
//!
//! The orchestrator never retries a failed step. Transient failures are the
//! handler's business: wrap it in [`RetryingHandler`] and `Retryable` errors
//! are retried before a terminal `Fatal` is reported.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::{NodeError, StepContext, StepHandler, StepOutcome};

/// Tuning knobs for [`RetryingHandler`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of times a retryable failure will be retried.
    pub max_retries: u32,
    /// Base delay for exponential back-off between retries.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

pub struct RetryingHandler<H> {
    inner: H,
    policy: RetryPolicy,
}

impl<H: StepHandler> RetryingHandler<H> {
    pub fn new(inner: H, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<H: StepHandler> StepHandler for RetryingHandler<H> {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, NodeError> {
        let mut attempts = 0u32;

        loop {
            match self.inner.execute(ctx).await {
                Ok(outcome) => return Ok(outcome),

                Err(NodeError::Fatal(msg)) => return Err(NodeError::Fatal(msg)),

                Err(NodeError::Retryable(msg)) => {
                    attempts += 1;
                    if attempts > self.policy.max_retries {
                        return Err(NodeError::Fatal(format!(
                            "retry limit ({}) exceeded: {msg}",
                            self.policy.max_retries
                        )));
                    }

                    let delay = self.policy.base_delay * 2u32.pow(attempts.saturating_sub(1));

                    warn!(
                        step_id = %ctx.step_id,
                        "retryable error (attempt {}/{}), retrying in {:?}: {}",
                        attempts, self.policy.max_retries, delay, msg
                    );

                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn timeout(&self) -> Option<Duration> {
        self.inner.timeout()
    }
}
