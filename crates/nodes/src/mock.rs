//! `MockNode` and `MockCompensation` — test doubles for the handler traits.
//!
//! Useful in unit and integration tests where a real handler implementation
//! is either unavailable or irrelevant.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{
    CompensationAction, CompensationContext, NodeError, StepContext, StepHandler, StepOutcome,
};

/// Behaviour injected into `MockNode` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Complete with a specific JSON value.
    ReturnValue(Value),
    /// Sleep, then complete with the value.
    Delayed(Duration, Value),
    /// Fail with a `Retryable` error `n` times, then complete with the value.
    Flaky(u32, Value),
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Report a fixed outcome (waits included).
    Outcome(StepOutcome),
}

/// One recorded invocation.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub step_id: String,
    pub attempt: u32,
    pub input: Value,
}

/// A mock handler that records every call it receives and returns a
/// programmer-specified result. Clones share the call log.
#[derive(Clone)]
pub struct MockNode {
    /// Label used in test assertions.
    pub name: String,
    /// What the node will do when `execute` is called.
    pub behaviour: MockBehaviour,
    /// All calls seen by this node (in call order).
    pub calls: Arc<Mutex<Vec<MockCall>>>,
    failures_left: Arc<AtomicU32>,
}

impl MockNode {
    fn with_behaviour(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        let failures = match &behaviour {
            MockBehaviour::Flaky(n, _) => *n,
            _ => 0,
        };
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
            failures_left: Arc::new(AtomicU32::new(failures)),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that sleeps before succeeding.
    pub fn delayed(name: impl Into<String>, delay: Duration, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::Delayed(delay, value))
    }

    /// Create a mock that fails `failures` times with a `Retryable` error first.
    pub fn flaky(name: impl Into<String>, failures: u32, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::Flaky(failures, value))
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailFatal(msg.into()))
    }

    /// Create a mock that always fails with a `Retryable` error.
    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailRetryable(msg.into()))
    }

    /// Create a mock that always reports the given outcome.
    pub fn outcome(name: impl Into<String>, outcome: StepOutcome) -> Self {
        Self::with_behaviour(name, MockBehaviour::Outcome(outcome))
    }

    /// Number of times this node has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Calls made for one step id.
    pub fn calls_for(&self, step_id: &str) -> Vec<MockCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.step_id == step_id)
            .cloned()
            .collect()
    }

    fn output(&self, v: &Value) -> Value {
        // Merge the node's own name into the output so tests can trace data
        // flowing through the run.
        let mut out = json!({ "node": self.name });
        if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), v.as_object()) {
            for (k, val) in v_obj {
                out_obj.insert(k.clone(), val.clone());
            }
        }
        out
    }
}

#[async_trait]
impl StepHandler for MockNode {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, NodeError> {
        self.calls.lock().unwrap().push(MockCall {
            step_id: ctx.step_id.clone(),
            attempt: ctx.attempt,
            input: ctx.input(),
        });

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(StepOutcome::Completed(self.output(v))),
            MockBehaviour::Delayed(delay, v) => {
                tokio::time::sleep(*delay).await;
                Ok(StepOutcome::Completed(self.output(v)))
            }
            MockBehaviour::Flaky(_, v) => {
                let remaining = self.failures_left.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.failures_left.store(remaining - 1, Ordering::SeqCst);
                    return Err(NodeError::Retryable(format!("{} flaked", self.name)));
                }
                Ok(StepOutcome::Completed(self.output(v)))
            }
            MockBehaviour::FailRetryable(msg) => Err(NodeError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(NodeError::Fatal(msg.clone())),
            MockBehaviour::Outcome(outcome) => Ok(outcome.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// MockCompensation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompensationBehaviour {
    Succeed,
    Fail,
    Panic,
}

/// A compensation action that records the steps it was asked to undo.
#[derive(Clone)]
pub struct MockCompensation {
    pub behaviour: CompensationBehaviour,
    pub calls: Arc<Mutex<Vec<CompensationContext>>>,
}

impl MockCompensation {
    fn with_behaviour(behaviour: CompensationBehaviour) -> Self {
        Self {
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn succeeding() -> Self {
        Self::with_behaviour(CompensationBehaviour::Succeed)
    }

    pub fn failing() -> Self {
        Self::with_behaviour(CompensationBehaviour::Fail)
    }

    pub fn panicking() -> Self {
        Self::with_behaviour(CompensationBehaviour::Panic)
    }

    /// Step ids compensated so far, in call order.
    pub fn compensated_steps(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|c| c.step_id.clone()).collect()
    }
}

#[async_trait]
impl CompensationAction for MockCompensation {
    async fn compensate(&self, ctx: &CompensationContext) -> Result<(), NodeError> {
        self.calls.lock().unwrap().push(ctx.clone());
        match self.behaviour {
            CompensationBehaviour::Succeed => Ok(()),
            CompensationBehaviour::Fail => {
                Err(NodeError::Fatal(format!("could not undo {}", ctx.step_id)))
            }
            CompensationBehaviour::Panic => panic!("compensation for {} panicked", ctx.step_id),
        }
    }
}
