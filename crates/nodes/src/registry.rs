//! Explicit lookup tables for step handlers and compensation actions.
//!
//! One registry is built per orchestrator and handed to it at construction,
//! so several independent orchestrators (or tests) can live in one process.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::builtin::{FailNode, NoopNode, WaitForSignalNode, WaitNode};
use crate::{CompensationAction, StepHandler};

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
    compensations: HashMap<String, Arc<dyn CompensationAction>>,
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the built-in step types:
    /// `noop`, `wait_for_signal`, `wait` and `fail`.
    pub fn with_builtins() -> Self {
        Self::new()
            .with_handler("noop", NoopNode)
            .with_handler("wait_for_signal", WaitForSignalNode)
            .with_handler("wait", WaitNode)
            .with_handler("fail", FailNode)
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_handler(mut self, step_type: impl Into<String>, handler: impl StepHandler + 'static) -> Self {
        self.register(step_type, Arc::new(handler));
        self
    }

    /// Builder-style [`register_compensation`](Self::register_compensation).
    pub fn with_compensation(
        mut self,
        action: impl Into<String>,
        compensation: impl CompensationAction + 'static,
    ) -> Self {
        self.register_compensation(action, Arc::new(compensation));
        self
    }

    /// Map `step_type` to a handler, replacing any previous registration.
    pub fn register(&mut self, step_type: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(step_type.into(), handler);
    }

    pub fn register_compensation(
        &mut self,
        action: impl Into<String>,
        compensation: Arc<dyn CompensationAction>,
    ) {
        self.compensations.insert(action.into(), compensation);
    }

    pub fn handler(&self, step_type: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(step_type).cloned()
    }

    pub fn compensation(&self, action: &str) -> Option<Arc<dyn CompensationAction>> {
        self.compensations.get(action).cloned()
    }

    /// Registered step types, sorted.
    pub fn step_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut compensations: Vec<&str> = self.compensations.keys().map(String::as_str).collect();
        compensations.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.step_types())
            .field("compensations", &compensations)
            .finish()
    }
}
