//! Core domain models for the orchestrator.
//!
//! [`Dag`] is the compiled form of a workflow definition. It is stored as
//! JSON in the `compiled_dag` column of `workflow_defs` and reloaded for every
//! pass of the executor.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use db::models::{CompensationStatus, RunStatus, StepStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// StepNode
// ---------------------------------------------------------------------------

/// A single step in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepNode {
    /// Unique identifier within this workflow (referenced by edges).
    pub id: String,
    /// Maps to a handler registered in the `HandlerRegistry`.
    #[serde(rename = "type")]
    pub step_type: String,
    /// Every declared key except `id`, `type` and `depends_on`.
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl StepNode {
    fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

/// Directed edge: `to` may not start before `from` has completed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Dag
// ---------------------------------------------------------------------------

/// A compiled, acyclic step graph. Nodes keep their declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dag {
    pub nodes: Vec<StepNode>,
    pub edges: Vec<Edge>,
}

impl Dag {
    pub fn node(&self, id: &str) -> Option<&StepNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Declaration index of a node.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    pub fn predecessors(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.to == id)
            .map(|e| e.from.as_str())
            .collect()
    }

    pub fn successors(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.from == id)
            .map(|e| e.to.as_str())
            .collect()
    }

    /// Registered compensation action declared by the step.
    pub fn compensation(&self, id: &str) -> Option<&str> {
        self.node(id).and_then(|n| n.meta_str("compensation"))
    }

    /// Signal name the step declares it waits for.
    pub fn signal(&self, id: &str) -> Option<&str> {
        self.node(id).and_then(|n| n.meta_str("signal"))
    }

    /// RunVar that receives the step's output.
    pub fn output_var(&self, id: &str) -> Option<&str> {
        self.node(id).and_then(|n| n.meta_str("output_var"))
    }

    /// Node ids in a dependency-respecting order. Ties follow declaration
    /// order, so the result is deterministic.
    pub fn topological_order(&self) -> Vec<&str> {
        self.kahn().0
    }

    /// Kahn's algorithm over declaration indices. Returns the ordered ids and
    /// the ids left unresolved (non-empty only when the graph has a cycle).
    pub(crate) fn kahn(&self) -> (Vec<&str>, Vec<&str>) {
        let n = self.nodes.len();
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut in_degree: Vec<usize> = vec![0; n];

        for edge in &self.edges {
            if let (Some(from), Some(to)) = (self.position(&edge.from), self.position(&edge.to)) {
                adjacency[from].push(to);
                in_degree[to] += 1;
            }
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut sorted = Vec::with_capacity(n);

        while let Some(i) = queue.pop_front() {
            sorted.push(self.nodes[i].id.as_str());
            for &next in &adjacency[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        let unresolved = (0..n)
            .filter(|&i| in_degree[i] > 0)
            .map(|i| self.nodes[i].id.as_str())
            .collect();
        (sorted, unresolved)
    }
}

// ---------------------------------------------------------------------------
// Requests and views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkflow {
    pub name: String,
    pub version: String,
    pub definition_text: String,
    #[serde(default = "default_creator")]
    pub created_by: String,
}

fn default_creator() -> String {
    "anonymous".to_owned()
}

impl NewWorkflow {
    pub fn new(name: impl Into<String>, version: impl Into<String>, definition_text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            definition_text: definition_text.into(),
            created_by: default_creator(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredWorkflow {
    pub id: Uuid,
    pub name: String,
    pub version: String,
    pub dag: Dag,
}

/// A stored workflow with its compiled DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowView {
    pub id: Uuid,
    pub name: String,
    pub version: String,
    pub definition_text: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub dag: Dag,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewRun {
    pub workflow_id: Uuid,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub caller: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepView {
    pub step_id: String,
    #[serde(rename = "type")]
    pub step_type: String,
    pub status: StepStatus,
    pub attempt: u32,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A run and its steps in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunView {
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    pub version: String,
    pub status: RunStatus,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepView>,
}

impl RunView {
    pub fn step(&self, step_id: &str) -> Option<&StepView> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationView {
    pub step_id: String,
    pub action: Option<String>,
    pub status: CompensationStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str, meta: Value) -> StepNode {
        StepNode {
            id: id.into(),
            step_type: "noop".into(),
            meta: meta.as_object().cloned().unwrap_or_default(),
        }
    }

    fn diamond() -> Dag {
        //   a
        //  / \
        // b   c
        //  \ /
        //   d
        Dag {
            nodes: vec![
                node("a", json!({ "compensation": "undo_a" })),
                node("b", json!({ "signal": "approve" })),
                node("c", json!({ "output_var": "total" })),
                node("d", json!({})),
            ],
            edges: vec![
                Edge::new("a", "b"),
                Edge::new("a", "c"),
                Edge::new("b", "d"),
                Edge::new("c", "d"),
            ],
        }
    }

    #[test]
    fn neighbours_follow_edges() {
        let dag = diamond();
        assert_eq!(dag.predecessors("d"), vec!["b", "c"]);
        assert_eq!(dag.successors("a"), vec!["b", "c"]);
        assert!(dag.predecessors("a").is_empty());
    }

    #[test]
    fn topological_order_breaks_ties_by_declaration() {
        assert_eq!(diamond().topological_order(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn metadata_accessors() {
        let dag = diamond();
        assert_eq!(dag.compensation("a"), Some("undo_a"));
        assert_eq!(dag.signal("b"), Some("approve"));
        assert_eq!(dag.output_var("c"), Some("total"));
        assert_eq!(dag.compensation("d"), None);
        assert_eq!(dag.compensation("missing"), None);
    }

    #[test]
    fn dag_serializes_with_type_key() {
        let value = serde_json::to_value(diamond()).unwrap();
        assert_eq!(value["nodes"][0]["type"], "noop");
        assert_eq!(value["edges"][0], json!({ "from": "a", "to": "b" }));
        let back: Dag = serde_json::from_value(value).unwrap();
        assert_eq!(back, diamond());
    }
}
