//! Definition compiler — turns YAML definition text into a validated [`Dag`].
//!
//! Rules enforced, in order:
//! 1. The text is YAML whose root is a mapping with a non-empty `steps` list.
//! 2. Every step is a mapping with a unique `id` (string or integer) and a
//!    non-empty string `type`; `depends_on`, when present, is a string or a
//!    list of ids.
//! 3. Every dependency names a declared step.
//! 4. The graph is acyclic (Kahn's algorithm).
//!
//! A step without `depends_on` depends on the step declared just before it.

use std::collections::HashSet;

use serde_json::{Map, Value};
use serde_yaml_ng::Value as Yaml;

use crate::models::{Dag, Edge, StepNode};
use crate::CompileError;

/// Keys consumed by the compiler; everything else lands in `StepNode::meta`.
const STRUCTURAL_KEYS: [&str; 3] = ["id", "type", "depends_on"];

/// Compile a workflow definition.
///
/// # Errors
/// Returns the first [`CompileError`] encountered; nothing partial is built.
pub fn compile(definition_text: &str) -> Result<Dag, CompileError> {
    let root: Yaml = serde_yaml_ng::from_str(definition_text)
        .map_err(|e| CompileError::InvalidYaml(e.to_string()))?;

    let root = match root {
        Yaml::Mapping(map) => map,
        _ => return Err(CompileError::RootNotMapping),
    };
    let steps = match root.get("steps") {
        None => return Err(CompileError::MissingSteps),
        Some(Yaml::Sequence(steps)) => steps,
        Some(_) => return Err(CompileError::StepsNotList),
    };
    if steps.is_empty() {
        return Err(CompileError::EmptyDefinition);
    }

    // -----------------------------------------------------------------------
    // 1. Per-step structure
    // -----------------------------------------------------------------------
    let mut nodes: Vec<StepNode> = Vec::with_capacity(steps.len());
    let mut depends: Vec<Option<Vec<String>>> = Vec::with_capacity(steps.len());
    let mut seen_ids: HashSet<String> = HashSet::new();

    for (index, step) in steps.iter().enumerate() {
        let Yaml::Mapping(step) = step else {
            return Err(CompileError::StepNotMapping { index });
        };

        let id = step.get("id").and_then(scalar_id).ok_or(CompileError::MissingId { index })?;

        let step_type = match step.get("type") {
            Some(Yaml::String(t)) if !t.trim().is_empty() => t.clone(),
            _ => return Err(CompileError::MissingType { step: id }),
        };

        if !seen_ids.insert(id.clone()) {
            return Err(CompileError::DuplicateId(id));
        }

        depends.push(parse_depends_on(step.get("depends_on"), &id)?);
        nodes.push(StepNode {
            meta: collect_meta(step)?,
            id,
            step_type,
        });
    }

    // -----------------------------------------------------------------------
    // 2. Edges
    // -----------------------------------------------------------------------
    let mut edges: Vec<Edge> = Vec::new();
    for (i, node) in nodes.iter().enumerate() {
        match &depends[i] {
            None if i > 0 => edges.push(Edge::new(nodes[i - 1].id.clone(), node.id.clone())),
            None => {}
            Some(deps) => {
                for dep in deps {
                    if !seen_ids.contains(dep) {
                        return Err(CompileError::UnknownDependency {
                            step: node.id.clone(),
                            dependency: dep.clone(),
                        });
                    }
                    let edge = Edge::new(dep.clone(), node.id.clone());
                    if !edges.contains(&edge) {
                        edges.push(edge);
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // 3. Cycle detection
    // -----------------------------------------------------------------------
    let dag = Dag { nodes, edges };
    let (_, unresolved) = dag.kahn();
    if !unresolved.is_empty() {
        return Err(CompileError::CycleDetected(
            unresolved.into_iter().map(str::to_owned).collect(),
        ));
    }

    Ok(dag)
}

fn scalar_id(value: &Yaml) -> Option<String> {
    match value {
        Yaml::String(s) if !s.is_empty() => Some(s.clone()),
        Yaml::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        _ => None,
    }
}

fn parse_depends_on(value: Option<&Yaml>, step: &str) -> Result<Option<Vec<String>>, CompileError> {
    let invalid = || CompileError::InvalidDependsOn { step: step.to_owned() };
    match value {
        None | Some(Yaml::Null) => Ok(None),
        Some(Yaml::String(dep)) => Ok(Some(vec![dep.clone()])),
        Some(Yaml::Sequence(deps)) => deps
            .iter()
            .map(|d| scalar_id(d).ok_or_else(invalid))
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(invalid()),
    }
}

fn collect_meta(step: &serde_yaml_ng::Mapping) -> Result<Map<String, Value>, CompileError> {
    let mut meta = Map::new();
    for (key, value) in step {
        let key = match key {
            Yaml::String(s) => s.clone(),
            Yaml::Number(n) => n.to_string(),
            Yaml::Bool(b) => b.to_string(),
            _ => continue,
        };
        if STRUCTURAL_KEYS.contains(&key.as_str()) {
            continue;
        }
        let value = serde_json::to_value(value).map_err(|e| CompileError::InvalidYaml(e.to_string()))?;
        meta.insert(key, value);
    }
    Ok(meta)
}
