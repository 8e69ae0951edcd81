//! The immutable pipeline graph.
//!
//! A `PipelineGraph` is the sole executable artefact of planning. It is a
//! plain record of stages, edges and declared outputs, serialisable to JSON
//! for external back-ends and exportable to DOT for inspection.

use super::{DeclaredOutput, Edge, PortRef, StageSpec};
use crate::core::StageKind;
use crate::errors::QsmflowError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;

/// A frozen, validated directed acyclic graph of stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineGraph {
    /// The graph name (the reconstruction unit id).
    name: String,
    /// Stage specifications by name.
    stages: BTreeMap<String, StageSpec>,
    /// Topological order, stable with respect to insertion order.
    execution_order: Vec<String>,
    /// Data edges in insertion order.
    edges: Vec<Edge>,
    /// Published outputs.
    outputs: Vec<DeclaredOutput>,
}

impl PipelineGraph {
    pub(crate) fn new(
        name: String,
        stages: HashMap<String, StageSpec>,
        stage_order: &[String],
        edges: Vec<Edge>,
        outputs: Vec<DeclaredOutput>,
    ) -> Self {
        let execution_order = topological_sort(stage_order, &edges);
        Self {
            name,
            stages: stages.into_iter().collect(),
            execution_order,
            edges,
            outputs,
        }
    }

    /// Returns the graph name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Returns the execution order.
    #[must_use]
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Looks up a stage.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.get(name)
    }

    /// Returns true if the stage exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    /// All stage names, sorted.
    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.keys().map(String::as_str)
    }

    /// All stages, sorted by name.
    pub fn stages(&self) -> impl Iterator<Item = &StageSpec> {
        self.stages.values()
    }

    /// All edges in insertion order.
    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Edges feeding a stage's port, in insertion order.
    pub fn edges_into<'a>(&'a self, stage: &'a str, port: &'a str) -> impl Iterator<Item = &'a Edge> {
        self.edges
            .iter()
            .filter(move |e| e.to_stage == stage && e.to_port == port)
    }

    /// Edges leaving a stage.
    pub fn edges_from<'a>(&'a self, stage: &'a str) -> impl Iterator<Item = &'a Edge> {
        self.edges.iter().filter(move |e| e.from.stage == stage)
    }

    /// Returns true if an edge connects the two ports.
    #[must_use]
    pub fn has_edge(&self, from_stage: &str, from_port: &str, to_stage: &str, to_port: &str) -> bool {
        self.edges.iter().any(|e| {
            e.from.stage == from_stage
                && e.from.port == from_port
                && e.to_stage == to_stage
                && e.to_port == to_port
        })
    }

    /// Distinct upstream stages, in edge order.
    #[must_use]
    pub fn dependencies(&self, stage: &str) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.edges
            .iter()
            .filter(|e| e.to_stage == stage)
            .map(|e| e.from.stage.as_str())
            .filter(|s| seen.insert(*s))
            .collect()
    }

    /// Distinct downstream stages, in edge order.
    #[must_use]
    pub fn dependents(&self, stage: &str) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.edges
            .iter()
            .filter(|e| e.from.stage == stage)
            .map(|e| e.to_stage.as_str())
            .filter(|s| seen.insert(*s))
            .collect()
    }

    /// Every stage reachable downstream of `stage`.
    #[must_use]
    pub fn descendants(&self, stage: &str) -> HashSet<String> {
        let mut found = HashSet::new();
        let mut stack = vec![stage.to_string()];
        while let Some(current) = stack.pop() {
            for next in self.dependents(&current) {
                if found.insert(next.to_string()) {
                    stack.push(next.to_string());
                }
            }
        }
        found
    }

    /// Stages of one kind, sorted by name.
    #[must_use]
    pub fn stages_of_kind(&self, kind: StageKind) -> Vec<&StageSpec> {
        self.stages.values().filter(|s| s.kind == kind).collect()
    }

    /// Stages whose name starts with `prefix.`.
    #[must_use]
    pub fn stages_with_prefix(&self, prefix: &str) -> Vec<&StageSpec> {
        let prefix = format!("{prefix}.");
        self.stages
            .values()
            .filter(|s| s.name.starts_with(&prefix))
            .collect()
    }

    /// Stages using an executor.
    #[must_use]
    pub fn stages_with_executor(&self, executor: &str) -> Vec<&StageSpec> {
        self.stages.values().filter(|s| s.executor == executor).collect()
    }

    /// Traces the producers behind an input port through identity nodes.
    ///
    /// Returns the non-identity output ports that ultimately feed the port,
    /// in edge order. List elements selected along the way are kept on the
    /// returned references only when they were selected directly on the
    /// producer.
    #[must_use]
    pub fn trace_sources(&self, stage: &str, port: &str) -> Vec<PortRef> {
        let mut sources = Vec::new();
        for edge in self.edges_into(stage, port) {
            self.trace_port(&edge.from, &mut sources);
        }
        sources
    }

    fn trace_port(&self, from: &PortRef, sources: &mut Vec<PortRef>) {
        match self.stages.get(&from.stage) {
            Some(spec) if spec.kind == StageKind::Identity => {
                for edge in self.edges_into(&from.stage, &from.port) {
                    self.trace_port(&edge.from, sources);
                }
            }
            Some(_) => sources.push(from.clone()),
            None => {}
        }
    }

    /// Published outputs.
    #[must_use]
    pub fn declared_outputs(&self) -> &[DeclaredOutput] {
        &self.outputs
    }

    /// Looks up a declared output by name.
    #[must_use]
    pub fn declared_output(&self, name: &str) -> Option<&DeclaredOutput> {
        self.outputs.iter().find(|o| o.name == name)
    }

    /// Largest single-stage memory hint in GB.
    #[must_use]
    pub fn peak_mem_gb(&self) -> f64 {
        self.stages
            .values()
            .map(|s| s.hints.mem_gb)
            .fold(0.0, f64::max)
    }

    /// Serialises the graph to pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns a serialization error.
    pub fn to_json(&self) -> Result<String, QsmflowError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Loads a graph from JSON.
    ///
    /// # Errors
    ///
    /// Returns a serialization error.
    pub fn from_json(json: &str) -> Result<Self, QsmflowError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Renders the graph in Graphviz DOT syntax.
    #[must_use]
    pub fn to_dot(&self) -> String {
        let mut dot = String::new();
        let _ = writeln!(dot, "digraph \"{}\" {{", self.name);
        let _ = writeln!(dot, "  rankdir=TB;");
        for name in &self.execution_order {
            if let Some(spec) = self.stages.get(name) {
                let shape = if spec.kind.is_structural() { "ellipse" } else { "box" };
                let _ = writeln!(
                    dot,
                    "  \"{name}\" [shape={shape}, label=\"{name}\\n{}\"];",
                    spec.executor
                );
            }
        }
        let mut drawn = HashSet::new();
        for edge in &self.edges {
            if drawn.insert((edge.from.stage.as_str(), edge.to_stage.as_str())) {
                let _ = writeln!(dot, "  \"{}\" -> \"{}\";", edge.from.stage, edge.to_stage);
            }
        }
        dot.push_str("}\n");
        dot
    }
}

/// Performs a depth-first topological sort, visiting in insertion order for
/// determinism.
fn topological_sort(stage_order: &[String], edges: &[Edge]) -> Vec<String> {
    let mut upstream: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        let deps = upstream.entry(edge.to_stage.as_str()).or_default();
        if !deps.contains(&edge.from.stage.as_str()) {
            deps.push(edge.from.stage.as_str());
        }
    }

    let mut result = Vec::with_capacity(stage_order.len());
    let mut visited = HashSet::new();

    fn visit<'a>(
        node: &'a str,
        upstream: &HashMap<&'a str, Vec<&'a str>>,
        visited: &mut HashSet<&'a str>,
        result: &mut Vec<String>,
    ) {
        if !visited.insert(node) {
            return;
        }
        if let Some(deps) = upstream.get(node) {
            for dep in deps {
                visit(dep, upstream, visited, result);
            }
        }
        result.push(node.to_string());
    }

    for name in stage_order {
        visit(name, &upstream, &mut visited, &mut result);
    }

    result
}
