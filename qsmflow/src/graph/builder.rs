//! Graph builder with validation.

use super::{
    Cardinality, DeclaredOutput, Edge, PipelineGraph, PortRef, StageSpec, Subgraph,
    SubgraphHandle,
};
use crate::core::StageKind;
use crate::errors::{codes, ContractErrorInfo, CycleDetectedError, PipelineValidationError};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Builder for validated pipeline graphs.
///
/// Stages are added first, then connected. Every `connect` call checks port
/// existence, cardinality and acyclicity, so a builder never holds an
/// invalid edge. [`GraphBuilder::build`] adds the whole-graph checks and
/// freezes the result.
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    /// The graph name.
    name: String,
    /// The stage specifications.
    stages: HashMap<String, StageSpec>,
    /// Insertion order for stages.
    stage_order: Vec<String>,
    /// Data edges in insertion order.
    edges: Vec<Edge>,
    /// Consumers of each stage, for cycle checks.
    downstream: HashMap<String, Vec<String>>,
    /// Declared outputs.
    outputs: Vec<DeclaredOutput>,
}

impl GraphBuilder {
    /// Creates a new graph builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: HashMap::new(),
            stage_order: Vec::new(),
            edges: Vec::new(),
            downstream: HashMap::new(),
            outputs: Vec::new(),
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

    /// Returns true if a stage with this name exists.
    #[must_use]
    pub fn has_stage(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    /// Looks up a stage.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.get(name)
    }

    /// Stage names in insertion order.
    #[must_use]
    pub fn stage_names(&self) -> &[String] {
        &self.stage_order
    }

    /// Adds a stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage schema is invalid or the name is taken.
    pub fn add_stage(&mut self, spec: StageSpec) -> Result<(), PipelineValidationError> {
        spec.validate()?;

        if self.stages.contains_key(&spec.name) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' is already defined in graph '{}'",
                spec.name, self.name
            ))
            .with_stages(vec![spec.name.clone()])
            .with_error_info(
                ContractErrorInfo::new(codes::DUPLICATE, format!("Duplicate stage '{}'", spec.name))
                    .with_fix_hint("Give per-echo and per-pass stages distinct suffixes or prefixes."),
            ));
        }

        debug!(graph = %self.name, stage = %spec.name, executor = %spec.executor, "Adding stage");
        self.push_stage(spec);
        Ok(())
    }

    pub(crate) fn push_stage(&mut self, spec: StageSpec) {
        self.stage_order.push(spec.name.clone());
        self.stages.insert(spec.name.clone(), spec);
    }

    /// Connects an output port to an input port.
    ///
    /// # Errors
    ///
    /// Returns an error if either side is unknown, a single-valued input is
    /// already connected, or the edge would close a cycle.
    pub fn connect(
        &mut self,
        from: PortRef,
        to_stage: &str,
        to_port: &str,
    ) -> Result<(), PipelineValidationError> {
        let producer = self
            .stages
            .get(&from.stage)
            .ok_or_else(|| missing_stage(&from.stage, to_stage))?;
        if !producer.has_output(&from.port) {
            return Err(missing_port(&from.stage, &from.port, "output"));
        }

        let consumer = self
            .stages
            .get(to_stage)
            .ok_or_else(|| missing_stage(to_stage, &from.stage))?;
        let port = consumer
            .input(to_port)
            .ok_or_else(|| missing_port(to_stage, to_port, "input"))?;

        if port.cardinality == Cardinality::One
            && self
                .edges
                .iter()
                .any(|e| e.to_stage == to_stage && e.to_port == to_port)
        {
            return Err(PipelineValidationError::new(format!(
                "Input '{to_stage}.{to_port}' accepts a single edge but '{from}' is a second one"
            ))
            .with_stages(vec![to_stage.to_string(), from.stage.clone()])
            .with_error_info(ContractErrorInfo::new(
                codes::CARDINALITY,
                format!("'{to_stage}.{to_port}' is single-valued"),
            )));
        }

        if let Some(cycle) = self.find_path(to_stage, &from.stage) {
            let mut path = vec![from.stage.clone()];
            path.extend(cycle);
            return Err(CycleDetectedError::new(path).into());
        }

        debug!(graph = %self.name, from = %from, to = %format!("{to_stage}.{to_port}"), "Connecting");
        self.push_edge(Edge {
            from,
            to_stage: to_stage.to_string(),
            to_port: to_port.to_string(),
        });
        Ok(())
    }

    /// Connects several producers, in order, to one input port.
    ///
    /// # Errors
    ///
    /// Returns the first connection error.
    pub fn connect_all(
        &mut self,
        from: impl IntoIterator<Item = PortRef>,
        to_stage: &str,
        to_port: &str,
    ) -> Result<(), PipelineValidationError> {
        for port in from {
            self.connect(port, to_stage, to_port)?;
        }
        Ok(())
    }

    pub(crate) fn push_edge(&mut self, edge: Edge) {
        let consumers = self.downstream.entry(edge.from.stage.clone()).or_default();
        if !consumers.contains(&edge.to_stage) {
            consumers.push(edge.to_stage.clone());
        }
        self.edges.push(edge);
    }

    /// Inserts a subgraph's stages under `prefix` and returns its handle.
    ///
    /// Internal edges are carried over renamed. Nothing outside the
    /// subgraph is connected yet; wire its `inputnode` and `outputnode`
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if a namespaced stage name is already taken.
    pub fn add_subgraph(
        &mut self,
        prefix: &str,
        subgraph: Subgraph,
    ) -> Result<SubgraphHandle, PipelineValidationError> {
        let inner = subgraph.into_builder();
        for name in &inner.stage_order {
            if let Some(spec) = inner.stages.get(name) {
                self.add_stage(spec.namespaced(prefix))?;
            }
        }
        for edge in inner.edges {
            let mut from = edge.from;
            from.stage = format!("{prefix}.{}", from.stage);
            self.push_edge(Edge {
                from,
                to_stage: format!("{prefix}.{}", edge.to_stage),
                to_port: edge.to_port,
            });
        }
        debug!(graph = %self.name, prefix, "Added subgraph");
        Ok(SubgraphHandle::new(prefix))
    }

    /// Declares a published output.
    ///
    /// # Errors
    ///
    /// Returns an error if the source port does not exist.
    pub fn declare_output(&mut self, output: DeclaredOutput) -> Result<(), PipelineValidationError> {
        let producer = self
            .stages
            .get(&output.source.stage)
            .ok_or_else(|| missing_stage(&output.source.stage, &output.name))?;
        if !producer.has_output(&output.source.port) {
            return Err(missing_port(&output.source.stage, &output.source.port, "output"));
        }
        self.outputs.push(output);
        Ok(())
    }

    /// Builds the immutable graph.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph is empty, a required input has no
    /// edge, or an edge reads a subgraph boundary port nothing feeds.
    pub fn build(self) -> Result<PipelineGraph, PipelineValidationError> {
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new(format!("Graph '{}' has no stages", self.name))
                .with_error_info(
                    ContractErrorInfo::new(codes::EMPTY, "Cannot build an empty graph")
                        .with_fix_hint("Add at least one stage to the graph before building."),
                ));
        }

        let connected: HashSet<(&str, &str)> = self
            .edges
            .iter()
            .map(|e| (e.to_stage.as_str(), e.to_port.as_str()))
            .collect();

        for name in &self.stage_order {
            let Some(spec) = self.stages.get(name) else {
                continue;
            };
            for port in spec.inputs.iter().filter(|p| p.required) {
                if !connected.contains(&(name.as_str(), port.name.as_str())) {
                    return Err(unconnected(name, &port.name, "has no incoming edge"));
                }
            }
        }

        let mut live = HashMap::new();
        for edge in &self.edges {
            if !self.is_live(&edge.from, &mut live) {
                return Err(unconnected(
                    &edge.from.stage,
                    &edge.from.port,
                    &format!("is read by '{}' but nothing feeds it", edge.to_stage),
                ));
            }
        }
        for output in &self.outputs {
            if !self.is_live(&output.source, &mut live) {
                return Err(unconnected(
                    &output.source.stage,
                    &output.source.port,
                    &format!("backs output '{}' but nothing feeds it", output.name),
                ));
            }
        }

        Ok(PipelineGraph::new(
            self.name,
            self.stages,
            &self.stage_order,
            self.edges,
            self.outputs,
        ))
    }

    /// Identity ports are live when some edge feeding them is live; every
    /// other output port is live by construction.
    fn is_live(&self, port: &PortRef, memo: &mut HashMap<(String, String), bool>) -> bool {
        let Some(spec) = self.stages.get(&port.stage) else {
            return false;
        };
        if spec.kind != StageKind::Identity {
            return true;
        }
        let key = (port.stage.clone(), port.port.clone());
        if let Some(&known) = memo.get(&key) {
            return known;
        }
        let feeders: Vec<PortRef> = self
            .edges
            .iter()
            .filter(|e| e.to_stage == port.stage && e.to_port == port.port)
            .map(|e| e.from.clone())
            .collect();
        let live = feeders.iter().any(|f| self.is_live(f, memo));
        memo.insert(key, live);
        live
    }

    /// Depth-first search along data edges; returns the stage path from
    /// `start` to `target` if one exists.
    fn find_path(&self, start: &str, target: &str) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        if self.dfs_path(start, target, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs_path(
        &self,
        node: &str,
        target: &str,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> bool {
        path.push(node.to_string());
        if node == target {
            return true;
        }
        visited.insert(node.to_string());

        if let Some(consumers) = self.downstream.get(node) {
            for next in consumers {
                if !visited.contains(next) && self.dfs_path(next, target, visited, path) {
                    return true;
                }
            }
        }

        path.pop();
        false
    }
}

fn missing_stage(stage: &str, referenced_by: &str) -> PipelineValidationError {
    PipelineValidationError::new(format!(
        "Unknown stage '{stage}' referenced by '{referenced_by}'"
    ))
    .with_stages(vec![stage.to_string(), referenced_by.to_string()])
    .with_error_info(
        ContractErrorInfo::new(codes::MISSING_STAGE, format!("Stage '{stage}' not found"))
            .with_fix_hint("Ensure the stage is added before it is connected."),
    )
}

fn missing_port(stage: &str, port: &str, direction: &str) -> PipelineValidationError {
    PipelineValidationError::new(format!("Stage '{stage}' has no {direction} port '{port}'"))
        .with_stages(vec![stage.to_string()])
        .with_error_info(
            ContractErrorInfo::new(codes::MISSING_PORT, format!("Unknown {direction} '{stage}.{port}'"))
                .with_context_entry("port", port),
        )
}

fn unconnected(stage: &str, port: &str, detail: &str) -> PipelineValidationError {
    PipelineValidationError::new(format!("Port '{stage}.{port}' {detail}"))
        .with_stages(vec![stage.to_string()])
        .with_error_info(
            ContractErrorInfo::new(codes::UNCONNECTED, format!("'{stage}.{port}' is unconnected"))
                .with_fix_hint("Do not wire a stage whose precondition input is absent."),
        )
}
