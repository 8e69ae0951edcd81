//! Subgraphs with identity boundary nodes.
//!
//! A workflow builder produces a [`Subgraph`] with local stage names. The
//! composer inserts it into the run's [`GraphBuilder`] under a prefix and
//! then wires the boundary nodes, so subgraph handles always exist before
//! any cross-subgraph edge does.

use super::{GraphBuilder, PortRef, StageSpec};
use crate::errors::PipelineValidationError;

/// Name of the boundary node receiving subgraph inputs.
pub const INPUT_NODE: &str = "inputnode";
/// Name of the boundary node exposing subgraph outputs.
pub const OUTPUT_NODE: &str = "outputnode";

/// A self-contained group of stages between an input and an output node.
#[derive(Debug, Clone)]
pub struct Subgraph {
    builder: GraphBuilder,
}

impl Subgraph {
    /// Creates a subgraph with the given boundary fields.
    #[must_use]
    pub fn new(name: impl Into<String>, inputs: &[&str], outputs: &[&str]) -> Self {
        let mut builder = GraphBuilder::new(name);
        builder.push_stage(StageSpec::identity(INPUT_NODE, inputs));
        builder.push_stage(StageSpec::identity(OUTPUT_NODE, outputs));
        Self { builder }
    }

    /// Returns the subgraph name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.builder.name()
    }

    /// Adds a stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is taken.
    pub fn add_stage(&mut self, spec: StageSpec) -> Result<(), PipelineValidationError> {
        self.builder.add_stage(spec)
    }

    /// Connects two local ports.
    ///
    /// # Errors
    ///
    /// See [`GraphBuilder::connect`].
    pub fn connect(
        &mut self,
        from: PortRef,
        to_stage: &str,
        to_port: &str,
    ) -> Result<(), PipelineValidationError> {
        self.builder.connect(from, to_stage, to_port)
    }

    /// Connects a local port to an output-node field.
    ///
    /// # Errors
    ///
    /// See [`GraphBuilder::connect`].
    pub fn expose(&mut self, from: PortRef, output: &str) -> Result<(), PipelineValidationError> {
        self.builder.connect(from, OUTPUT_NODE, output)
    }

    /// References an input-node field.
    #[must_use]
    pub fn input(&self, field: &str) -> PortRef {
        PortRef::new(INPUT_NODE, field)
    }

    /// Returns true if a local stage exists.
    #[must_use]
    pub fn has_stage(&self, name: &str) -> bool {
        self.builder.has_stage(name)
    }

    /// Local stage names in insertion order.
    #[must_use]
    pub fn stage_names(&self) -> &[String] {
        self.builder.stage_names()
    }

    pub(crate) fn into_builder(self) -> GraphBuilder {
        self.builder
    }
}

/// Handle to a subgraph inserted into a graph under a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubgraphHandle {
    prefix: String,
}

impl SubgraphHandle {
    pub(crate) fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The namespace prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Qualified name of the input node.
    #[must_use]
    pub fn input_node(&self) -> String {
        format!("{}.{INPUT_NODE}", self.prefix)
    }

    /// Qualified name of the output node.
    #[must_use]
    pub fn output_node(&self) -> String {
        format!("{}.{OUTPUT_NODE}", self.prefix)
    }

    /// Qualified name of an inner stage.
    #[must_use]
    pub fn stage(&self, local: &str) -> String {
        format!("{}.{local}", self.prefix)
    }

    /// References an output-node field.
    #[must_use]
    pub fn output(&self, field: &str) -> PortRef {
        PortRef::new(self.output_node(), field)
    }
}
