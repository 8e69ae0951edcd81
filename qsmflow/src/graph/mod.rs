//! Pipeline graph model.
//!
//! This module provides:
//! - The static stage schema (`StageSpec`, ports, resource hints)
//! - `GraphBuilder` with incremental validation
//! - `Subgraph` and `SubgraphHandle` for two-phase composition
//! - The frozen `PipelineGraph` with lineage queries and JSON/DOT export

mod builder;
mod dag;
mod hints;
mod spec;
mod subgraph;

pub use builder::GraphBuilder;
pub use dag::PipelineGraph;
pub use hints::ResourceEstimator;
pub use spec::{
    Cardinality, DeclaredOutput, Edge, InputPort, PortRef, ResourceHints, StageSpec,
    IDENTITY_EXECUTOR, SOURCE_EXECUTOR,
};
pub use subgraph::{Subgraph, SubgraphHandle, INPUT_NODE, OUTPUT_NODE};
