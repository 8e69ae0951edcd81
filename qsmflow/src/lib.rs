//! # qsmflow
//!
//! Reconstruction graph builder and local runner for quantitative
//! susceptibility mapping (QSM) pipelines over BIDS data.
//!
//! qsmflow turns a BIDS tree of multi-echo phase (and optionally magnitude)
//! acquisitions into one data-flow graph per reconstruction unit:
//!
//! - **Discovery**: group phase, magnitude, mask and anatomical files by
//!   subject, session, acquisition and run
//! - **Parameter resolution**: overlay premade, persisted and user settings,
//!   then downgrade what the unit's files cannot support
//! - **Graph composition**: masking and susceptibility subgraphs, per-echo
//!   or combined phase, single or two-pass, with declared BIDS derivatives
//! - **Local execution**: bounded-parallel stage execution with failure
//!   isolation and output publishing
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use qsmflow::prelude::*;
//!
//! init_tracing(false);
//! let settings = Settings::new("/data/bids", "/data/derivatives/qsmflow");
//! let planner = Planner::new(settings);
//! let plan = planner.plan()?;
//!
//! let registry = Arc::new(ExecutorRegistry::with_builtins());
//! for executor in external_commands(Path::new("/opt/qsmflow/bin")) {
//!     registry.register(executor);
//! }
//! for report in planner.execute(&plan, registry).await? {
//!     report.ensure_success()?;
//! }
//! ```

#![cfg_attr(not(test), forbid(unsafe_code))]
#![cfg_attr(test, deny(unsafe_code))]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

pub mod backend;
pub mod bids;
pub mod core;
pub mod errors;
pub mod graph;
pub mod observability;
pub mod params;
pub mod planner;
pub mod testing;
pub mod volume;
pub mod workflows;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::{
        external_commands, ExecutionReport, ExecutorRegistry, FailureMode, LocalBackend, StageContext,
        StageExecutor,
    };
    pub use crate::bids::{DiscoveryFilters, ReconstructionUnit, RunDiscoverer};
    pub use crate::core::{StageKind, StageOutput, StageStatus};
    pub use crate::errors::{ConfigError, PipelineValidationError, QsmflowError};
    pub use crate::graph::{GraphBuilder, PipelineGraph, PortRef, StageSpec};
    pub use crate::observability::init_tracing;
    pub use crate::params::{ParameterResolver, PartialRunParameters, RunParameters, Settings};
    pub use crate::planner::{Plan, Planner};
    pub use crate::workflows::ReconstructionComposer;
}
