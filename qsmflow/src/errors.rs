//! Error types for qsmflow.
//!
//! Failures come in three severities. Fatal errors are [`QsmflowError`] values
//! and stop planning. Downgrades are warnings returned next to a successful
//! resolution (see [`crate::params::Downgrade`]). Stage failures happen at
//! execution time and are reported by a back-end as
//! [`crate::backend::FailureRecord`]s.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Contract error codes attached to graph validation errors.
pub mod codes {
    /// An edge references a stage that does not exist.
    pub const MISSING_STAGE: &str = "GRAPH-MISSING-STAGE";
    /// An edge references a port that the stage does not declare.
    pub const MISSING_PORT: &str = "GRAPH-MISSING-PORT";
    /// Two stages share a name.
    pub const DUPLICATE: &str = "GRAPH-DUPLICATE";
    /// A single-valued input received a second edge.
    pub const CARDINALITY: &str = "GRAPH-CARDINALITY";
    /// The graph contains a dependency cycle.
    pub const CYCLE: &str = "GRAPH-CYCLE";
    /// The graph has no stages.
    pub const EMPTY: &str = "GRAPH-EMPTY";
    /// A required input has no incoming edge.
    pub const UNCONNECTED: &str = "GRAPH-UNCONNECTED";
}

/// The main error type for qsmflow operations.
#[derive(Debug, Error)]
pub enum QsmflowError {
    /// The requested configuration cannot be satisfied.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Nothing matched the requested inputs.
    #[error("No inputs found: {0}")]
    NoInputs(String),

    /// The input tree violates the BIDS layout contract.
    #[error("Invalid BIDS layout: {0}")]
    BadBids(String),

    /// A pipeline graph validation error occurred.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// A cycle was detected in the pipeline graph.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// A subgraph builder was asked to wire a stage whose inputs are absent.
    #[error("Graph builder error: {0}")]
    Builder(String),

    /// A run produced no requested outputs after downgrades.
    #[error("Nothing to reconstruct for run '{0}'")]
    NoOutputs(String),

    /// A stage failed during execution.
    #[error("Stage '{stage}' failed: {message}")]
    StageFailure {
        /// The failing stage.
        stage: String,
        /// The failure message.
        message: String,
    },

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for QsmflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl QsmflowError {
    /// Process exit code for this error class.
    ///
    /// Configuration errors, input layout errors and stage failures each get
    /// a distinct code so wrappers can tell them apart.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::NoInputs(_) | Self::BadBids(_) | Self::NoOutputs(_) => 3,
            Self::StageFailure { .. } => 4,
            Self::Validation(_)
            | Self::CycleDetected(_)
            | Self::Builder(_)
            | Self::Internal(_)
            | Self::Serialization(_)
            | Self::Io(_) => 1,
        }
    }

    /// Creates a configuration error for a field.
    #[must_use]
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config(ConfigError::new(field, message))
    }
}

/// A configuration that cannot be satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{field}: {message}")]
pub struct ConfigError {
    /// The offending option.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Metadata about a contract error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "GRAPH-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when pipeline graph validation fails.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the contract code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}

/// Error raised when a cycle is detected in the pipeline graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in pipeline: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle.
    pub cycle_path: Vec<String>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ContractErrorInfo::new(
            codes::CYCLE,
            format!("Pipeline contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Build subgraphs first, then connect them; never feed a stage from its own consumers.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

impl From<CycleDetectedError> for PipelineValidationError {
    fn from(err: CycleDetectedError) -> Self {
        Self {
            message: err.to_string(),
            stages: err.cycle_path.clone(),
            error_info: Some(err.error_info),
        }
    }
}

/// Provides default suggestions for graph contract error codes.
pub struct ContractSuggestions;

impl ContractSuggestions {
    /// Gets a suggestion for a given error code.
    #[must_use]
    pub fn get(code: &str) -> Option<&'static str> {
        match code {
            codes::CYCLE => Some(
                "Check stage wiring for circular references. \
                 Per-echo chains must only flow towards the averaging barrier.",
            ),
            codes::MISSING_STAGE | codes::MISSING_PORT => Some(
                "Add the stage before connecting to it and check port names for typos.",
            ),
            codes::CARDINALITY => Some(
                "Declare the input as a list port or connect a single upstream output.",
            ),
            codes::UNCONNECTED => Some(
                "The resolver should have disabled the feature needing this input; \
                 do not wire the stage when its input is absent.",
            ),
            codes::EMPTY => Some("Add at least one stage to the graph before building."),
            _ => None,
        }
    }
}
