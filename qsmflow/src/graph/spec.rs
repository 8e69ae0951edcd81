//! Static stage schema: ports, resource hints and executor references.

use crate::core::StageKind;
use crate::errors::PipelineValidationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Executor reference used by [`StageKind::Source`] stages.
pub const SOURCE_EXECUTOR: &str = "source";
/// Executor reference used by [`StageKind::Identity`] stages.
pub const IDENTITY_EXECUTOR: &str = "identity";

/// How many edges an input port accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// Exactly one edge; the port receives that edge's value.
    #[default]
    One,
    /// Any number of edges; values are spliced into one list in edge order.
    Many,
}

/// A typed input port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputPort {
    /// Port name.
    pub name: String,
    /// Edge cardinality.
    #[serde(default)]
    pub cardinality: Cardinality,
    /// Whether the port must be connected for the graph to build.
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl InputPort {
    /// A required single-valued port.
    #[must_use]
    pub fn one(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cardinality: Cardinality::One,
            required: true,
        }
    }

    /// A required list-valued port.
    #[must_use]
    pub fn many(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cardinality: Cardinality::Many,
            required: true,
        }
    }

    /// Marks the port optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Execution hints attached to every stage. The back-end may use them for
/// scheduling; graph construction only annotates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceHints {
    /// Estimated peak memory in GB.
    pub mem_gb: f64,
    /// CPU count.
    pub n_procs: u32,
    /// Wall time limit in hours.
    pub walltime_hours: f64,
}

impl Default for ResourceHints {
    fn default() -> Self {
        Self {
            mem_gb: 1.0,
            n_procs: 1,
            walltime_hours: 1.0,
        }
    }
}

impl ResourceHints {
    /// Creates hints with the given memory estimate.
    #[must_use]
    pub fn with_mem_gb(mut self, mem_gb: f64) -> Self {
        self.mem_gb = mem_gb;
        self
    }

    /// Sets the CPU count.
    #[must_use]
    pub fn with_n_procs(mut self, n_procs: u32) -> Self {
        self.n_procs = n_procs;
        self
    }

    /// Sets the wall time.
    #[must_use]
    pub fn with_walltime_hours(mut self, hours: f64) -> Self {
        self.walltime_hours = hours;
        self
    }
}

/// Specification for a single stage in a pipeline graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// The unique name of the stage.
    pub name: String,
    /// The kind of stage.
    pub kind: StageKind,
    /// Executor reference resolved by a back-end registry.
    pub executor: String,
    /// Declared input ports.
    #[serde(default)]
    pub inputs: Vec<InputPort>,
    /// Declared output ports.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Constant parameters handed to the executor.
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
    /// Resource hints.
    #[serde(default)]
    pub hints: ResourceHints,
}

impl StageSpec {
    /// Creates a new stage specification.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: StageKind, executor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            executor: executor.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            params: BTreeMap::new(),
            hints: ResourceHints::default(),
        }
    }

    /// Creates a source stage emitting constant values.
    ///
    /// Each entry becomes an output port whose value is the entry itself.
    #[must_use]
    pub fn source(name: impl Into<String>, values: BTreeMap<String, serde_json::Value>) -> Self {
        let outputs = values.keys().cloned().collect();
        Self {
            name: name.into(),
            kind: StageKind::Source,
            executor: SOURCE_EXECUTOR.to_string(),
            inputs: Vec::new(),
            outputs,
            params: values,
            hints: ResourceHints::default().with_mem_gb(0.1),
        }
    }

    /// Creates an identity stage with one optional list port per field.
    ///
    /// Every field is both an input and an output port.
    #[must_use]
    pub fn identity(name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            kind: StageKind::Identity,
            executor: IDENTITY_EXECUTOR.to_string(),
            inputs: fields
                .iter()
                .map(|f| InputPort::many(*f).optional())
                .collect(),
            outputs: fields.iter().map(|f| (*f).to_string()).collect(),
            params: BTreeMap::new(),
            hints: ResourceHints::default().with_mem_gb(0.1),
        }
    }

    /// Adds an input port.
    #[must_use]
    pub fn with_input(mut self, port: InputPort) -> Self {
        self.inputs.push(port);
        self
    }

    /// Adds an output port.
    #[must_use]
    pub fn with_output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    /// Adds several output ports.
    #[must_use]
    pub fn with_outputs(mut self, names: &[&str]) -> Self {
        self.outputs.extend(names.iter().map(|n| (*n).to_string()));
        self
    }

    /// Adds a constant parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Sets the resource hints.
    #[must_use]
    pub fn with_hints(mut self, hints: ResourceHints) -> Self {
        self.hints = hints;
        self
    }

    /// Looks up an input port.
    #[must_use]
    pub fn input(&self, name: &str) -> Option<&InputPort> {
        self.inputs.iter().find(|p| p.name == name)
    }

    /// Returns true if the stage declares the output port.
    #[must_use]
    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|o| o == name)
    }

    /// Returns a copy renamed into a namespace (`prefix.name`).
    #[must_use]
    pub fn namespaced(&self, prefix: &str) -> Self {
        let mut spec = self.clone();
        spec.name = format!("{prefix}.{}", self.name);
        spec
    }

    /// Validates the stage specification.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is blank or a port is declared twice.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new("Stage name cannot be empty"));
        }
        for (i, port) in self.inputs.iter().enumerate() {
            if self.inputs[..i].iter().any(|p| p.name == port.name) {
                return Err(PipelineValidationError::new(format!(
                    "Stage '{}' declares input '{}' twice",
                    self.name, port.name
                ))
                .with_stages(vec![self.name.clone()]));
            }
        }
        Ok(())
    }
}

/// A reference to an output port, optionally to one element of a
/// list-valued output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRef {
    /// Producing stage.
    pub stage: String,
    /// Output port name.
    pub port: String,
    /// List element, when only one element of the output is wanted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<usize>,
}

impl PortRef {
    /// References a whole output.
    #[must_use]
    pub fn new(stage: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            port: port.into(),
            element: None,
        }
    }

    /// Narrows the reference to one list element.
    #[must_use]
    pub fn at(mut self, element: usize) -> Self {
        self.element = Some(element);
        self
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.element {
            Some(i) => write!(f, "{}.{}[{i}]", self.stage, self.port),
            None => write!(f, "{}.{}", self.stage, self.port),
        }
    }
}

/// A data edge from an output port to an input port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Producing side.
    pub from: PortRef,
    /// Consuming stage.
    pub to_stage: String,
    /// Consuming port.
    pub to_port: String,
}

/// A named artefact the graph publishes into the output tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclaredOutput {
    /// Output name (`qsm`, `qsm_singlepass`, `swi`, ...).
    pub name: String,
    /// Port producing the file.
    pub source: PortRef,
    /// Destination relative to the output root.
    pub destination: String,
    /// JSON sidecar written next to the destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar: Option<serde_json::Value>,
}

impl DeclaredOutput {
    /// Creates a declared output.
    #[must_use]
    pub fn new(name: impl Into<String>, source: PortRef, destination: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source,
            destination: destination.into(),
            sidecar: None,
        }
    }

    /// Attaches a JSON sidecar.
    #[must_use]
    pub fn with_sidecar(mut self, sidecar: serde_json::Value) -> Self {
        self.sidecar = Some(sidecar);
        self
    }

    /// Destination of the sidecar, if any (`.nii[.gz]` swapped for `.json`).
    #[must_use]
    pub fn sidecar_destination(&self) -> Option<String> {
        self.sidecar.as_ref()?;
        let stem = self
            .destination
            .strip_suffix(".nii.gz")
            .or_else(|| self.destination.strip_suffix(".nii"))
            .unwrap_or(&self.destination);
        Some(format!("{stem}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stage_spec_creation() {
        let spec = StageSpec::new("threshold", StageKind::Mask, "builtin.threshold")
            .with_input(InputPort::one("data"))
            .with_outputs(&["mask", "threshold"])
            .with_param("factor", json!(1.7));

        assert_eq!(spec.name, "threshold");
        assert!(spec.input("data").is_some());
        assert!(spec.has_output("threshold"));
        assert_eq!(spec.params["factor"], json!(1.7));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_duplicate_input_rejected() {
        let spec = StageSpec::new("s", StageKind::Mask, "x")
            .with_input(InputPort::one("data"))
            .with_input(InputPort::many("data"));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_source_and_identity_ports() {
        let mut values = BTreeMap::new();
        values.insert("B0".to_string(), json!(3.0));
        let source = StageSpec::source("inputs", values);
        assert_eq!(source.kind, StageKind::Source);
        assert!(source.has_output("B0"));

        let identity = StageSpec::identity("inputnode", &["phase", "TE"]);
        assert_eq!(identity.kind, StageKind::Identity);
        let phase = identity.input("phase").unwrap();
        assert_eq!(phase.cardinality, Cardinality::Many);
        assert!(!phase.required);
        assert!(identity.has_output("TE"));
    }

    #[test]
    fn test_namespaced_stage() {
        let spec = StageSpec::new("rts.e0", StageKind::Inversion, "inversion.rts");
        assert_eq!(spec.namespaced("qsm").name, "qsm.rts.e0");
    }

    #[test]
    fn test_port_ref_display() {
        assert_eq!(PortRef::new("inputs", "phase").at(1).to_string(), "inputs.phase[1]");
        assert_eq!(PortRef::new("inputs", "B0").to_string(), "inputs.B0");
    }

    #[test]
    fn test_sidecar_destination() {
        let out = DeclaredOutput::new("qsm", PortRef::new("a", "b"), "qsm/sub-1_Chimap.nii.gz")
            .with_sidecar(json!({"ImageType": ["QSM"]}));
        assert_eq!(out.sidecar_destination().as_deref(), Some("qsm/sub-1_Chimap.json"));

        let bare = DeclaredOutput::new("mask", PortRef::new("a", "b"), "mask/m.nii.gz");
        assert!(bare.sidecar_destination().is_none());
    }
}
