//! Executor trait, stage context and registry.

use crate::graph::StageSpec;
use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything an executor sees for one stage.
///
/// `inputs` holds resolved port values: a single value for one-valued
/// ports, a list for many-valued ports. Unfed optional ports are absent.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Static schema of the stage.
    pub stage: StageSpec,
    /// Resolved input values by port.
    pub inputs: HashMap<String, Value>,
    /// Directory the stage writes into.
    pub output_dir: PathBuf,
}

impl StageContext {
    /// Creates a context.
    #[must_use]
    pub fn new(stage: StageSpec, inputs: HashMap<String, Value>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            stage,
            inputs,
            output_dir: output_dir.into(),
        }
    }

    /// Stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.stage.name
    }

    /// Raw input value.
    #[must_use]
    pub fn input(&self, port: &str) -> Option<&Value> {
        self.inputs.get(port)
    }

    /// True if the port received a value.
    #[must_use]
    pub fn has_input(&self, port: &str) -> bool {
        self.inputs.contains_key(port)
    }

    /// A single file path; a one-element list is accepted.
    pub fn path(&self, port: &str) -> anyhow::Result<PathBuf> {
        let value = self.required(port)?;
        let value = match value {
            Value::Array(items) if items.len() == 1 => &items[0],
            other => other,
        };
        value
            .as_str()
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("input '{port}' of '{}' is not a path: {value}", self.name()))
    }

    /// A list of file paths; a single path becomes a one-element list.
    pub fn paths(&self, port: &str) -> anyhow::Result<Vec<PathBuf>> {
        match self.required(port)? {
            Value::Array(items) => items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(PathBuf::from)
                        .ok_or_else(|| anyhow!("input '{port}' of '{}' holds a non-path: {v}", self.name()))
                })
                .collect(),
            Value::String(s) => Ok(vec![PathBuf::from(s)]),
            other => Err(anyhow!("input '{port}' of '{}' is not a path list: {other}", self.name())),
        }
    }

    /// A number; a one-element list is accepted.
    pub fn number(&self, port: &str) -> anyhow::Result<f64> {
        let value = self.required(port)?;
        let value = match value {
            Value::Array(items) if items.len() == 1 => &items[0],
            other => other,
        };
        value
            .as_f64()
            .ok_or_else(|| anyhow!("input '{port}' of '{}' is not a number: {value}", self.name()))
    }

    /// A typed stage parameter.
    pub fn param<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        let value = self
            .stage
            .params
            .get(key)
            .ok_or_else(|| anyhow!("stage '{}' has no parameter '{key}'", self.name()))?;
        serde_json::from_value(value.clone()).with_context(|| format!("parameter '{key}' of '{}'", self.name()))
    }

    /// A typed stage parameter, `None` when unset.
    pub fn optional_param<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        if self.stage.params.contains_key(key) {
            self.param(key).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Path of a file inside the stage directory.
    #[must_use]
    pub fn output_file(&self, file_name: &str) -> PathBuf {
        self.output_dir.join(file_name)
    }

    /// Output path derived from an input file name with a new suffix.
    #[must_use]
    pub fn derived_file(&self, input: &Path, suffix: &str) -> PathBuf {
        let name = input
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("volume.nii");
        let stem = name
            .strip_suffix(".nii.gz")
            .or_else(|| name.strip_suffix(".nii"))
            .unwrap_or(name);
        self.output_file(&format!("{stem}_{suffix}.nii"))
    }

    fn required(&self, port: &str) -> anyhow::Result<&Value> {
        self.inputs
            .get(port)
            .ok_or_else(|| anyhow!("stage '{}' received nothing on '{port}'", self.name()))
    }
}

/// Runs one kind of stage.
///
/// Returns a value for every output port the stage declares. Errors carry
/// context and become failure records in the back-end.
#[async_trait]
pub trait StageExecutor: Send + Sync + Debug {
    /// Executor name as referenced by stage schemas.
    fn name(&self) -> &str;

    /// Executes a stage.
    async fn execute(&self, ctx: &StageContext) -> anyhow::Result<HashMap<String, Value>>;
}

/// Maps executor names to implementations.
#[derive(Debug, Default)]
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, Arc<dyn StageExecutor>>>,
}

impl ExecutorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding every built-in volume executor.
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for executor in super::builtin::all() {
            registry.register(executor);
        }
        registry
    }

    /// Registers an executor under its own name, replacing any previous one.
    pub fn register(&self, executor: Arc<dyn StageExecutor>) {
        self.executors.write().insert(executor.name().to_string(), executor);
    }

    /// Looks up an executor.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn StageExecutor>> {
        self.executors.read().get(name).cloned()
    }

    /// True if an executor is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.executors.read().contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.read().keys().cloned().collect();
        names.sort();
        names
    }
}
