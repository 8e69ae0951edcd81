//! Failure tolerance for graph execution.
//!
//! A failed stage marks every downstream stage skipped; unrelated branches
//! such as sibling echoes keep running unless the mode says otherwise.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// How to handle stage failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Record the failure, continue unrelated branches.
    #[default]
    ContinueOnFailure,
    /// Stop scheduling after the first failure.
    FailFast,
}

/// Record of a stage failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Stage name.
    pub stage: String,
    /// Error message, with the executor's context chain.
    pub error: String,
    /// Executor that failed.
    pub executor: String,
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
    /// Additional context.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl FailureRecord {
    /// Creates a new failure record.
    #[must_use]
    pub fn new(stage: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            error: error.into(),
            executor: String::new(),
            timestamp: Utc::now(),
            context: BTreeMap::new(),
        }
    }

    /// Sets the executor.
    #[must_use]
    pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = executor.into();
        self
    }

    /// Adds context.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// Counts and failures of one graph execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureSummary {
    /// Total number of stages.
    pub total_stages: usize,
    /// Stages that completed.
    pub completed_stages: usize,
    /// Stages that failed.
    pub failed_stages: usize,
    /// Stages skipped because an upstream stage failed or scheduling stopped.
    pub skipped_stages: usize,
    /// Failure records in the order they occurred.
    pub failures: Vec<FailureRecord>,
}

impl FailureSummary {
    /// Fraction of stages that completed.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_stages == 0 {
            return 0.0;
        }
        self.completed_stages as f64 / self.total_stages as f64
    }

    /// True if any stage failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Collects failures while a graph executes.
#[derive(Debug)]
pub struct FailureCollector {
    /// Failure mode.
    pub mode: FailureMode,
    failures: Vec<FailureRecord>,
    failed: HashSet<String>,
    completed: HashSet<String>,
    skipped: HashSet<String>,
}

impl FailureCollector {
    /// Creates a new collector.
    #[must_use]
    pub fn new(mode: FailureMode) -> Self {
        Self {
            mode,
            failures: Vec::new(),
            failed: HashSet::new(),
            completed: HashSet::new(),
            skipped: HashSet::new(),
        }
    }

    /// Records a stage failure.
    pub fn record_failure(&mut self, record: FailureRecord) {
        self.failed.insert(record.stage.clone());
        self.failures.push(record);
    }

    /// Records a stage completion.
    pub fn record_completion(&mut self, stage: &str) {
        self.completed.insert(stage.to_string());
    }

    /// Records a skipped stage.
    pub fn record_skip(&mut self, stage: &str) {
        self.skipped.insert(stage.to_string());
    }

    /// True if the stage has failed.
    #[must_use]
    pub fn has_failed(&self, stage: &str) -> bool {
        self.failed.contains(stage)
    }

    /// True if the stage was skipped.
    #[must_use]
    pub fn was_skipped(&self, stage: &str) -> bool {
        self.skipped.contains(stage)
    }

    /// True once scheduling must stop.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        match self.mode {
            FailureMode::FailFast => !self.failures.is_empty(),
            FailureMode::ContinueOnFailure => false,
        }
    }

    /// True if a stage whose upstream stages are `dependencies` may run.
    #[must_use]
    pub fn can_run(&self, dependencies: &[&str]) -> bool {
        if self.should_stop() {
            return false;
        }
        !dependencies
            .iter()
            .any(|dep| self.failed.contains(*dep) || self.skipped.contains(*dep))
    }

    /// Summarises the execution.
    #[must_use]
    pub fn summary(&self, total_stages: usize) -> FailureSummary {
        FailureSummary {
            total_stages,
            completed_stages: self.completed.len(),
            failed_stages: self.failed.len(),
            skipped_stages: self.skipped.len(),
            failures: self.failures.clone(),
        }
    }

    /// All failures so far.
    #[must_use]
    pub fn failures(&self) -> &[FailureRecord] {
        &self.failures
    }
}

impl Default for FailureCollector {
    fn default() -> Self {
        Self::new(FailureMode::default())
    }
}
