//! Structured tracing for planning and graph execution.
//!
//! Runs and stages carry flat attribute maps so any emitter (logs, a JSON
//! collector, a test recorder) sees the same keys.

use crate::core::StageStatus;
use crate::graph::StageSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "QSMFLOW_LOG";

/// Installs the global subscriber.
///
/// The filter comes from `QSMFLOW_LOG` and falls back to `info`. Returns
/// false if a subscriber was already installed.
pub fn init_tracing(json: bool) -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    }
}

/// Span attributes for one graph run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSpanAttributes {
    /// Graph name (the reconstruction unit).
    pub graph: Option<String>,
    /// Run ID.
    pub run_id: Option<String>,
    /// Stage count.
    pub stages: Option<usize>,
    /// Largest single-stage memory hint in GB.
    pub peak_mem_gb: Option<f64>,
    /// Parallelism limit.
    pub max_parallel: Option<usize>,
}

impl RunSpanAttributes {
    /// Creates empty attributes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the graph name.
    #[must_use]
    pub fn with_graph(mut self, name: impl Into<String>) -> Self {
        self.graph = Some(name.into());
        self
    }

    /// Sets the run ID.
    #[must_use]
    pub fn with_run_id(mut self, id: impl Into<String>) -> Self {
        self.run_id = Some(id.into());
        self
    }

    /// Sets stage count and peak memory.
    #[must_use]
    pub fn with_shape(mut self, stages: usize, peak_mem_gb: f64) -> Self {
        self.stages = Some(stages);
        self.peak_mem_gb = Some(peak_mem_gb);
        self
    }

    /// Sets the parallelism limit.
    #[must_use]
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = Some(max_parallel);
        self
    }

    /// Flattens into dotted keys.
    #[must_use]
    pub fn to_attributes(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        if let Some(ref v) = self.graph {
            attrs.insert("run.graph".to_string(), v.clone());
        }
        if let Some(ref v) = self.run_id {
            attrs.insert("run.id".to_string(), v.clone());
        }
        if let Some(v) = self.stages {
            attrs.insert("run.stages".to_string(), v.to_string());
        }
        if let Some(v) = self.peak_mem_gb {
            attrs.insert("run.peak_mem_gb".to_string(), v.to_string());
        }
        if let Some(v) = self.max_parallel {
            attrs.insert("run.max_parallel".to_string(), v.to_string());
        }
        attrs
    }
}

/// Span attributes for one stage execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageSpanAttributes {
    /// Stage name.
    pub stage_name: String,
    /// Stage kind.
    pub stage_kind: Option<String>,
    /// Executor name.
    pub executor: Option<String>,
    /// Memory hint in GB.
    pub mem_gb: Option<f64>,
    /// Stage status.
    pub status: Option<String>,
    /// Duration in milliseconds.
    pub duration_ms: Option<f64>,
    /// Error message if failed.
    pub error: Option<String>,
    /// Output ports produced.
    pub outputs: Vec<String>,
}

impl StageSpanAttributes {
    /// Creates attributes for a stage name.
    #[must_use]
    pub fn new(stage_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            ..Default::default()
        }
    }

    /// Attributes taken from a stage's static schema.
    #[must_use]
    pub fn for_stage(spec: &StageSpec) -> Self {
        Self {
            stage_name: spec.name.clone(),
            stage_kind: Some(spec.kind.to_string()),
            executor: Some(spec.executor.clone()),
            mem_gb: Some(spec.hints.mem_gb),
            ..Default::default()
        }
    }

    /// Sets the stage status.
    #[must_use]
    pub fn with_status(mut self, status: StageStatus) -> Self {
        self.status = Some(status.to_string());
        self
    }

    /// Sets the duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Sets the error.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Sets the produced output ports.
    #[must_use]
    pub fn with_outputs(mut self, outputs: impl IntoIterator<Item = String>) -> Self {
        self.outputs = outputs.into_iter().collect();
        self.outputs.sort();
        self
    }

    /// Flattens into dotted keys.
    #[must_use]
    pub fn to_attributes(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        attrs.insert("stage.name".to_string(), self.stage_name.clone());
        if let Some(ref v) = self.stage_kind {
            attrs.insert("stage.kind".to_string(), v.clone());
        }
        if let Some(ref v) = self.executor {
            attrs.insert("stage.executor".to_string(), v.clone());
        }
        if let Some(v) = self.mem_gb {
            attrs.insert("stage.mem_gb".to_string(), v.to_string());
        }
        if let Some(ref v) = self.status {
            attrs.insert("stage.status".to_string(), v.clone());
        }
        if let Some(v) = self.duration_ms {
            attrs.insert("stage.duration_ms".to_string(), v.to_string());
        }
        if let Some(ref v) = self.error {
            attrs.insert("stage.error".to_string(), v.clone());
        }
        if !self.outputs.is_empty() {
            attrs.insert("stage.outputs".to_string(), self.outputs.join(","));
        }
        attrs
    }
}

/// Simple span timing helper.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a new span timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Finishes the span and returns the duration.
    #[must_use]
    pub fn finish(self) -> f64 {
        self.elapsed_ms()
    }
}

/// Receives span boundaries from the execution back-end.
pub trait TracingEmitter: Send + Sync {
    /// Emits a span start event.
    fn span_start(&self, name: &str, attributes: &HashMap<String, String>);

    /// Emits a span end event.
    fn span_end(&self, name: &str, duration_ms: f64, attributes: &HashMap<String, String>);

    /// Emits an error event.
    fn span_error(&self, name: &str, error: &str, attributes: &HashMap<String, String>);
}

/// No-op tracing emitter.
#[derive(Debug, Clone, Default)]
pub struct NoOpTracingEmitter;

impl TracingEmitter for NoOpTracingEmitter {
    fn span_start(&self, _name: &str, _attributes: &HashMap<String, String>) {}
    fn span_end(&self, _name: &str, _duration_ms: f64, _attributes: &HashMap<String, String>) {}
    fn span_error(&self, _name: &str, _error: &str, _attributes: &HashMap<String, String>) {}
}

/// Emits spans as `tracing` events.
#[derive(Debug, Clone, Default)]
pub struct LoggingTracingEmitter;

impl TracingEmitter for LoggingTracingEmitter {
    fn span_start(&self, name: &str, attributes: &HashMap<String, String>) {
        tracing::debug!(span_name = name, ?attributes, "Span started");
    }

    fn span_end(&self, name: &str, duration_ms: f64, attributes: &HashMap<String, String>) {
        tracing::info!(span_name = name, duration_ms, ?attributes, "Span ended");
    }

    fn span_error(&self, name: &str, error: &str, attributes: &HashMap<String, String>) {
        tracing::error!(span_name = name, error, ?attributes, "Span error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageKind;
    use crate::graph::ResourceHints;

    #[test]
    fn test_run_span_attributes() {
        let attrs = RunSpanAttributes::new()
            .with_graph("sub-1_ses-1")
            .with_run_id("run-123")
            .with_shape(40, 8.5);

        let flat = attrs.to_attributes();
        assert_eq!(flat.get("run.graph"), Some(&"sub-1_ses-1".to_string()));
        assert_eq!(flat.get("run.id"), Some(&"run-123".to_string()));
        assert_eq!(flat.get("run.stages"), Some(&"40".to_string()));
        assert!(!flat.contains_key("run.max_parallel"));
    }

    #[test]
    fn test_stage_span_attributes_from_spec() {
        let spec = StageSpec::new("qsm.inversion.e0", StageKind::Inversion, "rts")
            .with_hints(ResourceHints::default().with_mem_gb(3.0));
        let attrs = StageSpanAttributes::for_stage(&spec)
            .with_status(StageStatus::Ok)
            .with_duration_ms(123.45)
            .with_outputs(["qsm".to_string()]);

        let flat = attrs.to_attributes();
        assert_eq!(flat.get("stage.name"), Some(&"qsm.inversion.e0".to_string()));
        assert_eq!(flat.get("stage.kind"), Some(&"inversion".to_string()));
        assert_eq!(flat.get("stage.executor"), Some(&"rts".to_string()));
        assert_eq!(flat.get("stage.mem_gb"), Some(&"3".to_string()));
        assert_eq!(flat.get("stage.status"), Some(&"ok".to_string()));
        assert_eq!(flat.get("stage.duration_ms"), Some(&"123.45".to_string()));
        assert_eq!(flat.get("stage.outputs"), Some(&"qsm".to_string()));
    }

    #[test]
    fn test_span_timer() {
        let timer = SpanTimer::start("test_span");
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(timer.name(), "test_span");
        let duration = timer.finish();
        assert!(duration >= 10.0);
    }

    #[test]
    fn test_noop_emitter() {
        let emitter = NoOpTracingEmitter;
        emitter.span_start("test", &HashMap::new());
        emitter.span_end("test", 100.0, &HashMap::new());
        emitter.span_error("test", "error", &HashMap::new());
    }
}
