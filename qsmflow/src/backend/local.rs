//! Local execution back-end.
//!
//! Stages start as soon as every upstream stage has finished. Source and
//! identity stages resolve inline; everything else runs as a spawned task
//! holding a semaphore permit, so at most `max_parallel` executors run at
//! once. A failed stage marks its descendants skipped while unrelated
//! branches continue, unless the failure mode is fail-fast.
//!
//! Port values follow one rule: a one-valued port receives its edge's
//! value, a many-valued port receives the concatenation of its edges (list
//! values are spliced in), and an edge with an element index selects one
//! item of a list value.

use super::executor::{ExecutorRegistry, StageContext, StageExecutor};
use super::failure::{FailureCollector, FailureMode, FailureRecord, FailureSummary};
use crate::core::{StageKind, StageOutput, StageStatus};
use crate::errors::QsmflowError;
use crate::graph::{Cardinality, PipelineGraph, PortRef, StageSpec};
use crate::observability::{
    LoggingTracingEmitter, NoOpTracingEmitter, RunSpanAttributes, SpanTimer, StageSpanAttributes, TracingEmitter,
};
use crate::params::Settings;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Report file written into the graph's work directory.
pub const REPORT_FILE: &str = "report.json";

/// A declared output copied into the output tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedOutput {
    /// Output name.
    pub name: String,
    /// Published file.
    pub path: PathBuf,
    /// Published sidecar, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar: Option<PathBuf>,
}

/// Outcome of one graph run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Run ID.
    pub run_id: String,
    /// Graph name.
    pub graph: String,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: f64,
    /// Per-stage outcome.
    pub stages: BTreeMap<String, StageOutput>,
    /// Counts and failure records.
    pub summary: FailureSummary,
    /// Fraction of stages that completed.
    pub success_rate: f64,
    /// Outputs published into the output tree.
    pub published: Vec<PublishedOutput>,
    /// Declared outputs whose producer did not succeed.
    pub missing_outputs: Vec<String>,
}

impl ExecutionReport {
    /// True when every stage completed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.summary.has_failures() && self.summary.skipped_stages == 0
    }

    /// Outcome of one stage.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageOutput> {
        self.stages.get(name)
    }

    /// Converts the first failure into an error.
    ///
    /// # Errors
    ///
    /// `StageFailure` naming the first failed stage.
    pub fn ensure_success(&self) -> Result<(), QsmflowError> {
        match self.summary.failures.first() {
            Some(record) => Err(QsmflowError::StageFailure {
                stage: record.stage.clone(),
                message: record.error.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Runs pipeline graphs on this machine.
#[derive(Clone)]
pub struct LocalBackend {
    registry: Arc<ExecutorRegistry>,
    work_dir: PathBuf,
    output_dir: Option<PathBuf>,
    max_parallel: usize,
    failure_mode: FailureMode,
    emitter: Arc<dyn TracingEmitter>,
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("work_dir", &self.work_dir)
            .field("output_dir", &self.output_dir)
            .field("max_parallel", &self.max_parallel)
            .field("failure_mode", &self.failure_mode)
            .finish_non_exhaustive()
    }
}

impl LocalBackend {
    /// Creates a back-end writing stage directories below `work_dir`.
    #[must_use]
    pub fn new(registry: Arc<ExecutorRegistry>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            work_dir: work_dir.into(),
            output_dir: None,
            max_parallel: 4,
            failure_mode: FailureMode::default(),
            emitter: Arc::new(LoggingTracingEmitter),
        }
    }

    /// Creates a back-end configured from settings.
    #[must_use]
    pub fn from_settings(settings: &Settings, registry: Arc<ExecutorRegistry>) -> Self {
        let backend = Self::new(registry, settings.work_dir())
            .with_output_dir(settings.output_dir.clone())
            .with_max_parallel(settings.max_parallel)
            .with_failure_mode(settings.failure_mode);
        if settings.quiet {
            backend.quiet()
        } else {
            backend
        }
    }

    /// Publishes declared outputs below `output_dir`.
    #[must_use]
    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(output_dir.into());
        self
    }

    /// Sets the parallelism limit (at least one).
    #[must_use]
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Sets the failure mode.
    #[must_use]
    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Sets the span emitter.
    #[must_use]
    pub fn with_emitter(mut self, emitter: Arc<dyn TracingEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    /// Drops span events; the run summary is still logged.
    #[must_use]
    pub fn quiet(self) -> Self {
        self.with_emitter(Arc::new(NoOpTracingEmitter))
    }

    /// Checks that every executing stage has a registered executor.
    ///
    /// # Errors
    ///
    /// A configuration error listing the missing executors.
    pub fn check(&self, graph: &PipelineGraph) -> Result<(), QsmflowError> {
        let mut missing: Vec<&str> = graph
            .stages()
            .filter(|s| !s.kind.is_structural() && !self.registry.contains(&s.executor))
            .map(|s| s.executor.as_str())
            .collect();
        missing.sort_unstable();
        missing.dedup();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(QsmflowError::config(
                "executors",
                format!("no executor registered for {}", missing.join(", ")),
            ))
        }
    }

    /// Executes a graph, then publishes its declared outputs.
    ///
    /// Stage failures do not make this an error; inspect the report or call
    /// [`ExecutionReport::ensure_success`].
    ///
    /// # Errors
    ///
    /// Missing executors, unwritable directories, or a panicked stage task.
    pub async fn run(&self, graph: &PipelineGraph) -> Result<ExecutionReport, QsmflowError> {
        self.check(graph)?;
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let timer = SpanTimer::start(graph.name());
        let graph_dir = self.work_dir.join(graph.name());
        tokio::fs::create_dir_all(&graph_dir).await?;

        let attrs = RunSpanAttributes::new()
            .with_graph(graph.name())
            .with_run_id(&run_id)
            .with_shape(graph.stage_count(), graph.peak_mem_gb())
            .with_max_parallel(self.max_parallel)
            .to_attributes();
        self.emitter.span_start(graph.name(), &attrs);
        info!(graph = %graph.name(), run_id = %run_id, stages = graph.stage_count(), "Starting graph run");

        let mut scheduler = Scheduler::new(self, graph, &graph_dir);
        scheduler.drive().await?;
        let Scheduler {
            results,
            collector,
            values,
            ..
        } = scheduler;

        let (published, missing_outputs) = match &self.output_dir {
            Some(output_dir) => publish(graph, &graph_dir, output_dir, &results, &values).await?,
            None => (Vec::new(), Vec::new()),
        };

        let summary = collector.summary(graph.stage_count());
        let success_rate = summary.success_rate();
        let duration_ms = timer.finish();
        let report = ExecutionReport {
            run_id,
            graph: graph.name().to_string(),
            started_at,
            duration_ms,
            stages: results,
            summary,
            success_rate,
            published,
            missing_outputs,
        };
        tokio::fs::write(graph_dir.join(REPORT_FILE), serde_json::to_vec_pretty(&report)?).await?;

        if report.summary.has_failures() {
            self.emitter
                .span_error(graph.name(), &format!("{} stage(s) failed", report.summary.failed_stages), &attrs);
        }
        self.emitter.span_end(graph.name(), duration_ms, &attrs);
        info!(
            graph = %graph.name(),
            completed = report.summary.completed_stages,
            failed = report.summary.failed_stages,
            skipped = report.summary.skipped_stages,
            success_rate = report.success_rate,
            published = report.published.len(),
            duration_ms,
            "Graph run finished"
        );
        Ok(report)
    }
}

type StageTask = JoinHandle<(String, StageOutput)>;

/// Mutable state of one run.
struct Scheduler<'a> {
    backend: &'a LocalBackend,
    graph: &'a PipelineGraph,
    graph_dir: &'a Path,
    semaphore: Arc<Semaphore>,
    waiting: HashMap<String, usize>,
    ready: VecDeque<String>,
    active: FuturesUnordered<StageTask>,
    values: HashMap<String, HashMap<String, Value>>,
    results: BTreeMap<String, StageOutput>,
    collector: FailureCollector,
}

impl<'a> Scheduler<'a> {
    fn new(backend: &'a LocalBackend, graph: &'a PipelineGraph, graph_dir: &'a Path) -> Self {
        let waiting: HashMap<String, usize> = graph
            .stage_names()
            .map(|s| (s.to_string(), graph.dependencies(s).len()))
            .collect();
        let ready = graph
            .execution_order()
            .iter()
            .filter(|s| waiting.get(*s) == Some(&0))
            .cloned()
            .collect();
        Self {
            backend,
            graph,
            graph_dir,
            semaphore: Arc::new(Semaphore::new(backend.max_parallel)),
            waiting,
            ready,
            active: FuturesUnordered::new(),
            values: HashMap::new(),
            results: BTreeMap::new(),
            collector: FailureCollector::new(backend.failure_mode),
        }
    }

    async fn drive(&mut self) -> Result<(), QsmflowError> {
        loop {
            while let Some(stage) = self.ready.pop_front() {
                if let Some(output) = self.start(&stage) {
                    self.finish(stage, output);
                }
            }
            let Some(joined) = self.active.next().await else {
                break;
            };
            let (stage, output) =
                joined.map_err(|e| QsmflowError::Internal(format!("stage task did not complete: {e}")))?;
            self.finish(stage, output);
        }
        Ok(())
    }

    /// Resolves inline stages and spawns the rest; returns an outcome for
    /// anything that did not spawn.
    fn start(&mut self, name: &str) -> Option<StageOutput> {
        let graph = self.graph;
        let Some(spec) = graph.stage(name) else {
            return Some(StageOutput::fail(format!("unknown stage '{name}'")));
        };
        let dependencies = graph.dependencies(name);
        if !self.collector.can_run(&dependencies) {
            let reason = if self.collector.should_stop() {
                "run stopped after a failure".to_string()
            } else {
                format!("upstream of '{name}' did not complete")
            };
            return Some(StageOutput::skip(reason));
        }

        let inputs = match resolve_inputs(graph, spec, &self.values) {
            Ok(inputs) => inputs,
            Err(message) => return Some(StageOutput::fail(message)),
        };
        match spec.kind {
            StageKind::Source => {
                return Some(StageOutput::ok(spec.params.clone().into_iter().collect()));
            }
            StageKind::Identity => return Some(StageOutput::ok(inputs)),
            _ => {}
        }

        let Some(executor) = self.backend.registry.get(&spec.executor) else {
            return Some(StageOutput::fail(format!("no executor '{}'", spec.executor)));
        };
        let ctx = StageContext::new(spec.clone(), inputs, self.graph_dir.join(name));
        self.active.push(tokio::spawn(run_stage(
            executor,
            ctx,
            self.semaphore.clone(),
            self.backend.emitter.clone(),
        )));
        None
    }

    fn finish(&mut self, name: String, output: StageOutput) {
        let graph = self.graph;
        match output.status {
            StageStatus::Ok => {
                self.collector.record_completion(&name);
                self.values.insert(name.clone(), output.outputs.clone());
            }
            StageStatus::Fail => {
                let executor = graph.stage(&name).map(|s| s.executor.clone()).unwrap_or_default();
                let message = output.error.clone().unwrap_or_default();
                error!(stage = %name, executor = %executor, error = %message, "Stage failed");
                self.collector.record_failure(
                    FailureRecord::new(&name, message)
                        .with_executor(executor)
                        .with_context("duration_ms", serde_json::json!(output.duration_ms)),
                );
            }
            _ => {
                warn!(stage = %name, reason = output.skip_reason.as_deref().unwrap_or(""), "Stage skipped");
                self.collector.record_skip(&name);
            }
        }

        for dependent in graph.dependents(&name) {
            if let Some(count) = self.waiting.get_mut(dependent) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.ready.push_back(dependent.to_string());
                }
            }
        }
        self.results.insert(name, output);
    }
}

async fn run_stage(
    executor: Arc<dyn StageExecutor>,
    ctx: StageContext,
    semaphore: Arc<Semaphore>,
    emitter: Arc<dyn TracingEmitter>,
) -> (String, StageOutput) {
    let name = ctx.stage.name.clone();
    let Ok(_permit) = semaphore.acquire_owned().await else {
        return (name, StageOutput::fail("scheduler closed"));
    };
    let span = StageSpanAttributes::for_stage(&ctx.stage);
    emitter.span_start(&name, &span.to_attributes());
    let timer = SpanTimer::start(&name);

    let result = match tokio::fs::create_dir_all(&ctx.output_dir).await {
        Ok(()) => executor.execute(&ctx).await,
        Err(e) => Err(anyhow::Error::new(e).context(format!("creating {}", ctx.output_dir.display()))),
    };
    let duration_ms = timer.finish();

    let output = match result {
        Ok(outputs) => {
            let missing = ctx.stage.outputs.iter().find(|port| !outputs.contains_key(*port)).cloned();
            match missing {
                Some(port) => {
                    StageOutput::fail(format!("executor '{}' produced no value for '{port}'", executor.name()))
                }
                None => StageOutput::ok(outputs),
            }
        }
        Err(e) => StageOutput::fail(format!("{e:#}")),
    }
    .with_duration_ms(duration_ms);

    let span = span.with_status(output.status).with_duration_ms(duration_ms);
    match &output.error {
        Some(message) => emitter.span_error(&name, message, &span.with_error(message).to_attributes()),
        None => emitter.span_end(
            &name,
            duration_ms,
            &span.with_outputs(output.outputs.keys().cloned()).to_attributes(),
        ),
    }
    (name, output)
}

fn select(port: &PortRef, values: &HashMap<String, HashMap<String, Value>>) -> Result<Value, String> {
    let produced = values
        .get(&port.stage)
        .and_then(|outputs| outputs.get(&port.port))
        .ok_or_else(|| format!("'{}' produced no value", PortRef::new(&port.stage, &port.port)))?;
    match port.element {
        None => Ok(produced.clone()),
        Some(i) => produced
            .as_array()
            .and_then(|items| items.get(i))
            .cloned()
            .ok_or_else(|| format!("'{port}' is out of range in {produced}")),
    }
}

fn resolve_inputs(
    graph: &PipelineGraph,
    spec: &StageSpec,
    values: &HashMap<String, HashMap<String, Value>>,
) -> Result<HashMap<String, Value>, String> {
    let mut inputs = HashMap::new();
    for port in &spec.inputs {
        let mut gathered = Vec::new();
        for edge in graph.edges_into(&spec.name, &port.name) {
            gathered.push(select(&edge.from, values)?);
        }
        if gathered.is_empty() {
            if spec.kind == StageKind::Identity {
                inputs.insert(port.name.clone(), Value::Array(Vec::new()));
            }
            continue;
        }
        let value = match port.cardinality {
            Cardinality::One => gathered.swap_remove(0),
            Cardinality::Many => {
                let mut list = Vec::new();
                for value in gathered {
                    match value {
                        Value::Array(items) => list.extend(items),
                        other => list.push(other),
                    }
                }
                Value::Array(list)
            }
        };
        inputs.insert(port.name.clone(), value);
    }
    Ok(inputs)
}

async fn publish(
    graph: &PipelineGraph,
    graph_dir: &Path,
    output_dir: &Path,
    results: &BTreeMap<String, StageOutput>,
    values: &HashMap<String, HashMap<String, Value>>,
) -> Result<(Vec<PublishedOutput>, Vec<String>), QsmflowError> {
    let mut published = Vec::new();
    let mut missing = Vec::new();
    for output in graph.declared_outputs() {
        let succeeded = results
            .get(&output.source.stage)
            .is_some_and(StageOutput::is_success);
        let source = if succeeded {
            select(&output.source, values).ok()
        } else {
            None
        };
        let Some(source) = source.as_ref().and_then(Value::as_str).map(PathBuf::from) else {
            warn!(output = %output.name, source = %output.source, "Output not produced");
            missing.push(output.name.clone());
            continue;
        };
        let source = if source.is_relative() {
            graph_dir.join(&output.source.stage).join(source)
        } else {
            source
        };

        let destination = output_dir.join(&output.destination);
        link_or_copy(&source, &destination).await?;
        let sidecar = match (&output.sidecar, output.sidecar_destination()) {
            (Some(content), Some(relative)) => {
                let path = output_dir.join(relative);
                tokio::fs::write(&path, serde_json::to_vec_pretty(content)?).await?;
                Some(path)
            }
            _ => None,
        };
        info!(output = %output.name, path = %destination.display(), "Published output");
        published.push(PublishedOutput {
            name: output.name.clone(),
            path: destination,
            sidecar,
        });
    }
    Ok((published, missing))
}

/// Hardlinks `source` to `destination`, copying when linking fails (for
/// example across file systems).
async fn link_or_copy(source: &Path, destination: &Path) -> Result<(), QsmflowError> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::try_exists(destination).await? {
        tokio::fs::remove_file(destination).await?;
    }
    if tokio::fs::hard_link(source, destination).await.is_err() {
        tokio::fs::copy(source, destination).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DeclaredOutput, GraphBuilder, InputPort};
    use crate::testing::assert_report_succeeded;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Echoes `x` to `y`; fails on one value and can sleep.
    #[derive(Debug, Default)]
    struct Echo {
        fail_on: Option<i64>,
        slow_on: Option<i64>,
        delay_ms: u64,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl StageExecutor for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, ctx: &StageContext) -> anyhow::Result<HashMap<String, Value>> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let x = ctx.input("x").cloned().unwrap_or(Value::Null);
            let delay = if self.slow_on.is_some() && x.as_i64() == self.slow_on {
                self.delay_ms * 4
            } else {
                self.delay_ms
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.fail_on.is_some() && x.as_i64() == self.fail_on {
                anyhow::bail!("cannot echo {x}");
            }
            Ok(HashMap::from([("y".to_string(), x)]))
        }
    }

    #[derive(Debug)]
    struct Collect;

    #[async_trait]
    impl StageExecutor for Collect {
        fn name(&self) -> &str {
            "collect"
        }

        async fn execute(&self, ctx: &StageContext) -> anyhow::Result<HashMap<String, Value>> {
            let items = ctx.input("items").cloned().unwrap_or(Value::Null);
            Ok(HashMap::from([("out".to_string(), items)]))
        }
    }

    /// Writes a file and returns its relative name.
    #[derive(Debug)]
    struct Writer;

    #[async_trait]
    impl StageExecutor for Writer {
        fn name(&self) -> &str {
            "writer"
        }

        async fn execute(&self, ctx: &StageContext) -> anyhow::Result<HashMap<String, Value>> {
            tokio::fs::write(ctx.output_file("chi.nii"), b"volume").await?;
            Ok(HashMap::from([("image".to_string(), json!("chi.nii"))]))
        }
    }

    fn registry(echo: Echo) -> Arc<ExecutorRegistry> {
        let registry = ExecutorRegistry::new();
        registry.register(Arc::new(echo));
        registry.register(Arc::new(Collect));
        registry.register(Arc::new(Writer));
        Arc::new(registry)
    }

    /// inputs.x -> echo.e<i> (x[i]) -> twice.e<i> -> collect
    fn fan_out(n: usize) -> PipelineGraph {
        let mut b = GraphBuilder::new("sub-1");
        let values: Vec<i64> = (0..n as i64).collect();
        b.add_stage(StageSpec::source("inputs", BTreeMap::from([("x".to_string(), json!(values))])))
            .unwrap();
        b.add_stage(
            StageSpec::new("collect", StageKind::Aggregate, "collect")
                .with_input(InputPort::many("items"))
                .with_output("out"),
        )
        .unwrap();
        for i in 0..n {
            for (name, from) in [
                (format!("echo.e{i}"), PortRef::new("inputs", "x").at(i)),
                (format!("twice.e{i}"), PortRef::new(format!("echo.e{i}"), "y")),
            ] {
                b.add_stage(
                    StageSpec::new(&name, StageKind::Preprocess, "echo")
                        .with_input(InputPort::one("x"))
                        .with_output("y"),
                )
                .unwrap();
                b.connect(from, &name, "x").unwrap();
            }
            b.connect(PortRef::new(format!("twice.e{i}"), "y"), "collect", "items").unwrap();
        }
        b.build().unwrap()
    }

    #[tokio::test]
    async fn test_fan_out_and_collect() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(registry(Echo::default()), dir.path());
        let report = backend.run(&fan_out(3)).await.unwrap();

        assert_report_succeeded(&report);
        assert_eq!(report.summary.completed_stages, 8);
        assert_eq!(report.success_rate, 1.0);
        assert_eq!(report.stage("collect").unwrap().get("out"), Some(&json!([0, 1, 2])));
        assert_eq!(report.stage("echo.e1").unwrap().get("y"), Some(&json!(1)));
        assert!(dir.path().join("sub-1").join(REPORT_FILE).exists());
        assert!(dir.path().join("sub-1").join("twice.e2").is_dir());
        assert!(report.ensure_success().is_ok());
    }

    #[tokio::test]
    async fn test_failed_echo_leaves_siblings_running() {
        let dir = tempfile::tempdir().unwrap();
        let echo = Echo {
            fail_on: Some(1),
            ..Echo::default()
        };
        let backend = LocalBackend::new(registry(echo), dir.path());
        let report = backend.run(&fan_out(3)).await.unwrap();

        assert_eq!(report.stage("echo.e1").unwrap().status, StageStatus::Fail);
        assert_eq!(report.stage("twice.e1").unwrap().status, StageStatus::Skip);
        assert_eq!(report.stage("collect").unwrap().status, StageStatus::Skip);
        assert_eq!(report.stage("twice.e0").unwrap().status, StageStatus::Ok);
        assert_eq!(report.stage("twice.e2").unwrap().status, StageStatus::Ok);
        assert_eq!(report.summary.failed_stages, 1);
        assert_eq!(report.summary.skipped_stages, 2);
        assert_eq!(report.summary.failures[0].executor, "echo");
        assert_eq!(report.success_rate, 5.0 / 8.0);

        let err = report.ensure_success().unwrap_err();
        assert_eq!(err.exit_code(), 4);
        assert!(err.to_string().contains("echo.e1"));
    }

    #[derive(Default)]
    struct CountingEmitter {
        events: AtomicUsize,
    }

    impl TracingEmitter for CountingEmitter {
        fn span_start(&self, _name: &str, _attributes: &HashMap<String, String>) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }

        fn span_end(&self, _name: &str, _duration_ms: f64, _attributes: &HashMap<String, String>) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }

        fn span_error(&self, _name: &str, _error: &str, _attributes: &HashMap<String, String>) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_quiet_backend_emits_no_spans() {
        let loud_dir = tempfile::tempdir().unwrap();
        let heard = Arc::new(CountingEmitter::default());
        LocalBackend::new(registry(Echo::default()), loud_dir.path())
            .with_emitter(heard.clone())
            .run(&fan_out(2))
            .await
            .unwrap();
        assert!(heard.events.load(Ordering::SeqCst) > 0);

        let quiet_dir = tempfile::tempdir().unwrap();
        let silenced = Arc::new(CountingEmitter::default());
        let report = LocalBackend::new(registry(Echo::default()), quiet_dir.path())
            .with_emitter(silenced.clone())
            .quiet()
            .run(&fan_out(2))
            .await
            .unwrap();
        assert_report_succeeded(&report);
        assert_eq!(silenced.events.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_quiet_settings_still_run_and_report() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::new(dir.path().join("bids"), dir.path().join("out")).with_quiet(true);
        let backend = LocalBackend::from_settings(&settings, registry(Echo::default()));
        let report = backend.run(&fan_out(1)).await.unwrap();
        assert_report_succeeded(&report);
        assert!(settings.work_dir().join("sub-1").join(REPORT_FILE).exists());
    }

    #[tokio::test]
    async fn test_fail_fast_stops_scheduling() {
        let dir = tempfile::tempdir().unwrap();
        let echo = Echo {
            fail_on: Some(0),
            slow_on: Some(1),
            delay_ms: 25,
            ..Echo::default()
        };
        let backend = LocalBackend::new(registry(echo), dir.path()).with_failure_mode(FailureMode::FailFast);
        let report = backend.run(&fan_out(2)).await.unwrap();

        assert_eq!(report.stage("echo.e0").unwrap().status, StageStatus::Fail);
        assert_eq!(report.stage("echo.e1").unwrap().status, StageStatus::Ok);
        let stopped = report.stage("twice.e1").unwrap();
        assert_eq!(stopped.status, StageStatus::Skip);
        assert_eq!(stopped.skip_reason.as_deref(), Some("run stopped after a failure"));
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let echo = Arc::new(Echo {
            delay_ms: 20,
            ..Echo::default()
        });
        let registry = ExecutorRegistry::new();
        registry.register(echo.clone());
        registry.register(Arc::new(Collect));
        let backend = LocalBackend::new(Arc::new(registry), dir.path()).with_max_parallel(2);
        let report = backend.run(&fan_out(5)).await.unwrap();

        assert!(report.is_success());
        assert!(echo.peak.load(Ordering::SeqCst) <= 2);
        assert!(echo.peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_missing_executor_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(Arc::new(ExecutorRegistry::new()), dir.path());
        let err = backend.run(&fan_out(1)).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("collect"));
    }

    #[tokio::test]
    async fn test_declared_outputs_are_published() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let mut b = GraphBuilder::new("sub-1");
        b.add_stage(StageSpec::new("inversion", StageKind::Inversion, "writer").with_output("image"))
            .unwrap();
        b.add_stage(
            StageSpec::new("broken", StageKind::Inversion, "echo")
                .with_input(InputPort::one("x").optional())
                .with_output("y"),
        )
        .unwrap();
        b.declare_output(
            DeclaredOutput::new("qsm", PortRef::new("inversion", "image"), "qsm/sub-1_Chimap.nii")
                .with_sidecar(json!({"ImageType": ["DERIVED", "QSM"]})),
        )
        .unwrap();
        b.declare_output(DeclaredOutput::new("swi", PortRef::new("broken", "y"), "swi/sub-1_swi.nii"))
            .unwrap();
        let graph = b.build().unwrap();

        let backend = LocalBackend::new(registry(Echo::default()), work.path()).with_output_dir(out.path());
        let report = backend.run(&graph).await.unwrap();

        let published = out.path().join("qsm/sub-1_Chimap.nii");
        assert_eq!(std::fs::read(&published).unwrap(), b"volume");
        let sidecar: Value =
            serde_json::from_slice(&std::fs::read(out.path().join("qsm/sub-1_Chimap.json")).unwrap()).unwrap();
        assert_eq!(sidecar["ImageType"][1], json!("QSM"));
        assert_eq!(report.published.len(), 1);
        // the echo stage got null and returned null, which is not a path
        assert_eq!(report.missing_outputs, vec!["swi".to_string()]);
    }

    #[test]
    fn test_many_ports_splice_lists() {
        let mut b = GraphBuilder::new("g");
        b.add_stage(StageSpec::source(
            "inputs",
            BTreeMap::from([("a".to_string(), json!(["p0", "p1"])), ("b".to_string(), json!("p2"))]),
        ))
        .unwrap();
        b.add_stage(StageSpec::identity("node", &["items", "unused"])).unwrap();
        b.connect(PortRef::new("inputs", "a"), "node", "items").unwrap();
        b.connect(PortRef::new("inputs", "b"), "node", "items").unwrap();
        let graph = b.build().unwrap();

        let values = HashMap::from([(
            "inputs".to_string(),
            HashMap::from([("a".to_string(), json!(["p0", "p1"])), ("b".to_string(), json!("p2"))]),
        )]);
        let inputs = resolve_inputs(&graph, graph.stage("node").unwrap(), &values).unwrap();
        assert_eq!(inputs["items"], json!(["p0", "p1", "p2"]));
        assert_eq!(inputs["unused"], json!([]));

        let out_of_range = select(&PortRef::new("inputs", "a").at(5), &values);
        assert!(out_of_range.is_err());
    }
}
