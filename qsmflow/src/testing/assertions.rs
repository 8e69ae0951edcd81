//! Assertions over composed graphs and execution reports.
//!
//! Failure messages list what the graph actually holds, which is usually
//! what you need when a wiring test breaks.

use crate::backend::ExecutionReport;
use crate::graph::{PipelineGraph, PortRef};

/// Asserts an edge between two ports, ignoring element selection.
pub fn assert_edge(graph: &PipelineGraph, from_stage: &str, from_port: &str, to_stage: &str, to_port: &str) {
    assert!(
        graph.has_edge(from_stage, from_port, to_stage, to_port),
        "expected edge {from_stage}.{from_port} -> {to_stage}.{to_port}; {to_stage}.{to_port} is fed by {:?}",
        graph
            .edges_into(to_stage, to_port)
            .map(|e| e.from.to_string())
            .collect::<Vec<_>>()
    );
}

/// Asserts that a stage exists.
pub fn assert_stage(graph: &PipelineGraph, name: &str) {
    assert!(
        graph.contains(name),
        "expected stage '{name}' in {}; stages: {:?}",
        graph.name(),
        graph.stage_names().collect::<Vec<_>>()
    );
}

/// Asserts that no stage uses an executor.
pub fn assert_no_executor(graph: &PipelineGraph, executor: &str) {
    let users: Vec<&str> = graph
        .stages_with_executor(executor)
        .into_iter()
        .map(|s| s.name.as_str())
        .collect();
    assert!(users.is_empty(), "expected no '{executor}' stages, found {users:?}");
}

/// Asserts where a declared output comes from.
pub fn assert_output_source(graph: &PipelineGraph, output: &str, expected: &PortRef) {
    let declared = graph.declared_output(output).unwrap_or_else(|| {
        panic!(
            "no declared output '{output}'; declared: {:?}",
            graph.declared_outputs().iter().map(|o| &o.name).collect::<Vec<_>>()
        )
    });
    assert_eq!(&declared.source, expected, "source of output '{output}'");
}

/// Asserts that every stage of a run completed.
pub fn assert_report_succeeded(report: &ExecutionReport) {
    assert!(
        report.is_success(),
        "run of {} did not succeed: {} failed, {} skipped, failures: {:?}",
        report.graph,
        report.summary.failed_stages,
        report.summary.skipped_stages,
        report
            .summary
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.stage, f.error))
            .collect::<Vec<_>>()
    );
}
