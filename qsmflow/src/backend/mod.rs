//! Execution back-ends.
//!
//! This module provides:
//! - The `StageExecutor` trait, stage context and executor registry
//! - Built-in volume executors and external command executors
//! - Failure tolerance (`FailureMode`, `FailureCollector`)
//! - `LocalBackend`, which runs a graph on this machine

mod builtin;
mod command;
mod executor;
mod failure;
mod local;

pub use builtin::all as builtin_executors;
pub use command::{external_commands, CommandExecutor, REQUEST_FILE, RESPONSE_FILE};
pub use executor::{ExecutorRegistry, StageContext, StageExecutor};
pub use failure::{FailureCollector, FailureMode, FailureRecord, FailureSummary};
pub use local::{ExecutionReport, LocalBackend, PublishedOutput, REPORT_FILE};
