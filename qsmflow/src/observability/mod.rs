//! Observability: subscriber setup and span attributes for stage runs.

mod tracing;

pub use tracing::{
    init_tracing, LoggingTracingEmitter, NoOpTracingEmitter, RunSpanAttributes, SpanTimer,
    StageSpanAttributes, TracingEmitter, LOG_ENV,
};
