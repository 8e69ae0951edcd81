//! Core domain model types for qsmflow.
//!
//! This module contains the small vocabulary shared by the graph model and
//! the execution back-end:
//! - Stage status and kind enums
//! - Stage output record

mod output;
mod status;

pub use output::StageOutput;
pub use status::{StageKind, StageStatus};
