//! Test support for qsmflow.
//!
//! This module provides:
//! - On-disk BIDS fixtures
//! - Assertions over graphs and execution reports

mod assertions;
mod fixtures;

pub use assertions::{
    assert_edge, assert_no_executor, assert_output_source, assert_report_succeeded, assert_stage,
};
pub use fixtures::BidsFixture;
