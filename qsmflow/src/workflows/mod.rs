//! Reconstruction graph builders.
//!
//! This module provides:
//! - The masking subgraph builder
//! - The QSM subgraph builder
//! - `ReconstructionComposer`, which wires one graph per reconstruction unit
//! - The output layout of published derivatives
//!
//! Builders never downgrade: every fallback is decided by the resolver, and
//! a builder asked for something its inputs cannot support returns an error.

pub mod executors;
mod composer;
mod masking;
mod outputs;
mod qsm;


pub use composer::{ReconstructionComposer, INPUTS_STAGE};
pub use masking::{build_masking_graph, MaskingOptions, MASK_INPUTS, MASK_OUTPUTS};
pub use outputs::OutputLayout;
pub use qsm::{build_qsm_graph, QsmOptions, QSM_INPUTS, QSM_OUTPUTS};

use crate::graph::ResourceEstimator;
use crate::params::{InputDescriptors, RunParameters};

/// What every builder reads: resolved parameters, input descriptors and a
/// resource estimator sized for the unit.
#[derive(Debug, Clone, Copy)]
pub struct BuildContext<'a> {
    /// Resolved parameters.
    pub params: &'a RunParameters,
    /// Input descriptors.
    pub inputs: &'a InputDescriptors,
    /// Resource estimator.
    pub estimator: ResourceEstimator,
}

impl<'a> BuildContext<'a> {
    /// Creates a context for volumes of `voxels` voxels.
    #[must_use]
    pub fn new(params: &'a RunParameters, inputs: &'a InputDescriptors, voxels: usize) -> Self {
        Self {
            params,
            inputs,
            estimator: ResourceEstimator::new(voxels, inputs.echo_count),
        }
    }
}
