//! Voxel-wise kernels with exact numeric definitions.
//!
//! Everything here operates on 3-D `ndarray` volumes; masks are `u8`
//! volumes holding 0 or 1. External tools (unwrapping, background removal,
//! inversion) are not implemented here; they run as executor stages.

mod combine;
mod io;
mod morphology;
mod phase;
mod quality;
mod threshold;

pub use combine::{
    l2_magnitude, label_region, mask_union, merge_two_pass, nonzero_average, reference_to_region,
    MergeRule,
};
pub use io::{read_mask, read_volume, write_mask, write_volume};
pub use morphology::{dilate, erode, fill_holes, fill_small_holes, gaussian_fill, gaussian_smooth, GaussianFill};
pub use phase::{
    boundary_fraction, filename_seed, frequency_from_normalized, frequency_to_phase,
    normalize_frequency, normalize_phase, scale_phase, GAMMA_HZ_PER_T, MICRORAD_SCALE, PPM_SCALE,
    TGV_ECHO_TIME,
};
pub use quality::{phase_quality, wrap_to_pi};
pub use threshold::{binarize, gaussian_threshold, otsu_threshold, percentile, trimmed_values, ThresholdRule};

use ndarray::Array3;
use thiserror::Error;

/// Errors raised by volume kernels.
#[derive(Debug, Error)]
pub enum VolumeError {
    /// Two volumes that must share a grid do not.
    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        /// Reference shape.
        expected: Vec<usize>,
        /// Offending shape.
        found: Vec<usize>,
    },

    /// A kernel needing at least one volume received none.
    #[error("no volumes supplied")]
    Empty,

    /// The file holds more than three non-singleton dimensions.
    #[error("expected a 3-D volume, found {0} dimensions")]
    NotThreeD(usize),

    /// NIfTI decoding or encoding failed.
    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),
}

pub(crate) fn check_same_shape(reference: &Array3<f64>, other: &[usize]) -> Result<(), VolumeError> {
    if reference.shape() == other {
        Ok(())
    } else {
        Err(VolumeError::ShapeMismatch {
            expected: reference.shape().to_vec(),
            found: other.to_vec(),
        })
    }
}
