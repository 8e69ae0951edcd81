//! Executor references used by the graph builders.
//!
//! Built-in executors run in-process on the volume kernels; the rest are
//! external tools a back-end maps to commands.

/// Canonical axis reorientation.
pub const REORIENT: &str = "reorient";
/// Complex-valued resampling of oblique acquisitions to axial.
pub const AXIAL_RESAMPLE: &str = "axial_resample";
/// Resampling onto a reference geometry.
pub const RESAMPLE_LIKE: &str = "resample_like";
/// Phase scaling to [−π, π].
pub const SCALE_PHASE: &str = "scale_phase";
/// Multi-echo ROMEO combination into unwrapped phase and a B0 map.
pub const ROMEO_COMBINE: &str = "romeo_combine";
/// ROMEO single-echo unwrapping.
pub const ROMEO: &str = "romeo";
/// Laplacian unwrapping.
pub const LAPLACIAN: &str = "laplacian";
/// Unwrapped phase to normalised field.
pub const NORMALIZE_PHASE: &str = "normalize_phase";
/// Frequency map to normalised field.
pub const NORMALIZE_FREQUENCY: &str = "normalize_frequency";
/// Frequency map to wrapped phase at a fixed echo time.
pub const FREQUENCY_TO_PHASE: &str = "frequency_to_phase";
/// VSHARP background removal.
pub const VSHARP: &str = "vsharp";
/// PDF background removal.
pub const PDF: &str = "pdf";
/// Rapid two-step inversion.
pub const RTS: &str = "rts";
/// Total-variation inversion.
pub const TV: &str = "tv";
/// TGV joint solve.
pub const TGV: &str = "tgv";
/// NeXtQSM inference.
pub const NEXTQSM: &str = "nextqsm";
/// ℓ2 combination of magnitude echoes.
pub const L2_MAGNITUDE: &str = "l2_magnitude";
/// Magnitude bias-field correction.
pub const INHOMOGENEITY: &str = "inhomogeneity_correction";
/// Phase-quality map.
pub const QUALITY_MAP: &str = "quality_map";
/// Thresholding.
pub const THRESHOLD: &str = "threshold";
/// Gaussian hole filling.
pub const GAUSSIAN_FILL: &str = "gaussian_fill";
/// Morphological hole filling.
pub const FILL_HOLES: &str = "fill_holes";
/// Mask erosion.
pub const ERODE: &str = "erode";
/// Brain extraction.
pub const BET: &str = "bet";
/// Voxel-wise mask union.
pub const MASK_UNION: &str = "mask_union";
/// Non-zero average of susceptibility maps.
pub const NONZERO_AVERAGE: &str = "nonzero_average";
/// Two-pass merge.
pub const TWO_PASS_MERGE: &str = "two_pass_merge";
/// Susceptibility referencing.
pub const REFERENCE: &str = "reference";
/// Susceptibility-weighted imaging.
pub const SWI: &str = "swi";
/// T2* mapping.
pub const T2STARMAP: &str = "t2starmap";
/// R2* mapping.
pub const R2STARMAP: &str = "r2starmap";
/// T1w segmentation and registration to the QSM space.
pub const SEGMENTATION: &str = "segmentation";
/// Region statistics.
pub const ANALYSIS: &str = "analysis";

/// Executors implemented in-process.
pub const BUILTIN: [&str; 15] = [
    SCALE_PHASE,
    NORMALIZE_PHASE,
    NORMALIZE_FREQUENCY,
    FREQUENCY_TO_PHASE,
    L2_MAGNITUDE,
    QUALITY_MAP,
    THRESHOLD,
    GAUSSIAN_FILL,
    FILL_HOLES,
    ERODE,
    MASK_UNION,
    NONZERO_AVERAGE,
    TWO_PASS_MERGE,
    REFERENCE,
    REORIENT,
];

/// Executors backed by external tools.
pub const EXTERNAL: [&str; 18] = [
    AXIAL_RESAMPLE,
    RESAMPLE_LIKE,
    ROMEO_COMBINE,
    ROMEO,
    LAPLACIAN,
    VSHARP,
    PDF,
    RTS,
    TV,
    TGV,
    NEXTQSM,
    INHOMOGENEITY,
    BET,
    SWI,
    T2STARMAP,
    R2STARMAP,
    SEGMENTATION,
    ANALYSIS,
];
