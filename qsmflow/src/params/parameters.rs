//! Run parameters, complete and partial.

use super::{
    BfAlgorithm, FillingAlgorithm, MaskingAlgorithm, MaskingInput, QsmAlgorithm, QsmReference,
    ThresholdAlgorithm, UnwrappingAlgorithm,
};
use crate::errors::{ConfigError, QsmflowError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The resolved configuration of one reconstruction unit.
///
/// Fixed before graph construction starts and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParameters {
    /// Premade the parameters started from.
    #[serde(default = "default_premade")]
    pub premade: String,
    /// Dipole inversion family.
    #[serde(default)]
    pub qsm_algorithm: QsmAlgorithm,
    /// Phase unwrapping; `None` means no unwrapping stage.
    ///
    /// After resolution `None` only survives for TGV, which unwraps
    /// internally. Families that need unwrapping (rts, tv, nextqsm) never
    /// resolve to `None`: an unset or `null` value becomes romeo, and there
    /// is no `"none"` spelling to opt out.
    #[serde(default)]
    pub unwrapping_algorithm: Option<UnwrappingAlgorithm>,
    /// Background-field removal for rts and tv.
    #[serde(default)]
    pub bf_algorithm: BfAlgorithm,
    /// Mask generation.
    #[serde(default)]
    pub masking_algorithm: MaskingAlgorithm,
    /// Map driving the threshold branch.
    #[serde(default)]
    pub masking_input: MaskingInput,
    /// Hole filling for the primary pass.
    #[serde(default)]
    pub filling_algorithm: FillingAlgorithm,
    /// Explicit per-pass thresholds; empty means use `threshold_algorithm`.
    #[serde(default)]
    pub threshold_value: Vec<f64>,
    /// Automatic threshold.
    #[serde(default)]
    pub threshold_algorithm: ThresholdAlgorithm,
    /// Per-pass multipliers of the automatic threshold.
    #[serde(default = "default_threshold_factor")]
    pub threshold_algorithm_factor: Vec<f64>,
    /// Per-pass erosion counts.
    #[serde(default = "default_mask_erosions")]
    pub mask_erosions: Vec<usize>,
    /// Combine echoes into one field map before inversion.
    #[serde(default)]
    pub combine_phase: bool,
    /// Run the intermediate pass and merge.
    #[serde(default = "default_true")]
    pub two_pass: bool,
    /// Magnitude bias correction before masking.
    #[serde(default)]
    pub inhomogeneity_correction: bool,
    /// Union a BET mask into the threshold mask.
    #[serde(default)]
    pub add_bet: bool,
    /// BET fractional intensity in (0, 1).
    #[serde(default = "default_bet_fi")]
    pub bet_fractional_intensity: f64,
    /// Reference region.
    #[serde(default)]
    pub qsm_reference: QsmReference,
    /// Echo cap.
    #[serde(default)]
    pub num_echoes: Option<usize>,
    /// Obliquity in degrees above which inputs are resampled to axial; −1 disables.
    #[serde(default = "default_obliquity_threshold")]
    pub obliquity_threshold: f64,
    /// Reconstruct susceptibility.
    #[serde(default = "default_true")]
    pub do_qsm: bool,
    /// Susceptibility-weighted imaging.
    #[serde(default)]
    pub do_swi: bool,
    /// T2* map.
    #[serde(default)]
    pub do_t2starmap: bool,
    /// R2* map.
    #[serde(default)]
    pub do_r2starmap: bool,
    /// Segment the T1-weighted image and register to QSM space.
    #[serde(default)]
    pub do_segmentation: bool,
    /// Region-wise analysis of the final map.
    #[serde(default)]
    pub do_analysis: bool,
    /// Use masks found in derivatives.
    #[serde(default)]
    pub use_existing_masks: bool,
    /// Derivatives pipeline holding masks (`*` for any).
    #[serde(default = "default_any_pipeline")]
    pub existing_masks_pipeline: String,
    /// Use segmentations found in derivatives.
    #[serde(default)]
    pub use_existing_segmentations: bool,
    /// Derivatives pipeline holding segmentations.
    #[serde(default = "default_any_pipeline")]
    pub existing_segmentations_pipeline: String,
    /// Main field direction.
    #[serde(default = "default_b0_direction")]
    pub b0_direction: [f64; 3],
    /// RTS stopping tolerance.
    #[serde(default = "default_rts_tolerance")]
    pub rts_tolerance: f64,
    /// RTS ill-conditioned threshold.
    #[serde(default = "default_rts_delta")]
    pub rts_delta: f64,
    /// RTS regularisation weight.
    #[serde(default = "default_rts_mu")]
    pub rts_mu: f64,
    /// TV regularisation weight.
    #[serde(default = "default_tv_lambda")]
    pub tv_lambda: f64,
    /// TGV iterations.
    #[serde(default = "default_tgv_iterations")]
    pub tgv_iterations: u32,
    /// TGV regularisation weights.
    #[serde(default = "default_tgv_alphas")]
    pub tgv_alphas: [f64; 2],
    /// TGV internal mask erosions.
    #[serde(default = "default_tgv_erosions")]
    pub tgv_erosions: u32,
    /// Largest VSHARP kernel radius in millimetres.
    #[serde(default = "default_vsharp_radius")]
    pub vsharp_max_radius_mm: f64,
}

fn default_premade() -> String {
    "default".to_string()
}

fn default_threshold_factor() -> Vec<f64> {
    vec![1.7, 1.0]
}

fn default_mask_erosions() -> Vec<usize> {
    vec![3, 0]
}

fn default_true() -> bool {
    true
}

fn default_bet_fi() -> f64 {
    0.5
}

fn default_obliquity_threshold() -> f64 {
    10.0
}

fn default_any_pipeline() -> String {
    "*".to_string()
}

fn default_b0_direction() -> [f64; 3] {
    [0.0, 0.0, 1.0]
}

fn default_rts_tolerance() -> f64 {
    1e-4
}

fn default_rts_delta() -> f64 {
    0.15
}

fn default_rts_mu() -> f64 {
    1e5
}

fn default_tv_lambda() -> f64 {
    2e-4
}

fn default_tgv_iterations() -> u32 {
    1000
}

fn default_tgv_alphas() -> [f64; 2] {
    [0.0015, 0.0005]
}

fn default_tgv_erosions() -> u32 {
    3
}

fn default_vsharp_radius() -> f64 {
    18.0
}

impl Default for RunParameters {
    fn default() -> Self {
        Self {
            premade: default_premade(),
            qsm_algorithm: QsmAlgorithm::Rts,
            unwrapping_algorithm: Some(UnwrappingAlgorithm::Romeo),
            bf_algorithm: BfAlgorithm::Pdf,
            masking_algorithm: MaskingAlgorithm::Threshold,
            masking_input: MaskingInput::Phase,
            filling_algorithm: FillingAlgorithm::Both,
            threshold_value: Vec::new(),
            threshold_algorithm: ThresholdAlgorithm::Otsu,
            threshold_algorithm_factor: default_threshold_factor(),
            mask_erosions: default_mask_erosions(),
            combine_phase: false,
            two_pass: true,
            inhomogeneity_correction: false,
            add_bet: false,
            bet_fractional_intensity: default_bet_fi(),
            qsm_reference: QsmReference::None,
            num_echoes: None,
            obliquity_threshold: default_obliquity_threshold(),
            do_qsm: true,
            do_swi: false,
            do_t2starmap: false,
            do_r2starmap: false,
            do_segmentation: false,
            do_analysis: false,
            use_existing_masks: false,
            existing_masks_pipeline: default_any_pipeline(),
            use_existing_segmentations: false,
            existing_segmentations_pipeline: default_any_pipeline(),
            b0_direction: default_b0_direction(),
            rts_tolerance: default_rts_tolerance(),
            rts_delta: default_rts_delta(),
            rts_mu: default_rts_mu(),
            tv_lambda: default_tv_lambda(),
            tgv_iterations: default_tgv_iterations(),
            tgv_alphas: default_tgv_alphas(),
            tgv_erosions: default_tgv_erosions(),
            vsharp_max_radius_mm: default_vsharp_radius(),
        }
    }
}

fn per_pass<T: Copy>(list: &[T], pass: usize) -> Option<T> {
    list.get(pass).or_else(|| list.last()).copied()
}

impl RunParameters {
    /// Explicit threshold of a pass, if any.
    #[must_use]
    pub fn threshold_value_for(&self, pass: usize) -> Option<f64> {
        per_pass(&self.threshold_value, pass)
    }

    /// Threshold multiplier of a pass.
    #[must_use]
    pub fn threshold_factor_for(&self, pass: usize) -> f64 {
        per_pass(&self.threshold_algorithm_factor, pass).unwrap_or(1.0)
    }

    /// Erosion count of a pass.
    #[must_use]
    pub fn erosions_for(&self, pass: usize) -> usize {
        per_pass(&self.mask_erosions, pass).unwrap_or(0)
    }

    /// True when a segmentation will exist for referencing or analysis.
    #[must_use]
    pub fn segmentation_requested(&self) -> bool {
        self.do_segmentation || self.use_existing_segmentations
    }

    /// SHA-256 of the canonical JSON form, hex encoded.
    pub fn fingerprint(&self) -> Result<String, QsmflowError> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

/// A partially specified configuration; `None` fields are unset.
///
/// Field meanings match [`RunParameters`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialRunParameters {
    pub premade: Option<String>,
    pub qsm_algorithm: Option<QsmAlgorithm>,
    /// Unset and `null` both leave the choice to the resolver, which picks
    /// romeo for families that need unwrapping.
    pub unwrapping_algorithm: Option<UnwrappingAlgorithm>,
    pub bf_algorithm: Option<BfAlgorithm>,
    pub masking_algorithm: Option<MaskingAlgorithm>,
    pub masking_input: Option<MaskingInput>,
    pub filling_algorithm: Option<FillingAlgorithm>,
    pub threshold_value: Option<Vec<f64>>,
    pub threshold_algorithm: Option<ThresholdAlgorithm>,
    pub threshold_algorithm_factor: Option<Vec<f64>>,
    pub mask_erosions: Option<Vec<usize>>,
    pub combine_phase: Option<bool>,
    pub two_pass: Option<bool>,
    pub inhomogeneity_correction: Option<bool>,
    pub add_bet: Option<bool>,
    pub bet_fractional_intensity: Option<f64>,
    pub qsm_reference: Option<QsmReference>,
    pub num_echoes: Option<usize>,
    pub obliquity_threshold: Option<f64>,
    pub do_qsm: Option<bool>,
    pub do_swi: Option<bool>,
    pub do_t2starmap: Option<bool>,
    pub do_r2starmap: Option<bool>,
    pub do_segmentation: Option<bool>,
    pub do_analysis: Option<bool>,
    pub use_existing_masks: Option<bool>,
    pub existing_masks_pipeline: Option<String>,
    pub use_existing_segmentations: Option<bool>,
    pub existing_segmentations_pipeline: Option<String>,
    pub b0_direction: Option<[f64; 3]>,
    pub rts_tolerance: Option<f64>,
    pub rts_delta: Option<f64>,
    pub rts_mu: Option<f64>,
    pub tv_lambda: Option<f64>,
    pub tgv_iterations: Option<u32>,
    pub tgv_alphas: Option<[f64; 2]>,
    pub tgv_erosions: Option<u32>,
    pub vsharp_max_radius_mm: Option<f64>,
}

macro_rules! for_each_field {
    ($mac:ident!($($arg:tt)*)) => {
        $mac!($($arg)*;
            premade, qsm_algorithm, unwrapping_algorithm, bf_algorithm, masking_algorithm,
            masking_input, filling_algorithm, threshold_value, threshold_algorithm,
            threshold_algorithm_factor, mask_erosions, combine_phase, two_pass,
            inhomogeneity_correction, add_bet, bet_fractional_intensity, qsm_reference,
            num_echoes, obliquity_threshold, do_qsm, do_swi, do_t2starmap, do_r2starmap,
            do_segmentation, do_analysis, use_existing_masks, existing_masks_pipeline,
            use_existing_segmentations, existing_segmentations_pipeline, b0_direction,
            rts_tolerance, rts_delta, rts_mu, tv_lambda, tgv_iterations, tgv_alphas,
            tgv_erosions, vsharp_max_radius_mm
        )
    };
}

macro_rules! overlay_fields {
    ($dst:ident, $src:ident; $($field:ident),* $(,)?) => {
        $(
            if $src.$field.is_some() {
                $dst.$field = $src.$field.clone();
            }
        )*
    };
}

macro_rules! count_set_fields {
    ($count:ident, $src:ident; $($field:ident),* $(,)?) => {
        $(
            if $src.$field.is_some() {
                $count += 1;
            }
        )*
    };
}

impl PartialRunParameters {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, QsmflowError> {
        serde_json::from_str(json).map_err(|e| QsmflowError::config("config", e.to_string()))
    }

    /// Field-wise overlay: every field set in `other` replaces this one.
    pub fn overlay(&mut self, other: &Self) {
        for_each_field!(overlay_fields!(self, other));
    }

    /// Returns `self` overlaid with `other`.
    #[must_use]
    pub fn overlaid(mut self, other: &Self) -> Self {
        self.overlay(other);
        self
    }

    /// Number of fields set.
    #[must_use]
    pub fn set_field_count(&self) -> usize {
        let mut count = 0;
        for_each_field!(count_set_fields!(count, self));
        count
    }

    /// Sets the dipole inversion family.
    #[must_use]
    pub fn with_qsm_algorithm(mut self, algorithm: QsmAlgorithm) -> Self {
        self.qsm_algorithm = Some(algorithm);
        self
    }

    /// Sets the premade.
    #[must_use]
    pub fn with_premade(mut self, premade: impl Into<String>) -> Self {
        self.premade = Some(premade.into());
        self
    }

    /// Sets echo combination.
    #[must_use]
    pub fn with_combine_phase(mut self, combine: bool) -> Self {
        self.combine_phase = Some(combine);
        self
    }

    /// Sets two-pass reconstruction.
    #[must_use]
    pub fn with_two_pass(mut self, two_pass: bool) -> Self {
        self.two_pass = Some(two_pass);
        self
    }

    /// Sets existing-mask use.
    #[must_use]
    pub fn with_existing_masks(mut self, use_existing: bool) -> Self {
        self.use_existing_masks = Some(use_existing);
        self
    }

    /// Sets the masking algorithm.
    #[must_use]
    pub fn with_masking_algorithm(mut self, algorithm: MaskingAlgorithm) -> Self {
        self.masking_algorithm = Some(algorithm);
        self
    }

    /// Sets the hole filling.
    #[must_use]
    pub fn with_filling_algorithm(mut self, algorithm: FillingAlgorithm) -> Self {
        self.filling_algorithm = Some(algorithm);
        self
    }

    /// Sets the reference region.
    #[must_use]
    pub fn with_qsm_reference(mut self, reference: QsmReference) -> Self {
        self.qsm_reference = Some(reference);
        self
    }

    /// Validates value ranges.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(fi) = self.bet_fractional_intensity {
            if !(fi > 0.0 && fi < 1.0) {
                return Err(ConfigError::new(
                    "bet_fractional_intensity",
                    format!("{fi} is outside (0, 1)"),
                ));
            }
        }
        check_per_pass("threshold_value", self.threshold_value.as_deref())?;
        check_per_pass("threshold_algorithm_factor", self.threshold_algorithm_factor.as_deref())?;
        check_per_pass("mask_erosions", self.mask_erosions.as_deref())?;

        for (field, values) in [
            ("threshold_value", self.threshold_value.as_deref()),
            ("threshold_algorithm_factor", self.threshold_algorithm_factor.as_deref()),
        ] {
            if let Some(v) = values.and_then(|vs| vs.iter().find(|v| !v.is_finite() || **v < 0.0)) {
                return Err(ConfigError::new(field, format!("{v} must be a non-negative number")));
            }
        }
        if self.num_echoes == Some(0) {
            return Err(ConfigError::new("num_echoes", "must be at least 1"));
        }
        Ok(())
    }
}

fn check_per_pass<T>(field: &str, values: Option<&[T]>) -> Result<(), ConfigError> {
    match values {
        Some(v) if v.is_empty() || v.len() > 2 => Err(ConfigError::new(
            field,
            format!("expected one or two per-pass entries, got {}", v.len()),
        )),
        _ => Ok(()),
    }
}

impl From<&RunParameters> for PartialRunParameters {
    fn from(p: &RunParameters) -> Self {
        Self {
            premade: Some(p.premade.clone()),
            qsm_algorithm: Some(p.qsm_algorithm),
            unwrapping_algorithm: p.unwrapping_algorithm,
            bf_algorithm: Some(p.bf_algorithm),
            masking_algorithm: Some(p.masking_algorithm),
            masking_input: Some(p.masking_input),
            filling_algorithm: Some(p.filling_algorithm),
            threshold_value: (!p.threshold_value.is_empty()).then(|| p.threshold_value.clone()),
            threshold_algorithm: Some(p.threshold_algorithm),
            threshold_algorithm_factor: Some(p.threshold_algorithm_factor.clone()),
            mask_erosions: Some(p.mask_erosions.clone()),
            combine_phase: Some(p.combine_phase),
            two_pass: Some(p.two_pass),
            inhomogeneity_correction: Some(p.inhomogeneity_correction),
            add_bet: Some(p.add_bet),
            bet_fractional_intensity: Some(p.bet_fractional_intensity),
            qsm_reference: Some(p.qsm_reference.clone()),
            num_echoes: p.num_echoes,
            obliquity_threshold: Some(p.obliquity_threshold),
            do_qsm: Some(p.do_qsm),
            do_swi: Some(p.do_swi),
            do_t2starmap: Some(p.do_t2starmap),
            do_r2starmap: Some(p.do_r2starmap),
            do_segmentation: Some(p.do_segmentation),
            do_analysis: Some(p.do_analysis),
            use_existing_masks: Some(p.use_existing_masks),
            existing_masks_pipeline: Some(p.existing_masks_pipeline.clone()),
            use_existing_segmentations: Some(p.use_existing_segmentations),
            existing_segmentations_pipeline: Some(p.existing_segmentations_pipeline.clone()),
            b0_direction: Some(p.b0_direction),
            rts_tolerance: Some(p.rts_tolerance),
            rts_delta: Some(p.rts_delta),
            rts_mu: Some(p.rts_mu),
            tv_lambda: Some(p.tv_lambda),
            tgv_iterations: Some(p.tgv_iterations),
            tgv_alphas: Some(p.tgv_alphas),
            tgv_erosions: Some(p.tgv_erosions),
            vsharp_max_radius_mm: Some(p.vsharp_max_radius_mm),
        }
    }
}
