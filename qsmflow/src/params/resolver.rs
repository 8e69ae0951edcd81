//! Parameter resolution against a reconstruction unit.
//!
//! Resolution is pure: premade, persisted settings and user overrides are
//! overlaid, hard defaults fill the gaps, coercions make the combination
//! consistent, and the unit's files downgrade whatever they cannot support.
//! Every changed field is reported as a [`Downgrade`]; nothing aborts except
//! an unsatisfiable configuration.

use super::{
    premade, FillingAlgorithm, MaskingAlgorithm, MaskingInput, PartialRunParameters, QsmAlgorithm,
    QsmReference, RunParameters, UnwrappingAlgorithm,
};
use crate::bids::{ReconstructionUnit, VolumeHeader};
use crate::errors::QsmflowError;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Why a field changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DowngradeKind {
    /// The combination of options was inconsistent.
    Coercion,
    /// The unit's files cannot support the option.
    Input,
}

/// A field the resolver changed, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Downgrade {
    /// Parameter name.
    pub field: String,
    /// Value before the change.
    pub from: serde_json::Value,
    /// Value after the change.
    pub to: serde_json::Value,
    /// Human-readable reason.
    pub reason: String,
    /// Coercion or input-driven.
    pub kind: DowngradeKind,
}

/// What the graph builders may rely on for this unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDescriptors {
    /// Echoes reconstructed.
    pub echo_count: usize,
    /// Usable magnitude images: 0, 1 or one per echo.
    pub magnitude_count: usize,
    /// Usable existing masks: 0, 1 or one per echo.
    pub mask_count: usize,
    /// Obliquity of the first phase echo in degrees.
    pub obliquity: f64,
    /// Inputs are resampled to axial.
    pub axial_resampling: bool,
    /// A T1-weighted image exists.
    pub has_t1w: bool,
    /// An existing segmentation is used.
    pub has_segmentation: bool,
}

impl InputDescriptors {
    /// True when any magnitude is usable.
    #[must_use]
    pub fn has_magnitude(&self) -> bool {
        self.magnitude_count > 0
    }

    /// True when there is one magnitude per echo.
    #[must_use]
    pub fn magnitude_per_echo(&self) -> bool {
        self.magnitude_count > 0 && self.magnitude_count == self.echo_count
    }

    /// True when existing masks replace mask generation.
    #[must_use]
    pub fn uses_existing_masks(&self) -> bool {
        self.mask_count > 0
    }
}

/// Resolver output for one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Resolved parameters.
    pub params: RunParameters,
    /// Input descriptors.
    pub inputs: InputDescriptors,
    /// Every change applied after overlay, in order.
    pub warnings: Vec<Downgrade>,
}

struct Recorder<'a> {
    kind: DowngradeKind,
    warnings: &'a mut Vec<Downgrade>,
}

impl Recorder<'_> {
    fn set<T: PartialEq + Serialize>(&mut self, slot: &mut T, value: T, field: &str, reason: &str) -> bool {
        if *slot == value {
            return false;
        }
        let from = serde_json::to_value(&*slot).unwrap_or(serde_json::Value::Null);
        let to = serde_json::to_value(&value).unwrap_or(serde_json::Value::Null);
        warn!(field, %from, %to, reason, "Parameter downgraded");
        self.warnings.push(Downgrade {
            field: field.to_string(),
            from,
            to,
            reason: reason.to_string(),
            kind: self.kind,
        });
        *slot = value;
        true
    }

    fn disable_magnitude_masking(&mut self, p: &mut RunParameters, reason: &str) {
        self.set(&mut p.masking_input, MaskingInput::Phase, "masking_input", reason);
        self.set(&mut p.masking_algorithm, MaskingAlgorithm::Threshold, "masking_algorithm", reason);
        if p.filling_algorithm == FillingAlgorithm::Bet {
            self.set(&mut p.filling_algorithm, FillingAlgorithm::Both, "filling_algorithm", reason);
        }
        self.set(&mut p.add_bet, false, "add_bet", reason);
        self.set(&mut p.inhomogeneity_correction, false, "inhomogeneity_correction", reason);
    }
}

/// Resolves run parameters.
#[derive(Debug, Clone, Default)]
pub struct ParameterResolver {
    persisted: Option<PartialRunParameters>,
}

impl ParameterResolver {
    /// Creates a resolver without persisted settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlays settings persisted by an earlier run.
    #[must_use]
    pub fn with_persisted(mut self, persisted: PartialRunParameters) -> Self {
        self.persisted = Some(persisted);
        self
    }

    /// Overlays premade, persisted and user configuration and validates it.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown premade or a value out
    /// of range.
    pub fn merge(&self, user: &PartialRunParameters) -> Result<PartialRunParameters, QsmflowError> {
        let name = user
            .premade
            .clone()
            .or_else(|| self.persisted.as_ref().and_then(|p| p.premade.clone()))
            .unwrap_or_else(|| "default".to_string());

        let mut merged = premade(&name)
            .ok_or_else(|| QsmflowError::config("premade", format!("unknown premade '{name}'")))?;
        if let Some(persisted) = &self.persisted {
            merged.overlay(persisted);
        }
        merged.overlay(user);
        merged.premade = Some(name);
        merged.validate()?;
        Ok(merged)
    }

    /// Resolves parameters for one unit.
    ///
    /// # Errors
    ///
    /// Configuration errors from [`ParameterResolver::merge`]; a
    /// configuration error when label referencing has no segmentation; an
    /// internal error when coercions fail to reach a fixed point.
    pub fn resolve(
        &self,
        user: &PartialRunParameters,
        unit: &ReconstructionUnit,
    ) -> Result<Resolution, QsmflowError> {
        let merged = self.merge(user)?;
        let mut params = apply_hard_defaults(&merged);
        let mut warnings = Vec::new();

        coerce(&mut params, &mut warnings);
        let inputs = apply_input_downgrades(&mut params, unit, &mut warnings);
        coerce(&mut params, &mut warnings);

        let mut probe = params.clone();
        let mut scratch = Vec::new();
        coerce(&mut probe, &mut scratch);
        if !scratch.is_empty() {
            return Err(QsmflowError::Internal(format!(
                "parameter coercions did not reach a fixed point: {:?}",
                scratch.iter().map(|d| d.field.as_str()).collect::<Vec<_>>()
            )));
        }

        if matches!(params.qsm_reference, QsmReference::Labels(_)) && !params.segmentation_requested() {
            return Err(QsmflowError::config(
                "qsm_reference",
                format!(
                    "label referencing for {} needs do_segmentation or use_existing_segmentations",
                    unit.id()
                ),
            ));
        }

        debug!(unit = %unit.id(), warnings = warnings.len(), "Parameters resolved");
        Ok(Resolution {
            params,
            inputs,
            warnings,
        })
    }
}

/// Completes a merged configuration with the hard defaults.
fn apply_hard_defaults(merged: &PartialRunParameters) -> RunParameters {
    let d = RunParameters::default();
    let qsm_algorithm = merged.qsm_algorithm.unwrap_or(QsmAlgorithm::Rts);
    let masking_algorithm = merged.masking_algorithm.unwrap_or(if qsm_algorithm == QsmAlgorithm::Nextqsm {
        MaskingAlgorithm::Bet
    } else {
        MaskingAlgorithm::Threshold
    });
    // absent means undecided, never "skip unwrapping"
    let unwrapping_algorithm = merged
        .unwrapping_algorithm
        .or_else(|| qsm_algorithm.needs_unwrapping().then_some(UnwrappingAlgorithm::Romeo));

    RunParameters {
        premade: merged.premade.clone().unwrap_or(d.premade),
        qsm_algorithm,
        unwrapping_algorithm,
        bf_algorithm: merged.bf_algorithm.unwrap_or(d.bf_algorithm),
        masking_algorithm,
        masking_input: merged.masking_input.unwrap_or(d.masking_input),
        filling_algorithm: merged.filling_algorithm.unwrap_or(d.filling_algorithm),
        threshold_value: merged.threshold_value.clone().unwrap_or_default(),
        threshold_algorithm: merged.threshold_algorithm.unwrap_or(d.threshold_algorithm),
        threshold_algorithm_factor: merged
            .threshold_algorithm_factor
            .clone()
            .unwrap_or(d.threshold_algorithm_factor),
        mask_erosions: merged.mask_erosions.clone().unwrap_or(d.mask_erosions),
        combine_phase: merged.combine_phase.unwrap_or(d.combine_phase),
        two_pass: merged.two_pass.unwrap_or(d.two_pass),
        inhomogeneity_correction: merged.inhomogeneity_correction.unwrap_or(d.inhomogeneity_correction),
        add_bet: merged.add_bet.unwrap_or(d.add_bet),
        bet_fractional_intensity: merged.bet_fractional_intensity.unwrap_or(d.bet_fractional_intensity),
        qsm_reference: merged.qsm_reference.clone().unwrap_or(d.qsm_reference),
        num_echoes: merged.num_echoes,
        obliquity_threshold: merged.obliquity_threshold.unwrap_or(d.obliquity_threshold),
        do_qsm: merged.do_qsm.unwrap_or(d.do_qsm),
        do_swi: merged.do_swi.unwrap_or(d.do_swi),
        do_t2starmap: merged.do_t2starmap.unwrap_or(d.do_t2starmap),
        do_r2starmap: merged.do_r2starmap.unwrap_or(d.do_r2starmap),
        do_segmentation: merged.do_segmentation.unwrap_or(d.do_segmentation),
        do_analysis: merged.do_analysis.unwrap_or(d.do_analysis),
        use_existing_masks: merged.use_existing_masks.unwrap_or(d.use_existing_masks),
        existing_masks_pipeline: merged
            .existing_masks_pipeline
            .clone()
            .unwrap_or(d.existing_masks_pipeline),
        use_existing_segmentations: merged.use_existing_segmentations.unwrap_or(d.use_existing_segmentations),
        existing_segmentations_pipeline: merged
            .existing_segmentations_pipeline
            .clone()
            .unwrap_or(d.existing_segmentations_pipeline),
        b0_direction: merged.b0_direction.unwrap_or(d.b0_direction),
        rts_tolerance: merged.rts_tolerance.unwrap_or(d.rts_tolerance),
        rts_delta: merged.rts_delta.unwrap_or(d.rts_delta),
        rts_mu: merged.rts_mu.unwrap_or(d.rts_mu),
        tv_lambda: merged.tv_lambda.unwrap_or(d.tv_lambda),
        tgv_iterations: merged.tgv_iterations.unwrap_or(d.tgv_iterations),
        tgv_alphas: merged.tgv_alphas.unwrap_or(d.tgv_alphas),
        tgv_erosions: merged.tgv_erosions.unwrap_or(d.tgv_erosions),
        vsharp_max_radius_mm: merged.vsharp_max_radius_mm.unwrap_or(d.vsharp_max_radius_mm),
    }
}

/// Makes the option combination consistent. One pass reaches the fixed
/// point: each rule only reads fields settled by the rules before it.
fn coerce(p: &mut RunParameters, warnings: &mut Vec<Downgrade>) {
    let mut r = Recorder {
        kind: DowngradeKind::Coercion,
        warnings,
    };

    if p.masking_algorithm == MaskingAlgorithm::Bet {
        r.set(&mut p.masking_input, MaskingInput::Magnitude, "masking_input", "BET masking runs on magnitude");
    }

    if p.qsm_algorithm == QsmAlgorithm::Tgv {
        r.set(&mut p.unwrapping_algorithm, None, "unwrapping_algorithm", "TGV unwraps internally");
    } else if p.combine_phase {
        r.set(
            &mut p.unwrapping_algorithm,
            Some(UnwrappingAlgorithm::Romeo),
            "unwrapping_algorithm",
            "echo combination uses ROMEO",
        );
    }

    if p.masking_algorithm == MaskingAlgorithm::Bet || p.filling_algorithm == FillingAlgorithm::Bet {
        r.set(&mut p.add_bet, false, "add_bet", "the mask is already BET-based");
    }

    let vsharp_family = p.bf_algorithm == super::BfAlgorithm::Vsharp
        && matches!(p.qsm_algorithm, QsmAlgorithm::Rts | QsmAlgorithm::Tv | QsmAlgorithm::Nextqsm);
    if p.masking_algorithm == MaskingAlgorithm::Bet {
        r.set(&mut p.two_pass, false, "two_pass", "two-pass needs threshold masking");
    } else if p.qsm_algorithm == QsmAlgorithm::Nextqsm {
        r.set(&mut p.two_pass, false, "two_pass", "two-pass is not supported with NeXtQSM");
    } else if vsharp_family {
        r.set(&mut p.two_pass, false, "two_pass", "two-pass is not supported with VSHARP");
    }

    if p.inhomogeneity_correction
        && !(p.add_bet || p.masking_input == MaskingInput::Magnitude || p.filling_algorithm == FillingAlgorithm::Bet)
    {
        r.set(
            &mut p.inhomogeneity_correction,
            false,
            "inhomogeneity_correction",
            "no magnitude-based masking step to correct",
        );
    }
}

fn all_same_geometry(headers: &[VolumeHeader], reference: Option<&VolumeHeader>) -> bool {
    reference.map_or(true, |r| headers.iter().all(|h| h.same_geometry(r)))
}

/// Applies the unit-driven downgrades in their fixed order.
fn apply_input_downgrades(
    p: &mut RunParameters,
    unit: &ReconstructionUnit,
    warnings: &mut Vec<Downgrade>,
) -> InputDescriptors {
    let mut r = Recorder {
        kind: DowngradeKind::Input,
        warnings,
    };
    let echoes = unit.echo_count();
    let reference = unit.reference_header();
    let mut magnitude_count = unit.magnitude.len();

    if magnitude_count == 0 {
        let reason = "no magnitude images";
        r.set(&mut p.do_r2starmap, false, "do_r2starmap", reason);
        r.set(&mut p.do_t2starmap, false, "do_t2starmap", reason);
        r.set(&mut p.do_swi, false, "do_swi", reason);
        r.set(&mut p.obliquity_threshold, -1.0, "obliquity_threshold", reason);
        r.disable_magnitude_masking(p, reason);
    } else if magnitude_count != echoes {
        r.disable_magnitude_masking(p, "magnitude and phase counts differ");
    }

    if echoes == 1 {
        let reason = "single echo";
        r.set(&mut p.do_r2starmap, false, "do_r2starmap", reason);
        r.set(&mut p.do_t2starmap, false, "do_t2starmap", reason);
        r.set(&mut p.combine_phase, false, "combine_phase", reason);
    }

    let phase_3d = unit.phase_headers.iter().all(VolumeHeader::is_3d);
    if !all_same_geometry(&unit.phase_headers, reference) || !phase_3d {
        let reason = if phase_3d {
            "phase echoes differ in geometry"
        } else {
            "phase images are not 3-D"
        };
        r.set(&mut p.do_qsm, false, "do_qsm", reason);
        r.set(&mut p.do_swi, false, "do_swi", reason);
    }

    if magnitude_count > 0 {
        let magnitude_3d = unit.magnitude_headers.iter().all(VolumeHeader::is_3d);
        if !all_same_geometry(&unit.magnitude_headers, reference) || !magnitude_3d {
            let reason = if magnitude_3d {
                "magnitude geometry differs from phase"
            } else {
                "magnitude images are not 3-D"
            };
            r.set(&mut p.do_swi, false, "do_swi", reason);
            r.set(&mut p.do_r2starmap, false, "do_r2starmap", reason);
            r.set(&mut p.do_t2starmap, false, "do_t2starmap", reason);
            r.set(&mut p.obliquity_threshold, -1.0, "obliquity_threshold", reason);
            r.disable_magnitude_masking(p, reason);
            magnitude_count = 0;
        }
    }

    let mut mask_count = 0;
    if p.use_existing_masks {
        let masks_3d = unit.mask_headers.iter().all(VolumeHeader::is_3d);
        if unit.masks.is_empty() {
            r.set(&mut p.use_existing_masks, false, "use_existing_masks", "no existing masks found");
        } else if !all_same_geometry(&unit.mask_headers, reference) || !masks_3d {
            let reason = if masks_3d {
                "mask geometry differs from phase"
            } else {
                "masks are not 3-D"
            };
            r.set(&mut p.use_existing_masks, false, "use_existing_masks", reason);
        } else {
            mask_count = unit.masks.len();
            if mask_count != 1 && mask_count != echoes {
                let mut reduced = mask_count;
                r.set(&mut reduced, 1, "existing_masks", "mask count matches neither one nor the echo count");
                mask_count = reduced;
            }
        }
    }

    if mask_count > 0 {
        let reason = "existing masks are used";
        r.set(&mut p.two_pass, false, "two_pass", reason);
        r.set(&mut p.add_bet, false, "add_bet", reason);
        r.set(&mut p.inhomogeneity_correction, false, "inhomogeneity_correction", reason);
    }

    if p.do_segmentation && (unit.t1w.is_none() || magnitude_count == 0) {
        let reason = if unit.t1w.is_none() {
            "no T1-weighted image"
        } else {
            "registration needs magnitude"
        };
        r.set(&mut p.do_segmentation, false, "do_segmentation", reason);
    }
    if p.use_existing_segmentations && unit.segmentation.is_none() {
        r.set(
            &mut p.use_existing_segmentations,
            false,
            "use_existing_segmentations",
            "no existing segmentation found",
        );
    }
    if p.do_analysis && !p.segmentation_requested() {
        r.set(&mut p.do_analysis, false, "do_analysis", "analysis needs a segmentation");
    }

    let obliquity = reference.map_or(0.0, VolumeHeader::obliquity);
    InputDescriptors {
        echo_count: echoes,
        magnitude_count,
        mask_count,
        obliquity,
        axial_resampling: p.obliquity_threshold >= 0.0 && obliquity > p.obliquity_threshold,
        has_t1w: unit.t1w.is_some(),
        has_segmentation: p.use_existing_segmentations && unit.segmentation.is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::BfAlgorithm;
    use pretty_assertions::assert_eq;

    fn header() -> VolumeHeader {
        VolumeHeader::axial([64, 64, 32], [1.0; 3])
    }

    fn unit(echoes: usize, magnitude: bool) -> ReconstructionUnit {
        let mut ru = ReconstructionUnit::new("1", "MEGRE").with_field_strength(3.0);
        for i in 0..echoes {
            ru = ru.with_echo(format!("/bids/p{i}.nii"), 0.012 + 0.008 * i as f64, header());
            if magnitude {
                ru = ru.with_magnitude(format!("/bids/m{i}.nii"), header());
            }
        }
        ru
    }

    fn fields(warnings: &[Downgrade]) -> Vec<&str> {
        warnings.iter().map(|w| w.field.as_str()).collect()
    }

    #[test]
    fn test_default_two_echo_resolution() {
        let res = ParameterResolver::new()
            .resolve(&PartialRunParameters::new(), &unit(2, true))
            .unwrap();
        let p = &res.params;
        assert_eq!(p.qsm_algorithm, QsmAlgorithm::Rts);
        assert_eq!(p.masking_algorithm, MaskingAlgorithm::Threshold);
        assert_eq!(p.unwrapping_algorithm, Some(UnwrappingAlgorithm::Romeo));
        assert_eq!(p.bf_algorithm, BfAlgorithm::Pdf);
        assert_eq!(p.filling_algorithm, FillingAlgorithm::Both);
        assert!(p.two_pass);
        assert!(res.warnings.is_empty());
        assert_eq!(res.inputs.magnitude_count, 2);
        assert!(!res.inputs.axial_resampling);
    }

    #[test]
    fn test_nextqsm_hard_defaults() {
        let user = PartialRunParameters::new().with_qsm_algorithm(QsmAlgorithm::Nextqsm);
        let res = ParameterResolver::new().resolve(&user, &unit(2, true)).unwrap();
        assert_eq!(res.params.masking_algorithm, MaskingAlgorithm::Bet);
        assert_eq!(res.params.masking_input, MaskingInput::Magnitude);
        assert_eq!(res.params.unwrapping_algorithm, Some(UnwrappingAlgorithm::Romeo));
        assert!(!res.params.two_pass);
        assert!(res.warnings.iter().all(|w| w.kind == DowngradeKind::Coercion));
    }

    #[test]
    fn test_tgv_clears_unwrapping() {
        let user = PartialRunParameters {
            qsm_algorithm: Some(QsmAlgorithm::Tgv),
            unwrapping_algorithm: Some(UnwrappingAlgorithm::Laplacian),
            combine_phase: Some(true),
            ..PartialRunParameters::default()
        };
        let res = ParameterResolver::new().resolve(&user, &unit(2, true)).unwrap();
        assert_eq!(res.params.unwrapping_algorithm, None);
        assert!(res.params.combine_phase);
        assert_eq!(fields(&res.warnings), vec!["unwrapping_algorithm"]);
    }

    #[test]
    fn test_absent_unwrapping_resolves_by_family() {
        let user: PartialRunParameters =
            serde_json::from_str(r#"{"qsm_algorithm": "tv", "unwrapping_algorithm": null}"#).unwrap();
        let res = ParameterResolver::new().resolve(&user, &unit(2, true)).unwrap();
        assert_eq!(res.params.unwrapping_algorithm, Some(UnwrappingAlgorithm::Romeo));
        assert!(!fields(&res.warnings).contains(&"unwrapping_algorithm"));

        let tgv = PartialRunParameters::new().with_qsm_algorithm(QsmAlgorithm::Tgv);
        let res = ParameterResolver::new().resolve(&tgv, &unit(2, true)).unwrap();
        assert_eq!(res.params.unwrapping_algorithm, None);

        let opt_out = serde_json::from_str::<PartialRunParameters>(r#"{"unwrapping_algorithm": "none"}"#);
        assert!(opt_out.is_err());
    }

    #[test]
    fn test_combine_phase_forces_romeo() {
        let user = PartialRunParameters {
            unwrapping_algorithm: Some(UnwrappingAlgorithm::Laplacian),
            combine_phase: Some(true),
            ..PartialRunParameters::default()
        };
        let res = ParameterResolver::new().resolve(&user, &unit(2, true)).unwrap();
        assert_eq!(res.params.unwrapping_algorithm, Some(UnwrappingAlgorithm::Romeo));
    }

    #[test]
    fn test_single_echo_phase_only() {
        let user = PartialRunParameters {
            combine_phase: Some(true),
            do_r2starmap: Some(true),
            do_t2starmap: Some(true),
            ..PartialRunParameters::default()
        };
        let res = ParameterResolver::new().resolve(&user, &unit(1, false)).unwrap();
        let p = &res.params;
        assert!(!p.combine_phase);
        assert!(!p.do_r2starmap && !p.do_t2starmap);
        assert!(p.two_pass);
        assert_eq!(p.obliquity_threshold, -1.0);
        assert_eq!(res.inputs.magnitude_count, 0);
        assert!(res.warnings.iter().any(|w| w.field == "combine_phase" && w.kind == DowngradeKind::Input));
    }

    #[test]
    fn test_existing_mask_disables_passes() {
        let ru = unit(2, true).with_mask("/bids/derivatives/m.nii", header());
        let user = PartialRunParameters {
            use_existing_masks: Some(true),
            add_bet: Some(true),
            inhomogeneity_correction: Some(true),
            ..PartialRunParameters::default()
        };
        let res = ParameterResolver::new().resolve(&user, &ru).unwrap();
        assert_eq!(res.inputs.mask_count, 1);
        assert!(!res.params.two_pass);
        assert!(!res.params.add_bet);
        assert!(!res.params.inhomogeneity_correction);
    }

    #[test]
    fn test_odd_mask_count_reduces_to_first() {
        let ru = unit(3, true)
            .with_mask("/m1.nii", header())
            .with_mask("/m2.nii", header());
        let user = PartialRunParameters::new().with_existing_masks(true);
        let res = ParameterResolver::new().resolve(&user, &ru).unwrap();
        assert_eq!(res.inputs.mask_count, 1);
        assert!(res.warnings.iter().any(|w| w.field == "existing_masks"));
    }

    #[test]
    fn test_phase_geometry_mismatch_disables_qsm() {
        let mut ru = unit(2, true);
        ru.phase_headers[1] = VolumeHeader::axial([64, 64, 30], [1.0; 3]);
        let res = ParameterResolver::new()
            .resolve(&PartialRunParameters::new(), &ru)
            .unwrap();
        assert!(!res.params.do_qsm);
    }

    #[test]
    fn test_magnitude_geometry_mismatch_drops_magnitude() {
        let mut ru = unit(2, true);
        ru.magnitude_headers[0].dims = vec![64, 64, 32, 2];
        let user = PartialRunParameters {
            masking_input: Some(MaskingInput::Magnitude),
            do_swi: Some(true),
            ..PartialRunParameters::default()
        };
        let res = ParameterResolver::new().resolve(&user, &ru).unwrap();
        assert_eq!(res.inputs.magnitude_count, 0);
        assert_eq!(res.params.masking_input, MaskingInput::Phase);
        assert!(!res.params.do_swi);
    }

    #[test]
    fn test_label_reference_without_segmentation_is_fatal() {
        let user = PartialRunParameters::new().with_qsm_reference(QsmReference::Labels(vec![16]));
        let err = ParameterResolver::new().resolve(&user, &unit(2, true)).unwrap_err();
        assert!(matches!(err, QsmflowError::Config(ref c) if c.field == "qsm_reference"));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_label_reference_with_unavailable_segmentation_is_fatal() {
        let user = PartialRunParameters {
            do_segmentation: Some(true),
            qsm_reference: Some(QsmReference::Labels(vec![16])),
            ..PartialRunParameters::default()
        };
        // no T1w image, so segmentation is downgraded away
        let err = ParameterResolver::new().resolve(&user, &unit(2, true)).unwrap_err();
        assert!(matches!(err, QsmflowError::Config(_)));

        let ok = ParameterResolver::new()
            .resolve(&user, &unit(2, true).with_t1w("/bids/t1.nii"))
            .unwrap();
        assert!(ok.params.do_segmentation);
    }

    #[test]
    fn test_unknown_premade() {
        let user = PartialRunParameters::new().with_premade("medi");
        let err = ParameterResolver::new().resolve(&user, &unit(1, true)).unwrap_err();
        assert!(matches!(err, QsmflowError::Config(ref c) if c.field == "premade"));
    }

    #[test]
    fn test_persisted_settings_sit_between_premade_and_user() {
        let persisted = PartialRunParameters {
            bf_algorithm: Some(BfAlgorithm::Vsharp),
            two_pass: Some(false),
            ..PartialRunParameters::default()
        };
        let user = PartialRunParameters {
            qsm_algorithm: Some(QsmAlgorithm::Tgv),
            ..PartialRunParameters::default()
        };
        let res = ParameterResolver::new()
            .with_persisted(persisted)
            .resolve(&user, &unit(2, true))
            .unwrap();
        assert_eq!(res.params.bf_algorithm, BfAlgorithm::Vsharp);
        assert_eq!(res.params.qsm_algorithm, QsmAlgorithm::Tgv);
        assert!(!res.params.two_pass);
    }

    #[test]
    fn test_resolver_is_idempotent() {
        let configs = [
            PartialRunParameters::new(),
            PartialRunParameters::new().with_qsm_algorithm(QsmAlgorithm::Nextqsm),
            PartialRunParameters::new().with_combine_phase(true),
            PartialRunParameters::new().with_premade("fast"),
            PartialRunParameters::new().with_qsm_algorithm(QsmAlgorithm::Tgv),
        ];
        let resolver = ParameterResolver::new();
        for ru in [unit(2, true), unit(1, false), unit(3, true)] {
            for config in &configs {
                let first = resolver.resolve(config, &ru).unwrap();
                let second = resolver
                    .resolve(&PartialRunParameters::from(&first.params), &ru)
                    .unwrap();
                assert_eq!(first.params, second.params);
                assert_eq!(first.inputs, second.inputs);
            }
        }
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let user = PartialRunParameters::new().with_combine_phase(true);
        let a = ParameterResolver::new().resolve(&user, &unit(1, false)).unwrap();
        let b = ParameterResolver::new().resolve(&user, &unit(1, false)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_downgrades_of_smaller_config_are_a_subsequence() {
        let ru = unit(2, false);
        let small = PartialRunParameters {
            do_swi: Some(true),
            ..PartialRunParameters::default()
        };
        let large = PartialRunParameters {
            do_swi: Some(true),
            do_r2starmap: Some(true),
            do_t2starmap: Some(true),
            masking_input: Some(MaskingInput::Magnitude),
            ..PartialRunParameters::default()
        };
        let resolver = ParameterResolver::new();
        let w_small = fields(&resolver.resolve(&small, &ru).unwrap().warnings)
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let w_large: Vec<String> = resolver
            .resolve(&large, &ru)
            .unwrap()
            .warnings
            .into_iter()
            .map(|w| w.field)
            .filter(|f| w_small.contains(f))
            .collect();
        assert_eq!(w_small, w_large);
    }
}
