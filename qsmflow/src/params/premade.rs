//! Premade configurations.

use super::{
    BfAlgorithm, FillingAlgorithm, MaskingAlgorithm, MaskingInput, PartialRunParameters,
    QsmAlgorithm, QsmReference, ThresholdAlgorithm, UnwrappingAlgorithm,
};

/// Names of the built-in premades.
pub const PREMADE_NAMES: [&str; 7] = ["default", "gre", "epi", "bet", "fast", "body", "nextqsm"];

fn base() -> PartialRunParameters {
    PartialRunParameters {
        premade: Some("default".to_string()),
        qsm_algorithm: Some(QsmAlgorithm::Rts),
        bf_algorithm: Some(BfAlgorithm::Pdf),
        masking_input: Some(MaskingInput::Phase),
        threshold_algorithm: Some(ThresholdAlgorithm::Otsu),
        threshold_algorithm_factor: Some(vec![1.7, 1.0]),
        filling_algorithm: Some(FillingAlgorithm::Both),
        mask_erosions: Some(vec![3, 0]),
        two_pass: Some(true),
        combine_phase: Some(false),
        inhomogeneity_correction: Some(false),
        add_bet: Some(false),
        bet_fractional_intensity: Some(0.5),
        qsm_reference: Some(QsmReference::None),
        obliquity_threshold: Some(10.0),
        do_qsm: Some(true),
        do_swi: Some(false),
        do_t2starmap: Some(false),
        do_r2starmap: Some(false),
        do_segmentation: Some(false),
        do_analysis: Some(false),
        ..PartialRunParameters::default()
    }
}

/// Looks up a premade by name.
///
/// `default` leaves the masking and unwrapping algorithms unset so the
/// resolver's hard defaults decide them from the inversion family.
#[must_use]
pub fn premade(name: &str) -> Option<PartialRunParameters> {
    let overrides = match name {
        "default" => PartialRunParameters::default(),
        "gre" => PartialRunParameters {
            masking_algorithm: Some(MaskingAlgorithm::Threshold),
            unwrapping_algorithm: Some(UnwrappingAlgorithm::Romeo),
            threshold_algorithm_factor: Some(vec![1.5, 1.0]),
            ..PartialRunParameters::default()
        },
        "epi" => PartialRunParameters {
            masking_algorithm: Some(MaskingAlgorithm::Threshold),
            masking_input: Some(MaskingInput::Magnitude),
            unwrapping_algorithm: Some(UnwrappingAlgorithm::Romeo),
            inhomogeneity_correction: Some(true),
            two_pass: Some(false),
            threshold_algorithm_factor: Some(vec![1.0]),
            mask_erosions: Some(vec![3]),
            ..PartialRunParameters::default()
        },
        "bet" => PartialRunParameters {
            masking_algorithm: Some(MaskingAlgorithm::Bet),
            masking_input: Some(MaskingInput::Magnitude),
            unwrapping_algorithm: Some(UnwrappingAlgorithm::Romeo),
            two_pass: Some(false),
            mask_erosions: Some(vec![2]),
            ..PartialRunParameters::default()
        },
        "fast" => PartialRunParameters {
            masking_algorithm: Some(MaskingAlgorithm::Threshold),
            masking_input: Some(MaskingInput::Magnitude),
            unwrapping_algorithm: Some(UnwrappingAlgorithm::Laplacian),
            bf_algorithm: Some(BfAlgorithm::Vsharp),
            filling_algorithm: Some(FillingAlgorithm::Gaussian),
            two_pass: Some(false),
            ..PartialRunParameters::default()
        },
        "body" => PartialRunParameters {
            masking_algorithm: Some(MaskingAlgorithm::Threshold),
            qsm_algorithm: Some(QsmAlgorithm::Tv),
            unwrapping_algorithm: Some(UnwrappingAlgorithm::Romeo),
            threshold_algorithm: Some(ThresholdAlgorithm::Gaussian),
            threshold_algorithm_factor: Some(vec![1.0, 1.0]),
            filling_algorithm: Some(FillingAlgorithm::Morphological),
            mask_erosions: Some(vec![0, 0]),
            ..PartialRunParameters::default()
        },
        "nextqsm" => PartialRunParameters {
            qsm_algorithm: Some(QsmAlgorithm::Nextqsm),
            masking_algorithm: Some(MaskingAlgorithm::Bet),
            masking_input: Some(MaskingInput::Magnitude),
            unwrapping_algorithm: Some(UnwrappingAlgorithm::Romeo),
            two_pass: Some(false),
            ..PartialRunParameters::default()
        },
        _ => return None,
    };

    let mut params = base();
    params.overlay(&overrides);
    params.premade = Some(name.to_string());
    Some(params)
}
