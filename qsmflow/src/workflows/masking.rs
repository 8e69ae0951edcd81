//! Mask subgraph.

use super::executors;
use super::BuildContext;
use crate::core::StageKind;
use crate::errors::QsmflowError;
use crate::graph::{InputPort, PortRef, StageSpec, Subgraph};
use crate::params::{FillingAlgorithm, MaskingAlgorithm, MaskingInput, RunParameters};
use serde_json::json;
use tracing::debug;

/// Input-node fields of a mask subgraph.
pub const MASK_INPUTS: [&str; 5] = ["phase", "magnitude", "mask", "quality_map", "TE"];
/// Output-node fields of a mask subgraph.
pub const MASK_OUTPUTS: [&str; 3] = ["mask", "threshold", "quality_map"];

const GAUSSIAN_FILL_SIGMA_MM: f64 = 5.0;

/// Per-pass switches of the mask subgraph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskingOptions {
    /// Fill holes after thresholding.
    pub fill_masks: bool,
    /// Union a BET mask into the result.
    pub add_bet: bool,
    /// Pass index; selects per-pass thresholds and erosions.
    pub pass: usize,
    /// A quality map arrives on the `quality_map` input instead of being
    /// computed.
    pub quality_map_supplied: bool,
}

impl MaskingOptions {
    /// Options of the primary pass.
    #[must_use]
    pub fn primary(params: &RunParameters) -> Self {
        Self {
            fill_masks: true,
            add_bet: params.add_bet && params.filling_algorithm != FillingAlgorithm::Bet,
            pass: 0,
            quality_map_supplied: false,
        }
    }

    /// Options of the intermediate two-pass mask.
    #[must_use]
    pub fn intermediate() -> Self {
        Self {
            fill_masks: false,
            add_bet: false,
            pass: 1,
            quality_map_supplied: false,
        }
    }

    /// Reuses a quality map computed elsewhere.
    #[must_use]
    pub fn with_quality_map_supplied(mut self, supplied: bool) -> Self {
        self.quality_map_supplied = supplied;
        self
    }
}

/// Builds the mask subgraph for one pass.
///
/// Existing masks pass straight through. Otherwise the threshold branch
/// drives a threshold off a phase-quality map or magnitude, fills holes on
/// the primary pass, erodes, and optionally unions a BET mask; the BET
/// branch runs brain extraction on magnitude and erodes.
///
/// # Errors
///
/// Returns a builder error when a magnitude-driven step is requested for a
/// unit without usable magnitude.
pub fn build_masking_graph(ctx: &BuildContext<'_>, options: MaskingOptions) -> Result<Subgraph, QsmflowError> {
    let p = ctx.params;
    let mut g = Subgraph::new(format!("masking.pass{}", options.pass), &MASK_INPUTS, &MASK_OUTPUTS);

    if ctx.inputs.uses_existing_masks() {
        g.expose(g.input("mask"), "mask")?;
        debug!(pass = options.pass, "Mask subgraph passes existing masks through");
        return Ok(g);
    }

    let fill_with_bet = options.fill_masks && p.filling_algorithm == FillingAlgorithm::Bet;
    let wants_magnitude = p.masking_algorithm == MaskingAlgorithm::Bet
        || p.masking_input == MaskingInput::Magnitude
        || options.add_bet
        || fill_with_bet
        || p.inhomogeneity_correction;
    if wants_magnitude && !ctx.inputs.has_magnitude() {
        return Err(QsmflowError::Builder(format!(
            "mask pass {} needs magnitude (masking_algorithm={}, masking_input={}, add_bet={}, filling={}) but none is available",
            options.pass, p.masking_algorithm, p.masking_input, options.add_bet, p.filling_algorithm
        )));
    }
    let magnitude = if wants_magnitude {
        Some(magnitude_map(&mut g, ctx)?)
    } else {
        None
    };

    let erosions = p.erosions_for(options.pass);
    let mask = match (p.masking_algorithm, magnitude) {
        (MaskingAlgorithm::Bet, Some(magnitude)) => {
            let mask = add_bet(&mut g, ctx, "bet", magnitude)?;
            erode(&mut g, ctx, "erode", mask, erosions)?
        }
        (MaskingAlgorithm::Bet, None) => {
            return Err(QsmflowError::Internal("BET branch without magnitude".to_string()));
        }
        (MaskingAlgorithm::Threshold, magnitude) => threshold_branch(&mut g, ctx, options, magnitude, erosions)?,
    };

    g.expose(mask, "mask")?;
    debug!(pass = options.pass, stages = g.stage_names().len(), "Built mask subgraph");
    Ok(g)
}

/// One magnitude map, bias-corrected when requested: the ℓ2 combination of
/// all echoes when the phase is combined too, otherwise the first echo.
fn magnitude_map(g: &mut Subgraph, ctx: &BuildContext<'_>) -> Result<PortRef, QsmflowError> {
    let mut magnitude = if ctx.params.combine_phase && ctx.inputs.magnitude_count > 1 {
        g.add_stage(
            StageSpec::new("combine_magnitude", StageKind::Combine, executors::L2_MAGNITUDE)
                .with_input(InputPort::many("magnitude"))
                .with_output("magnitude")
                .with_hints(ctx.estimator.multi_echo()),
        )?;
        g.connect(g.input("magnitude"), "combine_magnitude", "magnitude")?;
        PortRef::new("combine_magnitude", "magnitude")
    } else {
        g.input("magnitude").at(0)
    };

    if ctx.params.inhomogeneity_correction {
        g.add_stage(
            StageSpec::new("correct_inhomogeneity", StageKind::Mask, executors::INHOMOGENEITY)
                .with_input(InputPort::one("magnitude"))
                .with_output("magnitude")
                .with_hints(ctx.estimator.light().with_walltime_hours(2.0)),
        )?;
        g.connect(magnitude, "correct_inhomogeneity", "magnitude")?;
        magnitude = PortRef::new("correct_inhomogeneity", "magnitude");
    }
    Ok(magnitude)
}

fn threshold_branch(
    g: &mut Subgraph,
    ctx: &BuildContext<'_>,
    options: MaskingOptions,
    magnitude: Option<PortRef>,
    erosions: usize,
) -> Result<PortRef, QsmflowError> {
    let p = ctx.params;
    let driver = match (p.masking_input, &magnitude) {
        (MaskingInput::Magnitude, Some(magnitude)) => magnitude.clone(),
        (MaskingInput::Magnitude, None) => {
            return Err(QsmflowError::Internal("magnitude driver without magnitude".to_string()));
        }
        (MaskingInput::Phase, _) => {
            let quality_map = if options.quality_map_supplied {
                g.input("quality_map").at(0)
            } else {
                g.add_stage(
                    StageSpec::new("quality_map", StageKind::Mask, executors::QUALITY_MAP)
                        .with_input(InputPort::many("phase"))
                        .with_input(InputPort::many("magnitude").optional())
                        .with_output("quality_map")
                        .with_hints(ctx.estimator.multi_echo()),
                )?;
                g.connect(g.input("phase"), "quality_map", "phase")?;
                if ctx.inputs.has_magnitude() {
                    g.connect(g.input("magnitude"), "quality_map", "magnitude")?;
                }
                PortRef::new("quality_map", "quality_map")
            };
            g.expose(quality_map.clone(), "quality_map")?;
            quality_map
        }
    };

    let mut threshold = StageSpec::new("threshold", StageKind::Mask, executors::THRESHOLD)
        .with_input(InputPort::one("data"))
        .with_outputs(&["mask", "threshold"])
        .with_hints(ctx.estimator.light());
    threshold = match p.threshold_value_for(options.pass) {
        Some(value) => threshold.with_param("threshold_value", json!(value)),
        None => threshold
            .with_param("threshold_algorithm", json!(p.threshold_algorithm))
            .with_param("factor", json!(p.threshold_factor_for(options.pass))),
    };
    g.add_stage(threshold)?;
    g.connect(driver, "threshold", "data")?;
    g.expose(PortRef::new("threshold", "threshold"), "threshold")?;

    let mut mask = PortRef::new("threshold", "mask");
    if options.fill_masks {
        mask = fill(g, ctx, mask, magnitude.as_ref())?;
    }
    mask = erode(g, ctx, "erode", mask, erosions)?;

    if options.add_bet {
        let Some(magnitude) = magnitude else {
            return Err(QsmflowError::Internal("add_bet without magnitude".to_string()));
        };
        let bet = add_bet(g, ctx, "bet", magnitude)?;
        let bet = erode(g, ctx, "erode_bet", bet, erosions)?;
        g.add_stage(
            StageSpec::new("mask_union", StageKind::Mask, executors::MASK_UNION)
                .with_input(InputPort::many("masks"))
                .with_output("mask")
                .with_hints(ctx.estimator.light()),
        )?;
        g.connect(mask, "mask_union", "masks")?;
        g.connect(bet, "mask_union", "masks")?;
        mask = PortRef::new("mask_union", "mask");
    }
    Ok(mask)
}

fn fill(
    g: &mut Subgraph,
    ctx: &BuildContext<'_>,
    mask: PortRef,
    magnitude: Option<&PortRef>,
) -> Result<PortRef, QsmflowError> {
    match ctx.params.filling_algorithm {
        FillingAlgorithm::Gaussian => gaussian_fill(g, ctx, mask),
        FillingAlgorithm::Morphological => fill_holes(g, ctx, mask),
        FillingAlgorithm::Both => {
            let smoothed = gaussian_fill(g, ctx, mask)?;
            fill_holes(g, ctx, smoothed)
        }
        FillingAlgorithm::Bet => {
            let magnitude = magnitude
                .cloned()
                .ok_or_else(|| QsmflowError::Internal("BET filling without magnitude".to_string()))?;
            add_bet(g, ctx, "bet", magnitude)
        }
    }
}

fn gaussian_fill(g: &mut Subgraph, ctx: &BuildContext<'_>, mask: PortRef) -> Result<PortRef, QsmflowError> {
    g.add_stage(
        StageSpec::new("gaussian_fill", StageKind::Mask, executors::GAUSSIAN_FILL)
            .with_input(InputPort::one("mask"))
            .with_output("mask")
            .with_param("sigma_mm", json!(GAUSSIAN_FILL_SIGMA_MM))
            .with_hints(ctx.estimator.light()),
    )?;
    g.connect(mask, "gaussian_fill", "mask")?;
    Ok(PortRef::new("gaussian_fill", "mask"))
}

fn fill_holes(g: &mut Subgraph, ctx: &BuildContext<'_>, mask: PortRef) -> Result<PortRef, QsmflowError> {
    g.add_stage(
        StageSpec::new("fill_holes", StageKind::Mask, executors::FILL_HOLES)
            .with_input(InputPort::one("mask"))
            .with_output("mask")
            .with_hints(ctx.estimator.light()),
    )?;
    g.connect(mask, "fill_holes", "mask")?;
    Ok(PortRef::new("fill_holes", "mask"))
}

fn add_bet(g: &mut Subgraph, ctx: &BuildContext<'_>, name: &str, magnitude: PortRef) -> Result<PortRef, QsmflowError> {
    g.add_stage(
        StageSpec::new(name, StageKind::Mask, executors::BET)
            .with_input(InputPort::one("magnitude"))
            .with_output("mask")
            .with_param("fractional_intensity", json!(ctx.params.bet_fractional_intensity))
            .with_hints(ctx.estimator.bet()),
    )?;
    g.connect(magnitude, name, "magnitude")?;
    Ok(PortRef::new(name, "mask"))
}

/// Erodes a mask; zero iterations adds nothing.
fn erode(
    g: &mut Subgraph,
    ctx: &BuildContext<'_>,
    name: &str,
    mask: PortRef,
    iterations: usize,
) -> Result<PortRef, QsmflowError> {
    if iterations == 0 {
        return Ok(mask);
    }
    g.add_stage(
        StageSpec::new(name, StageKind::Mask, executors::ERODE)
            .with_input(InputPort::one("mask"))
            .with_output("mask")
            .with_param("iterations", json!(iterations))
            .with_hints(ctx.estimator.light()),
    )?;
    g.connect(mask, name, "mask")?;
    Ok(PortRef::new(name, "mask"))
}
