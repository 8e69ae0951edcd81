//! Susceptibility subgraph.
//!
//! | algorithm | unwrap | background removal | normalisation |
//! |-----------|--------|--------------------|---------------|
//! | rts, tv   | yes    | vsharp or pdf      | 1e6/2π        |
//! | nextqsm   | yes    | no                 | 1e6           |
//! | tgv       | no     | no                 | radian phase  |
//!
//! Per-echo work is flattened into one chain of stages per echo (suffix
//! `.e<i>`), so a failing echo leaves its siblings running.

use super::executors;
use super::BuildContext;
use crate::core::StageKind;
use crate::errors::QsmflowError;
use crate::graph::{InputPort, PortRef, StageSpec, Subgraph};
use crate::params::{BfAlgorithm, QsmAlgorithm, UnwrappingAlgorithm};
use crate::volume::{MICRORAD_SCALE, PPM_SCALE, TGV_ECHO_TIME};
use serde_json::json;
use tracing::debug;

/// Input-node fields of a QSM subgraph.
pub const QSM_INPUTS: [&str; 9] = [
    "phase",
    "phase_unwrapped",
    "frequency",
    "magnitude",
    "mask",
    "TE",
    "B0",
    "b0_direction",
    "vsz",
];
/// Output-node fields of a QSM subgraph.
pub const QSM_OUTPUTS: [&str; 1] = ["qsm"];

/// Shape switches of the QSM subgraph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QsmOptions {
    /// One chain per echo; otherwise one chain on the first phase or the
    /// combined frequency.
    pub use_maps: bool,
    /// Mask erosions applied inside the TGV solve.
    pub erosions: u32,
    /// Masks arriving on the `mask` input: 1, or one per echo.
    pub mask_count: usize,
}

impl QsmOptions {
    /// Options implied by the context.
    #[must_use]
    pub fn new(ctx: &BuildContext<'_>) -> Self {
        Self {
            use_maps: ctx.inputs.echo_count > 1 && !ctx.params.combine_phase,
            erosions: ctx.params.tgv_erosions,
            mask_count: ctx.inputs.mask_count.max(1),
        }
    }
}

/// Builds the QSM subgraph.
///
/// # Errors
///
/// Returns a builder error when an unwrapping family has no unwrapping
/// algorithm and no combined frequency to start from.
pub fn build_qsm_graph(ctx: &BuildContext<'_>, options: QsmOptions) -> Result<Subgraph, QsmflowError> {
    let p = ctx.params;
    if p.qsm_algorithm.needs_unwrapping() && !p.combine_phase && p.unwrapping_algorithm.is_none() {
        return Err(QsmflowError::Builder(format!(
            "{} needs unwrapped phase but no unwrapping algorithm is set",
            p.qsm_algorithm
        )));
    }

    let mut g = Subgraph::new(format!("qsm.{}", p.qsm_algorithm), &QSM_INPUTS, &QSM_OUTPUTS);
    let channels = if options.use_maps { ctx.inputs.echo_count } else { 1 };

    for echo in 0..channels {
        let suffix = if options.use_maps {
            format!(".e{echo}")
        } else {
            String::new()
        };
        let mask_index = if options.use_maps && options.mask_count > 1 { echo } else { 0 };
        let channel = Channel {
            echo,
            suffix,
            mask: g.input("mask").at(mask_index),
        };
        let qsm = match p.qsm_algorithm {
            QsmAlgorithm::Tgv => tgv_chain(&mut g, ctx, &channel, options)?,
            QsmAlgorithm::Rts | QsmAlgorithm::Tv | QsmAlgorithm::Nextqsm => field_chain(&mut g, ctx, &channel)?,
        };
        g.expose(qsm, "qsm")?;
    }

    debug!(algorithm = %p.qsm_algorithm, channels, "Built QSM subgraph");
    Ok(g)
}

struct Channel {
    echo: usize,
    suffix: String,
    mask: PortRef,
}

impl Channel {
    fn name(&self, stage: &str) -> String {
        format!("{stage}{}", self.suffix)
    }
}

fn algorithmic(spec: StageSpec) -> StageSpec {
    spec.with_input(InputPort::one("vsz"))
        .with_input(InputPort::one("b0_direction"))
}

/// Voxel size and B0 direction are three-element lists read whole.
fn connect_geometry(g: &mut Subgraph, stage: &str) -> Result<(), QsmflowError> {
    g.connect(g.input("vsz"), stage, "vsz")?;
    g.connect(g.input("b0_direction"), stage, "b0_direction")?;
    Ok(())
}

/// Unwrap (unless combined), normalise, remove the background, invert.
fn field_chain(g: &mut Subgraph, ctx: &BuildContext<'_>, ch: &Channel) -> Result<PortRef, QsmflowError> {
    let p = ctx.params;
    let est = ctx.estimator;
    let scale = if p.qsm_algorithm == QsmAlgorithm::Nextqsm {
        MICRORAD_SCALE
    } else {
        PPM_SCALE
    };

    let normalize = ch.name("normalize");
    if p.combine_phase {
        g.add_stage(
            StageSpec::new(&normalize, StageKind::Normalize, executors::NORMALIZE_FREQUENCY)
                .with_input(InputPort::one("frequency"))
                .with_input(InputPort::one("B0"))
                .with_output("field")
                .with_param("scale", json!(scale))
                .with_hints(est.light()),
        )?;
        g.connect(g.input("frequency").at(0), &normalize, "frequency")?;
    } else {
        let unwrap = ch.name("unwrap");
        let (executor, hints) = match p.unwrapping_algorithm {
            Some(UnwrappingAlgorithm::Laplacian) => (executors::LAPLACIAN, est.light()),
            _ => (executors::ROMEO, est.romeo()),
        };
        g.add_stage(algorithmic(
            StageSpec::new(&unwrap, StageKind::Unwrap, executor)
                .with_input(InputPort::one("phase"))
                .with_input(InputPort::one("magnitude").optional())
                .with_input(InputPort::one("TE"))
                .with_output("phase")
                .with_hints(hints),
        ))?;
        g.connect(g.input("phase").at(ch.echo), &unwrap, "phase")?;
        g.connect(g.input("TE").at(ch.echo), &unwrap, "TE")?;
        if ctx.inputs.has_magnitude() && executor == executors::ROMEO {
            let index = if ctx.inputs.magnitude_per_echo() { ch.echo } else { 0 };
            g.connect(g.input("magnitude").at(index), &unwrap, "magnitude")?;
        }
        connect_geometry(g, &unwrap)?;

        g.add_stage(
            StageSpec::new(&normalize, StageKind::Normalize, executors::NORMALIZE_PHASE)
                .with_input(InputPort::one("phase"))
                .with_input(InputPort::one("TE"))
                .with_input(InputPort::one("B0"))
                .with_output("field")
                .with_param("scale", json!(scale))
                .with_hints(est.light()),
        )?;
        g.connect(PortRef::new(&unwrap, "phase"), &normalize, "phase")?;
        g.connect(g.input("TE").at(ch.echo), &normalize, "TE")?;
    }
    g.connect(g.input("B0").at(0), &normalize, "B0")?;

    let mut field = PortRef::new(&normalize, "field");
    let mut mask = ch.mask.clone();

    if p.qsm_algorithm.needs_background_removal() {
        let background = ch.name("background_removal");
        let mut spec = match p.bf_algorithm {
            BfAlgorithm::Vsharp => StageSpec::new(&background, StageKind::BackgroundRemoval, executors::VSHARP)
                .with_param("max_radius_mm", json!(p.vsharp_max_radius_mm))
                .with_hints(est.vsharp()),
            BfAlgorithm::Pdf => {
                StageSpec::new(&background, StageKind::BackgroundRemoval, executors::PDF).with_hints(est.pdf())
            }
        };
        spec = spec
            .with_input(InputPort::one("field"))
            .with_input(InputPort::one("mask"))
            .with_outputs(&["field", "mask"]);
        g.add_stage(algorithmic(spec))?;
        g.connect(field, &background, "field")?;
        g.connect(mask, &background, "mask")?;
        connect_geometry(g, &background)?;

        field = PortRef::new(&background, "field");
        if p.bf_algorithm == BfAlgorithm::Vsharp {
            mask = PortRef::new(&background, "mask");
        } else {
            mask = ch.mask.clone();
        }
    }

    let inversion = ch.name("inversion");
    let spec = match p.qsm_algorithm {
        QsmAlgorithm::Rts => StageSpec::new(&inversion, StageKind::Inversion, executors::RTS)
            .with_param("tolerance", json!(p.rts_tolerance))
            .with_param("delta", json!(p.rts_delta))
            .with_param("mu", json!(p.rts_mu))
            .with_hints(est.kspace_inversion()),
        QsmAlgorithm::Tv => StageSpec::new(&inversion, StageKind::Inversion, executors::TV)
            .with_param("lambda", json!(p.tv_lambda))
            .with_hints(est.kspace_inversion()),
        QsmAlgorithm::Nextqsm => {
            StageSpec::new(&inversion, StageKind::Inversion, executors::NEXTQSM).with_hints(est.nextqsm())
        }
        QsmAlgorithm::Tgv => {
            return Err(QsmflowError::Internal("TGV routed through the field chain".to_string()));
        }
    };
    g.add_stage(algorithmic(
        spec.with_input(InputPort::one("field"))
            .with_input(InputPort::one("mask"))
            .with_output("qsm"),
    ))?;
    g.connect(field, &inversion, "field")?;
    g.connect(mask, &inversion, "mask")?;
    connect_geometry(g, &inversion)?;
    Ok(PortRef::new(&inversion, "qsm"))
}

/// TGV solves on wrapped radian phase; a combined frequency map is first
/// converted back to phase at a fixed echo time.
fn tgv_chain(
    g: &mut Subgraph,
    ctx: &BuildContext<'_>,
    ch: &Channel,
    options: QsmOptions,
) -> Result<PortRef, QsmflowError> {
    let p = ctx.params;
    let (phase, te) = if p.combine_phase {
        let convert = ch.name("frequency_to_phase");
        g.add_stage(
            StageSpec::new(&convert, StageKind::Normalize, executors::FREQUENCY_TO_PHASE)
                .with_input(InputPort::one("frequency"))
                .with_outputs(&["phase", "TE"])
                .with_param("echo_time", json!(TGV_ECHO_TIME))
                .with_hints(ctx.estimator.light()),
        )?;
        g.connect(g.input("frequency").at(0), &convert, "frequency")?;
        (PortRef::new(&convert, "phase"), PortRef::new(&convert, "TE"))
    } else {
        (g.input("phase").at(ch.echo), g.input("TE").at(ch.echo))
    };

    let inversion = ch.name("inversion");
    g.add_stage(algorithmic(
        StageSpec::new(&inversion, StageKind::Inversion, executors::TGV)
            .with_input(InputPort::one("phase"))
            .with_input(InputPort::one("TE"))
            .with_input(InputPort::one("B0"))
            .with_input(InputPort::one("mask"))
            .with_output("qsm")
            .with_param("iterations", json!(p.tgv_iterations))
            .with_param("alphas", json!(p.tgv_alphas))
            .with_param("erosions", json!(options.erosions))
            .with_hints(ctx.estimator.tgv()),
    ))?;
    g.connect(phase, &inversion, "phase")?;
    g.connect(te, &inversion, "TE")?;
    g.connect(g.input("B0").at(0), &inversion, "B0")?;
    g.connect(ch.mask.clone(), &inversion, "mask")?;
    connect_geometry(g, &inversion)?;
    Ok(PortRef::new(&inversion, "qsm"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{InputDescriptors, RunParameters};
    use pretty_assertions::assert_eq;

    fn descriptors(echoes: usize) -> InputDescriptors {
        InputDescriptors {
            echo_count: echoes,
            magnitude_count: echoes,
            mask_count: 0,
            obliquity: 0.0,
            axial_resampling: false,
            has_t1w: false,
            has_segmentation: false,
        }
    }

    fn names(g: &Subgraph) -> Vec<&str> {
        g.stage_names()
            .iter()
            .map(String::as_str)
            .filter(|n| !n.ends_with("node"))
            .collect()
    }

    #[test]
    fn test_rts_per_echo_chains() {
        let params = RunParameters::default();
        let inputs = descriptors(2);
        let ctx = BuildContext::new(&params, &inputs, 1000);
        let g = build_qsm_graph(&ctx, QsmOptions::new(&ctx)).unwrap();
        assert_eq!(
            names(&g),
            vec![
                "unwrap.e0",
                "normalize.e0",
                "background_removal.e0",
                "inversion.e0",
                "unwrap.e1",
                "normalize.e1",
                "background_removal.e1",
                "inversion.e1"
            ]
        );
    }

    #[test]
    fn test_combined_phase_has_single_chain() {
        let params = RunParameters {
            combine_phase: true,
            ..RunParameters::default()
        };
        let inputs = descriptors(3);
        let ctx = BuildContext::new(&params, &inputs, 1000);
        let options = QsmOptions::new(&ctx);
        assert!(!options.use_maps);
        let g = build_qsm_graph(&ctx, options).unwrap();
        assert_eq!(names(&g), vec!["normalize", "background_removal", "inversion"]);
    }

    #[test]
    fn test_tgv_with_combined_phase_converts_frequency() {
        let params = RunParameters {
            qsm_algorithm: QsmAlgorithm::Tgv,
            unwrapping_algorithm: None,
            combine_phase: true,
            ..RunParameters::default()
        };
        let inputs = descriptors(2);
        let ctx = BuildContext::new(&params, &inputs, 1000);
        let g = build_qsm_graph(&ctx, QsmOptions::new(&ctx)).unwrap();
        assert_eq!(names(&g), vec!["frequency_to_phase", "inversion"]);
    }

    #[test]
    fn test_nextqsm_skips_background_removal() {
        let params = RunParameters {
            qsm_algorithm: QsmAlgorithm::Nextqsm,
            ..RunParameters::default()
        };
        let inputs = descriptors(1);
        let ctx = BuildContext::new(&params, &inputs, 1000);
        let g = build_qsm_graph(&ctx, QsmOptions::new(&ctx)).unwrap();
        assert_eq!(names(&g), vec!["unwrap", "normalize", "inversion"]);
    }

    #[test]
    fn test_missing_unwrapping_is_builder_error() {
        let params = RunParameters {
            unwrapping_algorithm: None,
            ..RunParameters::default()
        };
        let inputs = descriptors(1);
        let ctx = BuildContext::new(&params, &inputs, 1000);
        assert!(matches!(
            build_qsm_graph(&ctx, QsmOptions::new(&ctx)),
            Err(QsmflowError::Builder(_))
        ));
    }
}
