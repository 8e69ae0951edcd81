//! Reconstruction composer: one pipeline graph per reconstruction unit.
//!
//! Construction is two-phase. Each subgraph is built on its own, inserted
//! under a prefix, and only then wired to the stages around it, so no stage
//! is touched after it has consumers.

use super::executors;
use super::masking::{build_masking_graph, MaskingOptions};
use super::outputs::OutputLayout;
use super::qsm::{build_qsm_graph, QsmOptions};
use super::BuildContext;
use crate::bids::ReconstructionUnit;
use crate::core::StageKind;
use crate::errors::QsmflowError;
use crate::graph::{DeclaredOutput, GraphBuilder, InputPort, PipelineGraph, PortRef, StageSpec, SubgraphHandle};
use crate::params::{MaskingInput, QsmReference, Resolution};
use crate::volume::MergeRule;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Name of the source stage emitting the unit's files and constants.
pub const INPUTS_STAGE: &str = "inputs";

/// Per-file ports after reorientation, resampling and phase scaling.
struct Files {
    phase: Vec<PortRef>,
    magnitude: Vec<PortRef>,
    masks: Vec<PortRef>,
    /// Reoriented first phase echo in its original geometry.
    geometry_reference: Option<PortRef>,
}

/// Wires masking, QSM and supplementary stages into one graph.
#[derive(Debug, Clone)]
pub struct ReconstructionComposer<'a> {
    unit: &'a ReconstructionUnit,
    resolution: &'a Resolution,
    merge_rule: MergeRule,
}

impl<'a> ReconstructionComposer<'a> {
    /// Creates a composer for a unit and its resolution.
    #[must_use]
    pub fn new(unit: &'a ReconstructionUnit, resolution: &'a Resolution) -> Self {
        Self {
            unit,
            resolution,
            merge_rule: MergeRule::default(),
        }
    }

    /// Sets which voxels the two-pass merge takes from the intermediate map.
    #[must_use]
    pub fn with_merge_rule(mut self, rule: MergeRule) -> Self {
        self.merge_rule = rule;
        self
    }

    /// Builds the graph.
    ///
    /// # Errors
    ///
    /// `NoOutputs` when the resolved parameters request nothing; builder and
    /// validation errors from the subgraph builders.
    pub fn compose(&self) -> Result<PipelineGraph, QsmflowError> {
        let p = &self.resolution.params;
        let id = self.unit.id();
        if !(p.do_qsm || p.do_swi || p.do_t2starmap || p.do_r2starmap || p.do_segmentation) {
            return Err(QsmflowError::NoOutputs(format!(
                "every output is disabled for {id}"
            )));
        }

        let ctx = BuildContext::new(p, &self.resolution.inputs, self.unit.voxel_count());
        let layout = OutputLayout::new(&id);
        let mut b = GraphBuilder::new(&id);

        self.add_inputs(&mut b)?;
        let files = self.preprocess(&mut b, &ctx)?;
        let segmentation = self.segmentation(&mut b, &ctx, &files, &layout)?;

        if p.do_qsm {
            let (map, mask) = self.reconstruct(&mut b, &ctx, &files, segmentation.as_ref(), &layout)?;
            if p.do_swi {
                self.swi(&mut b, &ctx, &files, Some(mask), &layout)?;
            }
            if p.do_analysis {
                if let Some(segmentation) = segmentation {
                    self.analysis(&mut b, &ctx, map, segmentation, &layout)?;
                }
            }
        } else if p.do_swi {
            self.swi(&mut b, &ctx, &files, None, &layout)?;
        }
        self.relaxometry(&mut b, &ctx, &files, &layout)?;

        let graph = b.build()?;
        info!(
            graph = %graph.name(),
            stages = graph.stage_count(),
            outputs = graph.declared_outputs().len(),
            peak_mem_gb = graph.peak_mem_gb(),
            "Composed reconstruction graph"
        );
        Ok(graph)
    }

    fn add_inputs(&self, b: &mut GraphBuilder) -> Result<(), QsmflowError> {
        let unit = self.unit;
        let inputs = &self.resolution.inputs;
        let p = &self.resolution.params;

        let mut values = BTreeMap::new();
        values.insert("phase".to_string(), paths(&unit.phase, unit.phase.len()));
        values.insert("magnitude".to_string(), paths(&unit.magnitude, inputs.magnitude_count));
        values.insert("mask".to_string(), paths(&unit.masks, inputs.mask_count));
        values.insert("TE".to_string(), json!(unit.echo_times));
        values.insert("B0".to_string(), json!(unit.field_strength));
        values.insert("vsz".to_string(), json!(unit.voxel_size()));
        values.insert("b0_direction".to_string(), json!(p.b0_direction));
        if let Some(t1w) = &unit.t1w {
            values.insert("t1w".to_string(), json!(t1w.display().to_string()));
        }
        if inputs.has_segmentation {
            if let Some(segmentation) = &unit.segmentation {
                values.insert("segmentation".to_string(), json!(segmentation.display().to_string()));
            }
        }
        b.add_stage(StageSpec::source(INPUTS_STAGE, values))?;
        Ok(())
    }

    /// Reorients every file, resamples oblique acquisitions to axial and
    /// scales phase.
    fn preprocess(&self, b: &mut GraphBuilder, ctx: &BuildContext<'_>) -> Result<Files, QsmflowError> {
        let inputs = ctx.inputs;
        let mask_count = if ctx.params.do_qsm { inputs.mask_count } else { 0 };

        let mut phase = reorient_all(b, ctx, "phase", inputs.echo_count)?;
        let mut magnitude = reorient_all(b, ctx, "magnitude", inputs.magnitude_count)?;
        let mut masks = reorient_all(b, ctx, "mask", mask_count)?;
        let geometry_reference = phase.first().cloned();

        if inputs.axial_resampling {
            b.add_stage(
                StageSpec::new("axial_resample", StageKind::Preprocess, executors::AXIAL_RESAMPLE)
                    .with_input(InputPort::many("phase"))
                    .with_input(InputPort::many("magnitude").optional())
                    .with_input(InputPort::many("mask").optional())
                    .with_outputs(&["phase", "magnitude", "mask"])
                    .with_param("obliquity", json!(inputs.obliquity))
                    .with_param("unit_magnitude", json!(!inputs.has_magnitude()))
                    .with_hints(ctx.estimator.multi_echo()),
            )?;
            b.connect_all(phase, "axial_resample", "phase")?;
            b.connect_all(magnitude, "axial_resample", "magnitude")?;
            b.connect_all(masks, "axial_resample", "mask")?;
            let resampled = |port: &str, n: usize| {
                (0..n)
                    .map(|i| PortRef::new("axial_resample", port).at(i))
                    .collect::<Vec<_>>()
            };
            phase = resampled("phase", inputs.echo_count);
            magnitude = resampled("magnitude", inputs.magnitude_count);
            masks = resampled("mask", mask_count);
        }

        let mut scaled = Vec::with_capacity(phase.len());
        for (echo, port) in phase.into_iter().enumerate() {
            let name = format!("scale_phase.e{echo}");
            b.add_stage(
                StageSpec::new(&name, StageKind::Preprocess, executors::SCALE_PHASE)
                    .with_input(InputPort::one("phase"))
                    .with_output("phase")
                    .with_hints(ctx.estimator.light()),
            )?;
            b.connect(port, &name, "phase")?;
            scaled.push(PortRef::new(&name, "phase"));
        }

        Ok(Files {
            phase: scaled,
            magnitude,
            masks,
            geometry_reference,
        })
    }

    /// Segmentation used for label referencing and analysis: generated from
    /// the T1w image when requested, otherwise an existing one.
    fn segmentation(
        &self,
        b: &mut GraphBuilder,
        ctx: &BuildContext<'_>,
        files: &Files,
        layout: &OutputLayout,
    ) -> Result<Option<PortRef>, QsmflowError> {
        if ctx.params.do_segmentation {
            b.add_stage(
                StageSpec::new("segmentation", StageKind::Supplementary, executors::SEGMENTATION)
                    .with_input(InputPort::one("t1w"))
                    .with_input(InputPort::many("magnitude"))
                    .with_outputs(&["dseg_qsm", "dseg_t1w", "transform"])
                    .with_hints(ctx.estimator.supplementary().with_mem_gb(16.0).with_n_procs(4)),
            )?;
            b.connect(PortRef::new(INPUTS_STAGE, "t1w"), "segmentation", "t1w")?;
            b.connect_all(files.magnitude.iter().cloned(), "segmentation", "magnitude")?;
            b.declare_output(DeclaredOutput::new(
                "segmentation_qsm",
                PortRef::new("segmentation", "dseg_qsm"),
                layout.segmentation_qsm(),
            ))?;
            b.declare_output(DeclaredOutput::new(
                "segmentation_t1w",
                PortRef::new("segmentation", "dseg_t1w"),
                layout.segmentation_t1w(),
            ))?;
            b.declare_output(DeclaredOutput::new(
                "transform",
                PortRef::new("segmentation", "transform"),
                layout.transform(),
            ))?;
            return Ok(Some(PortRef::new("segmentation", "dseg_qsm")));
        }
        if ctx.inputs.has_segmentation && b.stage(INPUTS_STAGE).is_some_and(|s| s.has_output("segmentation")) {
            return Ok(Some(PortRef::new(INPUTS_STAGE, "segmentation")));
        }
        Ok(None)
    }

    /// Masks, inverts, merges passes, averages echoes and references.
    /// Returns the final map and the primary mask.
    fn reconstruct(
        &self,
        b: &mut GraphBuilder,
        ctx: &BuildContext<'_>,
        files: &Files,
        segmentation: Option<&PortRef>,
        layout: &OutputLayout,
    ) -> Result<(PortRef, PortRef), QsmflowError> {
        let p = ctx.params;
        let combined = if p.combine_phase {
            Some(combine_echoes(b, ctx, files)?)
        } else {
            None
        };

        let mask = b.add_subgraph("mask", build_masking_graph(ctx, MaskingOptions::primary(p))?)?;
        wire_mask(b, &mask, files)?;
        let qsm_options = QsmOptions::new(ctx);
        let qsm = b.add_subgraph("qsm", build_qsm_graph(ctx, qsm_options)?)?;
        wire_qsm(b, &qsm, files, combined, mask.output("mask"))?;

        let maps = if p.two_pass {
            let reuse_quality = p.masking_input == MaskingInput::Phase;
            let intermediate_mask = b.add_subgraph(
                "mask_intermediate",
                build_masking_graph(ctx, MaskingOptions::intermediate().with_quality_map_supplied(reuse_quality))?,
            )?;
            wire_mask(b, &intermediate_mask, files)?;
            if reuse_quality {
                b.connect(mask.output("quality_map"), &intermediate_mask.input_node(), "quality_map")?;
            }
            let intermediate = b.add_subgraph("qsm_intermediate", build_qsm_graph(ctx, qsm_options)?)?;
            wire_qsm(b, &intermediate, files, combined, intermediate_mask.output("mask"))?;

            b.add_stage(
                StageSpec::new("qsm_merge", StageKind::Aggregate, executors::TWO_PASS_MERGE)
                    .with_input(InputPort::many("primary"))
                    .with_input(InputPort::many("intermediate"))
                    .with_input(InputPort::one("mask"))
                    .with_output("qsm")
                    .with_param("rule", json!(self.merge_rule))
                    .with_hints(ctx.estimator.multi_echo()),
            )?;
            b.connect(qsm.output("qsm"), "qsm_merge", "primary")?;
            b.connect(intermediate.output("qsm"), "qsm_merge", "intermediate")?;
            b.connect(intermediate_mask.output("mask").at(0), "qsm_merge", "mask")?;

            let singlepass = finish(b, ctx, "qsm_singlepass", qsm.output("qsm"), qsm_options.use_maps, files)?;
            b.declare_output(DeclaredOutput::new("qsm_singlepass", singlepass, layout.qsm_singlepass()))?;
            PortRef::new("qsm_merge", "qsm")
        } else {
            qsm.output("qsm")
        };

        let mut map = finish(b, ctx, "qsm", maps, qsm_options.use_maps, files)?;
        map = reference(b, ctx, map, &mask, segmentation)?;

        b.declare_output(DeclaredOutput::new("qsm", map.clone(), layout.qsm()).with_sidecar(self.qsm_sidecar()))?;
        b.declare_output(DeclaredOutput::new("mask", mask.output("mask").at(0), layout.mask()))?;
        debug!(two_pass = p.two_pass, use_maps = qsm_options.use_maps, "Wired reconstruction");
        Ok((map, mask.output("mask").at(0)))
    }

    fn qsm_sidecar(&self) -> Value {
        let p = &self.resolution.params;
        json!({
            "ImageType": ["DERIVED", "QSM"],
            "QSMAlgorithm": p.qsm_algorithm,
            "UnwrappingAlgorithm": p.unwrapping_algorithm,
            "BackgroundFieldRemoval": p.qsm_algorithm.needs_background_removal().then_some(p.bf_algorithm),
            "MaskingAlgorithm": p.masking_algorithm,
            "CombinePhase": p.combine_phase,
            "TwoPass": p.two_pass,
            "Premade": p.premade,
            "EchoTime": self.unit.echo_times,
            "MagneticFieldStrength": self.unit.field_strength,
        })
    }

    fn swi(
        &self,
        b: &mut GraphBuilder,
        ctx: &BuildContext<'_>,
        files: &Files,
        mask: Option<PortRef>,
        layout: &OutputLayout,
    ) -> Result<(), QsmflowError> {
        b.add_stage(
            StageSpec::new("swi", StageKind::Supplementary, executors::SWI)
                .with_input(InputPort::many("phase"))
                .with_input(InputPort::many("magnitude"))
                .with_input(InputPort::one("mask").optional())
                .with_outputs(&["swi", "swi_mip"])
                .with_hints(ctx.estimator.supplementary()),
        )?;
        b.connect_all(files.phase.iter().cloned(), "swi", "phase")?;
        b.connect_all(files.magnitude.iter().cloned(), "swi", "magnitude")?;
        if let Some(mask) = mask {
            b.connect(mask, "swi", "mask")?;
        }
        b.declare_output(DeclaredOutput::new("swi", PortRef::new("swi", "swi"), layout.swi()))?;
        b.declare_output(DeclaredOutput::new("swi_mip", PortRef::new("swi", "swi_mip"), layout.swi_mip()))?;
        Ok(())
    }

    fn relaxometry(
        &self,
        b: &mut GraphBuilder,
        ctx: &BuildContext<'_>,
        files: &Files,
        layout: &OutputLayout,
    ) -> Result<(), QsmflowError> {
        let p = ctx.params;
        for (enabled, name, executor, destination) in [
            (p.do_t2starmap, "t2starmap", executors::T2STARMAP, layout.t2starmap()),
            (p.do_r2starmap, "r2starmap", executors::R2STARMAP, layout.r2starmap()),
        ] {
            if !enabled {
                continue;
            }
            b.add_stage(
                StageSpec::new(name, StageKind::Supplementary, executor)
                    .with_input(InputPort::many("magnitude"))
                    .with_input(InputPort::many("TE"))
                    .with_output(name)
                    .with_hints(ctx.estimator.supplementary()),
            )?;
            b.connect_all(files.magnitude.iter().cloned(), name, "magnitude")?;
            b.connect(PortRef::new(INPUTS_STAGE, "TE"), name, "TE")?;
            b.declare_output(DeclaredOutput::new(name, PortRef::new(name, name), destination))?;
        }
        Ok(())
    }

    fn analysis(
        &self,
        b: &mut GraphBuilder,
        ctx: &BuildContext<'_>,
        map: PortRef,
        segmentation: PortRef,
        layout: &OutputLayout,
    ) -> Result<(), QsmflowError> {
        b.add_stage(
            StageSpec::new("analysis", StageKind::Supplementary, executors::ANALYSIS)
                .with_input(InputPort::one("qsm"))
                .with_input(InputPort::one("segmentation"))
                .with_output("csv")
                .with_hints(ctx.estimator.light()),
        )?;
        b.connect(map, "analysis", "qsm")?;
        b.connect(segmentation, "analysis", "segmentation")?;
        b.declare_output(DeclaredOutput::new("analysis", PortRef::new("analysis", "csv"), layout.analysis()))?;
        Ok(())
    }
}

fn paths(files: &[impl AsRef<Path>], count: usize) -> Value {
    json!(files
        .iter()
        .take(count)
        .map(|f| f.as_ref().display().to_string())
        .collect::<Vec<_>>())
}

fn reorient_all(
    b: &mut GraphBuilder,
    ctx: &BuildContext<'_>,
    field: &str,
    count: usize,
) -> Result<Vec<PortRef>, QsmflowError> {
    let mut ports = Vec::with_capacity(count);
    for i in 0..count {
        let name = format!("reorient_{field}.e{i}");
        b.add_stage(
            StageSpec::new(&name, StageKind::Preprocess, executors::REORIENT)
                .with_input(InputPort::one("image"))
                .with_output("image")
                .with_hints(ctx.estimator.light()),
        )?;
        b.connect(PortRef::new(INPUTS_STAGE, field).at(i), &name, "image")?;
        ports.push(PortRef::new(&name, "image"));
    }
    Ok(ports)
}

/// One ROMEO call over every echo; returns the stage name.
fn combine_echoes(b: &mut GraphBuilder, ctx: &BuildContext<'_>, files: &Files) -> Result<&'static str, QsmflowError> {
    const STAGE: &str = "romeo_combine";
    b.add_stage(
        StageSpec::new(STAGE, StageKind::Combine, executors::ROMEO_COMBINE)
            .with_input(InputPort::many("phase"))
            .with_input(InputPort::many("magnitude").optional())
            .with_input(InputPort::many("TE"))
            .with_outputs(&["phase_unwrapped", "frequency"])
            .with_hints(ctx.estimator.romeo()),
    )?;
    b.connect_all(files.phase.iter().cloned(), STAGE, "phase")?;
    b.connect_all(files.magnitude.iter().cloned(), STAGE, "magnitude")?;
    b.connect(PortRef::new(INPUTS_STAGE, "TE"), STAGE, "TE")?;
    Ok(STAGE)
}

fn wire_mask(b: &mut GraphBuilder, handle: &SubgraphHandle, files: &Files) -> Result<(), QsmflowError> {
    let node = handle.input_node();
    b.connect_all(files.phase.iter().cloned(), &node, "phase")?;
    b.connect_all(files.magnitude.iter().cloned(), &node, "magnitude")?;
    b.connect_all(files.masks.iter().cloned(), &node, "mask")?;
    b.connect(PortRef::new(INPUTS_STAGE, "TE"), &node, "TE")?;
    Ok(())
}

fn wire_qsm(
    b: &mut GraphBuilder,
    handle: &SubgraphHandle,
    files: &Files,
    combined: Option<&str>,
    mask: PortRef,
) -> Result<(), QsmflowError> {
    let node = handle.input_node();
    b.connect_all(files.phase.iter().cloned(), &node, "phase")?;
    b.connect_all(files.magnitude.iter().cloned(), &node, "magnitude")?;
    b.connect(mask, &node, "mask")?;
    for field in ["TE", "B0", "vsz", "b0_direction"] {
        b.connect(PortRef::new(INPUTS_STAGE, field), &node, field)?;
    }
    if let Some(stage) = combined {
        b.connect(PortRef::new(stage, "frequency"), &node, "frequency")?;
        b.connect(PortRef::new(stage, "phase_unwrapped"), &node, "phase_unwrapped")?;
    }
    Ok(())
}

/// Averages per-echo maps and resamples back to the acquisition geometry.
fn finish(
    b: &mut GraphBuilder,
    ctx: &BuildContext<'_>,
    prefix: &str,
    maps: PortRef,
    use_maps: bool,
    files: &Files,
) -> Result<PortRef, QsmflowError> {
    let mut map = if use_maps {
        let average = format!("{prefix}_average");
        b.add_stage(
            StageSpec::new(&average, StageKind::Aggregate, executors::NONZERO_AVERAGE)
                .with_input(InputPort::many("maps"))
                .with_output("qsm")
                .with_hints(ctx.estimator.multi_echo()),
        )?;
        b.connect(maps, &average, "maps")?;
        PortRef::new(&average, "qsm")
    } else {
        maps.at(0)
    };

    if ctx.inputs.axial_resampling {
        let reference = files
            .geometry_reference
            .clone()
            .ok_or_else(|| QsmflowError::Builder("resampling back needs a phase reference".to_string()))?;
        let resample = format!("{prefix}_resample");
        b.add_stage(
            StageSpec::new(&resample, StageKind::Aggregate, executors::RESAMPLE_LIKE)
                .with_input(InputPort::one("image"))
                .with_input(InputPort::one("reference"))
                .with_output("image")
                .with_hints(ctx.estimator.light()),
        )?;
        b.connect(map, &resample, "image")?;
        b.connect(reference, &resample, "reference")?;
        map = PortRef::new(&resample, "image");
    }
    Ok(map)
}

fn reference(
    b: &mut GraphBuilder,
    ctx: &BuildContext<'_>,
    map: PortRef,
    mask: &SubgraphHandle,
    segmentation: Option<&PortRef>,
) -> Result<PortRef, QsmflowError> {
    let spec = StageSpec::new("qsm_reference", StageKind::Reference, executors::REFERENCE)
        .with_input(InputPort::one("qsm"))
        .with_input(InputPort::one("region").optional())
        .with_output("qsm")
        .with_hints(ctx.estimator.light());
    let region = match &ctx.params.qsm_reference {
        QsmReference::None => return Ok(map),
        QsmReference::Mean => {
            b.add_stage(spec)?;
            if ctx.inputs.axial_resampling {
                None
            } else {
                Some(mask.output("mask").at(0))
            }
        }
        QsmReference::Labels(labels) => {
            let segmentation = segmentation.cloned().ok_or_else(|| {
                QsmflowError::Builder("label referencing needs a segmentation stage".to_string())
            })?;
            b.add_stage(spec.with_param("labels", json!(labels)))?;
            Some(segmentation)
        }
    };
    b.connect(map, "qsm_reference", "qsm")?;
    if let Some(region) = region {
        b.connect(region, "qsm_reference", "region")?;
    }
    Ok(PortRef::new("qsm_reference", "qsm"))
}
