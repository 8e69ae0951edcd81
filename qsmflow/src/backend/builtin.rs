//! In-process executors backed by the volume kernels.
//!
//! Kernels are CPU-bound and run on tokio's blocking pool. Each reads its
//! inputs from NIfTI files, writes results into the stage directory and
//! returns the written paths.

use super::executor::{StageContext, StageExecutor};
use crate::params::ThresholdAlgorithm;
use crate::volume::{
    binarize, erode, fill_holes, filename_seed, frequency_to_phase, gaussian_fill, l2_magnitude,
    label_region, mask_union, merge_two_pass, nonzero_average, normalize_frequency, normalize_phase,
    phase_quality, read_mask, read_volume, reference_to_region, scale_phase, write_mask, write_volume,
    GaussianFill, MergeRule, ThresholdRule,
};
use crate::workflows::executors;
use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use ndarray::{Array3, Axis};
use nifti::NiftiHeader;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

type Outputs = HashMap<String, Value>;
type Kernel = fn(&StageContext) -> anyhow::Result<Outputs>;

/// A named volume kernel.
#[derive(Clone, Copy)]
pub struct VolumeExecutor {
    name: &'static str,
    kernel: Kernel,
}

impl fmt::Debug for VolumeExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeExecutor").field("name", &self.name).finish()
    }
}

#[async_trait]
impl StageExecutor for VolumeExecutor {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, ctx: &StageContext) -> anyhow::Result<Outputs> {
        let ctx = ctx.clone();
        let kernel = self.kernel;
        tokio::task::spawn_blocking(move || kernel(&ctx))
            .await
            .with_context(|| format!("{} kernel task aborted", self.name))?
    }
}

/// Every built-in executor.
#[must_use]
pub fn all() -> Vec<Arc<dyn StageExecutor>> {
    let table: [(&'static str, Kernel); 15] = [
        (executors::REORIENT, reorient),
        (executors::SCALE_PHASE, scale),
        (executors::NORMALIZE_PHASE, normalize_unwrapped),
        (executors::NORMALIZE_FREQUENCY, normalize_combined),
        (executors::FREQUENCY_TO_PHASE, to_phase),
        (executors::L2_MAGNITUDE, combine_magnitude),
        (executors::QUALITY_MAP, quality_map),
        (executors::THRESHOLD, threshold),
        (executors::GAUSSIAN_FILL, smooth_fill),
        (executors::FILL_HOLES, morphological_fill),
        (executors::ERODE, erode_mask),
        (executors::MASK_UNION, union),
        (executors::NONZERO_AVERAGE, average),
        (executors::TWO_PASS_MERGE, merge),
        (executors::REFERENCE, reference),
    ];
    table
        .into_iter()
        .map(|(name, kernel)| Arc::new(VolumeExecutor { name, kernel }) as Arc<dyn StageExecutor>)
        .collect()
}

fn path_value(path: &Path) -> Value {
    json!(path.display().to_string())
}

fn single(port: &str, path: &Path) -> Outputs {
    HashMap::from([(port.to_string(), path_value(path))])
}

fn read(path: &Path) -> anyhow::Result<(Array3<f64>, NiftiHeader)> {
    read_volume(path).with_context(|| format!("reading {}", path.display()))
}

fn read_all(paths: &[impl AsRef<Path>]) -> anyhow::Result<(Vec<Array3<f64>>, NiftiHeader)> {
    let mut volumes = Vec::with_capacity(paths.len());
    let mut header = None;
    for path in paths {
        let (data, h) = read(path.as_ref())?;
        header.get_or_insert(h);
        volumes.push(data);
    }
    let header = header.ok_or_else(|| anyhow!("no volumes to read"))?;
    Ok((volumes, header))
}

fn write(path: &Path, data: &Array3<f64>, header: &NiftiHeader) -> anyhow::Result<()> {
    write_volume(path, data, header).with_context(|| format!("writing {}", path.display()))
}

fn write_binary(path: &Path, mask: &Array3<u8>, header: &NiftiHeader) -> anyhow::Result<()> {
    write_mask(path, mask, header).with_context(|| format!("writing {}", path.display()))
}

fn voxel_size(header: &NiftiHeader) -> [f64; 3] {
    [1, 2, 3].map(|i| f64::from(header.pixdim[i]).abs())
}

/// Flips every axis whose scanner-space direction is negative so the data
/// is stored right/anterior/superior ascending. Only axis-aligned sform
/// affines are touched.
pub(crate) fn flip_to_canonical(mut data: Array3<f64>, header: &NiftiHeader) -> (Array3<f64>, NiftiHeader) {
    let mut header = header.clone();
    if header.sform_code <= 0 {
        return (data, header);
    }
    for axis in 0..3 {
        let column = [header.srow_x[axis], header.srow_y[axis], header.srow_z[axis]];
        let nonzero: Vec<f32> = column.iter().copied().filter(|v| v.abs() > 1e-6).collect();
        if nonzero.len() != 1 || nonzero[0] > 0.0 {
            continue;
        }
        let extent = data.len_of(Axis(axis)).saturating_sub(1) as f32;
        data.invert_axis(Axis(axis));
        for row in [&mut header.srow_x, &mut header.srow_y, &mut header.srow_z] {
            row[3] += row[axis] * extent;
            row[axis] = -row[axis];
        }
    }
    header.qform_code = 0;
    (data, header)
}

fn reorient(ctx: &StageContext) -> anyhow::Result<Outputs> {
    let input = ctx.path("image")?;
    let (data, header) = read(&input)?;
    let (data, header) = flip_to_canonical(data, &header);
    let out = ctx.derived_file(&input, "reoriented");
    write(&out, &data, &header)?;
    Ok(single("image", &out))
}

fn scale(ctx: &StageContext) -> anyhow::Result<Outputs> {
    let input = ctx.path("phase")?;
    let (data, header) = read(&input)?;
    let seed = filename_seed(&input.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default());
    let out = ctx.derived_file(&input, "scaled");
    write(&out, &scale_phase(&data, seed), &header)?;
    Ok(single("phase", &out))
}

fn normalize_unwrapped(ctx: &StageContext) -> anyhow::Result<Outputs> {
    let input = ctx.path("phase")?;
    let (data, header) = read(&input)?;
    let field = normalize_phase(&data, ctx.number("TE")?, ctx.number("B0")?, ctx.param("scale")?);
    let out = ctx.derived_file(&input, "normalized");
    write(&out, &field, &header)?;
    Ok(single("field", &out))
}

fn normalize_combined(ctx: &StageContext) -> anyhow::Result<Outputs> {
    let input = ctx.path("frequency")?;
    let (data, header) = read(&input)?;
    let field = normalize_frequency(&data, ctx.number("B0")?, ctx.param("scale")?);
    let out = ctx.derived_file(&input, "normalized");
    write(&out, &field, &header)?;
    Ok(single("field", &out))
}

fn to_phase(ctx: &StageContext) -> anyhow::Result<Outputs> {
    let input = ctx.path("frequency")?;
    let echo_time: f64 = ctx.param("echo_time")?;
    let (data, header) = read(&input)?;
    let out = ctx.derived_file(&input, "phase");
    write(&out, &frequency_to_phase(&data, echo_time), &header)?;
    let mut outputs = single("phase", &out);
    outputs.insert("TE".to_string(), json!(echo_time));
    Ok(outputs)
}

fn combine_magnitude(ctx: &StageContext) -> anyhow::Result<Outputs> {
    let (magnitudes, header) = read_all(&ctx.paths("magnitude")?)?;
    let out = ctx.output_file("magnitude_l2.nii");
    write(&out, &l2_magnitude(&magnitudes)?, &header)?;
    Ok(single("magnitude", &out))
}

fn quality_map(ctx: &StageContext) -> anyhow::Result<Outputs> {
    let (phases, header) = read_all(&ctx.paths("phase")?)?;
    let magnitudes = if ctx.has_input("magnitude") {
        Some(read_all(&ctx.paths("magnitude")?)?.0)
    } else {
        None
    };
    let quality = phase_quality(&phases, magnitudes.as_deref())?;
    let out = ctx.output_file("quality_map.nii");
    write(&out, &quality, &header)?;
    Ok(single("quality_map", &out))
}

fn threshold_rule(ctx: &StageContext) -> anyhow::Result<ThresholdRule> {
    if let Some(value) = ctx.optional_param::<f64>("threshold_value")? {
        return Ok(ThresholdRule::from_value(value));
    }
    let factor: f64 = ctx.param("factor")?;
    Ok(match ctx.param::<ThresholdAlgorithm>("threshold_algorithm")? {
        ThresholdAlgorithm::Otsu => ThresholdRule::Otsu { factor },
        ThresholdAlgorithm::Gaussian => ThresholdRule::Gaussian { factor },
    })
}

fn threshold(ctx: &StageContext) -> anyhow::Result<Outputs> {
    let input = ctx.path("data")?;
    let (data, header) = read(&input)?;
    let value = threshold_rule(ctx)?.compute(&data);
    let out = ctx.output_file("mask.nii");
    write_binary(&out, &binarize(&data, value), &header)?;
    let mut outputs = single("mask", &out);
    outputs.insert("threshold".to_string(), json!(value));
    Ok(outputs)
}

fn smooth_fill(ctx: &StageContext) -> anyhow::Result<Outputs> {
    let input = ctx.path("mask")?;
    let (mask, header) = read_mask(&input)?;
    let sigma_mm: f64 = ctx.param("sigma_mm")?;
    let filled = gaussian_fill(&mask, voxel_size(&header), GaussianFill::new(sigma_mm));
    let out = ctx.derived_file(&input, "gaussian-filled");
    write_binary(&out, &filled, &header)?;
    Ok(single("mask", &out))
}

fn morphological_fill(ctx: &StageContext) -> anyhow::Result<Outputs> {
    let input = ctx.path("mask")?;
    let (mask, header) = read_mask(&input)?;
    let out = ctx.derived_file(&input, "filled");
    write_binary(&out, &fill_holes(&mask), &header)?;
    Ok(single("mask", &out))
}

fn erode_mask(ctx: &StageContext) -> anyhow::Result<Outputs> {
    let input = ctx.path("mask")?;
    let (mask, header) = read_mask(&input)?;
    let iterations: usize = ctx.param("iterations")?;
    let out = ctx.derived_file(&input, "eroded");
    write_binary(&out, &erode(&mask, iterations), &header)?;
    Ok(single("mask", &out))
}

fn union(ctx: &StageContext) -> anyhow::Result<Outputs> {
    let mut masks = Vec::new();
    let mut header = None;
    for path in ctx.paths("masks")? {
        let (mask, h) = read_mask(&path)?;
        header.get_or_insert(h);
        masks.push(mask);
    }
    let header = header.ok_or_else(|| anyhow!("no masks to combine"))?;
    let out = ctx.output_file("mask_union.nii");
    write_binary(&out, &mask_union(&masks)?, &header)?;
    Ok(single("mask", &out))
}

fn average(ctx: &StageContext) -> anyhow::Result<Outputs> {
    let (maps, header) = read_all(&ctx.paths("maps")?)?;
    let out = ctx.output_file("average.nii");
    write(&out, &nonzero_average(&maps)?, &header)?;
    Ok(single("qsm", &out))
}

fn merge(ctx: &StageContext) -> anyhow::Result<Outputs> {
    let primary = ctx.paths("primary")?;
    let intermediate = ctx.paths("intermediate")?;
    if primary.len() != intermediate.len() {
        return Err(anyhow!(
            "{} primary maps but {} intermediate maps",
            primary.len(),
            intermediate.len()
        ));
    }
    let rule: MergeRule = ctx.param("rule")?;
    let (mask, _) = read_mask(&ctx.path("mask")?)?;

    let mut merged = Vec::with_capacity(primary.len());
    for (i, (p, q)) in primary.iter().zip(&intermediate).enumerate() {
        let (p, header) = read(p)?;
        let (q, _) = read(q)?;
        let out = ctx.output_file(&format!("merged_{i}.nii"));
        write(&out, &merge_two_pass(&p, &q, &mask, rule)?, &header)?;
        merged.push(path_value(&out));
    }
    Ok(HashMap::from([("qsm".to_string(), Value::Array(merged))]))
}

fn reference(ctx: &StageContext) -> anyhow::Result<Outputs> {
    let input = ctx.path("qsm")?;
    let (map, header) = read(&input)?;
    let region = if ctx.has_input("region") {
        let path = ctx.path("region")?;
        Some(match ctx.optional_param::<Vec<i64>>("labels")? {
            Some(labels) => label_region(&read(&path)?.0, &labels),
            None => read_mask(&path)?.0,
        })
    } else {
        None
    };
    let out = ctx.derived_file(&input, "referenced");
    write(&out, &reference_to_region(&map, region.as_ref())?, &header)?;
    Ok(single("qsm", &out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageKind;
    use crate::graph::StageSpec;
    use std::path::PathBuf;

    fn header() -> NiftiHeader {
        let mut header = NiftiHeader::default();
        header.pixdim = [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
        header
    }

    fn stage_ctx(dir: &Path, spec: StageSpec, inputs: &[(&str, Value)]) -> StageContext {
        let inputs = inputs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect();
        StageContext::new(spec, inputs, dir)
    }

    fn write_test_volume(dir: &Path, name: &str, data: &Array3<f64>) -> PathBuf {
        let path = dir.join(name);
        write_volume(&path, data, &header()).unwrap();
        path
    }

    #[test]
    fn test_flip_to_canonical() {
        let data = Array3::from_shape_fn((3, 2, 2), |(i, _, _)| i as f64);
        let mut h = header();
        h.sform_code = 1;
        h.srow_x = [-2.0, 0.0, 0.0, 10.0];
        h.srow_y = [0.0, 2.0, 0.0, 0.0];
        h.srow_z = [0.0, 0.0, 2.0, 0.0];

        let (flipped, h) = flip_to_canonical(data, &h);
        assert!((flipped[[0, 0, 0]] - 2.0).abs() < 1e-12);
        assert!((flipped[[2, 1, 1]] - 0.0).abs() < 1e-12);
        assert!((h.srow_x[0] - 2.0).abs() < 1e-6);
        // old last voxel (x = 10 - 4) is the new origin
        assert!((h.srow_x[3] - 6.0).abs() < 1e-6);
        assert!((h.srow_y[1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_flip_leaves_oblique_and_unset_affines() {
        let data = Array3::from_elem((2, 2, 2), 1.0);
        let (same, _) = flip_to_canonical(data.clone(), &header());
        assert_eq!(same, data);
    }

    #[tokio::test]
    async fn test_threshold_executor_writes_mask_and_value() {
        let dir = tempfile::tempdir().unwrap();
        let data = Array3::from_shape_fn((4, 4, 4), |(i, _, _)| if i < 2 { 0.1 } else { 0.9 });
        let input = write_test_volume(dir.path(), "quality.nii", &data);
        let spec = StageSpec::new("mask.threshold", StageKind::Mask, executors::THRESHOLD)
            .with_outputs(&["mask", "threshold"])
            .with_param("threshold_value", json!(0.5));
        let ctx = stage_ctx(dir.path(), spec, &[("data", path_value(&input))]);

        let executor = VolumeExecutor {
            name: executors::THRESHOLD,
            kernel: threshold,
        };
        let outputs = executor.execute(&ctx).await.unwrap();
        // 0.5 lies in (0, 1): the median of the map
        let value = outputs["threshold"].as_f64().unwrap();
        assert!((0.1..=0.9).contains(&value));
        let (mask, _) = read_mask(Path::new(outputs["mask"].as_str().unwrap())).unwrap();
        assert_eq!(mask[[0, 0, 0]], 0);
    }

    #[tokio::test]
    async fn test_merge_executor_switches_by_mask() {
        let dir = tempfile::tempdir().unwrap();
        let primary = write_test_volume(dir.path(), "p.nii", &Array3::from_elem((2, 2, 2), 1.0));
        let intermediate = write_test_volume(dir.path(), "q.nii", &Array3::from_elem((2, 2, 2), 5.0));
        let mask = Array3::from_shape_fn((2, 2, 2), |(i, _, _)| if i == 0 { 1.0 } else { 0.0 });
        let mask = write_test_volume(dir.path(), "m.nii", &mask);

        let spec = StageSpec::new("qsm_merge", StageKind::Aggregate, executors::TWO_PASS_MERGE)
            .with_output("qsm")
            .with_param("rule", json!(MergeRule::ByMask));
        let ctx = stage_ctx(
            dir.path(),
            spec,
            &[
                ("primary", json!([primary.display().to_string()])),
                ("intermediate", json!([intermediate.display().to_string()])),
                ("mask", path_value(&mask)),
            ],
        );
        let outputs = merge(&ctx).unwrap();
        let merged = outputs["qsm"].as_array().unwrap();
        assert_eq!(merged.len(), 1);
        let (data, _) = read_volume(Path::new(merged[0].as_str().unwrap())).unwrap();
        assert!((data[[0, 1, 1]] - 5.0).abs() < 1e-9);
        assert!((data[[1, 1, 1]] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_merge_rejects_uneven_lists() {
        let dir = tempfile::tempdir().unwrap();
        let spec = StageSpec::new("qsm_merge", StageKind::Aggregate, executors::TWO_PASS_MERGE)
            .with_param("rule", json!("by_mask"));
        let ctx = stage_ctx(
            dir.path(),
            spec,
            &[
                ("primary", json!(["/a.nii", "/b.nii"])),
                ("intermediate", json!(["/c.nii"])),
                ("mask", json!("/m.nii")),
            ],
        );
        assert!(merge(&ctx).is_err());
    }

    #[test]
    fn test_reference_by_labels() {
        let dir = tempfile::tempdir().unwrap();
        let map = Array3::from_shape_fn((2, 2, 2), |(i, _, _)| if i == 0 { 3.0 } else { 7.0 });
        let seg = Array3::from_shape_fn((2, 2, 2), |(i, _, _)| if i == 0 { 10.0 } else { 2.0 });
        let map = write_test_volume(dir.path(), "chi.nii", &map);
        let seg = write_test_volume(dir.path(), "dseg.nii", &seg);

        let spec = StageSpec::new("qsm_reference", StageKind::Reference, executors::REFERENCE)
            .with_param("labels", json!([10]));
        let ctx = stage_ctx(dir.path(), spec, &[("qsm", path_value(&map)), ("region", path_value(&seg))]);
        let outputs = reference(&ctx).unwrap();
        let (data, _) = read_volume(Path::new(outputs["qsm"].as_str().unwrap())).unwrap();
        assert!(data[[0, 0, 0]].abs() < 1e-9);
        assert!((data[[1, 0, 0]] - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_every_builtin_is_listed() {
        let names: Vec<String> = all().iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names.len(), executors::BUILTIN.len());
        for name in executors::BUILTIN {
            assert!(names.iter().any(|n| n == name));
        }
    }
}
