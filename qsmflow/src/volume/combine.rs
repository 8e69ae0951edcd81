//! Combining maps and masks.

use super::{check_same_shape, VolumeError};
use ndarray::{Array3, Zip};
use serde::{Deserialize, Serialize};

/// Which voxels take the intermediate (filled-mask) value in a two-pass merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRule {
    /// Voxels inside the intermediate mask.
    #[default]
    ByMask,
    /// Voxels where the intermediate map is non-zero.
    ByMap,
}

/// Voxel-wise mean over non-zero finite values; 0 where every input is 0.
pub fn nonzero_average(maps: &[Array3<f64>]) -> Result<Array3<f64>, VolumeError> {
    let first = maps.first().ok_or(VolumeError::Empty)?;
    for map in &maps[1..] {
        check_same_shape(first, map.shape())?;
    }

    let mut sum = Array3::<f64>::zeros(first.dim());
    let mut count = Array3::<f64>::zeros(first.dim());
    for map in maps {
        Zip::from(&mut sum)
            .and(&mut count)
            .and(map)
            .for_each(|s, c, &v| {
                if v.is_finite() && v != 0.0 {
                    *s += v;
                    *c += 1.0;
                }
            });
    }

    Ok(Zip::from(&sum)
        .and(&count)
        .map_collect(|&s, &c| if c > 0.0 { s / c } else { 0.0 }))
}

/// Merges the single-pass and intermediate susceptibility maps.
pub fn merge_two_pass(
    primary: &Array3<f64>,
    intermediate: &Array3<f64>,
    intermediate_mask: &Array3<u8>,
    rule: MergeRule,
) -> Result<Array3<f64>, VolumeError> {
    check_same_shape(primary, intermediate.shape())?;
    check_same_shape(primary, intermediate_mask.shape())?;

    Ok(Zip::from(primary)
        .and(intermediate)
        .and(intermediate_mask)
        .map_collect(|&p, &i, &m| {
            let take_intermediate = match rule {
                MergeRule::ByMask => m != 0,
                MergeRule::ByMap => i != 0.0,
            };
            if take_intermediate {
                i
            } else {
                p
            }
        }))
}

/// Subtracts the mean over a reference region from every non-zero voxel.
///
/// Without a region, the map's own non-zero voxels are the reference.
pub fn reference_to_region(map: &Array3<f64>, region: Option<&Array3<u8>>) -> Result<Array3<f64>, VolumeError> {
    if let Some(region) = region {
        check_same_shape(map, region.shape())?;
    }

    let mut total = 0.0;
    let mut n = 0usize;
    for (idx, &v) in map.indexed_iter() {
        let in_region = match region {
            Some(r) => r[idx] != 0,
            None => v != 0.0,
        };
        if in_region && v.is_finite() {
            total += v;
            n += 1;
        }
    }
    if n == 0 {
        return Ok(map.clone());
    }

    let mean = total / n as f64;
    Ok(map.mapv(|v| if v != 0.0 { v - mean } else { 0.0 }))
}

/// Binary region of voxels whose segmentation label is in `labels`.
#[must_use]
pub fn label_region(segmentation: &Array3<f64>, labels: &[i64]) -> Array3<u8> {
    segmentation.mapv(|v| u8::from(v.is_finite() && labels.contains(&(v.round() as i64))))
}

/// Union of several masks.
pub fn mask_union(masks: &[Array3<u8>]) -> Result<Array3<u8>, VolumeError> {
    let first = masks.first().ok_or(VolumeError::Empty)?;
    let mut out = first.mapv(|v| u8::from(v != 0));
    for mask in &masks[1..] {
        if mask.shape() != first.shape() {
            return Err(VolumeError::ShapeMismatch {
                expected: first.shape().to_vec(),
                found: mask.shape().to_vec(),
            });
        }
        Zip::from(&mut out).and(mask).for_each(|o, &m| *o |= u8::from(m != 0));
    }
    Ok(out)
}

/// Root-sum-of-squares over echoes.
pub fn l2_magnitude(magnitudes: &[Array3<f64>]) -> Result<Array3<f64>, VolumeError> {
    let first = magnitudes.first().ok_or(VolumeError::Empty)?;
    let mut acc = Array3::<f64>::zeros(first.dim());
    for m in magnitudes {
        check_same_shape(first, m.shape())?;
        Zip::from(&mut acc).and(m).for_each(|a, &v| *a += v * v);
    }
    acc.mapv_inplace(f64::sqrt);
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonzero_average_ignores_zeros() {
        let a = Array3::from_elem((2, 2, 2), 2.0);
        let mut b = Array3::from_elem((2, 2, 2), 4.0);
        b[[0, 0, 0]] = 0.0;
        let c = Array3::<f64>::zeros((2, 2, 2));

        let avg = nonzero_average(&[a, b, c]).unwrap();
        assert_eq!(avg[[0, 0, 0]], 2.0);
        assert_eq!(avg[[1, 1, 1]], 3.0);
    }

    #[test]
    fn test_nonzero_average_all_zero_is_zero() {
        let zeros = Array3::<f64>::zeros((2, 2, 2));
        let avg = nonzero_average(&[zeros.clone(), zeros]).unwrap();
        assert!(avg.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_nonzero_average_rejects_mismatch() {
        let a = Array3::<f64>::zeros((2, 2, 2));
        let b = Array3::<f64>::zeros((2, 2, 3));
        assert!(matches!(nonzero_average(&[a, b]), Err(VolumeError::ShapeMismatch { .. })));
        assert!(matches!(nonzero_average(&[]), Err(VolumeError::Empty)));
    }

    #[test]
    fn test_merge_by_mask_and_map() {
        let primary = Array3::from_elem((2, 1, 1), 1.0);
        let mut intermediate = Array3::from_elem((2, 1, 1), 5.0);
        intermediate[[1, 0, 0]] = 0.0;
        let mut mask = Array3::<u8>::zeros((2, 1, 1));
        mask[[1, 0, 0]] = 1;

        let by_mask = merge_two_pass(&primary, &intermediate, &mask, MergeRule::ByMask).unwrap();
        assert_eq!(by_mask.iter().copied().collect::<Vec<_>>(), vec![1.0, 0.0]);

        let by_map = merge_two_pass(&primary, &intermediate, &mask, MergeRule::ByMap).unwrap();
        assert_eq!(by_map.iter().copied().collect::<Vec<_>>(), vec![5.0, 1.0]);
    }

    #[test]
    fn test_reference_to_region_mean() {
        let map = Array3::from_shape_vec((4, 1, 1), vec![1.0, 3.0, 0.0, 6.0]).unwrap();
        let mut region = Array3::<u8>::zeros((4, 1, 1));
        region[[0, 0, 0]] = 1;
        region[[1, 0, 0]] = 1;

        let referenced = reference_to_region(&map, Some(&region)).unwrap();
        assert_eq!(referenced.iter().copied().collect::<Vec<_>>(), vec![-1.0, 1.0, 0.0, 4.0]);

        let self_ref = reference_to_region(&map, None).unwrap();
        let mean = 10.0 / 3.0;
        assert!((self_ref[[3, 0, 0]] - (6.0 - mean)).abs() < 1e-12);
        assert_eq!(self_ref[[2, 0, 0]], 0.0);
    }

    #[test]
    fn test_label_region_and_union() {
        let seg = Array3::from_shape_vec((3, 1, 1), vec![1.0, 2.0, 3.0]).unwrap();
        let region = label_region(&seg, &[1, 3]);
        assert_eq!(region.iter().copied().collect::<Vec<_>>(), vec![1, 0, 1]);

        let other = label_region(&seg, &[2]);
        let union = mask_union(&[region, other]).unwrap();
        assert!(union.iter().all(|v| *v == 1));
    }

    #[test]
    fn test_l2_magnitude() {
        let a = Array3::from_elem((1, 1, 1), 3.0);
        let b = Array3::from_elem((1, 1, 1), 4.0);
        assert_eq!(l2_magnitude(&[a, b]).unwrap()[[0, 0, 0]], 5.0);
    }
}
