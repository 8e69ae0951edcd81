//! Phase quality map used to pick reliable voxels for masking.

use super::{check_same_shape, VolumeError};
use ndarray::Array3;
use std::f64::consts::PI;

/// Wraps an angle into [−π, π).
#[must_use]
pub fn wrap_to_pi(x: f64) -> f64 {
    (x + PI).rem_euclid(2.0 * PI) - PI
}

fn echo_quality(phase: &Array3<f64>) -> Array3<f64> {
    let (nx, ny, nz) = phase.dim();
    Array3::from_shape_fn((nx, ny, nz), |(i, j, k)| {
        if i == 0 || j == 0 || k == 0 || i + 1 == nx || j + 1 == ny || k + 1 == nz {
            return 0.0;
        }
        let centre = phase[[i, j, k]];
        let second = |a: f64, b: f64| wrap_to_pi(wrap_to_pi(a - centre) - wrap_to_pi(centre - b)).abs() / PI;
        let laplacian = second(phase[[i + 1, j, k]], phase[[i - 1, j, k]])
            + second(phase[[i, j + 1, k]], phase[[i, j - 1, k]])
            + second(phase[[i, j, k + 1]], phase[[i, j, k - 1]]);
        1.0 - laplacian / 3.0
    })
}

/// Phase quality in [0, 1].
///
/// Each echo scores `1 − mean(|wrapped second difference|) / π` on interior
/// voxels (the border scores 0). Scores are averaged over echoes and, when
/// magnitudes are supplied, weighted by the mean magnitude normalised to
/// its maximum.
pub fn phase_quality(phases: &[Array3<f64>], magnitudes: Option<&[Array3<f64>]>) -> Result<Array3<f64>, VolumeError> {
    let first = phases.first().ok_or(VolumeError::Empty)?;
    let mut quality = Array3::<f64>::zeros(first.dim());
    for phase in phases {
        check_same_shape(first, phase.shape())?;
        quality += &echo_quality(phase);
    }
    quality /= phases.len() as f64;

    if let Some(mags) = magnitudes.filter(|m| !m.is_empty()) {
        let mut mean = Array3::<f64>::zeros(first.dim());
        for mag in mags {
            check_same_shape(first, mag.shape())?;
            mean += &mag.mapv(|v| if v.is_finite() { v } else { 0.0 });
        }
        mean /= mags.len() as f64;
        let peak = mean.iter().copied().fold(0.0_f64, f64::max);
        if peak > 0.0 {
            quality *= &(mean / peak);
        }
    }

    quality.mapv_inplace(|v| v.clamp(0.0, 1.0));
    Ok(quality)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_to_pi() {
        assert!((wrap_to_pi(3.0 * PI) - (-PI)).abs() < 1e-12);
        assert!((wrap_to_pi(0.5) - 0.5).abs() < 1e-12);
        assert!((wrap_to_pi(-0.5 - 2.0 * PI) + 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_linear_phase_is_high_quality() {
        let phase = Array3::from_shape_fn((6, 6, 6), |(i, j, k)| wrap_to_pi(0.4 * i as f64 + 0.2 * j as f64 - 0.1 * k as f64));
        let q = phase_quality(&[phase], None).unwrap();
        assert!((q[[3, 3, 3]] - 1.0).abs() < 1e-9);
        assert_eq!(q[[0, 3, 3]], 0.0);
    }

    #[test]
    fn test_noisy_phase_scores_lower() {
        let smooth = Array3::from_shape_fn((6, 6, 6), |(i, _, _)| 0.3 * i as f64);
        let noisy = Array3::from_shape_fn((6, 6, 6), |(i, j, k)| if (i + j + k) % 2 == 0 { 1.5 } else { -1.5 });
        let qs = phase_quality(&[smooth], None).unwrap();
        let qn = phase_quality(&[noisy], None).unwrap();
        assert!(qn[[3, 3, 3]] < qs[[3, 3, 3]]);
    }

    #[test]
    fn test_magnitude_weighting() {
        let phase = Array3::<f64>::zeros((5, 5, 5));
        let mut mag = Array3::from_elem((5, 5, 5), 2.0);
        mag[[2, 2, 2]] = 1.0;
        let q = phase_quality(&[phase], Some(&[mag][..])).unwrap();
        assert!((q[[2, 2, 2]] - 0.5).abs() < 1e-12);
        assert!((q[[1, 1, 1]] - 1.0).abs() < 1e-12);
        assert!(q.iter().all(|v| (0.0..=1.0).contains(v)));
    }
}
