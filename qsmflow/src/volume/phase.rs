//! Phase scaling and frequency normalisation.

use md5::{Digest, Md5};
use ndarray::{Array3, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;

/// Proton gyromagnetic ratio in Hz/T.
pub const GAMMA_HZ_PER_T: f64 = 42.58e6;
/// Scale for ppm-like normalised frequency (rts, tv).
pub const PPM_SCALE: f64 = 1e6 / (2.0 * PI);
/// Scale for microradian normalised phase (nextqsm).
pub const MICRORAD_SCALE: f64 = 1e6;
/// Echo time used when converting a combined frequency back to phase.
pub const TGV_ECHO_TIME: f64 = 0.005;

const BOUNDARY_LIMIT: f64 = 0.1;
const BOUNDARY_EPS: f64 = 1e-3;
const ZERO_EPS: f64 = 1e-9;

/// A deterministic 32-bit seed from a file name (first four bytes of its
/// MD5 digest, little endian).
#[must_use]
pub fn filename_seed(name: &str) -> u32 {
    let digest = Md5::digest(name.as_bytes());
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

fn at_boundary(v: f64) -> bool {
    v.abs() <= ZERO_EPS || v.abs() >= PI - BOUNDARY_EPS
}

/// Fraction of voxels sitting at zero or at ±π.
#[must_use]
pub fn boundary_fraction(data: &Array3<f64>) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let count = data.iter().filter(|v| at_boundary(**v)).count();
    count as f64 / data.len() as f64
}

/// Scales raw phase into [−π, π].
///
/// NaNs become 0. Values outside the range are mapped linearly from
/// [min, max]. When more than 10 % of voxels then sit at zero or ±π, those
/// voxels are replaced by uniform noise drawn from a generator seeded with
/// `seed`. Input already in range without saturation is returned unchanged.
#[must_use]
pub fn scale_phase(data: &Array3<f64>, seed: u32) -> Array3<f64> {
    let mut scaled = data.mapv(|v| if v.is_nan() { 0.0 } else { v });

    let (min, max) = scaled
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));

    if min < -PI || max > PI {
        let range = max - min;
        if range.is_finite() && range > 0.0 {
            scaled.mapv_inplace(|v| (v - min) / range * 2.0 * PI - PI);
        } else {
            scaled.mapv_inplace(|v| v.clamp(-PI, PI));
        }
    }

    if boundary_fraction(&scaled) > BOUNDARY_LIMIT {
        let mut rng = StdRng::seed_from_u64(u64::from(seed));
        for v in &mut scaled {
            if at_boundary(*v) {
                *v = rng.gen_range(-PI..PI);
            }
        }
    }

    scaled
}

/// Normalises unwrapped phase (rad) to `phase / (TE · γ · B0) · scale`.
#[must_use]
pub fn normalize_phase(unwrapped: &Array3<f64>, te: f64, b0: f64, scale: f64) -> Array3<f64> {
    let factor = scale / (te * GAMMA_HZ_PER_T * b0);
    unwrapped.mapv(|v| v * factor)
}

/// Normalises a frequency map (Hz) to `2π · f / (γ · B0) · scale`.
#[must_use]
pub fn normalize_frequency(frequency: &Array3<f64>, b0: f64, scale: f64) -> Array3<f64> {
    let factor = 2.0 * PI * scale / (GAMMA_HZ_PER_T * b0);
    frequency.mapv(|v| v * factor)
}

/// Inverse of [`normalize_frequency`].
#[must_use]
pub fn frequency_from_normalized(normalized: &Array3<f64>, b0: f64, scale: f64) -> Array3<f64> {
    let factor = GAMMA_HZ_PER_T * b0 / (2.0 * PI * scale);
    normalized.mapv(|v| v * factor)
}

/// Converts a frequency map (Hz) to wrapped phase at echo time `te`:
/// `((2π · f · TE) + π) mod 2π − π`.
#[must_use]
pub fn frequency_to_phase(frequency: &Array3<f64>, te: f64) -> Array3<f64> {
    frequency.mapv(|f| (2.0 * PI * f * te + PI).rem_euclid(2.0 * PI) - PI)
}

/// Voxel-wise maximum absolute difference; used by tests and sanity checks.
pub(crate) fn max_abs_diff(a: &Array3<f64>, b: &Array3<f64>) -> f64 {
    let mut worst = 0.0_f64;
    Zip::from(a).and(b).for_each(|x, y| worst = worst.max((x - y).abs()));
    worst
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(shape: (usize, usize, usize), lo: f64, hi: f64) -> Array3<f64> {
        let n = (shape.0 * shape.1 * shape.2 - 1) as f64;
        Array3::from_shape_fn(shape, |(i, j, k)| {
            let idx = (i * shape.1 * shape.2 + j * shape.2 + k) as f64;
            lo + (hi - lo) * idx / n
        })
    }

    #[test]
    fn test_seed_is_deterministic() {
        let a = filename_seed("sub-1_echo-1_part-phase_MEGRE.nii");
        let b = filename_seed("sub-1_echo-1_part-phase_MEGRE.nii");
        let c = filename_seed("sub-1_echo-2_part-phase_MEGRE.nii");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_scale_is_identity_on_wrapped_input() {
        let data = ramp((8, 8, 8), -3.0, 3.0);
        let scaled = scale_phase(&data, 7);
        assert_eq!(scaled, data);

        let twice = scale_phase(&scaled, 7);
        assert_eq!(twice, scaled);
    }

    #[test]
    fn test_scale_maps_raw_range() {
        let data = ramp((8, 8, 8), -4096.0, 4095.0);
        let scaled = scale_phase(&data, 1);
        let min = scaled.iter().copied().fold(f64::INFINITY, f64::min);
        let max = scaled.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        assert!((min + PI).abs() < 1e-12);
        assert!((max - PI).abs() < 1e-12);
    }

    #[test]
    fn test_nan_replaced() {
        let mut data = ramp((4, 4, 4), -1.0, 1.0);
        data[[1, 1, 1]] = f64::NAN;
        let scaled = scale_phase(&data, 3);
        assert!(scaled.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_saturated_voxels_replaced_deterministically() {
        let mut data = ramp((10, 10, 10), -2.0, 2.0);
        for k in 0..10 {
            for j in 0..10 {
                data[[0, j, k]] = PI;
                data[[1, j, k]] = -PI;
            }
        }
        assert!(boundary_fraction(&data) > 0.1);

        let first = scale_phase(&data, 42);
        let second = scale_phase(&data, 42);
        assert_eq!(first, second);
        assert!(boundary_fraction(&first) <= 0.1);
        assert!(first.iter().all(|v| (-PI..=PI).contains(v)));
    }

    #[test]
    fn test_frequency_normalisation_round_trip() {
        let freq = ramp((6, 6, 6), -40.0, 55.0);
        for scale in [PPM_SCALE, MICRORAD_SCALE] {
            let normalized = normalize_frequency(&freq, 3.0, scale);
            let restored = frequency_from_normalized(&normalized, 3.0, scale);
            assert!(max_abs_diff(&freq, &restored) <= 1e-10);
        }
    }

    #[test]
    fn test_phase_normalisation_matches_frequency() {
        let te = 0.012;
        let b0 = 3.0;
        let freq = ramp((4, 4, 4), -10.0, 10.0);
        let phase = freq.mapv(|f| 2.0 * PI * f * te);
        let via_phase = normalize_phase(&phase, te, b0, PPM_SCALE);
        let via_freq = normalize_frequency(&freq, b0, PPM_SCALE);
        assert!(max_abs_diff(&via_phase, &via_freq) < 1e-12);
    }

    #[test]
    fn test_frequency_to_phase_wraps() {
        let freq = Array3::from_elem((2, 2, 2), 150.0);
        let phase = frequency_to_phase(&freq, TGV_ECHO_TIME);
        let expected = (2.0 * PI * 150.0 * TGV_ECHO_TIME + PI).rem_euclid(2.0 * PI) - PI;
        assert!(phase.iter().all(|v| (v - expected).abs() < 1e-12));
        assert!(phase.iter().all(|v| (-PI..PI).contains(v)));
    }
}
